//! Core data models for the image store.
//!
//! `FileObject` is the catalog document of a stored file, `FileMetadata` the
//! auxiliary fields attached at upload time, and `Bucket` the namespace the
//! files live in. Content bytes never appear in these types.

pub mod bucket;
pub mod file;
pub mod metadata;

pub use bucket::Bucket;
pub use file::{FileId, FileInfo, FileObject};
pub use metadata::FileMetadata;
