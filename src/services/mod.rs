//! Storage services: name and content-type checks, the chunked blob store,
//! its metadata catalog, and the connector that owns the backing database.

pub mod blob_store;
pub mod catalog;
pub mod connector;
pub mod content_type;
pub mod filename;
pub mod storage_service;

pub use blob_store::{BlobStore, ByteStream, FileListing};
pub use catalog::MetadataCatalog;
pub use connector::{StorageConnector, StoreConfig};
pub use storage_service::{StorageError, StorageResult, StorageService};
