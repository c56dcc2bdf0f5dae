//! Represents a stored file (blob) and its catalog projection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;
use uuid::Uuid;

use super::metadata::FileMetadata;

/// Store-assigned identifier of a file.
///
/// Wraps a random 128-bit UUID. Parsed once at the boundary; everything past
/// that point carries the typed value.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, sqlx::Type,
)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct FileId(Uuid);

impl FileId {
    /// Allocate a fresh identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

/// Returned when text is not a hyphenated or simple (32 hex digit) UUID.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("`{0}` is not a file id")]
pub struct ParseFileIdError(String);

impl FromStr for FileId {
    type Err = ParseFileIdError;

    /// Accepts exactly the hyphenated and simple forms. Braced and URN
    /// forms, and surrounding whitespace, are rejected.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        // 36 is hyphenated, 32 is simple; parsing dispatches on length.
        if !matches!(raw.len(), 32 | 36) {
            return Err(ParseFileIdError(raw.to_string()));
        }
        Uuid::try_parse(raw)
            .map(Self)
            .map_err(|_| ParseFileIdError(raw.to_string()))
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// A single file stored in the chunked store.
///
/// Holds the catalog document only; content bytes live in the chunk table
/// and are read through a download stream.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileObject {
    /// Identifier assigned when the upload committed.
    #[serde(rename = "fileId")]
    pub id: FileId,

    /// Sanitized display name. Not unique.
    #[serde(rename = "fileName")]
    pub name: String,

    /// Exact number of bytes written.
    #[serde(rename = "fileSize")]
    pub size: u64,

    /// Lower-cased MIME type; empty when the catalog document lacks one.
    pub content_type: String,

    /// Commit time (UTC).
    pub upload_date: DateTime<Utc>,

    /// Chunk size the content was split with.
    pub chunk_size: u64,

    /// Hex MD5 of the content, computed while streaming.
    pub md5: String,

    /// Auxiliary fields attached at upload time.
    pub metadata: FileMetadata,
}

impl FileObject {
    /// Number of chunk rows backing this file.
    pub fn chunk_count(&self) -> u64 {
        if self.chunk_size == 0 {
            0
        } else {
            self.size.div_ceil(self.chunk_size)
        }
    }

    /// Expected byte length of chunk `n`.
    pub fn chunk_len(&self, n: u64) -> u64 {
        let start = n.saturating_mul(self.chunk_size);
        self.size.saturating_sub(start).min(self.chunk_size)
    }
}

/// Listing projection of a [`FileObject`]. Never carries content bytes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    #[serde(rename = "fileId")]
    pub id: FileId,
    #[serde(rename = "fileName")]
    pub name: String,
    pub content_type: String,
    #[serde(rename = "fileSize")]
    pub size: u64,
    pub upload_date: DateTime<Utc>,
}

impl From<FileObject> for FileInfo {
    fn from(file: FileObject) -> Self {
        Self {
            id: file.id,
            name: file.name,
            content_type: file.content_type,
            size: file.size,
            upload_date: file.upload_date,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(size: u64, chunk_size: u64) -> FileObject {
        FileObject {
            id: FileId::new(),
            name: "a.png".into(),
            size,
            content_type: "image/png".into(),
            upload_date: Utc::now(),
            chunk_size,
            md5: String::new(),
            metadata: FileMetadata::default(),
        }
    }

    #[test]
    fn file_id_accepts_hyphenated_and_simple_forms() {
        let id = FileId::new();
        let hyphenated: FileId = id.to_string().parse().unwrap();
        let simple: FileId = id.as_uuid().simple().to_string().parse().unwrap();
        assert_eq!(hyphenated, id);
        assert_eq!(simple, id);
    }

    #[test]
    fn file_id_rejects_garbage() {
        assert!("not-an-id".parse::<FileId>().is_err());
        assert!("".parse::<FileId>().is_err());
        assert!("64b7f0c2e4b0a1a2b3c4d5e6".parse::<FileId>().is_err());
    }

    #[test]
    fn file_id_accepts_only_canonical_forms() {
        let id = FileId::new();
        let text = id.to_string();
        for loose in [
            format!("{{{text}}}"),
            format!("urn:uuid:{text}"),
            format!(" {text}"),
            format!("{text}\n"),
            text.replace('-', "_"),
        ] {
            assert!(loose.parse::<FileId>().is_err(), "{loose:?} should be rejected");
        }
        assert_eq!(text.to_uppercase().parse::<FileId>().unwrap(), id);
    }

    #[test]
    fn chunk_geometry() {
        assert_eq!(sample(0, 4).chunk_count(), 0);
        assert_eq!(sample(1, 4).chunk_count(), 1);
        assert_eq!(sample(4, 4).chunk_count(), 1);
        assert_eq!(sample(5, 4).chunk_count(), 2);

        let file = sample(10, 4);
        assert_eq!(file.chunk_len(0), 4);
        assert_eq!(file.chunk_len(2), 2);
        assert_eq!(file.chunk_len(3), 0);
    }

    #[test]
    fn serializes_with_catalog_field_names() {
        let info: FileInfo = sample(3, 4).into();
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["fileName"], "a.png");
        assert_eq!(json["fileSize"], 3);
        assert_eq!(json["contentType"], "image/png");
        assert!(json.get("fileId").is_some());
        assert!(json.get("uploadDate").is_some());
    }
}
