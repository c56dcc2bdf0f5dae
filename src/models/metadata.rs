//! Auxiliary metadata attached to a file when it is uploaded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Upper bound on entries in [`FileMetadata::extra`].
pub const MAX_EXTRA_ENTRIES: usize = 16;
pub const MAX_EXTRA_KEY_LEN: usize = 64;
pub const MAX_EXTRA_VALUE_LEN: usize = 1024;

/// The catalog's metadata document.
///
/// Stored as JSON next to the file record. Every named field is optional so
/// documents written by older versions (or by hand) still decode.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    /// Name as declared by the uploader, before sanitizing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_file_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_by: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<DateTime<Utc>>,

    /// Bounded open extension map.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("metadata may hold at most {max} extra entries", max = MAX_EXTRA_ENTRIES)]
    TooManyEntries,
    #[error("metadata key `{0}` is empty or longer than {max} bytes", max = MAX_EXTRA_KEY_LEN)]
    KeyTooLong(String),
    #[error("metadata value for `{0}` is longer than {max} bytes", max = MAX_EXTRA_VALUE_LEN)]
    ValueTooLong(String),
}

impl FileMetadata {
    /// Add an extension entry, enforcing the size bounds.
    pub fn insert_extra(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), MetadataError> {
        let key = key.into();
        let value = value.into();
        check_entry(&key, &value)?;
        if !self.extra.contains_key(&key) && self.extra.len() >= MAX_EXTRA_ENTRIES {
            return Err(MetadataError::TooManyEntries);
        }
        self.extra.insert(key, value);
        Ok(())
    }

    /// Re-check the bounds. The fields are public, so the store calls this
    /// before committing a document.
    pub fn check_bounds(&self) -> Result<(), MetadataError> {
        if self.extra.len() > MAX_EXTRA_ENTRIES {
            return Err(MetadataError::TooManyEntries);
        }
        self.extra
            .iter()
            .try_for_each(|(key, value)| check_entry(key, value))
    }
}

fn check_entry(key: &str, value: &str) -> Result<(), MetadataError> {
    if key.is_empty() || key.len() > MAX_EXTRA_KEY_LEN {
        return Err(MetadataError::KeyTooLong(key.to_string()));
    }
    if value.len() > MAX_EXTRA_VALUE_LEN {
        return Err(MetadataError::ValueTooLong(key.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_partial_and_unknown_documents() {
        let meta: FileMetadata =
            serde_json::from_str(r#"{"uploadedBy":"alice","somethingElse":42}"#).unwrap();
        assert_eq!(meta.uploaded_by.as_deref(), Some("alice"));
        assert_eq!(meta.content_type, None);

        let empty: FileMetadata = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, FileMetadata::default());
    }

    #[test]
    fn omits_absent_fields() {
        let meta = FileMetadata {
            content_type: Some("image/png".into()),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_string(&meta).unwrap(),
            r#"{"contentType":"image/png"}"#
        );
    }

    #[test]
    fn extension_map_is_bounded() {
        let mut meta = FileMetadata::default();
        for i in 0..MAX_EXTRA_ENTRIES {
            meta.insert_extra(format!("k{i}"), "v").unwrap();
        }
        assert_eq!(
            meta.insert_extra("one-more", "v"),
            Err(MetadataError::TooManyEntries)
        );
        // Overwriting an existing key does not grow the map.
        meta.insert_extra("k0", "v2").unwrap();

        let long_key = "k".repeat(MAX_EXTRA_KEY_LEN + 1);
        assert!(matches!(
            FileMetadata::default().insert_extra(long_key, "v"),
            Err(MetadataError::KeyTooLong(_))
        ));
        assert!(matches!(
            FileMetadata::default().insert_extra("k", "v".repeat(MAX_EXTRA_VALUE_LEN + 1)),
            Err(MetadataError::ValueTooLong(_))
        ));
    }

    #[test]
    fn check_bounds_catches_direct_mutation() {
        let mut meta = FileMetadata::default();
        meta.extra.insert(String::new(), "v".into());
        assert!(meta.check_bounds().is_err());
    }
}
