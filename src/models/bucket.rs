//! Represents a bucket, the namespace a set of files lives in.

use thiserror::Error;

const BUCKET_NAME_MAX_LEN: usize = 64;

/// Bucket selected inside the backing database.
///
/// A bucket owns two tables, `{name}_files` (catalog) and `{name}_chunks`
/// (content). The name ends up inside SQL text, so it is restricted to
/// lowercase ASCII letters, digits, and underscores.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bucket {
    name: String,
    files_table: String,
    chunks_table: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("bucket `{name}` invalid: {reason}")]
pub struct InvalidBucketName {
    pub name: String,
    pub reason: &'static str,
}

impl Bucket {
    pub const DEFAULT_NAME: &'static str = "fs";

    pub fn new(name: &str) -> Result<Self, InvalidBucketName> {
        let invalid = |reason| InvalidBucketName {
            name: name.to_string(),
            reason,
        };

        if name.is_empty() || name.len() > BUCKET_NAME_MAX_LEN {
            return Err(invalid("must be between 1 and 64 characters"));
        }
        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_'))
        {
            return Err(invalid(
                "allowed characters are lowercase letters, digits, and underscores",
            ));
        }
        if name.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(invalid("must not start with a digit"));
        }

        Ok(Self {
            name: name.to_string(),
            files_table: format!("{name}_files"),
            chunks_table: format!("{name}_chunks"),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn files_table(&self) -> &str {
        &self.files_table
    }

    pub fn chunks_table(&self) -> &str {
        &self.chunks_table
    }
}

impl Default for Bucket {
    fn default() -> Self {
        Self {
            name: Self::DEFAULT_NAME.to_string(),
            files_table: format!("{}_files", Self::DEFAULT_NAME),
            chunks_table: format!("{}_chunks", Self::DEFAULT_NAME),
        }
    }
}
