//! Catalog documents: one row per committed file.
//!
//! The row is written exactly once, when an upload commits, and removed
//! exactly once, when the file is deleted. Its presence is what makes a file
//! visible; chunks without a row are invisible to every read path.

use crate::models::{FileId, FileMetadata, FileObject};
use chrono::{DateTime, Utc};
use sqlx::{Executor, FromRow, Row, Sqlite, sqlite::SqliteRow};
use std::io;

use super::{
    connector::StorageConnector,
    storage_service::{StorageError, StorageResult, parse_file_id},
};

const COLUMNS: &str = "id, name, length, chunk_size, upload_date, md5, metadata";

#[derive(FromRow)]
struct CatalogRow {
    id: FileId,
    name: String,
    length: i64,
    chunk_size: i64,
    upload_date: DateTime<Utc>,
    md5: String,
    metadata: Option<String>,
}

impl TryFrom<CatalogRow> for FileObject {
    type Error = StorageError;

    fn try_from(row: CatalogRow) -> Result<Self, Self::Error> {
        let metadata = match row.metadata.as_deref() {
            None | Some("") => FileMetadata::default(),
            Some(doc) => serde_json::from_str::<FileMetadata>(doc).map_err(|err| {
                corrupt(format!("metadata document of {}: {}", row.id, err))
            })?,
        };
        let size = u64::try_from(row.length)
            .map_err(|_| corrupt(format!("negative length for {}", row.id)))?;
        let chunk_size = u64::try_from(row.chunk_size)
            .map_err(|_| corrupt(format!("negative chunk size for {}", row.id)))?;

        Ok(FileObject {
            id: row.id,
            name: row.name,
            size,
            content_type: metadata.content_type.clone().unwrap_or_default(),
            upload_date: row.upload_date,
            chunk_size,
            md5: row.md5,
            metadata,
        })
    }
}

fn corrupt(msg: String) -> StorageError {
    StorageError::Io(io::Error::new(io::ErrorKind::InvalidData, msg))
}

fn decode_row(row: &SqliteRow) -> StorageResult<FileObject> {
    CatalogRow::from_row(row)
        .map_err(|err| corrupt(format!("catalog row: {}", err)))?
        .try_into()
}

/// Reads and writes catalog rows for the connector's bucket.
#[derive(Clone)]
pub struct MetadataCatalog {
    connector: StorageConnector,
}

impl MetadataCatalog {
    pub fn new(connector: StorageConnector) -> Self {
        Self { connector }
    }

    /// Insert the catalog row for a freshly uploaded file.
    ///
    /// This is the commit point of an upload.
    pub async fn attach(&self, file: &FileObject) -> StorageResult<()> {
        self.connector.ensure_ready()?;
        let document = serde_json::to_string(&file.metadata).map_err(io::Error::from)?;
        let sql = format!(
            "INSERT INTO {} ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)",
            self.connector.bucket().files_table()
        );
        sqlx::query(&sql)
            .bind(file.id)
            .bind(&file.name)
            .bind(to_i64(file.size)?)
            .bind(to_i64(file.chunk_size)?)
            .bind(file.upload_date)
            .bind(&file.md5)
            .bind(document)
            .execute(self.connector.db())
            .await?;
        Ok(())
    }

    /// Look up a file by its textual id.
    ///
    /// `InvalidId` when `raw_id` is malformed, `NotFound` when no live file
    /// has that id.
    pub async fn get_metadata(&self, raw_id: &str) -> StorageResult<FileObject> {
        let id = parse_file_id(raw_id)?;
        self.get(&id).await
    }

    pub async fn get(&self, id: &FileId) -> StorageResult<FileObject> {
        self.connector.ensure_ready()?;
        self.fetch_in(self.connector.db(), id)
            .await?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    /// Fetch a row through `executor`, so callers can read inside their own
    /// transaction.
    pub(crate) async fn fetch_in<'c, E>(
        &self,
        executor: E,
        id: &FileId,
    ) -> StorageResult<Option<FileObject>>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE id = ?",
            self.connector.bucket().files_table()
        );
        let row = sqlx::query(&sql).bind(*id).fetch_optional(executor).await?;
        row.as_ref().map(decode_row).transpose()
    }

    /// Delete a row through `executor`. Returns whether a row existed.
    pub(crate) async fn remove_in<'c, E>(&self, executor: E, id: &FileId) -> StorageResult<bool>
    where
        E: Executor<'c, Database = Sqlite>,
    {
        let sql = format!(
            "DELETE FROM {} WHERE id = ?",
            self.connector.bucket().files_table()
        );
        let result = sqlx::query(&sql).bind(*id).execute(executor).await?;
        Ok(result.rows_affected() > 0)
    }

    /// One page of rows in insertion order, starting after `after_rowid`.
    ///
    /// Each entry carries its rowid (the cursor for the next page) and the
    /// decode result, so a single bad row does not poison the page.
    pub(crate) async fn page(
        &self,
        after_rowid: i64,
        limit: i64,
    ) -> StorageResult<Vec<(i64, StorageResult<FileObject>)>> {
        self.connector.ensure_ready()?;
        let sql = format!(
            "SELECT rowid, {COLUMNS} FROM {} WHERE rowid > ? ORDER BY rowid LIMIT ?",
            self.connector.bucket().files_table()
        );
        let rows = sqlx::query(&sql)
            .bind(after_rowid)
            .bind(limit)
            .fetch_all(self.connector.db())
            .await?;

        let mut page = Vec::with_capacity(rows.len());
        for row in &rows {
            let rowid: i64 = row.try_get(0)?;
            page.push((rowid, decode_row(row)));
        }
        Ok(page)
    }
}

fn to_i64(value: u64) -> StorageResult<i64> {
    i64::try_from(value).map_err(|_| {
        StorageError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("value {} does not fit the catalog", value),
        ))
    })
}
