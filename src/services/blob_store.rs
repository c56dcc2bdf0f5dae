//! Chunked blob storage.
//!
//! Content is split into fixed-size chunks stored as `(files_id, n, data)`
//! rows; the catalog row written by [`MetadataCatalog::attach`] is the commit
//! point. Uploads never buffer more than one chunk. Downloads fetch one
//! chunk per query and hold no connection between chunks; a stream whose
//! file is deleted underneath it fails with `NotFound` instead of ending
//! early.

use crate::models::{FileId, FileInfo, FileMetadata, FileObject};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::{
    Stream, StreamExt, pin_mut,
    stream::{self, BoxStream},
};
use std::{
    collections::VecDeque,
    io::{self, ErrorKind},
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll},
};
use tokio::sync::{OwnedRwLockReadGuard, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    catalog::MetadataCatalog,
    connector::StorageConnector,
    storage_service::{StorageError, StorageResult, parse_file_id},
};

/// Sequential content stream of a stored file.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Catalog rows fetched per round trip while listing.
const LIST_PAGE_SIZE: i64 = 100;

/// Streaming access to the chunked store.
#[derive(Clone)]
pub struct BlobStore {
    connector: StorageConnector,
    catalog: MetadataCatalog,
}

impl BlobStore {
    pub fn new(connector: StorageConnector, catalog: MetadataCatalog) -> Self {
        Self { connector, catalog }
    }

    /// Stream `stream` into the store and commit it under a new id.
    ///
    /// - Writes one chunk row each time `chunk_size` bytes have arrived.
    /// - Computes size and MD5 while streaming.
    /// - Inserts the catalog row once every chunk is written.
    ///
    /// Any failure, shutdown of the connector, or dropping of the returned
    /// future removes the chunks written so far. The catalog insert runs on
    /// its own task: once started it either commits a complete file or is
    /// rolled back, and it is rolled back when nobody is left to receive the
    /// result.
    pub async fn upload<S>(
        &self,
        stream: S,
        name: &str,
        metadata: FileMetadata,
    ) -> StorageResult<FileObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        metadata
            .check_bounds()
            .map_err(|err| StorageError::Validation(err.to_string()))?;
        let writer = self.connector.begin_write().await?;

        let id = FileId::new();
        let pending =
            PendingChunks::new(self.connector.clone(), self.catalog.clone(), id, writer);

        let (size, md5) = match self.write_chunks(id, stream).await {
            Ok(written) => written,
            Err(err) => {
                pending.rollback().await;
                return Err(err);
            }
        };

        let file = FileObject {
            id,
            name: name.to_string(),
            size,
            content_type: metadata.content_type.clone().unwrap_or_default(),
            upload_date: Utc::now(),
            chunk_size: self.connector.chunk_size() as u64,
            md5,
            metadata,
        };

        let (done, outcome) = oneshot::channel();
        let catalog = self.catalog.clone();
        let committed = file.clone();
        tokio::spawn(async move {
            if let Err(err) = catalog.attach(&committed).await {
                pending.rollback().await;
                let _ = done.send(Err(err));
                return;
            }
            match done.send(Ok(())) {
                Ok(()) => pending.commit(),
                Err(_) => {
                    debug!(id = %committed.id, "upload abandoned during commit");
                    pending.rollback().await;
                }
            }
        });

        match outcome.await {
            Ok(Ok(())) => {
                debug!(%id, size, name, "committed upload");
                Ok(file)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(StorageError::Io(io::Error::other(format!(
                "commit of {} did not complete",
                id
            )))),
        }
    }

    async fn write_chunks<S>(&self, id: FileId, stream: S) -> StorageResult<(u64, String)>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let chunk_size = self.connector.chunk_size();
        let shutdown = self.connector.shutdown_token();
        let sql = format!(
            "INSERT INTO {} (files_id, n, data) VALUES (?, ?, ?)",
            self.connector.bucket().chunks_table()
        );

        let mut buffer = BytesMut::with_capacity(chunk_size);
        let mut n: i64 = 0;
        let mut size: u64 = 0;
        let mut digest = md5::Context::new();

        pin_mut!(stream);
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    return Err(StorageError::Io(io::Error::new(
                        ErrorKind::Interrupted,
                        "upload interrupted by store shutdown",
                    )));
                }
                next = stream.next() => next,
            };
            let Some(item) = next else { break };
            let mut bytes = item?;

            size += bytes.len() as u64;
            digest.consume(&bytes);

            while !bytes.is_empty() {
                let take = (chunk_size - buffer.len()).min(bytes.len());
                buffer.extend_from_slice(&bytes.split_to(take));
                if buffer.len() == chunk_size {
                    self.insert_chunk(&sql, id, n, &buffer).await?;
                    buffer.clear();
                    n += 1;
                }
            }
        }

        if !buffer.is_empty() {
            self.insert_chunk(&sql, id, n, &buffer).await?;
        }

        Ok((size, format!("{:x}", digest.compute())))
    }

    async fn insert_chunk(&self, sql: &str, id: FileId, n: i64, data: &[u8]) -> StorageResult<()> {
        sqlx::query(sql)
            .bind(id)
            .bind(n)
            .bind(data)
            .execute(self.connector.db())
            .await?;
        Ok(())
    }

    /// Open a download stream for the file with textual id `raw_id`.
    pub async fn download(&self, raw_id: &str) -> StorageResult<(FileObject, ByteStream)> {
        let id = parse_file_id(raw_id)?;
        self.open_download(id).await
    }

    /// Open a download stream.
    ///
    /// Chunks are fetched lazily, each with its own short query, so an idle
    /// reader holds no pooled connection. A missing chunk fails the stream:
    /// `NotFound` when the file was deleted meanwhile, `InvalidData` when
    /// the catalog row is still there.
    pub async fn open_download(&self, id: FileId) -> StorageResult<(FileObject, ByteStream)> {
        let file = self.catalog.get(&id).await?;

        let state = DownloadState {
            connector: self.connector.clone(),
            catalog: self.catalog.clone(),
            sql: format!(
                "SELECT data FROM {} WHERE files_id = ? AND n = ?",
                self.connector.bucket().chunks_table()
            ),
            file: file.clone(),
            next: 0,
            shutdown: self.connector.shutdown_token(),
        };

        let body = stream::try_unfold(state, |mut state| async move {
            if state.next >= state.file.chunk_count() {
                return Ok::<_, io::Error>(None);
            }
            if state.shutdown.is_cancelled() {
                return Err(io::Error::new(
                    ErrorKind::Interrupted,
                    "download interrupted by store shutdown",
                ));
            }

            let n = state.next;
            let data: Option<Vec<u8>> = sqlx::query_scalar(&state.sql)
                .bind(state.file.id)
                .bind(n as i64)
                .fetch_optional(state.connector.db())
                .await
                .map_err(io::Error::other)?;

            let Some(data) = data else {
                return Err(state.missing_chunk(n).await);
            };
            let expected = state.file.chunk_len(n);
            if data.len() as u64 != expected {
                return Err(io::Error::new(
                    ErrorKind::InvalidData,
                    format!(
                        "chunk {} of {} has {} bytes, expected {}",
                        n,
                        state.file.id,
                        data.len(),
                        expected
                    ),
                ));
            }

            state.next += 1;
            Ok(Some((Bytes::from(data), state)))
        });

        debug!(%id, size = file.size, "opened download");
        Ok((file, Box::pin(body)))
    }

    /// Remove a file's catalog row and chunks in one transaction.
    pub async fn delete(&self, raw_id: &str) -> StorageResult<bool> {
        let id = parse_file_id(raw_id)?;
        self.connector.ensure_ready()?;

        let mut tx = self.connector.db().begin().await?;
        if !self.catalog.remove_in(&mut *tx, &id).await? {
            return Err(StorageError::NotFound(id.to_string()));
        }
        let sql = format!(
            "DELETE FROM {} WHERE files_id = ?",
            self.connector.bucket().chunks_table()
        );
        let chunks = sqlx::query(&sql)
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        debug!(%id, chunks, "deleted file");
        Ok(true)
    }

    /// Lazily enumerate catalog entries. No content is read.
    pub fn list(&self) -> StorageResult<FileListing> {
        self.connector.ensure_ready()?;
        let skipped = Arc::new(AtomicUsize::new(0));
        let state = ListState {
            catalog: self.catalog.clone(),
            after: 0,
            buffered: VecDeque::new(),
            exhausted: false,
            skipped: skipped.clone(),
        };

        let entries = stream::try_unfold(state, |mut state| async move {
            loop {
                if let Some(info) = state.buffered.pop_front() {
                    return Ok::<_, StorageError>(Some((info, state)));
                }
                if state.exhausted {
                    return Ok(None);
                }

                let page = state.catalog.page(state.after, LIST_PAGE_SIZE).await?;
                if (page.len() as i64) < LIST_PAGE_SIZE {
                    state.exhausted = true;
                }
                for (rowid, decoded) in page {
                    state.after = rowid;
                    match decoded {
                        Ok(file) => state.buffered.push_back(FileInfo::from(file)),
                        Err(err) => {
                            state.skipped.fetch_add(1, Ordering::Relaxed);
                            warn!(rowid, error = %err, "skipping catalog entry that failed to decode");
                        }
                    }
                }
            }
        });

        Ok(FileListing {
            entries: entries.boxed(),
            skipped,
        })
    }
}

struct DownloadState {
    connector: StorageConnector,
    catalog: MetadataCatalog,
    sql: String,
    file: FileObject,
    next: u64,
    shutdown: CancellationToken,
}

impl DownloadState {
    /// Explain a missing chunk: the file is gone, or the store is damaged.
    async fn missing_chunk(&self, n: u64) -> io::Error {
        match self.catalog.fetch_in(self.connector.db(), &self.file.id).await {
            Ok(None) => io::Error::new(
                ErrorKind::NotFound,
                format!("{} was deleted while being read", self.file.id),
            ),
            Ok(Some(_)) => io::Error::new(
                ErrorKind::InvalidData,
                format!("chunk {} of {} is missing", n, self.file.id),
            ),
            Err(err) => io::Error::other(err),
        }
    }
}

struct ListState {
    catalog: MetadataCatalog,
    after: i64,
    buffered: VecDeque<FileInfo>,
    exhausted: bool,
    skipped: Arc<AtomicUsize>,
}

/// Lazy sequence of catalog entries returned by [`BlobStore::list`].
///
/// Entries that fail to decode are skipped and counted; [`skipped`] tells a
/// partially readable catalog apart from an empty one.
///
/// [`skipped`]: FileListing::skipped
pub struct FileListing {
    entries: BoxStream<'static, StorageResult<FileInfo>>,
    skipped: Arc<AtomicUsize>,
}

impl FileListing {
    /// Entries skipped so far because they could not be decoded.
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::Relaxed)
    }
}

impl Stream for FileListing {
    type Item = StorageResult<FileInfo>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.entries.poll_next_unpin(cx)
    }
}

/// Chunks written by an upload that has not committed yet.
///
/// Exactly one of `commit` or `rollback` should end its life. If neither
/// does (the upload future was dropped mid-stream), `Drop` schedules the
/// cleanup on the runtime. Rolling back removes the catalog row as well, in
/// case an insert for this id landed anyway.
struct PendingChunks {
    connector: StorageConnector,
    catalog: MetadataCatalog,
    id: FileId,
    writer: Option<OwnedRwLockReadGuard<()>>,
}

impl PendingChunks {
    fn new(
        connector: StorageConnector,
        catalog: MetadataCatalog,
        id: FileId,
        writer: OwnedRwLockReadGuard<()>,
    ) -> Self {
        Self {
            connector,
            catalog,
            id,
            writer: Some(writer),
        }
    }

    fn commit(mut self) {
        self.writer.take();
    }

    async fn rollback(mut self) {
        let writer = self.writer.take();
        discard_upload(&self.connector, &self.catalog, self.id).await;
        drop(writer);
    }
}

impl Drop for PendingChunks {
    fn drop(&mut self) {
        let Some(writer) = self.writer.take() else {
            return;
        };
        let connector = self.connector.clone();
        let catalog = self.catalog.clone();
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    discard_upload(&connector, &catalog, id).await;
                    drop(writer);
                });
            }
            Err(_) => warn!(%id, "no runtime to discard chunks of abandoned upload"),
        }
    }
}

/// Delete the catalog row and chunks of an uncommitted upload together.
async fn discard_upload(connector: &StorageConnector, catalog: &MetadataCatalog, id: FileId) {
    let sql = format!(
        "DELETE FROM {} WHERE files_id = ?",
        connector.bucket().chunks_table()
    );
    let result = async {
        let mut tx = connector.db().begin().await?;
        catalog.remove_in(&mut *tx, &id).await?;
        let chunks = sqlx::query(&sql)
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok::<_, StorageError>(chunks)
    }
    .await;
    match result {
        Ok(chunks) => debug!(%id, chunks, "rolled back upload"),
        Err(err) => warn!(%id, error = %err, "failed to discard chunks of failed upload"),
    }
}
