//! The core image API: upload, metadata lookup, download,
//! listing, and delete. Name and content-type checks run here before any
//! I/O; the chunked store and its catalog do the rest.

use crate::models::{FileId, FileMetadata, FileObject};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, stream};
use std::{future::Future, io, time::Duration};
use thiserror::Error;
use tracing::debug;

use super::{
    blob_store::{BlobStore, ByteStream, FileListing},
    catalog::MetadataCatalog,
    connector::StorageConnector,
    content_type, filename,
};

/// Uploader recorded when the caller does not name one.
pub const ANONYMOUS_UPLOADER: &str = "anonymous";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{0}")]
    Validation(String),
    #[error("invalid file id `{0}`")]
    InvalidId(String),
    #[error("file `{0}` not found")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("storage unavailable: {0}")]
    StoreUnavailable(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
                StorageError::StoreUnavailable(err.to_string())
            }
            sqlx::Error::Io(err) => StorageError::Io(err),
            other => StorageError::Io(io::Error::other(other)),
        }
    }
}

/// Parse a textual id, mapping malformed input to `InvalidId`.
pub fn parse_file_id(raw: &str) -> StorageResult<FileId> {
    raw.parse()
        .map_err(|_| StorageError::InvalidId(raw.to_string()))
}

/// StorageService provides the image operations:
/// - Upload an image (validate, sanitize, resolve content type, stream in)
/// - Get metadata (catalog lookup)
/// - Download (catalog lookup + chunk stream)
/// - List (lazy catalog enumeration, no content)
/// - Delete (catalog row and chunks together)
///
/// Every storage call runs under `operation_timeout`; an expired deadline
/// surfaces as a timed-out I/O error and rolls back partial writes.
#[derive(Clone)]
pub struct StorageService {
    pub connector: StorageConnector,
    catalog: MetadataCatalog,
    blobs: BlobStore,
    operation_timeout: Duration,
}

impl StorageService {
    pub fn new(connector: StorageConnector, operation_timeout: Duration) -> Self {
        let catalog = MetadataCatalog::new(connector.clone());
        let blobs = BlobStore::new(connector.clone(), catalog.clone());
        Self {
            connector,
            catalog,
            blobs,
            operation_timeout,
        }
    }

    /// Validate and stream an image into the store.
    ///
    /// Rejects, before reading any bytes, content types outside the allowed
    /// image set and names that fail [`filename::validate`]. A stream that
    /// ends without yielding a byte is rejected before anything is written.
    /// The stored name is the sanitized form; the declared one is kept in
    /// the metadata.
    pub async fn upload<S>(
        &self,
        stream: S,
        declared_name: &str,
        declared_content_type: Option<&str>,
        uploaded_by: Option<&str>,
    ) -> StorageResult<FileObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let content_type = content_type::resolve(declared_content_type, declared_name);
        if !content_type::is_allowed_image(&content_type) {
            return Err(StorageError::Validation(
                "Invalid image file. Only JPG, PNG, GIF, BMP and WebP formats are allowed".into(),
            ));
        }
        if !filename::validate(declared_name) {
            return Err(StorageError::Validation("Invalid file name".into()));
        }
        let safe_name = filename::sanitize(declared_name);

        let uploader = uploaded_by
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .unwrap_or(ANONYMOUS_UPLOADER);

        let metadata = FileMetadata {
            content_type: Some(content_type),
            original_file_name: Some(declared_name.to_string()),
            uploaded_by: Some(uploader.to_string()),
            upload_date: Some(Utc::now()),
            ..Default::default()
        };

        debug!(name = %safe_name, uploader, "starting upload");
        self.with_deadline(async {
            let mut input = Box::pin(stream);
            let first = loop {
                match input.next().await {
                    Some(Ok(bytes)) if bytes.is_empty() => continue,
                    Some(Ok(bytes)) => break bytes,
                    Some(Err(err)) => return Err(StorageError::Io(err)),
                    None => return Err(StorageError::Validation("Empty image file".into())),
                }
            };
            let body = stream::once(async move { Ok(first) }).chain(input);
            self.blobs.upload(body, &safe_name, metadata).await
        })
        .await
    }

    /// Catalog entry of one file.
    pub async fn get_metadata(&self, id: &str) -> StorageResult<FileObject> {
        self.with_deadline(self.catalog.get_metadata(id)).await
    }

    /// Open a content stream. The returned file carries the content type.
    pub async fn download(&self, id: &str) -> StorageResult<(FileObject, ByteStream)> {
        self.with_deadline(self.blobs.download(id)).await
    }

    /// Lazily enumerate every stored file.
    pub fn list_all(&self) -> StorageResult<FileListing> {
        self.blobs.list()
    }

    pub async fn delete(&self, id: &str) -> StorageResult<bool> {
        self.with_deadline(self.blobs.delete(id)).await
    }

    async fn with_deadline<T>(
        &self,
        operation: impl Future<Output = StorageResult<T>>,
    ) -> StorageResult<T> {
        match tokio::time::timeout(self.operation_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!(
                    "storage operation exceeded {}s deadline",
                    self.operation_timeout.as_secs_f64()
                ),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::connector::test_support::{chunk_rows, connector};
    use futures::TryStreamExt;
    use std::collections::HashSet;

    const CHUNK: usize = 16;

    fn service(connector: &crate::services::StorageConnector) -> StorageService {
        StorageService::new(connector.clone(), Duration::from_secs(30))
    }

    fn body(data: &[u8]) -> impl Stream<Item = io::Result<Bytes>> + Send + use<> {
        stream::iter(vec![Ok(Bytes::copy_from_slice(data))])
    }

    async fn read_all(body: ByteStream) -> Vec<u8> {
        body.map_ok(|b| b.to_vec())
            .try_concat()
            .await
            .expect("read body")
    }

    #[tokio::test]
    async fn upload_records_metadata() {
        let (_dir, connector) = connector(CHUNK).await;
        let service = service(&connector);

        let file = service
            .upload(body(b"png bytes"), "bad name.png", Some("image/PNG"), Some("alice"))
            .await
            .unwrap();
        assert_eq!(file.name, "bad_name.png");
        assert_eq!(file.content_type, "image/png");
        assert_eq!(file.size, 9);
        assert_eq!(
            file.metadata.original_file_name.as_deref(),
            Some("bad name.png")
        );
        assert_eq!(file.metadata.uploaded_by.as_deref(), Some("alice"));
        assert!(file.metadata.upload_date.is_some());

        let loaded = service.get_metadata(&file.id.to_string()).await.unwrap();
        assert_eq!(loaded.metadata, file.metadata);
    }

    #[tokio::test]
    async fn uploader_defaults_to_anonymous() {
        let (_dir, connector) = connector(CHUNK).await;
        let file = service(&connector)
            .upload(body(b"x"), "x.gif", None, Some("  "))
            .await
            .unwrap();
        assert_eq!(file.metadata.uploaded_by.as_deref(), Some(ANONYMOUS_UPLOADER));
        assert_eq!(file.content_type, "image/gif");
    }

    #[tokio::test]
    async fn validation_happens_before_any_write() {
        let (_dir, connector) = connector(CHUNK).await;
        let service = service(&connector);

        // A stream that would fail if it were ever polled.
        let poisoned = || {
            stream::poll_fn(|_| -> std::task::Poll<Option<io::Result<Bytes>>> {
                panic!("stream must not be read")
            })
        };

        for (name, declared) in [
            ("notes.txt", None),
            ("x.png", Some("text/html")),
            ("x.xyz", Some("")),
        ] {
            assert!(matches!(
                service.upload(poisoned(), name, declared, None).await,
                Err(StorageError::Validation(_))
            ));
        }
        for name in ["../etc/passwd.png", "", "a;b.png"] {
            assert!(matches!(
                service
                    .upload(poisoned(), name, Some("image/png"), None)
                    .await,
                Err(StorageError::Validation(_))
            ));
        }
        assert_eq!(chunk_rows(&connector).await, 0);
    }

    #[tokio::test]
    async fn empty_images_are_rejected_without_writes() {
        let (_dir, connector) = connector(CHUNK).await;
        let service = service(&connector);

        let empty = stream::iter(vec![Ok(Bytes::new()), Ok(Bytes::new())]);
        assert!(matches!(
            service.upload(empty, "x.png", None, None).await,
            Err(StorageError::Validation(_))
        ));
        assert!(matches!(
            service.upload(stream::empty(), "x.png", None, None).await,
            Err(StorageError::Validation(_))
        ));

        assert_eq!(chunk_rows(&connector).await, 0);
        let listed: Vec<_> = service.list_all().unwrap().try_collect().await.unwrap();
        assert!(listed.is_empty());

        // Leading empty pieces are fine once real bytes follow.
        let padded = stream::iter(vec![Ok(Bytes::new()), Ok(Bytes::from_static(b"gif"))]);
        let file = service.upload(padded, "x.gif", None, None).await.unwrap();
        assert_eq!(file.size, 3);
    }

    #[tokio::test]
    async fn post_delete_unavailability() {
        let (_dir, connector) = connector(CHUNK).await;
        let service = service(&connector);
        let file = service
            .upload(body(&[3u8; CHUNK * 2]), "x.png", None, None)
            .await
            .unwrap();
        let id = file.id.to_string();

        assert!(service.delete(&id).await.unwrap());
        assert!(matches!(
            service.download(&id).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            service.get_metadata(&id).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn listing_matches_uploads() {
        let (_dir, connector) = connector(CHUNK).await;
        let service = service(&connector);

        let a = service.upload(body(b"aaaa"), "a.png", None, None).await.unwrap();
        let b = service
            .upload(body(&[1u8; CHUNK * 3]), "b.jpg", None, None)
            .await
            .unwrap();
        let c = service.upload(body(b"c"), "c.webp", None, None).await.unwrap();

        let listed: Vec<_> = service.list_all().unwrap().try_collect().await.unwrap();
        assert_eq!(listed.len(), 3);
        for expected in [&a, &b, &c] {
            let entry = listed.iter().find(|e| e.id == expected.id).unwrap();
            assert_eq!(entry.name, expected.name);
            assert_eq!(entry.size, expected.size);
            assert_eq!(entry.content_type, expected.content_type);
        }

        // Listing projection carries no content.
        let json = serde_json::to_value(&listed[0]).unwrap();
        let keys: HashSet<_> = json.as_object().unwrap().keys().cloned().collect();
        let expected: HashSet<String> = ["fileId", "fileName", "contentType", "fileSize", "uploadDate"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(keys, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_uploads_are_isolated() {
        let (_dir, connector) = connector(CHUNK).await;
        let service = service(&connector);

        let first: Vec<u8> = (0..200u8).collect();
        let second: Vec<u8> = (0..150u8).rev().collect();

        let (a, b) = tokio::join!(
            service.upload(body(&first), "first.png", None, Some("a")),
            service.upload(body(&second), "second.png", None, Some("b")),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a.id, b.id);

        let (_, a_body) = service.download(&a.id.to_string()).await.unwrap();
        let (_, b_body) = service.download(&b.id.to_string()).await.unwrap();
        assert_eq!(read_all(a_body).await, first);
        assert_eq!(read_all(b_body).await, second);
    }

    #[tokio::test]
    async fn deadline_expiry_rolls_back() {
        let (_dir, connector) = connector(CHUNK).await;
        let service = StorageService::new(connector.clone(), Duration::from_millis(100));

        let stalled = stream::iter(vec![Ok(Bytes::from(vec![1u8; CHUNK * 2]))])
            .chain(stream::pending());
        let err = service
            .upload(stalled, "x.png", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Io(ref e) if e.kind() == io::ErrorKind::TimedOut));

        let mut remaining = chunk_rows(&connector).await;
        for _ in 0..50 {
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            remaining = chunk_rows(&connector).await;
        }
        assert_eq!(remaining, 0);
        let listed: Vec<_> = service.list_all().unwrap().try_collect().await.unwrap();
        assert!(listed.is_empty());
    }

    #[test]
    fn sqlx_pool_errors_map_to_unavailable() {
        assert!(matches!(
            StorageError::from(sqlx::Error::PoolClosed),
            StorageError::StoreUnavailable(_)
        ));
        assert!(matches!(
            StorageError::from(sqlx::Error::RowNotFound),
            StorageError::Io(_)
        ));
    }
}
