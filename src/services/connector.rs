//! Connection lifecycle for the chunked backing store.
//!
//! A `StorageConnector` is opened once at service start, cloned into every
//! component that needs storage, and closed on shutdown. Closing trips a
//! cancellation token that in-flight uploads observe, waits for those uploads
//! to finish rolling back, then closes the SQLite pool.

use crate::models::Bucket;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{str::FromStr, sync::Arc, time::Duration};
use tokio::sync::{OwnedRwLockReadGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::storage_service::{StorageError, StorageResult};

/// Chunk size used by chunked stores traditionally (255 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 255 * 1024;

const SCHEMA_SQL: &str = include_str!("../../migrations/0001_init.sql");

/// Settings needed to open the backing store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub bucket: String,
    pub chunk_size: usize,
    pub max_connections: u32,
    pub busy_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/image_store.db".into(),
            bucket: Bucket::DEFAULT_NAME.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_connections: 5,
            busy_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

/// Shared handle to the backing store.
#[derive(Clone)]
pub struct StorageConnector {
    db: Arc<SqlitePool>,
    bucket: Arc<Bucket>,
    chunk_size: usize,
    shutdown: CancellationToken,
    /// Held for reading by every in-flight upload; `close` takes it for
    /// writing so pending rollbacks complete before the pool goes away.
    writers: Arc<RwLock<()>>,
}

impl StorageConnector {
    /// Open the pool, verify connectivity, select the bucket, and make sure
    /// its tables exist.
    pub async fn connect(config: &StoreConfig) -> StorageResult<Self> {
        let bucket = Bucket::new(&config.bucket)
            .map_err(|err| StorageError::Validation(err.to_string()))?;
        if config.chunk_size == 0 {
            return Err(StorageError::Validation(
                "chunk size must be greater than zero".into(),
            ));
        }

        let options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(|err| {
                StorageError::StoreUnavailable(format!(
                    "invalid database url `{}`: {}",
                    config.database_url, err
                ))
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(|err| {
                StorageError::StoreUnavailable(format!(
                    "connecting to `{}`: {}",
                    config.database_url, err
                ))
            })?;

        let connector = Self {
            db: Arc::new(pool),
            bucket: Arc::new(bucket),
            chunk_size: config.chunk_size,
            shutdown: CancellationToken::new(),
            writers: Arc::new(RwLock::new(())),
        };

        connector.health_check().await?;
        connector.ensure_schema().await?;
        connector.purge_orphaned_chunks().await?;

        info!(
            bucket = connector.bucket.name(),
            chunk_size = connector.chunk_size,
            "storage connector ready"
        );
        Ok(connector)
    }

    /// Create the bucket tables if they are missing.
    ///
    /// Runs the embedded schema one statement at a time.
    pub async fn ensure_schema(&self) -> StorageResult<()> {
        self.ensure_ready()?;
        let sql = SCHEMA_SQL.replace("{bucket}", self.bucket.name());
        let statements = sql
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("running {} schema statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Drop chunks that no catalog row refers to.
    ///
    /// Only safe while no upload is in flight, so it runs during `connect`.
    async fn purge_orphaned_chunks(&self) -> StorageResult<u64> {
        let sql = format!(
            "DELETE FROM {chunks} WHERE files_id NOT IN (SELECT id FROM {files})",
            chunks = self.bucket.chunks_table(),
            files = self.bucket.files_table(),
        );
        let purged = sqlx::query(&sql).execute(&*self.db).await?.rows_affected();
        if purged > 0 {
            info!(purged, "removed chunks left behind by interrupted uploads");
        }
        Ok(purged)
    }

    /// Round-trip a trivial query through the pool.
    pub async fn health_check(&self) -> StorageResult<()> {
        self.ensure_ready()?;
        let value = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await
            .map_err(|err| StorageError::StoreUnavailable(format!("health check: {}", err)))?;
        if value != 1 {
            return Err(StorageError::StoreUnavailable(format!(
                "health check returned unexpected value {}",
                value
            )));
        }
        Ok(())
    }

    /// Fail with `StoreUnavailable` once the connector has been closed.
    pub fn ensure_ready(&self) -> StorageResult<()> {
        if self.shutdown.is_cancelled() || self.db.is_closed() {
            return Err(StorageError::StoreUnavailable(
                "storage connector is closed".into(),
            ));
        }
        Ok(())
    }

    /// Register an in-flight upload. `close` waits for every guard to drop.
    pub(crate) async fn begin_write(&self) -> StorageResult<OwnedRwLockReadGuard<()>> {
        self.ensure_ready()?;
        let guard = self.writers.clone().read_owned().await;
        // `close` may have started while we waited.
        self.ensure_ready()?;
        Ok(guard)
    }

    /// Cancel in-flight work, wait for uploads to roll back, close the pool.
    pub async fn close(&self) {
        if self.shutdown.is_cancelled() && self.db.is_closed() {
            return;
        }
        self.shutdown.cancel();
        let _writers = self.writers.write().await;
        self.db.close().await;
        info!(bucket = self.bucket.name(), "storage connector closed");
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn bucket(&self) -> &Bucket {
        &self.bucket
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Token tripped by [`close`](Self::close).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn connect_creates_bucket_tables() {
        let (_dir, connector) = connector(DEFAULT_CHUNK_SIZE).await;
        connector.health_check().await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(connector.db())
        .await
        .unwrap();
        assert!(tables.contains(&"fs_files".to_string()));
        assert!(tables.contains(&"fs_chunks".to_string()));

        // Idempotent.
        connector.ensure_schema().await.unwrap();
    }

    #[tokio::test]
    async fn rejects_bad_bucket_and_chunk_size() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("x.db").display());

        let bad_bucket = StoreConfig {
            database_url: url.clone(),
            bucket: "Robert'); DROP".into(),
            ..StoreConfig::default()
        };
        assert!(matches!(
            StorageConnector::connect(&bad_bucket).await,
            Err(StorageError::Validation(_))
        ));

        let zero_chunks = StoreConfig {
            database_url: url,
            chunk_size: 0,
            ..StoreConfig::default()
        };
        assert!(matches!(
            StorageConnector::connect(&zero_chunks).await,
            Err(StorageError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_store_is_unavailable() {
        let config = StoreConfig {
            database_url: "sqlite:///nonexistent-dir/definitely/missing/store.db".into(),
            ..StoreConfig::default()
        };
        assert!(matches!(
            StorageConnector::connect(&config).await,
            Err(StorageError::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn connect_purges_orphaned_chunks() {
        let (dir, connector) = connector(4).await;
        let sql = format!(
            "INSERT INTO {} (files_id, n, data) VALUES (?, 0, ?)",
            connector.bucket().chunks_table()
        );
        sqlx::query(&sql)
            .bind(crate::models::FileId::new())
            .bind(&b"abcd"[..])
            .execute(connector.db())
            .await
            .unwrap();
        assert_eq!(chunk_rows(&connector).await, 1);
        connector.close().await;

        let reopened = StorageConnector::connect(&StoreConfig {
            database_url: format!("sqlite://{}", dir.path().join("store.db").display()),
            chunk_size: 4,
            ..StoreConfig::default()
        })
        .await
        .unwrap();
        assert_eq!(chunk_rows(&reopened).await, 0);
    }

    #[tokio::test]
    async fn closed_connector_is_unavailable() {
        let (_dir, connector) = connector(DEFAULT_CHUNK_SIZE).await;
        let token = connector.shutdown_token();
        connector.close().await;

        assert!(token.is_cancelled());
        assert!(matches!(
            connector.ensure_ready(),
            Err(StorageError::StoreUnavailable(_))
        ));
        assert!(matches!(
            connector.health_check().await,
            Err(StorageError::StoreUnavailable(_))
        ));
        // Closing twice is harmless.
        connector.close().await;
    }
}
