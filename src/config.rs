use crate::services::{StoreConfig, connector::DEFAULT_CHUNK_SIZE};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, fmt, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub bucket: String,
    pub chunk_size: usize,
    pub max_connections: u32,
    pub api_token: String,
    pub operation_timeout: Duration,
    pub max_upload_bytes: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Chunked image storage API")]
pub struct Args {
    /// Host to bind to (overrides IMAGE_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides IMAGE_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides IMAGE_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Bucket (table prefix) to store files in (overrides IMAGE_STORE_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Chunk size in bytes (overrides IMAGE_STORE_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::merge(args, |key| env::var(key))?, migrate))
    }

    /// Merge CLI args over values looked up through `var`.
    fn merge(
        args: Args,
        var: impl Fn(&str) -> Result<String, env::VarError>,
    ) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = var("IMAGE_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = parse_var(&var, "IMAGE_STORE_PORT", 3000u16)?;
        let env_db = var("IMAGE_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/image_store.db".into());
        let env_bucket = var("IMAGE_STORE_BUCKET").unwrap_or_else(|_| "fs".into());
        let env_chunk = parse_var(&var, "IMAGE_STORE_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?;
        let max_connections = parse_var(
            &var,
            "IMAGE_STORE_MAX_CONNECTIONS",
            StoreConfig::default().max_connections,
        )?;
        let timeout_secs = parse_var(&var, "IMAGE_STORE_OPERATION_TIMEOUT_SECS", 300u64)?;
        let max_upload_bytes =
            parse_var(&var, "IMAGE_STORE_MAX_UPLOAD_BYTES", 32 * 1024 * 1024usize)?;

        let api_token = match var("IMAGE_STORE_API_TOKEN") {
            Ok(token) if !token.trim().is_empty() => token.trim().to_string(),
            Ok(_) | Err(env::VarError::NotPresent) => {
                bail!("IMAGE_STORE_API_TOKEN must be set")
            }
            Err(err) => return Err(err).context("reading IMAGE_STORE_API_TOKEN"),
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            bucket: args.bucket.unwrap_or(env_bucket),
            chunk_size: args.chunk_size.unwrap_or(env_chunk),
            max_connections,
            api_token,
            operation_timeout: Duration::from_secs(timeout_secs),
            max_upload_bytes,
        };

        if cfg.chunk_size == 0 {
            bail!("chunk size must be greater than zero");
        }
        if cfg.max_connections == 0 {
            bail!("IMAGE_STORE_MAX_CONNECTIONS must be greater than zero");
        }
        if cfg.operation_timeout.is_zero() {
            bail!("IMAGE_STORE_OPERATION_TIMEOUT_SECS must be greater than zero");
        }

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Settings for the storage connector.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            database_url: self.database_url.clone(),
            bucket: self.bucket.clone(),
            chunk_size: self.chunk_size,
            max_connections: self.max_connections,
            ..StoreConfig::default()
        }
    }
}

// Hand-written so the API token never reaches the logs.
impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("bucket", &self.bucket)
            .field("chunk_size", &self.chunk_size)
            .field("max_connections", &self.max_connections)
            .field("api_token", &"<redacted>")
            .field("operation_timeout", &self.operation_timeout)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .finish()
    }
}

fn parse_var<T>(
    var: &impl Fn(&str) -> Result<String, env::VarError>,
    key: &str,
    default: T,
) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
