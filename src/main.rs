use anyhow::Result;
use axum::Router;
use image_store::{
    auth::ApiToken,
    config::AppConfig,
    routes,
    services::{StorageConnector, StorageService},
};
use std::{io::ErrorKind, path::Path, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Upper bound on how long shutdown waits for in-flight uploads to roll back.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting image-store with config: {:?}", cfg);

    // --- Ensure the SQLite directory exists ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // --- Open the store (creates the bucket tables) ---
    let connector = StorageConnector::connect(&cfg.store_config()).await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        connector.close().await;
        return Ok(()); // exit after migration
    }

    // --- Initialize core service ---
    let storage = StorageService::new(connector.clone(), cfg.operation_timeout);

    // --- Build router ---
    let app: Router = routes::routes::routes(
        ApiToken::new(cfg.api_token.clone()),
        cfg.max_upload_bytes,
    )
    .with_state(storage);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // --- Release the store ---
    if tokio::time::timeout(CLOSE_TIMEOUT, connector.close())
        .await
        .is_err()
    {
        tracing::warn!("Timed out waiting for in-flight uploads to roll back");
    }
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
