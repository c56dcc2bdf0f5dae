//! Defines routes for all image operations.
//!
//! ## Structure
//! - **Probes** (unauthenticated)
//!   - `GET    /healthz` — liveness
//!   - `GET    /readyz` — readiness (backing store round trip)
//!
//! - **Image endpoints** (bearer token required)
//!   - `POST   /v1/images/upload` — multipart upload (`uploadedBy`, `file`)
//!   - `GET    /v1/images/list` — metadata of every image
//!   - `GET    /v1/images/view/{id}` — image bytes
//!   - `GET    /v1/images/metadata/{id}` — metadata of one image
//!   - `DELETE /v1/images/remove/{id}` — delete an image
//!
//! - **Info** (bearer token required)
//!   - `GET    /v1/info/ping`

use crate::{
    auth::{ApiToken, require_bearer_token},
    handlers::{
        health_handlers::{healthz, ping, readyz},
        image_handlers::{delete_image, image_metadata, list_images, upload_image, view_image},
    },
    services::StorageService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post},
};

/// Build and return the router for the image API.
///
/// The router carries shared state (`StorageService`) to all handlers;
/// `max_upload_bytes` caps request bodies on the image routes.
pub fn routes(token: ApiToken, max_upload_bytes: usize) -> Router<StorageService> {
    let images = Router::new()
        .route("/upload", post(upload_image))
        .route("/list", get(list_images))
        .route("/view/{id}", get(view_image))
        .route("/metadata/{id}", get(image_metadata))
        .route("/remove/{id}", delete(delete_image))
        .layer(DefaultBodyLimit::max(max_upload_bytes));

    let info = Router::new().route("/ping", get(ping));

    let api = Router::new()
        .nest("/v1/images", images)
        .nest("/v1/info", info)
        .route_layer(middleware::from_fn_with_state(token, require_bearer_token));

    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .merge(api)
}
