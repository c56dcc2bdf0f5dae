//! Health, readiness & info handlers.
//!
//! - GET /healthz       -> simple liveness ("ok")
//! - GET /readyz        -> readiness that checks the backing store
//! - GET /v1/info/ping  -> authenticated ping with server time

use crate::services::StorageService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Very small liveness probe. Always returns 200 OK with a plain JSON body.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that round-trips `SELECT 1` through the storage
/// connector. HTTP 200 when the store answers, HTTP 503 otherwise
/// (including after the connector has been closed).
pub async fn readyz(State(service): State<StorageService>) -> impl IntoResponse {
    let store_check = match service.connector.health_check().await {
        Ok(()) => CheckStatus {
            ok: true,
            error: None,
        },
        Err(e) => CheckStatus {
            ok: false,
            error: Some(e.to_string()),
        },
    };

    let overall_ok = store_check.ok;
    let mut checks = HashMap::new();
    checks.insert("store", store_check);

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

/// `GET /v1/info/ping`
pub async fn ping() -> impl IntoResponse {
    Json(PingResponse {
        status: "success",
        message: "Server is operational",
        timestamp: Utc::now(),
    })
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}

#[derive(Serialize)]
struct PingResponse {
    status: &'static str,
    message: &'static str,
    timestamp: DateTime<Utc>,
}
