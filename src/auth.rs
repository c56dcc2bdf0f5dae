//! Bearer-token authentication for the API routes.
//!
//! Every request under `/v1` must carry `Authorization: Bearer <token>`
//! matching the configured API token. Health probes are mounted outside the
//! guarded router.

use crate::errors::AppError;
use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// The shared secret callers must present.
#[derive(Clone)]
pub struct ApiToken(Arc<str>);

impl ApiToken {
    pub fn new(token: impl Into<Arc<str>>) -> Self {
        Self(token.into())
    }

    /// Constant-time comparison against a presented token.
    pub fn matches(&self, presented: &str) -> bool {
        self.0.as_bytes().ct_eq(presented.as_bytes()).into()
    }
}

pub async fn require_bearer_token(
    State(token): State<ApiToken>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let Some(header) = header else {
        return Err(AppError::unauthorized("Authentication token not provided"));
    };

    match header.strip_prefix("Bearer ").map(str::trim) {
        Some(presented) if token.matches(presented) => Ok(next.run(request).await),
        _ => {
            tracing::debug!("rejected request with invalid bearer token");
            Err(AppError::unauthorized("Invalid authentication token"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_comparison() {
        let token = ApiToken::new("s3cret");
        assert!(token.matches("s3cret"));
        assert!(!token.matches("s3cre"));
        assert!(!token.matches("s3cret!"));
        assert!(!token.matches(""));
    }
}
