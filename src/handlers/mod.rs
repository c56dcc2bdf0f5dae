//! HTTP handlers. Thin adapters between axum extractors and the
//! `StorageService` API; they never touch the backing store directly.

pub mod health_handlers;
pub mod image_handlers;
