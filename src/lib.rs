//! Chunked image storage over SQLite with an authenticated HTTP API.

pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
