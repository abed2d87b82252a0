//! callsync-server library - Server Ingest API
//!
//! Multi-tenant endpoints that receive call metadata and chunked recordings
//! from paired devices and serve deltas back to them.

use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod pairing;
pub mod storage;

pub use crate::error::{ApiError, ApiResult};
use crate::storage::RecordingStorage;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub storage: RecordingStorage,
    /// Origin prefixed to `/public/...` in recording URLs
    pub base_url: Arc<str>,
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(db: SqlitePool, storage: RecordingStorage, base_url: &str) -> Self {
        Self {
            db,
            storage,
            base_url: Arc::from(base_url.trim_end_matches('/')),
            startup_time: Utc::now(),
        }
    }
}

/// Build application router
///
/// Ingest endpoints under `/api`, assembled recordings under `/public`,
/// health and build info without credentials.
pub fn build_router(state: AppState) -> Router {
    let public_files = ServeDir::new(state.storage.public_dir());

    Router::new()
        .merge(api::ingest_routes())
        .merge(api::health_routes())
        .nest_service("/public", public_files)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
