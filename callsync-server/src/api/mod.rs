//! HTTP API handlers for callsync-server

pub mod buildinfo;
pub mod calls;
pub mod health;
pub mod pairing;
pub mod upload;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use callsync_common::api::CHUNK_SIZE;

use crate::AppState;

pub use health::health_routes;

/// Sync endpoints used by the device client
pub fn ingest_routes() -> Router<AppState> {
    Router::new()
        .route("/api/verify_pairing_code", post(pairing::verify_pairing_code))
        .route("/api/fetch_config", post(pairing::fetch_config))
        .route("/api/start_call", post(calls::start_call))
        .route("/api/batch_sync_calls", post(calls::batch_sync_calls))
        .route("/api/fetch_updates", post(calls::fetch_updates))
        .route("/api/get_updates", post(calls::fetch_updates))
        .route("/api/update_note", post(calls::update_note))
        .route("/api/check_recordings_status", post(upload::check_recordings_status))
        .route(
            "/api/upload_chunk",
            post(upload::upload_chunk).layer(DefaultBodyLimit::max(CHUNK_SIZE + 64 * 1024)),
        )
        .route("/api/finalize_upload", post(upload::finalize_upload))
        .route("/api/buildinfo", get(buildinfo::get_build_info))
}
