//! Error types for callsync-server
//!
//! Protocol failures are reported in-band: HTTP 200 with
//! `{"success": false, "error": ..., "code": ...}`. Malformed requests get
//! 400 and storage failures 500, so clients can tell "retry later" from
//! "the server said no".

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use callsync_common::api::{ErrorCode, ErrorEnvelope};
use thiserror::Error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Device already bound to another identity in the org
    #[error("Device is already paired with another employee: {0}")]
    PairingConflict(String),

    /// Write from a device that is no longer the bound one
    #[error("Device is not paired with this employee: {0}")]
    DeviceMismatch(String),

    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// Finalize found a gap in the uploaded chunks
    #[error("Missing chunk {0}")]
    ChunkMissing(u32),

    /// Missing or malformed field (400)
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ApiError::PairingConflict(_) => ErrorCode::PairingConflict,
            ApiError::DeviceMismatch(_) => ErrorCode::DeviceMismatch,
            ApiError::CallNotFound(_) => ErrorCode::CallNotFound,
            ApiError::ChunkMissing(_) => ErrorCode::ChunkMissing,
            ApiError::Validation(_) => ErrorCode::ValidationError,
            ApiError::Database(_) | ApiError::Io(_) | ApiError::Internal(_) => ErrorCode::DatabaseError,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::PairingConflict(_)
            | ApiError::DeviceMismatch(_)
            | ApiError::CallNotFound(_)
            | ApiError::ChunkMissing(_) => StatusCode::OK,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Database(_) | ApiError::Io(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<callsync_common::Error> for ApiError {
    fn from(err: callsync_common::Error) -> Self {
        match err {
            callsync_common::Error::Database(e) => ApiError::Database(e),
            callsync_common::Error::Io(e) => ApiError::Io(e),
            callsync_common::Error::InvalidInput(msg) => ApiError::Validation(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, code = %self.code(), "Request rejected");
        }
        (status, Json(ErrorEnvelope::new(self.code(), self.to_string()))).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
