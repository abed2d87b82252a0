//! Error types for callsync-client
//!
//! Every failure a worker can hit is classified as transient (retry on the
//! next run) or permanent (stop automatic retries until the user asks).

use callsync_common::api::{ErrorCode, RemoteFailure};
use callsync_common::status::TransitionError;
use thiserror::Error;

/// Client-side sync error
#[derive(Debug, Error)]
pub enum SyncError {
    /// Device is bound to a different identity in the organisation
    #[error("Pairing conflict: {0}")]
    PairingConflict(String),

    /// Stored identity is no longer bound to this device; re-pair needed
    #[error("Device mismatch: {0}")]
    DeviceMismatch(String),

    /// Server has no row for the call (metadata not pushed yet)
    #[error("Call not found on server: {0}")]
    CallNotFound(String),

    /// Server could not assemble the recording; restart from chunk 0
    #[error("Chunk missing: {0}")]
    ChunkMissing(String),

    /// Local audio file vanished or is empty
    #[error("Recording file not found: {0}")]
    RecordingFileNotFound(String),

    /// Connection, timeout or 5xx failure
    #[error("Network failure: {0}")]
    Network(String),

    /// Request rejected as malformed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Server reported an error we have no code for
    #[error("Server error: {0}")]
    Server(String),

    /// No pairing identity stored yet
    #[error("Device is not paired")]
    NotPaired,

    /// Attempt cancelled by shutdown
    #[error("Cancelled")]
    Cancelled,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Worth retrying on the next scheduled run without user action
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_)
                | SyncError::Server(_)
                | SyncError::ChunkMissing(_)
                | SyncError::CallNotFound(_)
                | SyncError::Database(_)
                | SyncError::Io(_)
                | SyncError::Cancelled
        )
    }

    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Wire code this error corresponds to, if any
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            SyncError::PairingConflict(_) => Some(ErrorCode::PairingConflict),
            SyncError::DeviceMismatch(_) => Some(ErrorCode::DeviceMismatch),
            SyncError::CallNotFound(_) => Some(ErrorCode::CallNotFound),
            SyncError::ChunkMissing(_) => Some(ErrorCode::ChunkMissing),
            SyncError::RecordingFileNotFound(_) => Some(ErrorCode::RecordingFileNotFound),
            SyncError::Network(_) => Some(ErrorCode::NetworkFailure),
            SyncError::Validation(_) => Some(ErrorCode::ValidationError),
            SyncError::Database(_) => Some(ErrorCode::DatabaseError),
            _ => None,
        }
    }
}

impl From<RemoteFailure> for SyncError {
    fn from(failure: RemoteFailure) -> Self {
        let message = failure.message;
        match failure.code {
            Some(ErrorCode::PairingConflict) => SyncError::PairingConflict(message),
            Some(ErrorCode::DeviceMismatch) => SyncError::DeviceMismatch(message),
            Some(ErrorCode::CallNotFound) => SyncError::CallNotFound(message),
            Some(ErrorCode::ChunkMissing) => SyncError::ChunkMissing(message),
            Some(ErrorCode::RecordingFileNotFound) => SyncError::RecordingFileNotFound(message),
            Some(ErrorCode::NetworkFailure) => SyncError::Network(message),
            Some(ErrorCode::ValidationError) => SyncError::Validation(message),
            // Server-side storage trouble; nothing the device did wrong
            Some(ErrorCode::DatabaseError) | None => SyncError::Server(message),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Network(err.to_string())
    }
}

impl From<callsync_common::Error> for SyncError {
    fn from(err: callsync_common::Error) -> Self {
        match err {
            callsync_common::Error::Database(e) => SyncError::Database(e),
            callsync_common::Error::Io(e) => SyncError::Io(e),
            callsync_common::Error::Config(msg) => SyncError::Config(msg),
            callsync_common::Error::InvalidInput(msg) => SyncError::Validation(msg),
            other => SyncError::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Internal(format!("JSON error: {}", err))
    }
}
