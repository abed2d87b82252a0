//! Uniform JSON response envelope
//!
//! Success: `{ "success": true, "message": "...", ...payload }`
//! Failure: `{ "success": false, "error": "...", "code": "DEVICE_MISMATCH" }`
//!
//! Protocol errors travel in-band with HTTP 200, so clients must inspect
//! `success` rather than the status code.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Error taxonomy carried in the `code` field of failure envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    PairingConflict,
    DeviceMismatch,
    CallNotFound,
    ChunkMissing,
    RecordingFileNotFound,
    NetworkFailure,
    DatabaseError,
    ValidationError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::PairingConflict => "PAIRING_CONFLICT",
            ErrorCode::DeviceMismatch => "DEVICE_MISMATCH",
            ErrorCode::CallNotFound => "CALL_NOT_FOUND",
            ErrorCode::ChunkMissing => "CHUNK_MISSING",
            ErrorCode::RecordingFileNotFound => "RECORDING_FILE_NOT_FOUND",
            ErrorCode::NetworkFailure => "NETWORK_FAILURE",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Success envelope around a payload
#[derive(Debug, Clone, Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub data: T,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
        }
    }
}

/// Failure envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: String,
    #[serde(default)]
    pub code: Option<ErrorCode>,
}

impl ErrorEnvelope {
    pub fn new(code: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            code: Some(code),
        }
    }
}

/// In-band failure reported by the server
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{}: {message}", .code.map(|c| c.as_str()).unwrap_or("UNKNOWN"))]
pub struct RemoteFailure {
    pub code: Option<ErrorCode>,
    pub message: String,
}

/// Split a response body into its payload or the in-band failure.
///
/// A body that is not a JSON object, or a success payload that does not
/// match `T`, is reported as a failure without a code.
pub fn parse_envelope<T: DeserializeOwned>(body: Value) -> Result<T, RemoteFailure> {
    let success = body.get("success").and_then(Value::as_bool).unwrap_or(false);

    if !success {
        let message = body
            .get("error")
            .or_else(|| body.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("request failed")
            .to_string();
        let code = body
            .get("code")
            .cloned()
            .and_then(|c| serde_json::from_value::<ErrorCode>(c).ok());
        return Err(RemoteFailure { code, message });
    }

    serde_json::from_value(body).map_err(|e| RemoteFailure {
        code: None,
        message: format!("Malformed response payload: {}", e),
    })
}
