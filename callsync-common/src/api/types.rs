//! Request/response bodies of the ingest API
//!
//! Every response is wrapped in the JSON envelope from
//! [`super::envelope`]; the structs here are the flattened payloads.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::CallType;

// ========================================
// Pairing identity
// ========================================

/// Pairing identity sent with every write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub org_id: String,
    pub user_id: i64,
    pub device_id: String,
}

/// Result of a pairing verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingOutcome {
    /// Identity had no device; now bound to this one
    Bound,
    /// Identity already bound to this device
    Confirmed,
    /// Identity moved from another device to this one
    Switched,
    /// Device already belongs to a different identity in the org
    Conflict,
}

/// Server-side recording state of a call row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Completed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Completed => "completed",
        }
    }

    pub fn from_db(value: &str) -> Self {
        if value.eq_ignore_ascii_case("completed") {
            UploadStatus::Completed
        } else {
            UploadStatus::Pending
        }
    }
}

/// Tracking policy configured for an employee
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmployeeSettings {
    pub call_track: bool,
    pub call_record_crm: bool,
    pub allow_personal_exclusion: bool,
    pub allow_changing_tracking_start_date: bool,
    pub allow_updating_tracking_sims: bool,
    /// `YYYY-MM-DD`
    pub default_tracking_starting_date: Option<String>,
}

impl Default for EmployeeSettings {
    fn default() -> Self {
        Self {
            call_track: true,
            call_record_crm: true,
            allow_personal_exclusion: false,
            allow_changing_tracking_start_date: false,
            allow_updating_tracking_sims: false,
            default_tracking_starting_date: None,
        }
    }
}

/// Organisation plan limits
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanInfo {
    pub expiry_date: Option<String>,
    pub allowed_storage_gb: f64,
    pub storage_used_bytes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyPairingRequest {
    #[serde(flatten)]
    pub credentials: Credentials,
    #[serde(default)]
    pub device_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyPairingResponse {
    pub outcome: PairingOutcome,
    pub employee_name: String,
    pub settings: EmployeeSettings,
    pub plan: PlanInfo,
}

// ========================================
// Call metadata
// ========================================

/// One call as pushed by the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallPayload {
    pub unique_id: String,
    /// E.164-normalised remote number
    pub caller: String,
    #[serde(default)]
    pub caller_name: Option<String>,
    #[serde(rename = "type")]
    pub call_type: CallType,
    /// Seconds
    pub duration: i64,
    /// `YYYY-MM-DD HH:MM:SS` UTC
    pub call_time: String,
    /// Number of the SIM the call was placed on, when known
    #[serde(default)]
    pub device_phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartCallRequest {
    #[serde(flatten)]
    pub credentials: Credentials,
    #[serde(flatten)]
    pub call: CallPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartCallResponse {
    pub unique_id: String,
    pub upload_status: UploadStatus,
    #[serde(default)]
    pub recording_url: Option<String>,
}

/// Calls per `batch_sync_calls` request
pub const MAX_BATCH_CALLS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSyncRequest {
    #[serde(flatten)]
    pub credentials: Credentials,
    pub calls: Vec<CallPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSyncResponse {
    pub synced_ids: Vec<String>,
    #[serde(default)]
    pub upload_statuses: HashMap<String, UploadStatus>,
    pub server_time: i64,
}

// ========================================
// Recording upload
// ========================================

/// Fixed chunk size of the upload protocol (1 MiB)
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Query string of `upload_chunk`; the body is the raw chunk bytes.
///
/// Kept flat (no nested credentials) so it decodes from a URL query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadChunkQuery {
    pub org_id: String,
    pub user_id: i64,
    pub device_id: String,
    pub unique_id: String,
    pub chunk_index: u32,
}

impl UploadChunkQuery {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            org_id: self.org_id.clone(),
            user_id: self.user_id,
            device_id: self.device_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadChunkResponse {
    pub unique_id: String,
    pub chunk_index: u32,
    pub bytes: u64,
    /// Recording was already finalized; the chunk was not stored
    #[serde(default)]
    pub already_completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeUploadRequest {
    #[serde(flatten)]
    pub credentials: Credentials,
    pub unique_id: String,
    pub total_chunks: u32,
    /// File extension of the assembled recording, default `mp3`
    #[serde(default)]
    pub extension: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeUploadResponse {
    pub unique_id: String,
    #[serde(default)]
    pub recording_url: Option<String>,
    #[serde(default)]
    pub already_completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRecordingsRequest {
    pub org_id: String,
    pub unique_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRecordingsResponse {
    pub completed_ids: Vec<String>,
}

// ========================================
// Delta sync and notes
// ========================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchUpdatesRequest {
    pub org_id: String,
    /// Epoch millis; 0 fetches everything
    #[serde(default)]
    pub last_sync_time: i64,
}

/// Call row changed on the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallUpdate {
    pub unique_id: String,
    pub note: Option<String>,
    pub caller_name: Option<String>,
    pub updated_at: i64,
}

/// Contact row changed on the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonUpdate {
    pub phone: String,
    pub name: Option<String>,
    pub person_note: Option<String>,
    pub label: Option<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchUpdatesResponse {
    pub call_updates: Vec<CallUpdate>,
    pub person_updates: Vec<PersonUpdate>,
    /// Server clock at query time; the next `last_sync_time`
    pub server_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfigRequest {
    pub org_id: String,
    pub user_id: i64,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfigResponse {
    pub excluded_contacts: Vec<String>,
    pub settings: EmployeeSettings,
    pub plan: PlanInfo,
}

/// `None` leaves a field untouched; an empty string clears it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateNoteRequest {
    #[serde(flatten)]
    pub credentials: Credentials,
    pub unique_id: String,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub person_note: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateNoteResponse {
    pub unique_id: String,
}
