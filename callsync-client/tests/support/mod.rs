//! Shared fixtures for callsync-client integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use callsync_client::error::{Result, SyncError};
use callsync_client::store::PairingIdentity;
use callsync_client::{CallRecord, LocalCallStore, SyncApi};
use callsync_common::api::*;
use callsync_common::CallType;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tempfile::TempDir;

pub const ORG: &str = "ACME";
pub const USER: i64 = 7;
pub const DEVICE: &str = "device-a";

pub async fn paired_store() -> (TempDir, LocalCallStore) {
    let dir = TempDir::new().unwrap();
    let store = LocalCallStore::open(&dir.path().join("client.db")).await.unwrap();
    store
        .set_pairing_identity(&PairingIdentity {
            org_id: ORG.to_string(),
            user_id: USER,
            device_id: DEVICE.to_string(),
        })
        .await
        .unwrap();
    (dir, store)
}

pub fn call(id: &str, phone: &str, call_type: CallType, ts: i64, duration: i64) -> CallRecord {
    CallRecord::new(id.to_string(), phone.to_string(), call_type, ts, duration)
}

/// Scripted server state
#[derive(Default)]
pub struct FakeState {
    pub settings: EmployeeSettings,
    pub excluded: Vec<String>,
    pub call_updates: Vec<CallUpdate>,
    pub person_updates: Vec<PersonUpdate>,
    pub server_time: i64,
    /// Every network call fails with `Network`
    pub offline: bool,
    /// Every credentialed call fails with `DeviceMismatch`
    pub device_mismatch: bool,
    /// Ids the server refuses in `start_call` and `batch_sync_calls`
    pub reject_ids: HashSet<String>,
    /// Recordings the server already stores
    pub completed: HashSet<String>,
    /// Finalize reports a missing chunk for these ids
    pub finalize_missing: HashSet<String>,
    /// Upload chunk calls block until cancelled
    pub stall_uploads: bool,
    /// Upload chunk calls fail with `Network`
    pub fail_chunks: bool,

    pub config_fetches: usize,
    pub pushed: Vec<CallPayload>,
    /// Pushes that went through `start_call`
    pub start_calls: usize,
    pub notes: Vec<UpdateNoteRequest>,
    /// unique_id -> chunk sizes in arrival order
    pub chunks: HashMap<String, Vec<usize>>,
    pub finalized: Vec<FinalizeUploadRequest>,
    pub status_checks: Vec<Vec<String>>,
}

#[derive(Default)]
pub struct FakeApi {
    pub state: Mutex<FakeState>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    fn gate(&self, credentialed: bool) -> Result<()> {
        let state = self.state.lock().unwrap();
        if state.offline {
            return Err(SyncError::Network("connection refused".to_string()));
        }
        if credentialed && state.device_mismatch {
            return Err(SyncError::DeviceMismatch("device replaced".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SyncApi for FakeApi {
    async fn verify_pairing(&self, _req: &VerifyPairingRequest) -> Result<VerifyPairingResponse> {
        self.gate(false)?;
        let settings = self.with(|s| s.settings.clone());
        Ok(VerifyPairingResponse {
            outcome: PairingOutcome::Bound,
            employee_name: "Asha".to_string(),
            settings,
            plan: PlanInfo::default(),
        })
    }

    async fn fetch_config(&self, _req: &FetchConfigRequest) -> Result<FetchConfigResponse> {
        self.gate(true)?;
        Ok(self.with(|s| {
            s.config_fetches += 1;
            FetchConfigResponse {
                excluded_contacts: s.excluded.clone(),
                settings: s.settings.clone(),
                plan: PlanInfo::default(),
            }
        }))
    }

    async fn start_call(&self, req: &StartCallRequest) -> Result<StartCallResponse> {
        self.gate(true)?;
        self.with(|s| {
            s.start_calls += 1;
            let id = req.call.unique_id.clone();
            if s.reject_ids.contains(&id) {
                return Err(SyncError::Validation(format!("call {} rejected", id)));
            }
            s.pushed.push(req.call.clone());
            let (upload_status, recording_url) = if s.completed.contains(&id) {
                (UploadStatus::Completed, Some(format!("http://calls.test/public/{}.mp3", id)))
            } else {
                (UploadStatus::Pending, None)
            };
            Ok(StartCallResponse {
                unique_id: id,
                upload_status,
                recording_url,
            })
        })
    }

    async fn batch_sync_calls(&self, req: &BatchSyncRequest) -> Result<BatchSyncResponse> {
        self.gate(true)?;
        Ok(self.with(|s| {
            let mut synced_ids = Vec::new();
            let mut upload_statuses = HashMap::new();
            for call in &req.calls {
                if s.reject_ids.contains(&call.unique_id) {
                    continue;
                }
                s.pushed.push(call.clone());
                synced_ids.push(call.unique_id.clone());
                let status = if s.completed.contains(&call.unique_id) {
                    UploadStatus::Completed
                } else {
                    UploadStatus::Pending
                };
                upload_statuses.insert(call.unique_id.clone(), status);
            }
            BatchSyncResponse {
                synced_ids,
                upload_statuses,
                server_time: s.server_time,
            }
        }))
    }

    async fn fetch_updates(&self, req: &FetchUpdatesRequest) -> Result<FetchUpdatesResponse> {
        self.gate(false)?;
        Ok(self.with(|s| FetchUpdatesResponse {
            call_updates: s
                .call_updates
                .iter()
                .filter(|u| u.updated_at > req.last_sync_time)
                .cloned()
                .collect(),
            person_updates: s
                .person_updates
                .iter()
                .filter(|u| u.updated_at > req.last_sync_time)
                .cloned()
                .collect(),
            server_time: s.server_time,
        }))
    }

    async fn update_note(&self, req: &UpdateNoteRequest) -> Result<UpdateNoteResponse> {
        self.gate(true)?;
        self.with(|s| s.notes.push(req.clone()));
        Ok(UpdateNoteResponse {
            unique_id: req.unique_id.clone(),
        })
    }

    async fn upload_chunk(&self, query: &UploadChunkQuery, chunk: Vec<u8>) -> Result<UploadChunkResponse> {
        self.gate(true)?;
        if self.with(|s| s.stall_uploads) {
            std::future::pending::<()>().await;
        }
        if self.with(|s| s.fail_chunks) {
            return Err(SyncError::Network("connection reset".to_string()));
        }
        let already_completed = self.with(|s| {
            if s.completed.contains(&query.unique_id) {
                return true;
            }
            s.chunks.entry(query.unique_id.clone()).or_default().push(chunk.len());
            false
        });
        Ok(UploadChunkResponse {
            unique_id: query.unique_id.clone(),
            chunk_index: query.chunk_index,
            bytes: chunk.len() as u64,
            already_completed,
        })
    }

    async fn finalize_upload(&self, req: &FinalizeUploadRequest) -> Result<FinalizeUploadResponse> {
        self.gate(true)?;
        self.with(|s| {
            if s.finalize_missing.contains(&req.unique_id) {
                return Err(SyncError::ChunkMissing(format!("chunk 1 of {} missing", req.unique_id)));
            }
            s.finalized.push(req.clone());
            let already_completed = !s.completed.insert(req.unique_id.clone());
            Ok(FinalizeUploadResponse {
                unique_id: req.unique_id.clone(),
                recording_url: Some(format!("http://calls.test/public/{}.mp3", req.unique_id)),
                already_completed,
            })
        })
    }

    async fn check_recordings_status(&self, req: &CheckRecordingsRequest) -> Result<CheckRecordingsResponse> {
        self.gate(false)?;
        Ok(self.with(|s| {
            s.status_checks.push(req.unique_ids.clone());
            CheckRecordingsResponse {
                completed_ids: req
                    .unique_ids
                    .iter()
                    .filter(|id| s.completed.contains(*id))
                    .cloned()
                    .collect(),
            }
        }))
    }
}
