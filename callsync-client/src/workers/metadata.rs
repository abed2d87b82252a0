//! Metadata Sync Worker (fast path)
//!
//! One run:
//! 1. refresh config (exclusions, tracking flags)
//! 2. pull server deltas since `last_sync_time` and merge them
//! 3. push unsynced calls in batches of up to 100; a lone call (usually the
//!    one that just ended) goes through `start_call`
//! 4. push pending note and label edits
//!
//! Pull always precedes push so a stale local copy is refreshed before
//! anything is written back.

use callsync_common::api::{
    BatchSyncRequest, CallPayload, Credentials, FetchConfigRequest, FetchUpdatesRequest, StartCallRequest,
    UpdateNoteRequest, UploadStatus, MAX_BATCH_CALLS,
};
use callsync_common::time::{format_call_time, from_millis};
use callsync_common::{RecordingEvent, RecordingSyncStatus, SyncStatus};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{is_excluded, RunMode};
use crate::api_client::SyncApi;
use crate::error::{Result, SyncError};
use crate::store::{CallRecord, LocalCallStore};

/// Batches pushed per run; the rest waits for the next trigger
pub const MAX_BATCHES_PER_RUN: usize = 10;

/// Outcome of one metadata run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataRunReport {
    pub pulled_calls: usize,
    pub pulled_persons: usize,
    /// Remote contact changes held back by a pending local edit
    pub deferred_persons: usize,
    pub pushed_calls: usize,
    /// Calls to excluded numbers, marked synced without a push
    pub excluded_calls: usize,
    /// Calls the server refused; parked as failed
    pub rejected_calls: usize,
    /// Recordings the server reported as not needed or already stored
    pub recordings_settled: usize,
    pub pushed_notes: usize,
    pub pushed_person_edits: usize,
    /// Server disabled call tracking for this employee
    pub tracking_disabled: bool,
    /// Push stopped early on a transient failure
    pub push_interrupted: bool,
    pub more_remaining: bool,
    pub server_time: i64,
}

/// Server answer for one pushed call
struct PushedCall {
    unique_id: String,
    upload_status: UploadStatus,
    recording_url: Option<String>,
}

pub struct MetadataSyncWorker {
    store: LocalCallStore,
    api: Arc<dyn SyncApi>,
}

impl MetadataSyncWorker {
    pub fn new(store: LocalCallStore, api: Arc<dyn SyncApi>) -> Self {
        Self { store, api }
    }

    pub async fn run(&self, mode: RunMode) -> Result<MetadataRunReport> {
        let identity = self.store.require_identity().await?;
        let credentials = identity.credentials();
        let mut report = MetadataRunReport::default();

        let config = self
            .api
            .fetch_config(&FetchConfigRequest {
                org_id: identity.org_id.clone(),
                user_id: identity.user_id,
                device_id: Some(identity.device_id.clone()),
            })
            .await?;
        self.store.set_excluded_numbers(&config.excluded_contacts).await?;
        self.store.apply_employee_settings(&config.settings).await?;

        self.pull(&identity.org_id, &mut report).await?;

        if !config.settings.call_track {
            debug!("Call tracking disabled by server; push skipped");
            report.tracking_disabled = true;
            return Ok(report);
        }

        if mode.includes_permanent_failures() {
            let requeued = self.store.requeue_failed_metadata().await?;
            if requeued > 0 {
                info!(requeued, "Retrying failed call pushes");
            }
        }

        let excluded = self.store.excluded_numbers().await?;
        let completed = self.push_calls(&credentials, &excluded, &mut report).await?;
        if completed {
            self.push_notes(&credentials, &excluded, &mut report).await?;
        }

        info!(
            pulled_calls = report.pulled_calls,
            pulled_persons = report.pulled_persons,
            pushed_calls = report.pushed_calls,
            pushed_notes = report.pushed_notes + report.pushed_person_edits,
            "Metadata sync finished"
        );
        Ok(report)
    }

    /// Merge server changes and advance the delta cursor
    async fn pull(&self, org_id: &str, report: &mut MetadataRunReport) -> Result<()> {
        let since = self.store.last_sync_time().await?;
        let updates = self
            .api
            .fetch_updates(&FetchUpdatesRequest {
                org_id: org_id.to_string(),
                last_sync_time: since,
            })
            .await?;

        for person in &updates.person_updates {
            if self.store.apply_remote_person_update(person).await? {
                report.pulled_persons += 1;
            } else {
                report.deferred_persons += 1;
            }
        }
        for call in &updates.call_updates {
            if self.store.apply_remote_call_update(call).await? {
                report.pulled_calls += 1;
            }
        }

        self.store.set_last_sync_time(updates.server_time).await?;
        report.server_time = updates.server_time;
        debug!(
            since,
            server_time = updates.server_time,
            persons = updates.person_updates.len(),
            calls = updates.call_updates.len(),
            "Pulled server updates"
        );
        Ok(())
    }

    /// Push pending calls. Returns false when a transient failure cut the
    /// push short.
    async fn push_calls(
        &self,
        credentials: &Credentials,
        excluded: &HashSet<String>,
        report: &mut MetadataRunReport,
    ) -> Result<bool> {
        for _ in 0..MAX_BATCHES_PER_RUN {
            let pending = self.store.calls_needing_metadata_sync(MAX_BATCH_CALLS).await?;
            if pending.is_empty() {
                return Ok(true);
            }

            let (skipped, to_push): (Vec<CallRecord>, Vec<CallRecord>) =
                pending.into_iter().partition(|c| is_excluded(&c.phone_number, excluded));
            if !skipped.is_empty() {
                self.settle_excluded(&skipped).await?;
                report.excluded_calls += skipped.len();
            }
            if to_push.is_empty() {
                continue;
            }

            let ids: Vec<String> = to_push.iter().map(|c| c.composite_id.clone()).collect();

            match self.send_calls(credentials, &to_push).await {
                Ok(pushed) => {
                    let synced: Vec<String> = pushed.iter().map(|p| p.unique_id.clone()).collect();
                    self.store.mark_metadata_synced(&synced).await?;
                    report.pushed_calls += synced.len();

                    let synced: HashSet<&str> = synced.iter().map(String::as_str).collect();
                    let rejected: Vec<String> = ids.iter().filter(|id| !synced.contains(id.as_str())).cloned().collect();
                    if !rejected.is_empty() {
                        warn!(count = rejected.len(), "Server rejected calls in batch");
                        self.store
                            .mark_metadata_failed(&rejected, "rejected by server", true)
                            .await?;
                        report.rejected_calls += rejected.len();
                    }

                    for call in &pushed {
                        if call.upload_status != UploadStatus::Completed {
                            continue;
                        }
                        if self.settle_recording(&call.unique_id).await? {
                            report.recordings_settled += 1;
                        }
                        if let Some(url) = call.recording_url.as_deref() {
                            self.store.set_recording_url(&call.unique_id, url).await?;
                        }
                    }
                }
                Err(e @ (SyncError::DeviceMismatch(_) | SyncError::PairingConflict(_))) => {
                    error!("Call push refused, device must be re-paired: {}", e);
                    return Err(e);
                }
                Err(e) if e.is_transient() => {
                    warn!(count = ids.len(), "Call push failed, retrying next run: {}", e);
                    self.store.mark_metadata_failed(&ids, &e.to_string(), false).await?;
                    report.push_interrupted = true;
                    return Ok(false);
                }
                Err(e) => {
                    error!(count = ids.len(), "Call push failed permanently: {}", e);
                    self.store.mark_metadata_failed(&ids, &e.to_string(), true).await?;
                    report.rejected_calls += ids.len();
                }
            }
        }

        report.more_remaining = !self.store.calls_needing_metadata_sync(1).await?.is_empty();
        Ok(true)
    }

    /// One request for the whole batch, or `start_call` for a single call
    async fn send_calls(&self, credentials: &Credentials, calls: &[CallRecord]) -> Result<Vec<PushedCall>> {
        if let [call] = calls {
            let response = self
                .api
                .start_call(&StartCallRequest {
                    credentials: credentials.clone(),
                    call: call_payload(call),
                })
                .await?;
            return Ok(vec![PushedCall {
                unique_id: call.composite_id.clone(),
                upload_status: response.upload_status,
                recording_url: response.recording_url,
            }]);
        }

        let response = self
            .api
            .batch_sync_calls(&BatchSyncRequest {
                credentials: credentials.clone(),
                calls: calls.iter().map(call_payload).collect(),
            })
            .await?;
        let mut statuses = response.upload_statuses;
        Ok(response
            .synced_ids
            .into_iter()
            .map(|unique_id| PushedCall {
                upload_status: statuses.remove(&unique_id).unwrap_or(UploadStatus::Pending),
                unique_id,
                recording_url: None,
            })
            .collect())
    }

    async fn settle_excluded(&self, calls: &[CallRecord]) -> Result<()> {
        let ids: Vec<String> = calls.iter().map(|c| c.composite_id.clone()).collect();
        self.store.mark_metadata_synced(&ids).await?;
        for call in calls {
            if matches!(call.recording_status, RecordingSyncStatus::Pending | RecordingSyncStatus::Failed) {
                self.store
                    .transition_recording(&call.composite_id, RecordingEvent::Excluded)
                    .await?;
            }
        }
        debug!(count = calls.len(), "Excluded calls settled locally");
        Ok(())
    }

    /// Server needs no upload for this call; returns whether state changed
    async fn settle_recording(&self, composite_id: &str) -> Result<bool> {
        match self.store.recording_status(composite_id).await? {
            Some(RecordingSyncStatus::Pending | RecordingSyncStatus::Failed) => {
                self.store
                    .transition_recording(composite_id, RecordingEvent::ServerCompleted)
                    .await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn push_notes(
        &self,
        credentials: &Credentials,
        excluded: &HashSet<String>,
        report: &mut MetadataRunReport,
    ) -> Result<()> {
        for call in self.store.calls_with_pending_notes().await? {
            if is_excluded(&call.phone_number, excluded) {
                continue;
            }
            let request = UpdateNoteRequest {
                credentials: credentials.clone(),
                unique_id: call.composite_id.clone(),
                note: Some(call.note.clone().unwrap_or_default()),
                person_note: None,
                label: None,
            };
            match self.send_note(&request, report).await? {
                NoteOutcome::Sent => {}
                NoteOutcome::Skipped => continue,
                NoteOutcome::Stop => return Ok(()),
            }
            self.store
                .mark_call_note_synced(&call.composite_id, call.note.as_deref())
                .await?;
            report.pushed_notes += 1;
        }

        for person in self.store.persons_needing_sync().await? {
            if is_excluded(&person.phone_number, excluded) {
                continue;
            }
            // Edits are addressed through a call the server already knows
            let Some(anchor) = person.last_call_composite_id.as_deref() else {
                debug!(phone = %person.phone_number, "Contact edit waits for a first call");
                continue;
            };
            let anchored = self
                .store
                .get_call(anchor)
                .await?
                .is_some_and(|c| c.sync_status == SyncStatus::Completed);
            if !anchored {
                continue;
            }

            let request = UpdateNoteRequest {
                credentials: credentials.clone(),
                unique_id: anchor.to_string(),
                note: None,
                person_note: Some(person.note.clone().unwrap_or_default()),
                label: Some(person.label.clone().unwrap_or_default()),
            };
            match self.send_note(&request, report).await? {
                NoteOutcome::Sent => {}
                NoteOutcome::Skipped => continue,
                NoteOutcome::Stop => return Ok(()),
            }
            self.store
                .mark_person_synced(&person.phone_number, person.note.as_deref(), person.label.as_deref())
                .await?;
            report.pushed_person_edits += 1;
        }
        Ok(())
    }

    async fn send_note(&self, request: &UpdateNoteRequest, report: &mut MetadataRunReport) -> Result<NoteOutcome> {
        match self.api.update_note(request).await {
            Ok(_) => Ok(NoteOutcome::Sent),
            Err(e @ SyncError::DeviceMismatch(_)) => Err(e),
            Err(SyncError::CallNotFound(_)) => {
                debug!(unique_id = %request.unique_id, "Note target not on server yet");
                Ok(NoteOutcome::Skipped)
            }
            Err(e) if e.is_transient() => {
                warn!(unique_id = %request.unique_id, "Note push failed, retrying next run: {}", e);
                report.push_interrupted = true;
                Ok(NoteOutcome::Stop)
            }
            Err(e) => {
                error!(unique_id = %request.unique_id, "Note push rejected: {}", e);
                Ok(NoteOutcome::Skipped)
            }
        }
    }
}

enum NoteOutcome {
    Sent,
    /// Edit stays pending; carry on with the next one
    Skipped,
    /// Stop pushing notes this run
    Stop,
}

/// Wire form of a stored call
pub fn call_payload(call: &CallRecord) -> CallPayload {
    CallPayload {
        unique_id: call.composite_id.clone(),
        caller: call.phone_number.clone(),
        caller_name: call.contact_name.clone(),
        call_type: call.call_type,
        duration: call.duration_secs,
        call_time: format_call_time(from_millis(call.timestamp_ms)),
        device_phone: None,
    }
}
