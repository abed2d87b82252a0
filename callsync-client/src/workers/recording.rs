//! Recording Upload Worker (slow path)
//!
//! Each run handles one bounded batch:
//! 1. ask the server which stale `Uploading` rows and queued candidates it
//!    already stored; those become `Completed`, other stale rows go back to
//!    `Pending`
//! 2. for each queued call, find the audio file and send it in 1 MiB chunks
//!    from index 0, then finalize
//! 3. report `more_remaining` when rows beyond the batch are still due
//!
//! A call whose file has not appeared 3 hours after it ended is marked
//! `NotApplicable`. Until then it is stamped as deferred and left out of
//! scheduled runs for [`DEFERRED_RECHECK`], so the rest of the queue keeps
//! moving.

use callsync_common::api::{CheckRecordingsRequest, FinalizeUploadRequest, UploadChunkQuery, CHUNK_SIZE};
use callsync_common::{RecordingEvent, RecordingSyncStatus};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{is_excluded, RunMode};
use crate::api_client::SyncApi;
use crate::clock::Clock;
use crate::error::{Result, SyncError};
use crate::locator::RecordingLocator;
use crate::store::{CallRecord, LocalCallStore, PairingIdentity};

/// How long after a call ends its recording may still show up
pub const GRACE_PERIOD: Duration = Duration::from_secs(3 * 60 * 60);

/// Default wait before a scheduled run looks for a deferred recording again
pub const DEFERRED_RECHECK: Duration = Duration::from_secs(15 * 60);

/// Outcome of one recording run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingRunReport {
    /// Marked completed because the server already had them
    pub reconciled: usize,
    /// Stale `Uploading` rows put back to `Pending`
    pub reset_stale: usize,
    pub uploaded: usize,
    pub bytes_sent: u64,
    /// Grace period expired or number excluded
    pub not_applicable: usize,
    /// No file yet, still inside the grace period
    pub deferred: usize,
    pub failed: usize,
    /// Finalize hit a missing chunk; resent from scratch next run
    pub incomplete: usize,
    pub recording_disabled: bool,
    pub cancelled: bool,
    pub more_remaining: bool,
}

struct UploadedRecording {
    url: Option<String>,
    bytes: u64,
}

pub struct RecordingUploadWorker {
    store: LocalCallStore,
    api: Arc<dyn SyncApi>,
    clock: Arc<dyn Clock>,
    /// Falls back to the stored `recording_dir` preference when unset
    locator: Option<RecordingLocator>,
    batch_size: usize,
    recheck_after: Duration,
}

impl RecordingUploadWorker {
    pub fn new(
        store: LocalCallStore,
        api: Arc<dyn SyncApi>,
        clock: Arc<dyn Clock>,
        locator: Option<RecordingLocator>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            api,
            clock,
            locator,
            batch_size: batch_size.max(1),
            recheck_after: DEFERRED_RECHECK,
        }
    }

    pub fn with_recheck_after(mut self, recheck_after: Duration) -> Self {
        self.recheck_after = recheck_after;
        self
    }

    /// Rows deferred after this instant are not due yet. Manual runs look
    /// at everything.
    fn deferred_before(&self, mode: RunMode) -> i64 {
        if mode.includes_permanent_failures() {
            return i64::MAX;
        }
        let window = i64::try_from(self.recheck_after.as_millis()).unwrap_or(i64::MAX);
        self.clock.now_millis().saturating_sub(window)
    }

    pub async fn run(&self, mode: RunMode, cancel: &CancellationToken) -> Result<RecordingRunReport> {
        let identity = self.store.require_identity().await?;
        let mut report = RecordingRunReport::default();

        if !self.store.call_record_enabled().await? {
            debug!("Recording upload disabled by server");
            report.recording_disabled = true;
            return Ok(report);
        }

        let deferred_before = self.deferred_before(mode);
        self.reconcile(&identity, mode, deferred_before, &mut report).await?;

        let mut batch = self
            .store
            .calls_needing_recording_sync(mode.includes_permanent_failures(), deferred_before, self.batch_size + 1)
            .await?;
        let overflow = batch.len() > self.batch_size;
        batch.truncate(self.batch_size);

        let excluded = self.store.excluded_numbers().await?;
        let locator = self.locator().await?;

        let mut handled = 0usize;
        for call in batch {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            self.process(&identity, &call, &excluded, locator.as_ref(), cancel, &mut report)
                .await?;
            if report.cancelled {
                break;
            }
            handled += 1;
        }
        // Every handled row left the due set, so another run reaches new rows
        report.more_remaining = report.cancelled || (overflow && handled > 0);

        if report.uploaded + report.failed + report.not_applicable + report.reconciled > 0 {
            info!(
                uploaded = report.uploaded,
                failed = report.failed,
                not_applicable = report.not_applicable,
                reconciled = report.reconciled,
                more_remaining = report.more_remaining,
                "Recording sync finished"
            );
        }
        Ok(report)
    }

    async fn locator(&self) -> Result<Option<RecordingLocator>> {
        if let Some(locator) = &self.locator {
            return Ok(Some(locator.clone()));
        }
        Ok(self.store.recording_dir().await?.map(RecordingLocator::new))
    }

    /// Settle rows the server already stored and reset stale uploads.
    ///
    /// An `Uploading` row at the start of a run belongs to an attempt that
    /// never finished; it is not resumed.
    async fn reconcile(
        &self,
        identity: &PairingIdentity,
        mode: RunMode,
        deferred_before: i64,
        report: &mut RecordingRunReport,
    ) -> Result<()> {
        let stale = self.store.calls_in_recording_status(RecordingSyncStatus::Uploading).await?;
        let queued = self
            .store
            .calls_needing_recording_sync(mode.includes_permanent_failures(), deferred_before, self.batch_size)
            .await?;

        let mut ids: Vec<String> = Vec::with_capacity(stale.len() + queued.len());
        let mut seen = HashSet::new();
        for call in stale.iter().chain(queued.iter()) {
            if seen.insert(call.composite_id.as_str()) {
                ids.push(call.composite_id.clone());
            }
        }
        if ids.is_empty() {
            return Ok(());
        }

        let response = self
            .api
            .check_recordings_status(&CheckRecordingsRequest {
                org_id: identity.org_id.clone(),
                unique_ids: ids,
            })
            .await?;
        let completed: HashSet<&str> = response.completed_ids.iter().map(String::as_str).collect();

        for id in &completed {
            match self.store.recording_status(id).await? {
                Some(RecordingSyncStatus::Completed) | None => {}
                Some(_) => {
                    self.store
                        .transition_recording(id, RecordingEvent::ServerCompleted)
                        .await?;
                    report.reconciled += 1;
                }
            }
        }
        for call in stale.iter().filter(|c| !completed.contains(c.composite_id.as_str())) {
            self.store
                .transition_recording(&call.composite_id, RecordingEvent::Interrupted)
                .await?;
            report.reset_stale += 1;
        }

        if report.reconciled + report.reset_stale > 0 {
            info!(
                reconciled = report.reconciled,
                reset = report.reset_stale,
                "Recording states reconciled with server"
            );
        }
        Ok(())
    }

    async fn process(
        &self,
        identity: &PairingIdentity,
        call: &CallRecord,
        excluded: &HashSet<String>,
        locator: Option<&RecordingLocator>,
        cancel: &CancellationToken,
        report: &mut RecordingRunReport,
    ) -> Result<()> {
        let id = call.composite_id.as_str();

        if call.recording_status == RecordingSyncStatus::Failed {
            self.store.transition_recording(id, RecordingEvent::RetryScheduled).await?;
        }

        if is_excluded(&call.phone_number, excluded) {
            self.store.transition_recording(id, RecordingEvent::Excluded).await?;
            report.not_applicable += 1;
            return Ok(());
        }

        let Some(path) = self.resolve_file(call, locator).await? else {
            let grace_ms = i64::try_from(GRACE_PERIOD.as_millis()).unwrap_or(i64::MAX);
            let now = self.clock.now_millis();
            if now > call.end_millis().saturating_add(grace_ms) {
                self.store.transition_recording(id, RecordingEvent::GraceExpired).await?;
                info!(unique_id = %id, "No recording found within grace period");
                report.not_applicable += 1;
            } else {
                self.store.mark_recording_deferred(id, now).await?;
                debug!(unique_id = %id, "Recording not found yet");
                report.deferred += 1;
            }
            return Ok(());
        };

        self.store.transition_recording(id, RecordingEvent::AttemptStarted).await?;
        debug!(unique_id = %id, path = %path.display(), "Uploading recording");

        let outcome = tokio::select! {
            result = self.upload_file(identity, id, &path) => result,
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
        };

        match outcome {
            Ok(uploaded) => {
                if let Some(url) = uploaded.url.as_deref() {
                    self.store.set_recording_url(id, url).await?;
                }
                self.store.transition_recording(id, RecordingEvent::FinalizeConfirmed).await?;
                info!(unique_id = %id, bytes = uploaded.bytes, "Recording uploaded");
                report.uploaded += 1;
                report.bytes_sent += uploaded.bytes;
            }
            Err(SyncError::Cancelled) => {
                self.store.transition_recording(id, RecordingEvent::Interrupted).await?;
                info!(unique_id = %id, "Upload cancelled; back to pending");
                report.cancelled = true;
            }
            Err(e @ SyncError::ChunkMissing(_)) => {
                // Stays Uploading; the next run's status check resets it
                warn!(unique_id = %id, "Finalize incomplete, full resend next run: {}", e);
                report.incomplete += 1;
            }
            Err(SyncError::RecordingFileNotFound(msg)) => {
                self.store.transition_recording(id, RecordingEvent::Interrupted).await?;
                self.store.set_recording_path(id, None).await?;
                self.store.mark_recording_deferred(id, self.clock.now_millis()).await?;
                warn!(unique_id = %id, "Recording file unusable: {}", msg);
                report.deferred += 1;
            }
            Err(e @ (SyncError::DeviceMismatch(_) | SyncError::PairingConflict(_))) => {
                self.store.transition_recording(id, RecordingEvent::Interrupted).await?;
                error!(unique_id = %id, "Upload refused, device must be re-paired: {}", e);
                return Err(e);
            }
            Err(e @ SyncError::Database(_)) => return Err(e),
            Err(e) => {
                if e.is_transient() {
                    warn!(unique_id = %id, "Upload failed, retrying next run: {}", e);
                } else {
                    error!(unique_id = %id, "Upload failed permanently: {}", e);
                }
                self.store.fail_recording(id, &e).await?;
                report.failed += 1;
            }
        }
        Ok(())
    }

    /// Stored path if it still exists, else the best unclaimed locator match
    async fn resolve_file(&self, call: &CallRecord, locator: Option<&RecordingLocator>) -> Result<Option<PathBuf>> {
        let id = call.composite_id.as_str();
        if let Some(stored) = call.local_recording_path.as_deref() {
            if Path::new(stored).is_file() {
                return Ok(Some(PathBuf::from(stored)));
            }
            self.store.set_recording_path(id, None).await?;
        }

        let Some(locator) = locator.cloned() else {
            return Ok(None);
        };
        let lookup = call.clone();
        let candidates = tokio::task::spawn_blocking(move || locator.candidates(&lookup))
            .await
            .map_err(|e| SyncError::Internal(format!("Recording scan panicked: {}", e)))?;

        for candidate in candidates {
            let path = candidate.to_string_lossy().into_owned();
            if !self.store.recording_path_claimed(&path, id).await? {
                self.store.set_recording_path(id, Some(&path)).await?;
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Send the whole file from chunk 0 and finalize
    async fn upload_file(&self, identity: &PairingIdentity, unique_id: &str, path: &Path) -> Result<UploadedRecording> {
        let mut file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SyncError::RecordingFileNotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata().await?.len();
        if len == 0 {
            return Err(SyncError::RecordingFileNotFound(format!("{} is empty", path.display())));
        }
        let total_chunks = u32::try_from(len.div_ceil(CHUNK_SIZE as u64))
            .map_err(|_| SyncError::Validation(format!("{} is too large", path.display())))?;

        let mut bytes = 0u64;
        for chunk_index in 0..total_chunks {
            let mut chunk = Vec::with_capacity(CHUNK_SIZE);
            (&mut file).take(CHUNK_SIZE as u64).read_to_end(&mut chunk).await?;
            if chunk.is_empty() {
                return Err(SyncError::RecordingFileNotFound(format!("{} shrank during upload", path.display())));
            }
            bytes += chunk.len() as u64;

            let query = UploadChunkQuery {
                org_id: identity.org_id.clone(),
                user_id: identity.user_id,
                device_id: identity.device_id.clone(),
                unique_id: unique_id.to_string(),
                chunk_index,
            };
            let response = self.api.upload_chunk(&query, chunk).await?;
            if response.already_completed {
                debug!(unique_id, "Server already holds this recording");
                break;
            }
        }

        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase());
        let response = self
            .api
            .finalize_upload(&FinalizeUploadRequest {
                credentials: identity.credentials(),
                unique_id: unique_id.to_string(),
                total_chunks,
                extension,
            })
            .await?;

        Ok(UploadedRecording {
            url: response.recording_url,
            bytes,
        })
    }
}
