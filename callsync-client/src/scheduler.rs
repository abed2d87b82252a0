//! Sync scheduling
//!
//! Two long-lived tasks, one per worker, each woken by a periodic tick or
//! an explicit [`SyncTrigger`]. Metadata runs ingest first and nudges the
//! recording task when it finishes, since recordings only upload for calls
//! the server already knows. A run reporting `more_remaining` queues a
//! `Continuation` for its own task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::SyncError;
use crate::ingestor::CallLogIngestor;
use crate::store::LocalCallStore;
use crate::workers::{MetadataSyncWorker, RecordingUploadWorker, RunMode};

const TRIGGER_QUEUE: usize = 8;

/// Why a sync run was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    CallEnded,
    /// Pull-to-refresh; also retries permanently failed records
    UserRefresh,
    ConnectivityRegained,
    Periodic,
    /// Previous run stopped at its batch bound
    Continuation,
}

impl SyncTrigger {
    pub fn mode(self) -> RunMode {
        match self {
            SyncTrigger::UserRefresh => RunMode::Manual,
            _ => RunMode::Scheduled,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerIntervals {
    pub metadata: Duration,
    pub recording: Duration,
}

pub struct SyncScheduler {
    store: LocalCallStore,
    ingestor: Option<CallLogIngestor>,
    metadata: MetadataSyncWorker,
    recording: RecordingUploadWorker,
    intervals: SchedulerIntervals,
}

impl SyncScheduler {
    pub fn new(
        store: LocalCallStore,
        metadata: MetadataSyncWorker,
        recording: RecordingUploadWorker,
        intervals: SchedulerIntervals,
    ) -> Self {
        Self {
            store,
            ingestor: None,
            metadata,
            recording,
            intervals,
        }
    }

    /// Run the call-log ingestor ahead of every metadata pass
    pub fn with_ingestor(mut self, ingestor: CallLogIngestor) -> Self {
        self.ingestor = Some(ingestor);
        self
    }

    /// Spawn both worker tasks. The first tick fires immediately.
    pub fn start(self) -> SchedulerHandle {
        let cancel = CancellationToken::new();
        let (metadata_tx, metadata_rx) = mpsc::channel(TRIGGER_QUEUE);
        let (recording_tx, recording_rx) = mpsc::channel(TRIGGER_QUEUE);

        let metadata_task = tokio::spawn(metadata_loop(
            self.ingestor,
            self.metadata,
            self.intervals.metadata,
            metadata_rx,
            metadata_tx.clone(),
            recording_tx.clone(),
            cancel.clone(),
        ));
        let recording_task = tokio::spawn(recording_loop(
            self.recording,
            self.intervals.recording,
            recording_rx,
            recording_tx.clone(),
            cancel.clone(),
        ));

        info!(
            metadata_secs = self.intervals.metadata.as_secs(),
            recording_secs = self.intervals.recording.as_secs(),
            "Sync scheduler started"
        );
        SchedulerHandle {
            store: self.store,
            metadata_tx,
            recording_tx,
            cancel,
            online: AtomicBool::new(true),
            tasks: vec![metadata_task, recording_task],
        }
    }
}

/// Control surface for a running scheduler
pub struct SchedulerHandle {
    store: LocalCallStore,
    metadata_tx: mpsc::Sender<SyncTrigger>,
    recording_tx: mpsc::Sender<SyncTrigger>,
    cancel: CancellationToken,
    online: AtomicBool,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Wake both workers
    pub fn trigger(&self, trigger: SyncTrigger) {
        debug!(?trigger, "Sync triggered");
        enqueue(&self.metadata_tx, trigger);
        enqueue(&self.recording_tx, trigger);
    }

    /// Report network reachability. Coming back online with unsynced work
    /// triggers a run.
    pub async fn connectivity_changed(&self, online: bool) {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if !online {
            if was_online {
                info!("Connectivity lost");
            }
            return;
        }
        if was_online {
            return;
        }

        match self.store.has_pending_work().await {
            Ok(true) => {
                info!("Connectivity regained with pending work");
                self.trigger(SyncTrigger::ConnectivityRegained);
            }
            Ok(false) => debug!("Connectivity regained, nothing pending"),
            Err(e) => warn!("Could not check pending work: {}", e),
        }
    }

    /// Cancel in-flight work and wait for both tasks to exit
    pub async fn shutdown(self) {
        info!("Stopping sync scheduler");
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Sync task ended abnormally: {}", e);
            }
        }
    }
}

fn enqueue(tx: &mpsc::Sender<SyncTrigger>, trigger: SyncTrigger) {
    if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(trigger) {
        debug!(?trigger, "Run already queued");
    }
}

/// Wait for the next tick or trigger. Queued triggers are coalesced; any
/// manual one makes the run manual.
async fn next_run(
    timer: &mut tokio::time::Interval,
    rx: &mut mpsc::Receiver<SyncTrigger>,
    cancel: &CancellationToken,
) -> Option<RunMode> {
    let first = tokio::select! {
        _ = cancel.cancelled() => return None,
        _ = timer.tick() => SyncTrigger::Periodic,
        received = rx.recv() => received?,
    };
    let mut mode = first.mode();
    while let Ok(queued) = rx.try_recv() {
        if queued.mode() == RunMode::Manual {
            mode = RunMode::Manual;
        }
    }
    Some(mode)
}

fn log_failure(worker: &str, e: &SyncError) {
    match e {
        SyncError::NotPaired => debug!(worker, "Device not paired; run skipped"),
        SyncError::DeviceMismatch(_) | SyncError::PairingConflict(_) => {
            error!(worker, "Device must be re-paired: {}", e)
        }
        e if e.is_transient() => warn!(worker, "Run failed, will retry: {}", e),
        e => error!(worker, "Run failed: {}", e),
    }
}

async fn metadata_loop(
    ingestor: Option<CallLogIngestor>,
    worker: MetadataSyncWorker,
    period: Duration,
    mut rx: mpsc::Receiver<SyncTrigger>,
    own_tx: mpsc::Sender<SyncTrigger>,
    recording_tx: mpsc::Sender<SyncTrigger>,
    cancel: CancellationToken,
) {
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while let Some(mode) = next_run(&mut timer, &mut rx, &cancel).await {
        if let Some(ingestor) = &ingestor {
            if let Err(e) = ingestor.run().await {
                log_failure("ingest", &e);
            }
        }

        match worker.run(mode).await {
            Ok(report) => {
                if report.more_remaining {
                    enqueue(&own_tx, SyncTrigger::Continuation);
                }
                let follow_up = if mode == RunMode::Manual {
                    SyncTrigger::UserRefresh
                } else {
                    SyncTrigger::Continuation
                };
                enqueue(&recording_tx, follow_up);
            }
            Err(e) => log_failure("metadata", &e),
        }
    }
    debug!("Metadata task stopped");
}

async fn recording_loop(
    worker: RecordingUploadWorker,
    period: Duration,
    mut rx: mpsc::Receiver<SyncTrigger>,
    own_tx: mpsc::Sender<SyncTrigger>,
    cancel: CancellationToken,
) {
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while let Some(mode) = next_run(&mut timer, &mut rx, &cancel).await {
        match worker.run(mode, &cancel).await {
            Ok(report) if report.cancelled => break,
            Ok(report) => {
                if report.more_remaining {
                    enqueue(&own_tx, SyncTrigger::Continuation);
                }
            }
            Err(e) => log_failure("recording", &e),
        }
    }
    debug!("Recording task stopped");
}
