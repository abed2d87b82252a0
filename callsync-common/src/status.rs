//! Per-call sync lifecycles
//!
//! Metadata sync and recording upload run on independent schedules, so each
//! call carries two separate states. Both are closed enums persisted as their
//! `as_str()` form; recording transitions go through [`RecordingSyncStatus::apply`]
//! so an illegal move is an error rather than a silent overwrite.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Metadata (fast path) sync state of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    Pending,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "PENDING",
            SyncStatus::Completed => "COMPLETED",
            SyncStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(SyncStatus::Pending),
            "COMPLETED" => Ok(SyncStatus::Completed),
            "FAILED" => Ok(SyncStatus::Failed),
            other => Err(Error::InvalidInput(format!("Unknown sync status: {}", other))),
        }
    }
}

/// Recording (slow path) upload state of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordingSyncStatus {
    /// No recording expected, or none found within the grace period
    NotApplicable,
    Pending,
    Uploading,
    /// Server confirmed finalize; terminal
    Completed,
    Failed,
}

/// Inputs that move a recording between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingEvent {
    /// Worker begins sending chunks
    AttemptStarted,
    /// Server acknowledged `finalize_upload`
    FinalizeConfirmed,
    /// I/O or network error during an attempt
    Failed,
    /// Scheduler picked a failed record up again
    RetryScheduled,
    /// No local file 3 hours after call end
    GraceExpired,
    /// Server reports the recording is already stored (status re-check,
    /// `start_call` / `batch_sync_calls` response)
    ServerCompleted,
    /// Attempt cancelled, or an `Uploading` row found stale on restart
    Interrupted,
    /// Call excluded from recording (excluded number, recording disabled)
    Excluded,
}

/// Rejected state transition
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Illegal recording transition: {event:?} from {from}")]
pub struct TransitionError {
    pub from: RecordingSyncStatus,
    pub event: RecordingEvent,
}

impl RecordingSyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingSyncStatus::NotApplicable => "NOT_APPLICABLE",
            RecordingSyncStatus::Pending => "PENDING",
            RecordingSyncStatus::Uploading => "UPLOADING",
            RecordingSyncStatus::Completed => "COMPLETED",
            RecordingSyncStatus::Failed => "FAILED",
        }
    }

    /// Completed and NotApplicable take no further automatic work
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordingSyncStatus::Completed | RecordingSyncStatus::NotApplicable)
    }

    /// Next state for `event`, or an error when the move is not allowed.
    pub fn apply(self, event: RecordingEvent) -> Result<Self, TransitionError> {
        use RecordingEvent as E;
        use RecordingSyncStatus as S;

        let next = match (self, event) {
            (S::Pending, E::AttemptStarted) => S::Uploading,
            (S::Uploading, E::FinalizeConfirmed) => S::Completed,
            (S::Pending | S::Uploading, E::Failed) => S::Failed,
            (S::Failed, E::RetryScheduled) => S::Pending,
            (S::Pending, E::GraceExpired) => S::NotApplicable,
            (S::Uploading, E::Interrupted) => S::Pending,
            (S::Pending | S::Uploading | S::Failed | S::NotApplicable, E::ServerCompleted) => S::Completed,
            (S::Pending | S::Failed, E::Excluded) => S::NotApplicable,
            // Confirmations of an already-completed upload are no-ops
            (S::Completed, E::ServerCompleted | E::FinalizeConfirmed) => S::Completed,
            (from, event) => return Err(TransitionError { from, event }),
        };
        Ok(next)
    }
}

impl fmt::Display for RecordingSyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordingSyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_APPLICABLE" => Ok(RecordingSyncStatus::NotApplicable),
            "PENDING" => Ok(RecordingSyncStatus::Pending),
            "UPLOADING" => Ok(RecordingSyncStatus::Uploading),
            "COMPLETED" => Ok(RecordingSyncStatus::Completed),
            "FAILED" => Ok(RecordingSyncStatus::Failed),
            other => Err(Error::InvalidInput(format!("Unknown recording status: {}", other))),
        }
    }
}
