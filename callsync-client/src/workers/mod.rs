//! Background sync workers
//!
//! Metadata sync (fast path) and recording upload (slow path) run on their
//! own schedules so a long upload never delays call metadata.

use callsync_common::call::phone_digits;
use std::collections::HashSet;

pub mod metadata;
pub mod recording;

pub use metadata::{MetadataRunReport, MetadataSyncWorker};
pub use recording::{RecordingRunReport, RecordingUploadWorker, GRACE_PERIOD};

/// What started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Timer or event trigger; permanently failed records are left alone
    Scheduled,
    /// User asked for a sync; permanently failed records are retried too
    Manual,
}

impl RunMode {
    pub fn includes_permanent_failures(&self) -> bool {
        matches!(self, RunMode::Manual)
    }
}

/// Whether `phone` is on the exclusion list.
///
/// Entries are compared by digits so `+91 98765 43210` and `09876543210`
/// match; numbers of 7+ digits match on their last 10 digits.
pub fn is_excluded(phone: &str, excluded: &HashSet<String>) -> bool {
    if phone.is_empty() || excluded.is_empty() {
        return false;
    }
    if excluded.contains(phone) {
        return true;
    }
    let digits = phone_digits(phone);
    excluded.iter().any(|entry| {
        let other = phone_digits(entry);
        if other == digits {
            return true;
        }
        digits.len() >= 7 && other.len() >= 7 && last_digits(&digits) == last_digits(&other)
    })
}

fn last_digits(digits: &str) -> &str {
    &digits[digits.len().saturating_sub(10)..]
}
