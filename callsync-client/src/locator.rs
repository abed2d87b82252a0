//! Recording discovery
//!
//! Dialer apps write recordings into a folder with no link back to the call
//! log, so a file is matched to a call by its modification time: it must
//! fall within `[call start - 30s, call end + 30s]`. Among several matches a
//! file whose name contains the caller's digits wins, otherwise the one
//! closest to the call end. Best effort only.

use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};
use walkdir::{DirEntry, WalkDir};

use crate::store::CallRecord;

/// Slack on both sides of the call interval
pub const MATCH_TOLERANCE: Duration = Duration::from_secs(30);

/// Trailing digits compared against file names (drops country code variance)
const NAME_MATCH_DIGITS: usize = 10;
/// Shorter numbers are too ambiguous to match by name
const MIN_NAME_MATCH_DIGITS: usize = 5;

const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "amr", "wav", "aac", "ogg", "opus", "3gp", "awb"];

#[derive(Debug, Clone)]
pub struct RecordingLocator {
    root: PathBuf,
    tolerance: Duration,
}

struct Candidate {
    path: PathBuf,
    name_match: bool,
    /// Distance of mtime from call end, millis
    distance: i64,
}

impl RecordingLocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tolerance: MATCH_TOLERANCE,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Best matching recording for `call`
    pub fn find(&self, call: &CallRecord) -> Option<PathBuf> {
        self.candidates(call).into_iter().next()
    }

    /// All matching recordings, best first
    pub fn candidates(&self, call: &CallRecord) -> Vec<PathBuf> {
        if !self.root.is_dir() {
            tracing::debug!("Recording folder {} not available", self.root.display());
            return Vec::new();
        }

        let tolerance = i64::try_from(self.tolerance.as_millis()).unwrap_or(i64::MAX);
        let window_start = call.timestamp_ms - tolerance;
        let call_end = call.end_millis();
        let window_end = call_end + tolerance;
        let digits = match_digits(&call.phone_number);

        let mut found = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false).into_iter() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Error accessing entry: {}", e);
                    continue;
                }
            };
            if !is_audio_file(&entry) {
                continue;
            }
            let Some(mtime) = modified_millis(&entry) else {
                continue;
            };
            if mtime < window_start || mtime > window_end {
                continue;
            }

            let name_match = digits.as_deref().is_some_and(|d| {
                let name_digits: String = entry
                    .file_name()
                    .to_string_lossy()
                    .chars()
                    .filter(char::is_ascii_digit)
                    .collect();
                name_digits.contains(d)
            });
            found.push(Candidate {
                path: entry.into_path(),
                name_match,
                distance: (mtime - call_end).abs(),
            });
        }

        found.sort_by(|a, b| {
            b.name_match
                .cmp(&a.name_match)
                .then(a.distance.cmp(&b.distance))
                .then_with(|| a.path.cmp(&b.path))
        });
        tracing::debug!(unique_id = %call.composite_id, matches = found.len(), "Recording candidates");
        found.into_iter().map(|c| c.path).collect()
    }
}

fn match_digits(phone: &str) -> Option<String> {
    let digits = callsync_common::call::phone_digits(phone);
    if digits.len() < MIN_NAME_MATCH_DIGITS {
        return None;
    }
    let skip = digits.len().saturating_sub(NAME_MATCH_DIGITS);
    Some(digits[skip..].to_string())
}

fn is_audio_file(entry: &DirEntry) -> bool {
    if !entry.file_type().is_file() || entry.file_name().to_string_lossy().starts_with('.') {
        return false;
    }
    entry
        .path()
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|ext| AUDIO_EXTENSIONS.contains(&ext.as_str()))
}

fn modified_millis(entry: &DirEntry) -> Option<i64> {
    let modified = entry.metadata().ok()?.modified().ok()?;
    let since_epoch = modified.duration_since(UNIX_EPOCH).ok()?;
    i64::try_from(since_epoch.as_millis()).ok()
}
