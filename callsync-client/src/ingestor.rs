//! Call Log Ingestor
//!
//! Copies new OS call-log rows into the Local Call Store:
//! 1. drop stored calls older than the tracking start date
//! 2. read the log from `max(tracking_start, latest_stored - 2 days)`
//! 3. apply the SIM policy, normalise numbers, derive composite ids
//! 4. insert ids not stored yet, then recompute the affected persons

use callsync_common::{composite_id, normalize_phone_number, CallType, SimSelection};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::call_log::{CallLogEntry, CallLogSource};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::store::{CallRecord, LocalCallStore};

/// Re-read window behind the newest stored call, for late log writes
pub const INCREMENTAL_OVERLAP_MS: i64 = 2 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub device_id: String,
    pub default_country_code: Option<String>,
    pub sim_selection: SimSelection,
    pub sim1_subscription_id: Option<i64>,
    pub sim2_subscription_id: Option<i64>,
    /// Epoch millis; earlier calls are never tracked
    pub tracking_start_ms: i64,
}

impl IngestSettings {
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            device_id: config.device_id.clone(),
            default_country_code: config.default_country_code.clone(),
            sim_selection: config.sim_selection,
            sim1_subscription_id: config.sim1_subscription_id,
            sim2_subscription_id: config.sim2_subscription_id,
            tracking_start_ms: config.tracking_start_millis()?,
        })
    }

    /// Store-ready record for a log row, or `None` when it is not tracked
    pub fn to_record(&self, entry: &CallLogEntry) -> Option<CallRecord> {
        let call_type = CallType::from_os_code(entry.type_code)?;
        if entry.timestamp_ms < self.tracking_start_ms {
            return None;
        }
        let phone = normalize_phone_number(&entry.number, self.default_country_code.as_deref());
        let id = composite_id(call_type, &self.device_id, &phone, entry.timestamp_ms);

        let mut record = CallRecord::new(id, phone, call_type, entry.timestamp_ms, entry.duration.max(0));
        record.contact_name = entry
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        record.subscription_id = entry.subscription_id;
        Some(record)
    }

    fn tracks_sim(&self, entry: &CallLogEntry) -> bool {
        self.sim_selection
            .matches(entry.subscription_id, self.sim1_subscription_id, self.sim2_subscription_id)
    }
}

/// Outcome of one ingest pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Rows read from the OS log
    pub fetched: usize,
    pub inserted: usize,
    pub skipped_sim: usize,
    /// Unknown type code or before the tracking start
    pub skipped_untracked: usize,
    /// Numbers whose stored calls fell out of the tracking window
    pub pruned_numbers: usize,
    pub persons_recomputed: usize,
}

pub struct CallLogIngestor {
    store: LocalCallStore,
    source: Arc<dyn CallLogSource>,
    settings: IngestSettings,
}

impl CallLogIngestor {
    pub fn new(store: LocalCallStore, source: Arc<dyn CallLogSource>, settings: IngestSettings) -> Self {
        Self {
            store,
            source,
            settings,
        }
    }

    pub async fn run(&self) -> Result<IngestReport> {
        let mut report = IngestReport::default();

        if self.settings.sim_selection == SimSelection::Off {
            debug!("SIM tracking off; ingest skipped");
            return Ok(report);
        }

        let start = self.settings.tracking_start_ms;
        let pruned = self.store.delete_calls_before(start).await?;
        report.pruned_numbers = pruned.len();

        let window_start = self.window_start().await?;
        let entries = self.source.entries_since(window_start).await?;
        report.fetched = entries.len();

        let mut records = Vec::with_capacity(entries.len());
        for entry in &entries {
            if !self.settings.tracks_sim(entry) {
                report.skipped_sim += 1;
                continue;
            }
            match self.settings.to_record(entry) {
                Some(record) => records.push(record),
                None => report.skipped_untracked += 1,
            }
        }

        report.inserted = self.store.insert_new_calls(&records).await?;

        let affected: BTreeSet<String> = records
            .iter()
            .map(|r| r.phone_number.clone())
            .chain(pruned)
            .collect();
        let affected: Vec<String> = affected.into_iter().collect();
        report.persons_recomputed = self.store.recompute_persons(&affected).await?;

        self.store.set_ingest_tracking_start(start).await?;

        if report.inserted > 0 {
            info!(
                inserted = report.inserted,
                fetched = report.fetched,
                window_start,
                "Call log ingested"
            );
        } else {
            debug!(fetched = report.fetched, window_start, "No new calls in log");
        }
        Ok(report)
    }

    /// Incremental read start, or the full window when the tracking start
    /// moved earlier since the previous pass
    async fn window_start(&self) -> Result<i64> {
        let start = self.settings.tracking_start_ms;
        let moved_back = self
            .store
            .ingest_tracking_start()
            .await?
            .is_some_and(|previous| start < previous);
        if moved_back {
            info!(tracking_start = start, "Tracking start moved earlier; rescanning full window");
            return Ok(start);
        }

        Ok(match self.store.latest_call_timestamp().await? {
            Some(latest) => start.max(latest - INCREMENTAL_OVERLAP_MS),
            None => start,
        })
    }
}
