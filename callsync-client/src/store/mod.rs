//! Local Call Store
//!
//! SQLite tables on the device:
//! - `calls`: one row per ingested call-log entry, keyed by composite id,
//!   carrying both sync lifecycles
//! - `persons`: per-number aggregates plus the user-owned note, label and
//!   exclusion flag
//! - `settings`: pairing identity and sync bookkeeping (see [`settings`])

mod calls;
mod persons;
pub mod settings;

use callsync_common::db::{get_schema_version, open_pool, set_schema_version};
use callsync_common::{CallType, RecordingSyncStatus, SyncStatus};
use sqlx::{FromRow, SqlitePool};
use std::path::Path;
use tracing::info;

use crate::error::{Result, SyncError};

pub use settings::PairingIdentity;

const SCHEMA_VERSION: i64 = 2;

/// A call as stored on the device
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub composite_id: String,
    /// Normalised number; empty for withheld callers
    pub phone_number: String,
    pub call_type: CallType,
    /// Call start, epoch millis
    pub timestamp_ms: i64,
    pub duration_secs: i64,
    pub contact_name: Option<String>,
    pub subscription_id: Option<i64>,
    pub local_recording_path: Option<String>,
    pub recording_url: Option<String>,
    pub note: Option<String>,
    pub note_needs_sync: bool,
    pub sync_status: SyncStatus,
    pub sync_error: Option<String>,
    pub recording_status: RecordingSyncStatus,
    pub recording_error: Option<String>,
    /// Last recording failure was transient
    pub recording_retryable: bool,
}

impl CallRecord {
    /// Fresh record for a call-log entry, not yet synced anywhere
    pub fn new(
        composite_id: String,
        phone_number: String,
        call_type: CallType,
        timestamp_ms: i64,
        duration_secs: i64,
    ) -> Self {
        Self {
            composite_id,
            phone_number,
            call_type,
            timestamp_ms,
            duration_secs,
            contact_name: None,
            subscription_id: None,
            local_recording_path: None,
            recording_url: None,
            note: None,
            note_needs_sync: false,
            sync_status: SyncStatus::Pending,
            sync_error: None,
            recording_status: initial_recording_status(call_type, duration_secs),
            recording_error: None,
            recording_retryable: true,
        }
    }

    /// Call end, epoch millis
    pub fn end_millis(&self) -> i64 {
        self.timestamp_ms + self.duration_secs.max(0) * 1000
    }
}

/// Only answered calls with a non-zero duration can have a recording
pub fn initial_recording_status(call_type: CallType, duration_secs: i64) -> RecordingSyncStatus {
    match call_type {
        CallType::Incoming | CallType::Outgoing if duration_secs > 0 => RecordingSyncStatus::Pending,
        _ => RecordingSyncStatus::NotApplicable,
    }
}

/// Aggregated view of one phone number
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct PersonRecord {
    pub phone_number: String,
    pub contact_name: Option<String>,
    pub total_calls: i64,
    pub total_incoming: i64,
    pub total_outgoing: i64,
    pub total_missed: i64,
    pub total_duration: i64,
    pub last_call_timestamp: Option<i64>,
    pub last_call_composite_id: Option<String>,
    pub note: Option<String>,
    pub label: Option<String>,
    pub needs_sync: bool,
    pub is_excluded: bool,
}

#[derive(FromRow)]
struct CallRow {
    composite_id: String,
    phone_number: String,
    call_type: String,
    timestamp: i64,
    duration: i64,
    contact_name: Option<String>,
    subscription_id: Option<i64>,
    local_recording_path: Option<String>,
    recording_url: Option<String>,
    note: Option<String>,
    note_needs_sync: bool,
    sync_status: String,
    sync_error: Option<String>,
    recording_status: String,
    recording_error: Option<String>,
    recording_retryable: bool,
}

impl TryFrom<CallRow> for CallRecord {
    type Error = SyncError;

    fn try_from(row: CallRow) -> Result<Self> {
        Ok(CallRecord {
            call_type: row.call_type.parse()?,
            sync_status: row.sync_status.parse()?,
            recording_status: row.recording_status.parse()?,
            composite_id: row.composite_id,
            phone_number: row.phone_number,
            timestamp_ms: row.timestamp,
            duration_secs: row.duration,
            contact_name: row.contact_name,
            subscription_id: row.subscription_id,
            local_recording_path: row.local_recording_path,
            recording_url: row.recording_url,
            note: row.note,
            note_needs_sync: row.note_needs_sync,
            sync_error: row.sync_error,
            recording_error: row.recording_error,
            recording_retryable: row.recording_retryable,
        })
    }
}

fn into_records(rows: Vec<CallRow>) -> Result<Vec<CallRecord>> {
    rows.into_iter().map(CallRecord::try_from).collect()
}

/// Handle to the device database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LocalCallStore {
    pool: SqlitePool,
}

impl LocalCallStore {
    /// Open or create the store at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = open_pool(path, 4).await?;
        let store = Self { pool };
        store.create_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS calls (
                composite_id TEXT PRIMARY KEY,
                phone_number TEXT NOT NULL,
                call_type TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                duration INTEGER NOT NULL DEFAULT 0,
                contact_name TEXT,
                subscription_id INTEGER,
                local_recording_path TEXT,
                recording_url TEXT,
                note TEXT,
                note_needs_sync INTEGER NOT NULL DEFAULT 0,
                sync_status TEXT NOT NULL DEFAULT 'PENDING',
                sync_error TEXT,
                recording_status TEXT NOT NULL DEFAULT 'PENDING',
                recording_error TEXT,
                recording_retryable INTEGER NOT NULL DEFAULT 1,
                recording_checked_at INTEGER,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_calls_phone ON calls(phone_number)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_calls_timestamp ON calls(timestamp)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_calls_sync_status ON calls(sync_status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_calls_recording_status ON calls(recording_status)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS persons (
                phone_number TEXT PRIMARY KEY,
                contact_name TEXT,
                total_calls INTEGER NOT NULL DEFAULT 0,
                total_incoming INTEGER NOT NULL DEFAULT 0,
                total_outgoing INTEGER NOT NULL DEFAULT 0,
                total_missed INTEGER NOT NULL DEFAULT 0,
                total_duration INTEGER NOT NULL DEFAULT 0,
                last_call_timestamp INTEGER,
                last_call_composite_id TEXT,
                note TEXT,
                label TEXT,
                needs_sync INTEGER NOT NULL DEFAULT 0,
                is_excluded INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let version = get_schema_version(&self.pool).await?;
        if version == 1 {
            // v1 rows predate deferred-recording bookkeeping
            sqlx::query("ALTER TABLE calls ADD COLUMN recording_checked_at INTEGER")
                .execute(&self.pool)
                .await?;
        }
        if version < SCHEMA_VERSION {
            set_schema_version(&self.pool, SCHEMA_VERSION).await?;
            info!("Local call store schema at version {}", SCHEMA_VERSION);
        }
        Ok(())
    }

    /// Counts of calls awaiting metadata push and recording upload
    pub async fn pending_work(&self) -> Result<(i64, i64)> {
        let metadata: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM calls WHERE sync_status = 'PENDING' OR note_needs_sync = 1")
                .fetch_one(&self.pool)
                .await?;
        let persons: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM persons WHERE needs_sync = 1")
            .fetch_one(&self.pool)
            .await?;
        let recordings: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM calls WHERE recording_status IN ('PENDING', 'UPLOADING')
             OR (recording_status = 'FAILED' AND recording_retryable = 1)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((metadata + persons, recordings))
    }

    pub async fn has_pending_work(&self) -> Result<bool> {
        let (metadata, recordings) = self.pending_work().await?;
        Ok(metadata > 0 || recordings > 0)
    }
}
