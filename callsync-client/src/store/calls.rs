//! Call rows: ingest, metadata sync bookkeeping, recording lifecycle

use callsync_common::api::CallUpdate;
use callsync_common::{RecordingEvent, RecordingSyncStatus, SyncStatus};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::HashSet;
use tracing::debug;

use super::{into_records, CallRecord, CallRow, LocalCallStore};
use crate::error::{Result, SyncError};

/// Bound parameters per `IN (...)` query
const ID_CHUNK: usize = 500;

async fn existing_among(conn: &mut SqliteConnection, ids: &[&str]) -> Result<HashSet<String>> {
    let mut found = HashSet::new();
    for chunk in ids.chunks(ID_CHUNK) {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT composite_id FROM calls WHERE composite_id IN (");
        let mut separated = query.separated(", ");
        for id in chunk {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        let rows: Vec<String> = query.build_query_scalar::<String>().fetch_all(&mut *conn).await?;
        found.extend(rows);
    }
    Ok(found)
}

impl LocalCallStore {
    /// Insert the calls whose composite id is not stored yet.
    ///
    /// Existing ids are looked up in bulk first; rows already present are
    /// left untouched. Returns the number of rows inserted.
    pub async fn insert_new_calls(&self, calls: &[CallRecord]) -> Result<usize> {
        if calls.is_empty() {
            return Ok(0);
        }

        let ids: Vec<&str> = calls.iter().map(|c| c.composite_id.as_str()).collect();
        let now_ms = callsync_common::time::now_millis();

        let mut tx = self.pool.begin().await?;
        let existing = existing_among(&mut tx, &ids).await?;

        let mut inserted = 0usize;
        for call in calls.iter().filter(|c| !existing.contains(&c.composite_id)) {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO calls (
                    composite_id, phone_number, call_type, timestamp, duration, contact_name,
                    subscription_id, local_recording_path, note, sync_status, recording_status, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&call.composite_id)
            .bind(&call.phone_number)
            .bind(call.call_type.as_str())
            .bind(call.timestamp_ms)
            .bind(call.duration_secs)
            .bind(&call.contact_name)
            .bind(call.subscription_id)
            .bind(&call.local_recording_path)
            .bind(&call.note)
            .bind(call.sync_status.as_str())
            .bind(call.recording_status.as_str())
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;

        debug!(offered = calls.len(), already_stored = existing.len(), inserted, "Calls inserted");
        Ok(inserted)
    }

    /// Composite ids of calls that started at or after `since_ms`
    pub async fn existing_ids_since(&self, since_ms: i64) -> Result<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT composite_id FROM calls WHERE timestamp >= ?")
            .bind(since_ms)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    pub async fn latest_call_timestamp(&self) -> Result<Option<i64>> {
        let latest: Option<i64> = sqlx::query_scalar("SELECT MAX(timestamp) FROM calls")
            .fetch_one(&self.pool)
            .await?;
        Ok(latest)
    }

    /// Drop calls that started before `cutoff_ms`; returns the affected numbers
    pub async fn delete_calls_before(&self, cutoff_ms: i64) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        let phones: Vec<String> = sqlx::query_scalar("SELECT DISTINCT phone_number FROM calls WHERE timestamp < ?")
            .bind(cutoff_ms)
            .fetch_all(&mut *tx)
            .await?;
        if !phones.is_empty() {
            sqlx::query("DELETE FROM calls WHERE timestamp < ?")
                .bind(cutoff_ms)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(phones)
    }

    pub async fn get_call(&self, composite_id: &str) -> Result<Option<CallRecord>> {
        let row = sqlx::query_as::<_, CallRow>("SELECT * FROM calls WHERE composite_id = ?")
            .bind(composite_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(CallRecord::try_from).transpose()
    }

    // ========================================
    // Metadata sync
    // ========================================

    /// Calls whose metadata has not reached the server, oldest first
    pub async fn calls_needing_metadata_sync(&self, limit: usize) -> Result<Vec<CallRecord>> {
        let rows = sqlx::query_as::<_, CallRow>(
            "SELECT * FROM calls WHERE sync_status = 'PENDING' ORDER BY timestamp ASC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        into_records(rows)
    }

    /// Put permanently failed pushes back in the queue (user-initiated sync)
    pub async fn requeue_failed_metadata(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE calls SET sync_status = 'PENDING' WHERE sync_status = 'FAILED'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn mark_metadata_synced(&self, composite_ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in composite_ids {
            sqlx::query("UPDATE calls SET sync_status = ?, sync_error = NULL WHERE composite_id = ?")
                .bind(SyncStatus::Completed.as_str())
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Record a failed push. Transient failures keep the row `PENDING` for
    /// the next scheduled run; permanent ones park it as `FAILED`.
    pub async fn mark_metadata_failed(&self, composite_ids: &[String], error: &str, permanent: bool) -> Result<()> {
        let status = if permanent {
            SyncStatus::Failed
        } else {
            SyncStatus::Pending
        };
        let mut tx = self.pool.begin().await?;
        for id in composite_ids {
            sqlx::query("UPDATE calls SET sync_status = ?, sync_error = ? WHERE composite_id = ?")
                .bind(status.as_str())
                .bind(error)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Local edit of a call note; pushed by the next metadata run
    pub async fn update_call_note(&self, composite_id: &str, note: Option<&str>) -> Result<()> {
        let note = note.map(str::trim).filter(|n| !n.is_empty());
        let result = sqlx::query("UPDATE calls SET note = ?, note_needs_sync = 1 WHERE composite_id = ?")
            .bind(note)
            .bind(composite_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SyncError::CallNotFound(composite_id.to_string()));
        }
        Ok(())
    }

    /// Calls with an unsent note edit whose metadata is already on the server
    pub async fn calls_with_pending_notes(&self) -> Result<Vec<CallRecord>> {
        let rows = sqlx::query_as::<_, CallRow>(
            "SELECT * FROM calls WHERE note_needs_sync = 1 AND sync_status = 'COMPLETED' ORDER BY timestamp ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        into_records(rows)
    }

    /// Clear the pending flag unless the note changed again since it was sent
    pub async fn mark_call_note_synced(&self, composite_id: &str, sent_note: Option<&str>) -> Result<bool> {
        let result = sqlx::query("UPDATE calls SET note_needs_sync = 0 WHERE composite_id = ? AND note IS ?")
            .bind(composite_id)
            .bind(sent_note)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Merge a server-side call change. Skipped while a local note edit is
    /// pending. Returns whether the row changed.
    pub async fn apply_remote_call_update(&self, update: &CallUpdate) -> Result<bool> {
        let caller_name = update.caller_name.as_deref().map(str::trim).filter(|n| !n.is_empty());
        let result = sqlx::query(
            r#"
            UPDATE calls SET
                note = ?,
                contact_name = COALESCE(?, contact_name)
            WHERE composite_id = ? AND note_needs_sync = 0
            "#,
        )
        .bind(&update.note)
        .bind(caller_name)
        .bind(&update.unique_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========================================
    // Recording lifecycle
    // ========================================

    /// Calls the recording worker should look at.
    ///
    /// Only calls whose metadata is on the server qualify. Failed rows are
    /// included when retryable, or always when `include_permanent` is set.
    /// Rows deferred after `deferred_before` (epoch millis) are skipped.
    /// Never-deferred calls come first, newest first, then deferred calls
    /// by oldest check, so calls still waiting for a file cannot crowd out
    /// the rest of the queue.
    pub async fn calls_needing_recording_sync(
        &self,
        include_permanent: bool,
        deferred_before: i64,
        limit: usize,
    ) -> Result<Vec<CallRecord>> {
        let rows = sqlx::query_as::<_, CallRow>(
            r#"
            SELECT * FROM calls
            WHERE sync_status = 'COMPLETED'
              AND (recording_status = 'PENDING'
                   OR (recording_status = 'FAILED' AND (recording_retryable = 1 OR ?)))
              AND (recording_checked_at IS NULL OR recording_checked_at <= ?)
            ORDER BY recording_checked_at IS NOT NULL, recording_checked_at, timestamp DESC
            LIMIT ?
            "#,
        )
        .bind(include_permanent)
        .bind(deferred_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        into_records(rows)
    }

    pub async fn calls_in_recording_status(&self, status: RecordingSyncStatus) -> Result<Vec<CallRecord>> {
        let rows = sqlx::query_as::<_, CallRow>("SELECT * FROM calls WHERE recording_status = ? ORDER BY timestamp DESC")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        into_records(rows)
    }

    pub async fn recording_status(&self, composite_id: &str) -> Result<Option<RecordingSyncStatus>> {
        let status: Option<String> = sqlx::query_scalar("SELECT recording_status FROM calls WHERE composite_id = ?")
            .bind(composite_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(status.map(|s| s.parse::<RecordingSyncStatus>()).transpose()?)
    }

    /// Apply `event` to the stored recording status.
    ///
    /// Illegal moves are rejected with [`SyncError::Transition`] and leave the
    /// row unchanged.
    pub async fn transition_recording(&self, composite_id: &str, event: RecordingEvent) -> Result<RecordingSyncStatus> {
        self.write_transition(composite_id, event, None).await
    }

    /// `Failed` transition that also records the cause and whether the next
    /// scheduled run may retry it
    pub async fn fail_recording(&self, composite_id: &str, error: &SyncError) -> Result<RecordingSyncStatus> {
        self.write_transition(composite_id, RecordingEvent::Failed, Some(error)).await
    }

    async fn write_transition(
        &self,
        composite_id: &str,
        event: RecordingEvent,
        error: Option<&SyncError>,
    ) -> Result<RecordingSyncStatus> {
        let mut tx = self.pool.begin().await?;
        let current: String = sqlx::query_scalar("SELECT recording_status FROM calls WHERE composite_id = ?")
            .bind(composite_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| SyncError::CallNotFound(composite_id.to_string()))?;
        let current: RecordingSyncStatus = current.parse()?;
        let next = current.apply(event)?;

        match error {
            Some(err) => {
                sqlx::query(
                    "UPDATE calls SET recording_status = ?, recording_error = ?, recording_retryable = ? WHERE composite_id = ?",
                )
                .bind(next.as_str())
                .bind(err.to_string())
                .bind(err.is_transient())
                .bind(composite_id)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                let clears_error = matches!(next, RecordingSyncStatus::Completed | RecordingSyncStatus::NotApplicable);
                sqlx::query(
                    r#"
                    UPDATE calls SET
                        recording_status = ?,
                        recording_error = CASE WHEN ? THEN NULL ELSE recording_error END
                    WHERE composite_id = ?
                    "#,
                )
                .bind(next.as_str())
                .bind(clears_error)
                .bind(composite_id)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;

        debug!(unique_id = %composite_id, from = %current, to = %next, ?event, "Recording transition");
        Ok(next)
    }

    /// Note that no usable file was found for this call at `now_ms`
    pub async fn mark_recording_deferred(&self, composite_id: &str, now_ms: i64) -> Result<()> {
        sqlx::query("UPDATE calls SET recording_checked_at = ? WHERE composite_id = ?")
            .bind(now_ms)
            .bind(composite_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_recording_path(&self, composite_id: &str, path: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE calls SET local_recording_path = ? WHERE composite_id = ?")
            .bind(path)
            .bind(composite_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_recording_url(&self, composite_id: &str, url: &str) -> Result<()> {
        sqlx::query("UPDATE calls SET recording_url = ? WHERE composite_id = ?")
            .bind(url)
            .bind(composite_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Whether another call already claimed `path` as its recording
    pub async fn recording_path_claimed(&self, path: &str, except_id: &str) -> Result<bool> {
        let claimed: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM calls WHERE local_recording_path = ? AND composite_id != ?",
        )
        .bind(path)
        .bind(except_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(claimed > 0)
    }
}
