//! Person rows
//!
//! Totals and the last-call pointer are derived from `calls`; `note`,
//! `label`, `is_excluded` and `needs_sync` belong to the user and are only
//! written by the explicit edit methods, by [`LocalCallStore::mark_person_synced`]
//! and, when nothing is pending locally, by remote deltas.

use callsync_common::api::PersonUpdate;
use std::collections::BTreeSet;
use tracing::debug;

use super::{LocalCallStore, PersonRecord};
use crate::error::Result;

#[derive(sqlx::FromRow)]
struct Totals {
    total_calls: i64,
    total_incoming: i64,
    total_outgoing: i64,
    total_missed: i64,
    total_duration: i64,
    last_call_timestamp: Option<i64>,
}

fn clean(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl LocalCallStore {
    /// Rebuild the aggregates of each number from its calls.
    ///
    /// A person whose calls are all gone is removed unless it still carries
    /// user-owned data, in which case its totals drop to zero.
    pub async fn recompute_persons(&self, phone_numbers: &[String]) -> Result<usize> {
        let phones: BTreeSet<&str> = phone_numbers
            .iter()
            .map(String::as_str)
            .filter(|p| !p.is_empty())
            .collect();

        let mut tx = self.pool.begin().await?;
        for &phone in &phones {
            let totals = sqlx::query_as::<_, Totals>(
                r#"
                SELECT
                    COUNT(*) AS total_calls,
                    COALESCE(SUM(call_type = 'incoming'), 0) AS total_incoming,
                    COALESCE(SUM(call_type = 'outgoing'), 0) AS total_outgoing,
                    COALESCE(SUM(call_type IN ('missed', 'rejected')), 0) AS total_missed,
                    COALESCE(SUM(duration), 0) AS total_duration,
                    MAX(timestamp) AS last_call_timestamp
                FROM calls WHERE phone_number = ?
                "#,
            )
            .bind(phone)
            .fetch_one(&mut *tx)
            .await?;

            if totals.total_calls == 0 {
                sqlx::query(
                    r#"
                    DELETE FROM persons
                    WHERE phone_number = ? AND note IS NULL AND label IS NULL
                      AND needs_sync = 0 AND is_excluded = 0
                    "#,
                )
                .bind(phone)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    r#"
                    UPDATE persons SET total_calls = 0, total_incoming = 0, total_outgoing = 0,
                        total_missed = 0, total_duration = 0,
                        last_call_timestamp = NULL, last_call_composite_id = NULL
                    WHERE phone_number = ?
                    "#,
                )
                .bind(phone)
                .execute(&mut *tx)
                .await?;
                continue;
            }

            let last_call_id: Option<String> = sqlx::query_scalar(
                "SELECT composite_id FROM calls WHERE phone_number = ? ORDER BY timestamp DESC, composite_id DESC LIMIT 1",
            )
            .bind(phone)
            .fetch_optional(&mut *tx)
            .await?;
            let contact_name: Option<String> = sqlx::query_scalar(
                r#"
                SELECT contact_name FROM calls
                WHERE phone_number = ? AND contact_name IS NOT NULL AND contact_name != ''
                ORDER BY timestamp DESC LIMIT 1
                "#,
            )
            .bind(phone)
            .fetch_optional(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO persons (
                    phone_number, contact_name, total_calls, total_incoming, total_outgoing,
                    total_missed, total_duration, last_call_timestamp, last_call_composite_id
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(phone_number) DO UPDATE SET
                    contact_name = COALESCE(excluded.contact_name, persons.contact_name),
                    total_calls = excluded.total_calls,
                    total_incoming = excluded.total_incoming,
                    total_outgoing = excluded.total_outgoing,
                    total_missed = excluded.total_missed,
                    total_duration = excluded.total_duration,
                    last_call_timestamp = excluded.last_call_timestamp,
                    last_call_composite_id = excluded.last_call_composite_id
                "#,
            )
            .bind(phone)
            .bind(contact_name)
            .bind(totals.total_calls)
            .bind(totals.total_incoming)
            .bind(totals.total_outgoing)
            .bind(totals.total_missed)
            .bind(totals.total_duration)
            .bind(totals.last_call_timestamp)
            .bind(last_call_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(persons = phones.len(), "Persons recomputed");
        Ok(phones.len())
    }

    pub async fn get_person(&self, phone_number: &str) -> Result<Option<PersonRecord>> {
        let person = sqlx::query_as::<_, PersonRecord>("SELECT * FROM persons WHERE phone_number = ?")
            .bind(phone_number)
            .fetch_optional(&self.pool)
            .await?;
        Ok(person)
    }

    async fn ensure_person(&self, phone_number: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO persons (phone_number) VALUES (?)")
            .bind(phone_number)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Local edit of a contact note; `None` or blank clears it
    pub async fn update_person_note(&self, phone_number: &str, note: Option<&str>) -> Result<()> {
        self.ensure_person(phone_number).await?;
        sqlx::query("UPDATE persons SET note = ?, needs_sync = 1 WHERE phone_number = ?")
            .bind(clean(note))
            .bind(phone_number)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Local edit of a contact label; `None` or blank clears it
    pub async fn update_person_label(&self, phone_number: &str, label: Option<&str>) -> Result<()> {
        self.ensure_person(phone_number).await?;
        sqlx::query("UPDATE persons SET label = ?, needs_sync = 1 WHERE phone_number = ?")
            .bind(clean(label))
            .bind(phone_number)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Personal exclusion; stays on the device
    pub async fn set_person_excluded(&self, phone_number: &str, excluded: bool) -> Result<()> {
        self.ensure_person(phone_number).await?;
        sqlx::query("UPDATE persons SET is_excluded = ? WHERE phone_number = ?")
            .bind(excluded)
            .bind(phone_number)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Numbers the user excluded on this device
    pub async fn personally_excluded_numbers(&self) -> Result<Vec<String>> {
        let phones = sqlx::query_scalar("SELECT phone_number FROM persons WHERE is_excluded = 1")
            .fetch_all(&self.pool)
            .await?;
        Ok(phones)
    }

    pub async fn persons_needing_sync(&self) -> Result<Vec<PersonRecord>> {
        let persons = sqlx::query_as::<_, PersonRecord>(
            "SELECT * FROM persons WHERE needs_sync = 1 ORDER BY phone_number",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(persons)
    }

    /// Clear `needs_sync` if note and label still hold the values that were
    /// sent. Returns false when the user edited again meanwhile.
    pub async fn mark_person_synced(&self, phone_number: &str, note: Option<&str>, label: Option<&str>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE persons SET needs_sync = 0 WHERE phone_number = ? AND note IS ? AND label IS ?",
        )
        .bind(phone_number)
        .bind(note)
        .bind(label)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Merge a server-side contact change.
    ///
    /// The remote name fills in when present. Note and label are taken from
    /// the server unless a local edit is still pending, in which case the
    /// local values win until they have been pushed. Returns whether the
    /// user-owned fields were applied.
    pub async fn apply_remote_person_update(&self, update: &PersonUpdate) -> Result<bool> {
        if update.phone.trim().is_empty() {
            return Ok(false);
        }
        self.ensure_person(&update.phone).await?;

        sqlx::query("UPDATE persons SET contact_name = COALESCE(?, contact_name) WHERE phone_number = ?")
            .bind(clean(update.name.as_deref()))
            .bind(&update.phone)
            .execute(&self.pool)
            .await?;

        let result = sqlx::query(
            "UPDATE persons SET note = ?, label = ? WHERE phone_number = ? AND needs_sync = 0",
        )
        .bind(clean(update.person_note.as_deref()))
        .bind(clean(update.label.as_deref()))
        .bind(&update.phone)
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() > 0;
        if !applied {
            debug!(phone = %update.phone, "Remote contact update deferred: local edit pending");
        }
        Ok(applied)
    }
}
