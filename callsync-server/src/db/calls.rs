//! Call rows

use callsync_common::api::{CallPayload, CallUpdate, UploadStatus};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

#[derive(Debug, Clone, FromRow)]
pub struct CallRow {
    pub org_id: String,
    pub unique_id: String,
    pub employee_id: i64,
    pub device_id: String,
    pub caller_phone: String,
    pub caller_name: Option<String>,
    pub device_phone: Option<String>,
    pub call_type: String,
    pub duration: i64,
    pub call_time: String,
    pub note: Option<String>,
    pub labels: Option<String>,
    pub recording_url: Option<String>,
    pub upload_status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl CallRow {
    pub fn upload_status(&self) -> UploadStatus {
        UploadStatus::from_db(&self.upload_status)
    }
}

/// Upload status a freshly reported call starts with: nothing to upload for
/// missed/rejected or zero-length calls.
pub fn initial_upload_status(call: &CallPayload) -> UploadStatus {
    if call.duration <= 0 || call.call_type.counts_as_missed() {
        UploadStatus::Completed
    } else {
        UploadStatus::Pending
    }
}

/// Insert or update a call keyed by `(org_id, unique_id)`.
///
/// A `completed` upload status is never downgraded and `recording_url` is
/// never touched. Returns the stored status and URL.
pub async fn upsert_call(
    conn: &mut SqliteConnection,
    org_id: &str,
    employee_id: i64,
    device_id: &str,
    call: &CallPayload,
    call_time: &str,
    now_ms: i64,
) -> Result<(UploadStatus, Option<String>), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO calls (
            org_id, unique_id, employee_id, device_id, caller_phone, caller_name,
            device_phone, call_type, duration, call_time, upload_status, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(org_id, unique_id) DO UPDATE SET
            employee_id = excluded.employee_id,
            device_id = excluded.device_id,
            caller_phone = excluded.caller_phone,
            caller_name = COALESCE(excluded.caller_name, calls.caller_name),
            device_phone = COALESCE(excluded.device_phone, calls.device_phone),
            call_type = excluded.call_type,
            duration = excluded.duration,
            call_time = excluded.call_time,
            upload_status = CASE
                WHEN calls.upload_status = 'completed' THEN 'completed'
                ELSE excluded.upload_status
            END,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(org_id)
    .bind(&call.unique_id)
    .bind(employee_id)
    .bind(device_id)
    .bind(&call.caller)
    .bind(&call.caller_name)
    .bind(&call.device_phone)
    .bind(call.call_type.as_str())
    .bind(call.duration)
    .bind(call_time)
    .bind(initial_upload_status(call).as_str())
    .bind(now_ms)
    .bind(now_ms)
    .execute(&mut *conn)
    .await?;

    let (status, url): (String, Option<String>) =
        sqlx::query_as("SELECT upload_status, recording_url FROM calls WHERE org_id = ? AND unique_id = ?")
            .bind(org_id)
            .bind(&call.unique_id)
            .fetch_one(&mut *conn)
            .await?;

    Ok((UploadStatus::from_db(&status), url))
}

pub async fn get_call(
    conn: &mut SqliteConnection,
    org_id: &str,
    unique_id: &str,
) -> Result<Option<CallRow>, sqlx::Error> {
    sqlx::query_as::<_, CallRow>("SELECT * FROM calls WHERE org_id = ? AND unique_id = ?")
        .bind(org_id)
        .bind(unique_id)
        .fetch_optional(conn)
        .await
}

pub async fn mark_recording_completed(
    conn: &mut SqliteConnection,
    org_id: &str,
    unique_id: &str,
    recording_url: &str,
    now_ms: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE calls SET recording_url = ?, upload_status = 'completed', updated_at = ?
        WHERE org_id = ? AND unique_id = ?
        "#,
    )
    .bind(recording_url)
    .bind(now_ms)
    .bind(org_id)
    .bind(unique_id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Set (or clear, with `None`) the note of one call
pub async fn set_call_note(
    conn: &mut SqliteConnection,
    org_id: &str,
    unique_id: &str,
    note: Option<&str>,
    now_ms: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE calls SET note = ?, updated_at = ? WHERE org_id = ? AND unique_id = ?")
        .bind(note)
        .bind(now_ms)
        .bind(org_id)
        .bind(unique_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Mirror a contact label onto every call with that number
pub async fn set_labels_for_phone(
    conn: &mut SqliteConnection,
    org_id: &str,
    phone: &str,
    label: Option<&str>,
    now_ms: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE calls SET labels = ?, updated_at = ? WHERE org_id = ? AND caller_phone = ?")
        .bind(label)
        .bind(now_ms)
        .bind(org_id)
        .bind(phone)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn calls_updated_since(pool: &SqlitePool, org_id: &str, since_ms: i64) -> Result<Vec<CallUpdate>, sqlx::Error> {
    let rows: Vec<(String, Option<String>, Option<String>, i64)> = sqlx::query_as(
        r#"
        SELECT unique_id, note, caller_name, updated_at FROM calls
        WHERE org_id = ? AND updated_at > ?
        ORDER BY updated_at
        "#,
    )
    .bind(org_id)
    .bind(since_ms)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(unique_id, note, caller_name, updated_at)| CallUpdate {
            unique_id,
            note,
            caller_name,
            updated_at,
        })
        .collect())
}

/// Subset of `unique_ids` whose recording is already stored
pub async fn completed_among(pool: &SqlitePool, org_id: &str, unique_ids: &[String]) -> Result<Vec<String>, sqlx::Error> {
    if unique_ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut builder: QueryBuilder<Sqlite> =
        QueryBuilder::new("SELECT unique_id FROM calls WHERE upload_status = 'completed' AND org_id = ");
    builder.push_bind(org_id);
    builder.push(" AND unique_id IN (");
    let mut separated = builder.separated(", ");
    for id in unique_ids {
        separated.push_bind(id);
    }
    separated.push_unseparated(")");

    builder.build_query_scalar::<String>().fetch_all(pool).await
}
