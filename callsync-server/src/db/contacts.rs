//! Contact rows: per-number name, note and label shared across an org

use callsync_common::api::PersonUpdate;
use sqlx::{SqliteConnection, SqlitePool};

/// Create the contact if missing; fill or refresh its name.
///
/// `updated_at` only moves when the name actually changes, so pushing calls
/// does not flood the delta feed.
pub async fn touch_contact(
    conn: &mut SqliteConnection,
    org_id: &str,
    phone: &str,
    name: Option<&str>,
    now_ms: i64,
) -> Result<(), sqlx::Error> {
    let name = name.map(str::trim).filter(|n| !n.is_empty());
    sqlx::query(
        r#"
        INSERT INTO contacts (org_id, phone, name, created_at, updated_at) VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(org_id, phone) DO UPDATE SET
            updated_at = CASE
                WHEN excluded.name IS NOT NULL AND excluded.name IS NOT contacts.name THEN excluded.updated_at
                ELSE contacts.updated_at
            END,
            name = COALESCE(excluded.name, contacts.name)
        "#,
    )
    .bind(org_id)
    .bind(phone)
    .bind(name)
    .bind(now_ms)
    .bind(now_ms)
    .execute(conn)
    .await?;
    Ok(())
}

/// Apply note/label edits. `None` leaves a field alone; an empty string
/// clears it.
pub async fn update_note_and_label(
    conn: &mut SqliteConnection,
    org_id: &str,
    phone: &str,
    person_note: Option<&str>,
    label: Option<&str>,
    now_ms: i64,
) -> Result<(), sqlx::Error> {
    touch_contact(&mut *conn, org_id, phone, None, now_ms).await?;

    if let Some(note) = person_note {
        sqlx::query("UPDATE contacts SET notes = NULLIF(?, ''), updated_at = ? WHERE org_id = ? AND phone = ?")
            .bind(note)
            .bind(now_ms)
            .bind(org_id)
            .bind(phone)
            .execute(&mut *conn)
            .await?;
    }
    if let Some(label) = label {
        sqlx::query("UPDATE contacts SET label = NULLIF(?, ''), updated_at = ? WHERE org_id = ? AND phone = ?")
            .bind(label)
            .bind(now_ms)
            .bind(org_id)
            .bind(phone)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

pub async fn contacts_updated_since(
    pool: &SqlitePool,
    org_id: &str,
    since_ms: i64,
) -> Result<Vec<PersonUpdate>, sqlx::Error> {
    let rows: Vec<(String, Option<String>, Option<String>, Option<String>, i64)> = sqlx::query_as(
        r#"
        SELECT phone, name, notes, label, updated_at FROM contacts
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
        .map(|(phone, name, person_note, label, updated_at)| PersonUpdate {
            phone,
            name,
            person_note,
            label,
            updated_at,
        })
        .collect())
}
