//! Employees, organisations and excluded numbers

use callsync_common::api::{EmployeeSettings, PlanInfo};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

/// Employee row
#[derive(Debug, Clone, FromRow)]
pub struct Employee {
    pub org_id: String,
    pub id: i64,
    pub name: String,
    pub device_id: Option<String>,
    pub device_model: Option<String>,
    pub last_sync: Option<i64>,
    pub call_track: bool,
    pub call_record_crm: bool,
    pub allow_personal_exclusion: bool,
    pub allow_changing_tracking_start_date: bool,
    pub allow_updating_tracking_sims: bool,
    pub default_tracking_starting_date: Option<String>,
}

impl Employee {
    pub fn settings(&self) -> EmployeeSettings {
        EmployeeSettings {
            call_track: self.call_track,
            call_record_crm: self.call_record_crm,
            allow_personal_exclusion: self.allow_personal_exclusion,
            allow_changing_tracking_start_date: self.allow_changing_tracking_start_date,
            allow_updating_tracking_sims: self.allow_updating_tracking_sims,
            default_tracking_starting_date: self.default_tracking_starting_date.clone(),
        }
    }
}

/// Create the organisation row if missing
pub async fn ensure_organization(pool: &SqlitePool, org_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT OR IGNORE INTO organizations (org_id) VALUES (?)")
        .bind(org_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Provision (or rename) an employee; the device binding is left as is
pub async fn upsert_employee(pool: &SqlitePool, org_id: &str, id: i64, name: &str) -> Result<(), sqlx::Error> {
    ensure_organization(pool, org_id).await?;
    sqlx::query(
        r#"
        INSERT INTO employees (org_id, id, name) VALUES (?, ?, ?)
        ON CONFLICT(org_id, id) DO UPDATE SET name = excluded.name
        "#,
    )
    .bind(org_id)
    .bind(id)
    .bind(name)
    .execute(pool)
    .await?;
    Ok(())
}

/// Replace the tracking policy of an employee
pub async fn update_settings(
    pool: &SqlitePool,
    org_id: &str,
    id: i64,
    settings: &EmployeeSettings,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE employees SET
            call_track = ?, call_record_crm = ?, allow_personal_exclusion = ?,
            allow_changing_tracking_start_date = ?, allow_updating_tracking_sims = ?,
            default_tracking_starting_date = ?
        WHERE org_id = ? AND id = ?
        "#,
    )
    .bind(settings.call_track)
    .bind(settings.call_record_crm)
    .bind(settings.allow_personal_exclusion)
    .bind(settings.allow_changing_tracking_start_date)
    .bind(settings.allow_updating_tracking_sims)
    .bind(&settings.default_tracking_starting_date)
    .bind(org_id)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_employee(
    conn: &mut SqliteConnection,
    org_id: &str,
    id: i64,
) -> Result<Option<Employee>, sqlx::Error> {
    sqlx::query_as::<_, Employee>("SELECT * FROM employees WHERE org_id = ? AND id = ?")
        .bind(org_id)
        .bind(id)
        .fetch_optional(conn)
        .await
}

/// Employee (other than `except_id`) currently bound to `device_id`
pub async fn find_by_device(
    conn: &mut SqliteConnection,
    org_id: &str,
    device_id: &str,
    except_id: i64,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar("SELECT id FROM employees WHERE org_id = ? AND device_id = ? AND id != ?")
        .bind(org_id)
        .bind(device_id)
        .bind(except_id)
        .fetch_optional(conn)
        .await
}

pub async fn bind_device(
    conn: &mut SqliteConnection,
    org_id: &str,
    id: i64,
    device_id: &str,
    device_model: Option<&str>,
    now_ms: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE employees
        SET device_id = ?, device_model = COALESCE(?, device_model), last_sync = ?
        WHERE org_id = ? AND id = ?
        "#,
    )
    .bind(device_id)
    .bind(device_model)
    .bind(now_ms)
    .bind(org_id)
    .bind(id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Record a heartbeat from the bound device
pub async fn touch_last_sync(pool: &SqlitePool, org_id: &str, id: i64, now_ms: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE employees SET last_sync = ? WHERE org_id = ? AND id = ?")
        .bind(now_ms)
        .bind(org_id)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_plan(pool: &SqlitePool, org_id: &str) -> Result<PlanInfo, sqlx::Error> {
    let row: Option<(Option<String>, f64, i64)> = sqlx::query_as(
        "SELECT expiry_date, allowed_storage_gb, storage_used_bytes FROM organizations WHERE org_id = ?",
    )
    .bind(org_id)
    .fetch_optional(pool)
    .await?;

    Ok(row
        .map(|(expiry_date, allowed_storage_gb, storage_used_bytes)| PlanInfo {
            expiry_date,
            allowed_storage_gb,
            storage_used_bytes,
        })
        .unwrap_or_default())
}

pub async fn add_storage_used(conn: &mut SqliteConnection, org_id: &str, bytes: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE organizations SET storage_used_bytes = storage_used_bytes + ? WHERE org_id = ?")
        .bind(bytes)
        .bind(org_id)
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn add_excluded_contact(pool: &SqlitePool, org_id: &str, phone: &str) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT OR IGNORE INTO excluded_contacts (org_id, phone) VALUES (?, ?)")
        .bind(org_id)
        .bind(phone)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_excluded_contacts(pool: &SqlitePool, org_id: &str) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar("SELECT phone FROM excluded_contacts WHERE org_id = ? ORDER BY phone")
        .bind(org_id)
        .fetch_all(pool)
        .await
}
