//! Server database access layer
//!
//! Tenancy: every table is keyed by `org_id` first and every query filters
//! on it. Timestamps (`created_at`, `updated_at`, `last_sync`) are epoch
//! milliseconds so delta queries compare integers.

use callsync_common::db::{get_schema_version, open_pool, set_schema_version};
use sqlx::SqlitePool;
use std::path::Path;
use tracing::info;

pub mod calls;
pub mod contacts;
pub mod employees;

const SCHEMA_VERSION: i64 = 1;

/// Open the server database and create tables if needed
pub async fn init_database(db_path: &Path) -> callsync_common::Result<SqlitePool> {
    let pool = open_pool(db_path, 10).await?;
    create_schema(&pool).await?;
    Ok(pool)
}

/// Idempotent schema creation
pub async fn create_schema(pool: &SqlitePool) -> callsync_common::Result<()> {
    create_organizations_table(pool).await?;
    create_employees_table(pool).await?;
    create_calls_table(pool).await?;
    create_contacts_table(pool).await?;
    create_excluded_contacts_table(pool).await?;

    if get_schema_version(pool).await? < SCHEMA_VERSION {
        set_schema_version(pool, SCHEMA_VERSION).await?;
        info!("Server schema at version {}", SCHEMA_VERSION);
    }
    Ok(())
}

async fn create_organizations_table(pool: &SqlitePool) -> callsync_common::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS organizations (
            org_id TEXT PRIMARY KEY,
            expiry_date TEXT,
            allowed_storage_gb REAL NOT NULL DEFAULT 1.0,
            storage_used_bytes INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_employees_table(pool: &SqlitePool) -> callsync_common::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS employees (
            org_id TEXT NOT NULL REFERENCES organizations(org_id),
            id INTEGER NOT NULL,
            name TEXT NOT NULL,
            device_id TEXT,
            device_model TEXT,
            last_sync INTEGER,
            call_track INTEGER NOT NULL DEFAULT 1,
            call_record_crm INTEGER NOT NULL DEFAULT 1,
            allow_personal_exclusion INTEGER NOT NULL DEFAULT 0,
            allow_changing_tracking_start_date INTEGER NOT NULL DEFAULT 0,
            allow_updating_tracking_sims INTEGER NOT NULL DEFAULT 0,
            default_tracking_starting_date TEXT,
            PRIMARY KEY (org_id, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One identity per device within an org
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_employees_device
        ON employees(org_id, device_id) WHERE device_id IS NOT NULL
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_calls_table(pool: &SqlitePool) -> callsync_common::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS calls (
            org_id TEXT NOT NULL,
            unique_id TEXT NOT NULL,
            employee_id INTEGER NOT NULL,
            device_id TEXT NOT NULL,
            caller_phone TEXT NOT NULL,
            caller_name TEXT,
            device_phone TEXT,
            call_type TEXT NOT NULL,
            duration INTEGER NOT NULL DEFAULT 0,
            call_time TEXT NOT NULL,
            note TEXT,
            labels TEXT,
            recording_url TEXT,
            upload_status TEXT NOT NULL DEFAULT 'pending',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (org_id, unique_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_calls_updated ON calls(org_id, updated_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_calls_phone ON calls(org_id, caller_phone)")
        .execute(pool)
        .await?;
    Ok(())
}

async fn create_contacts_table(pool: &SqlitePool) -> callsync_common::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS contacts (
            org_id TEXT NOT NULL,
            phone TEXT NOT NULL,
            name TEXT,
            notes TEXT,
            label TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (org_id, phone)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_contacts_updated ON contacts(org_id, updated_at)")
        .execute(pool)
        .await?;
    Ok(())
}

async fn create_excluded_contacts_table(pool: &SqlitePool) -> callsync_common::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS excluded_contacts (
            org_id TEXT NOT NULL,
            phone TEXT NOT NULL,
            PRIMARY KEY (org_id, phone)
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}
