//! Device pairing gate
//!
//! An employee `(org_id, id)` is bound to at most one device, and a device to
//! at most one employee per org (backed by the `idx_employees_device` unique
//! index). Every write endpoint calls [`require_binding`] before touching a
//! call row.

use callsync_common::api::{Credentials, PairingOutcome};
use callsync_common::time::now_millis;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{info, warn};

use crate::db::employees::{self, Employee};
use crate::error::{ApiError, ApiResult};

/// Bind, confirm or switch the device of an identity.
///
/// A device already bound to a different employee of the same org yields
/// `Conflict` and leaves every binding unchanged. Unknown employees are a
/// validation error.
pub async fn verify(pool: &SqlitePool, creds: &Credentials, device_model: Option<&str>) -> ApiResult<(PairingOutcome, Employee)> {
    validate_credentials(creds)?;

    let mut tx = pool.begin().await?;
    let employee = employees::get_employee(&mut tx, &creds.org_id, creds.user_id)
        .await?
        .ok_or_else(|| ApiError::Validation(format!("Unknown employee {}/{}", creds.org_id, creds.user_id)))?;

    if employee.device_id.as_deref() == Some(creds.device_id.as_str()) {
        employees::bind_device(&mut tx, &creds.org_id, creds.user_id, &creds.device_id, device_model, now_millis())
            .await?;
        tx.commit().await?;
        return Ok((PairingOutcome::Confirmed, employee));
    }

    if let Some(owner) = employees::find_by_device(&mut tx, &creds.org_id, &creds.device_id, creds.user_id).await? {
        warn!(
            org_id = %creds.org_id,
            user_id = creds.user_id,
            device_id = %creds.device_id,
            owner,
            "Pairing rejected: device belongs to another employee"
        );
        tx.rollback().await?;
        return Ok((PairingOutcome::Conflict, employee));
    }

    let outcome = if employee.device_id.is_some() {
        PairingOutcome::Switched
    } else {
        PairingOutcome::Bound
    };

    let bound = employees::bind_device(&mut tx, &creds.org_id, creds.user_id, &creds.device_id, device_model, now_millis())
        .await;
    match bound {
        Ok(()) => {}
        // Lost a race with a concurrent pairing of the same device
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            tx.rollback().await?;
            return Ok((PairingOutcome::Conflict, employee));
        }
        Err(e) => return Err(e.into()),
    }
    tx.commit().await?;

    info!(
        org_id = %creds.org_id,
        user_id = creds.user_id,
        device_id = %creds.device_id,
        previous = ?employee.device_id,
        ?outcome,
        "Device paired"
    );

    let mut employee = employee;
    employee.device_id = Some(creds.device_id.clone());
    Ok((outcome, employee))
}

/// Reject writes from any device other than the currently bound one
pub async fn require_binding(conn: &mut SqliteConnection, creds: &Credentials) -> ApiResult<Employee> {
    validate_credentials(creds)?;

    let employee = employees::get_employee(conn, &creds.org_id, creds.user_id)
        .await?
        .ok_or_else(|| ApiError::Validation(format!("Unknown employee {}/{}", creds.org_id, creds.user_id)))?;

    if employee.device_id.as_deref() != Some(creds.device_id.as_str()) {
        return Err(ApiError::DeviceMismatch(format!(
            "device {} is not the active device of employee {}",
            creds.device_id, creds.user_id
        )));
    }
    Ok(employee)
}

fn validate_credentials(creds: &Credentials) -> ApiResult<()> {
    if creds.org_id.trim().is_empty() {
        return Err(ApiError::Validation("org_id is required".to_string()));
    }
    if creds.device_id.trim().is_empty() {
        return Err(ApiError::Validation("device_id is required".to_string()));
    }
    Ok(())
}
