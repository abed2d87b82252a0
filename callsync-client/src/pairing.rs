//! Device pairing
//!
//! The server decides whether this device may act as the employee. On
//! success the identity and the employee's settings are stored locally so
//! the workers can start.

use callsync_common::api::{PairingOutcome, VerifyPairingRequest};
use tracing::{info, warn};

use crate::api_client::SyncApi;
use crate::error::{Result, SyncError};
use crate::store::{LocalCallStore, PairingIdentity};

/// Pair `device_id` as employee `user_id` of `org_id`.
///
/// `Conflict` is returned as [`SyncError::PairingConflict`] and leaves the
/// stored identity untouched.
pub async fn pair_device(
    api: &dyn SyncApi,
    store: &LocalCallStore,
    org_id: &str,
    user_id: i64,
    device_id: &str,
    device_model: Option<&str>,
) -> Result<PairingOutcome> {
    let org_id = org_id.trim();
    let device_id = device_id.trim();
    if org_id.is_empty() || device_id.is_empty() {
        return Err(SyncError::Validation("org_id and device_id are required".to_string()));
    }

    let identity = PairingIdentity {
        org_id: org_id.to_string(),
        user_id,
        device_id: device_id.to_string(),
    };
    let response = api
        .verify_pairing(&VerifyPairingRequest {
            credentials: identity.credentials(),
            device_model: device_model.map(str::to_string),
        })
        .await?;

    if response.outcome == PairingOutcome::Conflict {
        warn!(org_id, user_id, "Pairing refused: employee is bound to another device");
        return Err(SyncError::PairingConflict(format!(
            "Employee {} of {} is paired with another device",
            user_id, org_id
        )));
    }

    store.set_pairing_identity(&identity).await?;
    store.apply_employee_settings(&response.settings).await?;
    info!(
        org_id,
        user_id,
        employee = %response.employee_name,
        outcome = ?response.outcome,
        "Device paired"
    );
    Ok(response.outcome)
}
