//! Pairing and configuration endpoints

use axum::{extract::State, Json};
use callsync_common::api::{
    Envelope, FetchConfigRequest, FetchConfigResponse, PairingOutcome, VerifyPairingRequest, VerifyPairingResponse,
};
use callsync_common::time::now_millis;

use crate::db::employees;
use crate::error::{ApiError, ApiResult};
use crate::pairing;
use crate::AppState;

/// POST /api/verify_pairing_code
///
/// Binds the calling device to the employee and returns the employee's
/// tracking policy. A device owned by another employee is refused with
/// `PAIRING_CONFLICT`.
pub async fn verify_pairing_code(
    State(state): State<AppState>,
    Json(req): Json<VerifyPairingRequest>,
) -> ApiResult<Json<Envelope<VerifyPairingResponse>>> {
    let (outcome, employee) = pairing::verify(&state.db, &req.credentials, req.device_model.as_deref()).await?;

    if outcome == PairingOutcome::Conflict {
        return Err(ApiError::PairingConflict(format!(
            "device {} is linked to another employee of {}",
            req.credentials.device_id, req.credentials.org_id
        )));
    }

    let plan = employees::get_plan(&state.db, &req.credentials.org_id).await?;
    let message = match outcome {
        PairingOutcome::Confirmed => "Device already paired",
        PairingOutcome::Switched => "Device switched; previous device logged out",
        _ => "Device paired",
    };

    Ok(Json(Envelope::ok(
        message,
        VerifyPairingResponse {
            outcome,
            employee_name: employee.name.clone(),
            settings: employee.settings(),
            plan,
        },
    )))
}

/// POST /api/fetch_config
///
/// Excluded numbers and tracking policy. Also records a heartbeat when the
/// caller is the bound device; a stale device gets `DEVICE_MISMATCH`.
pub async fn fetch_config(
    State(state): State<AppState>,
    Json(req): Json<FetchConfigRequest>,
) -> ApiResult<Json<Envelope<FetchConfigResponse>>> {
    let employee = {
        let mut conn = state.db.acquire().await?;
        employees::get_employee(&mut conn, &req.org_id, req.user_id)
            .await?
            .ok_or_else(|| ApiError::Validation(format!("Unknown employee {}/{}", req.org_id, req.user_id)))?
    };

    if let Some(device_id) = req.device_id.as_deref() {
        if employee.device_id.as_deref() != Some(device_id) {
            return Err(ApiError::DeviceMismatch(format!(
                "device {} is not the active device of employee {}",
                device_id, req.user_id
            )));
        }
        employees::touch_last_sync(&state.db, &req.org_id, req.user_id, now_millis()).await?;
    }

    let excluded_contacts = employees::list_excluded_contacts(&state.db, &req.org_id).await?;
    let plan = employees::get_plan(&state.db, &req.org_id).await?;

    Ok(Json(Envelope::ok(
        "Config loaded",
        FetchConfigResponse {
            excluded_contacts,
            settings: employee.settings(),
            plan,
        },
    )))
}
