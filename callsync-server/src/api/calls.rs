//! Call metadata endpoints: upsert, batch upsert, delta fetch, notes

use axum::{extract::State, Json};
use callsync_common::api::{
    BatchSyncRequest, BatchSyncResponse, CallPayload, Envelope, FetchUpdatesRequest, FetchUpdatesResponse,
    StartCallRequest, StartCallResponse, UpdateNoteRequest, UpdateNoteResponse, MAX_BATCH_CALLS,
};
use callsync_common::time::{format_call_time, now_millis, parse_call_time};
use sqlx::SqliteConnection;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::db::{calls, contacts};
use crate::error::{ApiError, ApiResult};
use crate::pairing::require_binding;
use crate::AppState;

/// Validate one pushed call and return its normalised `call_time`
fn validate_call(call: &CallPayload) -> ApiResult<String> {
    if call.unique_id.trim().is_empty() {
        return Err(ApiError::Validation("unique_id is required".to_string()));
    }
    if call.duration < 0 {
        return Err(ApiError::Validation(format!("negative duration for {}", call.unique_id)));
    }
    let time = parse_call_time(&call.call_time)
        .ok_or_else(|| ApiError::Validation(format!("invalid call_time '{}'", call.call_time)))?;
    Ok(format_call_time(time))
}

/// Upsert the call and its contact row inside the caller's transaction
async fn store_call(
    conn: &mut SqliteConnection,
    org_id: &str,
    employee_id: i64,
    device_id: &str,
    call: &CallPayload,
    call_time: &str,
    now_ms: i64,
) -> ApiResult<(callsync_common::api::UploadStatus, Option<String>)> {
    let stored = calls::upsert_call(&mut *conn, org_id, employee_id, device_id, call, call_time, now_ms).await?;
    if !call.caller.is_empty() {
        contacts::touch_contact(&mut *conn, org_id, &call.caller, call.caller_name.as_deref(), now_ms).await?;
    }
    Ok(stored)
}

/// POST /api/start_call
///
/// Idempotent upsert keyed by `unique_id`; returns the stored upload status
/// so the device can skip recordings the server does not need.
pub async fn start_call(
    State(state): State<AppState>,
    Json(req): Json<StartCallRequest>,
) -> ApiResult<Json<Envelope<StartCallResponse>>> {
    let call_time = validate_call(&req.call)?;

    let mut tx = state.db.begin().await?;
    let employee = require_binding(&mut tx, &req.credentials).await?;
    let (upload_status, recording_url) = store_call(
        &mut tx,
        &req.credentials.org_id,
        employee.id,
        &req.credentials.device_id,
        &req.call,
        &call_time,
        now_millis(),
    )
    .await?;
    tx.commit().await?;

    debug!(unique_id = %req.call.unique_id, ?upload_status, "Call stored");

    Ok(Json(Envelope::ok(
        "Call synced",
        StartCallResponse {
            unique_id: req.call.unique_id,
            upload_status,
            recording_url,
        },
    )))
}

/// POST /api/batch_sync_calls
///
/// Same upsert as `start_call` for up to 100 calls in one transaction.
/// Invalid entries are skipped and left out of `synced_ids`.
pub async fn batch_sync_calls(
    State(state): State<AppState>,
    Json(req): Json<BatchSyncRequest>,
) -> ApiResult<Json<Envelope<BatchSyncResponse>>> {
    if req.calls.len() > MAX_BATCH_CALLS {
        return Err(ApiError::Validation(format!(
            "batch of {} calls exceeds limit of {}",
            req.calls.len(),
            MAX_BATCH_CALLS
        )));
    }

    let now_ms = now_millis();
    let mut tx = state.db.begin().await?;
    let employee = require_binding(&mut tx, &req.credentials).await?;

    let mut synced_ids = Vec::with_capacity(req.calls.len());
    let mut upload_statuses = HashMap::with_capacity(req.calls.len());
    for call in &req.calls {
        let call_time = match validate_call(call) {
            Ok(t) => t,
            Err(e) => {
                warn!(unique_id = %call.unique_id, "Skipping call in batch: {}", e);
                continue;
            }
        };
        let (status, _) = store_call(
            &mut tx,
            &req.credentials.org_id,
            employee.id,
            &req.credentials.device_id,
            call,
            &call_time,
            now_ms,
        )
        .await?;
        synced_ids.push(call.unique_id.clone());
        upload_statuses.insert(call.unique_id.clone(), status);
    }
    tx.commit().await?;

    info!(
        org_id = %req.credentials.org_id,
        user_id = req.credentials.user_id,
        synced = synced_ids.len(),
        skipped = req.calls.len() - synced_ids.len(),
        "Batch synced"
    );

    Ok(Json(Envelope::ok(
        format!("{} calls synced", synced_ids.len()),
        BatchSyncResponse {
            synced_ids,
            upload_statuses,
            server_time: now_ms,
        },
    )))
}

/// POST /api/fetch_updates (alias /api/get_updates)
///
/// Calls and contacts of the org changed after `last_sync_time`.
pub async fn fetch_updates(
    State(state): State<AppState>,
    Json(req): Json<FetchUpdatesRequest>,
) -> ApiResult<Json<Envelope<FetchUpdatesResponse>>> {
    if req.org_id.trim().is_empty() {
        return Err(ApiError::Validation("org_id is required".to_string()));
    }

    // Rows stamped in the same millisecond as this query are returned again
    // next time rather than risk missing a concurrent write.
    let server_time = now_millis() - 1;

    let call_updates = calls::calls_updated_since(&state.db, &req.org_id, req.last_sync_time).await?;
    let person_updates = contacts::contacts_updated_since(&state.db, &req.org_id, req.last_sync_time).await?;

    Ok(Json(Envelope::ok(
        "Updates fetched",
        FetchUpdatesResponse {
            call_updates,
            person_updates,
            server_time,
        },
    )))
}

/// POST /api/update_note
///
/// Call note plus contact note/label of the call's number, in one
/// transaction. A label change is mirrored onto every call of that number.
pub async fn update_note(
    State(state): State<AppState>,
    Json(req): Json<UpdateNoteRequest>,
) -> ApiResult<Json<Envelope<UpdateNoteResponse>>> {
    let now_ms = now_millis();
    let org_id = req.credentials.org_id.as_str();

    let mut tx = state.db.begin().await?;
    require_binding(&mut tx, &req.credentials).await?;

    let call = calls::get_call(&mut tx, org_id, &req.unique_id)
        .await?
        .ok_or_else(|| ApiError::CallNotFound(req.unique_id.clone()))?;

    if let Some(note) = req.note.as_deref() {
        let note = Some(note).filter(|n| !n.is_empty());
        calls::set_call_note(&mut tx, org_id, &req.unique_id, note, now_ms).await?;
    }

    if req.person_note.is_some() || req.label.is_some() {
        contacts::update_note_and_label(
            &mut tx,
            org_id,
            &call.caller_phone,
            req.person_note.as_deref(),
            req.label.as_deref(),
            now_ms,
        )
        .await?;
    }
    if let Some(label) = req.label.as_deref() {
        let label = Some(label).filter(|l| !l.is_empty());
        calls::set_labels_for_phone(&mut tx, org_id, &call.caller_phone, label, now_ms).await?;
    }
    tx.commit().await?;

    debug!(unique_id = %req.unique_id, "Note updated");

    Ok(Json(Envelope::ok(
        "Note updated",
        UpdateNoteResponse {
            unique_id: req.unique_id,
        },
    )))
}
