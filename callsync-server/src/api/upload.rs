//! Chunked recording upload endpoints

use axum::{
    body::Bytes,
    extract::{Query, State},
    Json,
};
use callsync_common::api::{
    CheckRecordingsRequest, CheckRecordingsResponse, Envelope, FinalizeUploadRequest, FinalizeUploadResponse,
    UploadChunkQuery, UploadChunkResponse, UploadStatus, CHUNK_SIZE,
};
use callsync_common::time::{now, now_millis, parse_call_time};
use std::path::Path;
use tracing::{info, warn};

use crate::db::{calls, employees};
use crate::error::{ApiError, ApiResult};
use crate::pairing::require_binding;
use crate::storage::recording_relative_path;
use crate::AppState;

/// POST /api/upload_chunk?org_id=..&user_id=..&device_id=..&unique_id=..&chunk_index=..
///
/// Body is the raw chunk. Re-sending an index replaces the stored chunk.
pub async fn upload_chunk(
    State(state): State<AppState>,
    Query(query): Query<UploadChunkQuery>,
    body: Bytes,
) -> ApiResult<Json<Envelope<UploadChunkResponse>>> {
    if body.is_empty() {
        return Err(ApiError::Validation("empty chunk".to_string()));
    }
    if body.len() > CHUNK_SIZE {
        return Err(ApiError::Validation(format!(
            "chunk of {} bytes exceeds {} bytes",
            body.len(),
            CHUNK_SIZE
        )));
    }

    let call = {
        let mut conn = state.db.acquire().await?;
        require_binding(&mut conn, &query.credentials()).await?;
        calls::get_call(&mut conn, &query.org_id, &query.unique_id)
            .await?
            .ok_or_else(|| ApiError::CallNotFound(query.unique_id.clone()))?
    };

    if call.upload_status() == UploadStatus::Completed {
        return Ok(Json(Envelope::ok(
            "Recording already uploaded",
            UploadChunkResponse {
                unique_id: query.unique_id,
                chunk_index: query.chunk_index,
                bytes: 0,
                already_completed: true,
            },
        )));
    }

    let bytes = state
        .storage
        .store_chunk(&query.org_id, &query.unique_id, query.chunk_index, &body)
        .await?;

    Ok(Json(Envelope::ok(
        "Chunk stored",
        UploadChunkResponse {
            unique_id: query.unique_id,
            chunk_index: query.chunk_index,
            bytes,
            already_completed: false,
        },
    )))
}

/// POST /api/finalize_upload
///
/// Assembles chunks `0..total_chunks`, marks the call completed and returns
/// the public URL. Finalizing an already-completed call succeeds without
/// touching storage.
pub async fn finalize_upload(
    State(state): State<AppState>,
    Json(req): Json<FinalizeUploadRequest>,
) -> ApiResult<Json<Envelope<FinalizeUploadResponse>>> {
    let org_id = req.credentials.org_id.as_str();

    let (employee, call) = {
        let mut conn = state.db.acquire().await?;
        let employee = require_binding(&mut conn, &req.credentials).await?;
        let call = calls::get_call(&mut conn, org_id, &req.unique_id)
            .await?
            .ok_or_else(|| ApiError::CallNotFound(req.unique_id.clone()))?;
        (employee, call)
    };

    if call.upload_status() == UploadStatus::Completed {
        return Ok(Json(already_completed(req.unique_id, call.recording_url)));
    }

    let call_time = parse_call_time(&call.call_time).unwrap_or_else(now);
    let relative = recording_relative_path(
        org_id,
        employee.id,
        &call.caller_phone,
        call_time,
        call.duration,
        req.extension.as_deref().unwrap_or("mp3"),
    )?;

    let written = match state
        .storage
        .assemble(org_id, &req.unique_id, req.total_chunks, &relative)
        .await
    {
        Ok(written) => written,
        Err(ApiError::ChunkMissing(index)) => {
            // A concurrent finalize may have consumed the chunks already
            let mut conn = state.db.acquire().await?;
            if let Some(current) = calls::get_call(&mut conn, org_id, &req.unique_id).await? {
                if current.upload_status() == UploadStatus::Completed {
                    return Ok(Json(already_completed(req.unique_id, current.recording_url)));
                }
            }
            warn!(unique_id = %req.unique_id, index, total = req.total_chunks, "Finalize failed: chunk missing");
            return Err(ApiError::ChunkMissing(index));
        }
        Err(e) => return Err(e),
    };

    let recording_url = format!("{}/public/{}", state.base_url, url_path(&relative));

    let mut tx = state.db.begin().await?;
    calls::mark_recording_completed(&mut tx, org_id, &req.unique_id, &recording_url, now_millis()).await?;
    employees::add_storage_used(&mut tx, org_id, i64::try_from(written).unwrap_or(i64::MAX)).await?;
    tx.commit().await?;

    info!(unique_id = %req.unique_id, bytes = written, url = %recording_url, "Recording finalized");

    Ok(Json(Envelope::ok(
        "Upload finalized",
        FinalizeUploadResponse {
            unique_id: req.unique_id,
            recording_url: Some(recording_url),
            already_completed: false,
        },
    )))
}

/// POST /api/check_recordings_status
///
/// Which of the given calls already have their recording stored.
pub async fn check_recordings_status(
    State(state): State<AppState>,
    Json(req): Json<CheckRecordingsRequest>,
) -> ApiResult<Json<Envelope<CheckRecordingsResponse>>> {
    if req.org_id.trim().is_empty() {
        return Err(ApiError::Validation("org_id is required".to_string()));
    }
    let completed_ids = calls::completed_among(&state.db, &req.org_id, &req.unique_ids).await?;
    Ok(Json(Envelope::ok(
        format!("{} of {} completed", completed_ids.len(), req.unique_ids.len()),
        CheckRecordingsResponse { completed_ids },
    )))
}

fn already_completed(unique_id: String, recording_url: Option<String>) -> Envelope<FinalizeUploadResponse> {
    Envelope::ok(
        "Recording already uploaded",
        FinalizeUploadResponse {
            unique_id,
            recording_url,
            already_completed: true,
        },
    )
}

/// Relative path joined with `/` regardless of platform
fn url_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
