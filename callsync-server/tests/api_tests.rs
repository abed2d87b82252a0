//! Integration tests for callsync-server API endpoints
//!
//! Each test runs the full router against a scratch root folder:
//! - pairing bind/confirm/conflict and the stale-device write check
//! - start_call upsert idempotence
//! - chunk upload, reassembly and finalize idempotence
//! - delta fetch after note/label updates

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use callsync_server::db::{self, employees};
use callsync_server::storage::RecordingStorage;
use callsync_server::{build_router, AppState};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tempfile::TempDir;
use tower::util::ServiceExt; // for `oneshot` method

struct TestServer {
    _dir: TempDir,
    root: std::path::PathBuf,
    pool: SqlitePool,
    app: Router,
}

/// Test helper: scratch server with employees ACME/7 and ACME/9
async fn setup() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let pool = db::init_database(&root.join("callsync-server.db")).await.unwrap();
    employees::upsert_employee(&pool, "ACME", 7, "Asha").await.unwrap();
    employees::upsert_employee(&pool, "ACME", 9, "Ravi").await.unwrap();

    let state = AppState::new(pool.clone(), RecordingStorage::new(&root), "http://files.test");
    TestServer {
        _dir: dir,
        root,
        pool,
        app: build_router(state),
    }
}

/// Test helper: Extract JSON body from response
async fn extract_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .expect("Should read body");
    serde_json::from_slice(&bytes).expect("Should parse JSON")
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    (status, extract_json(response.into_body()).await)
}

async fn post_chunk(app: &Router, device: &str, unique_id: &str, index: u32, bytes: Vec<u8>) -> Value {
    let uri = format!(
        "/api/upload_chunk?org_id=ACME&user_id=7&device_id={}&unique_id={}&chunk_index={}",
        device,
        urlencode(unique_id),
        index
    );
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/octet-stream")
        .body(Body::from(bytes))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    extract_json(response.into_body()).await
}

fn urlencode(value: &str) -> String {
    value.replace('+', "%2B")
}

async fn pair(app: &Router, user: i64, device: &str) -> Value {
    post_json(
        app,
        "/api/verify_pairing_code",
        json!({"org_id": "ACME", "user_id": user, "device_id": device}),
    )
    .await
    .1
}

fn call_body(unique_id: &str, device: &str, call_type: &str, duration: i64) -> Value {
    json!({
        "org_id": "ACME",
        "user_id": 7,
        "device_id": device,
        "unique_id": unique_id,
        "caller": "+919876543210",
        "caller_name": "Bob",
        "type": call_type,
        "duration": duration,
        "call_time": "2024-03-05 10:20:30"
    })
}

const CALL_ID: &str = "incoming-devA-+919876543210-1709634030000";

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let server = setup().await;
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = server.app.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "callsync-server");
    assert!(body["version"].is_string());
}

// =============================================================================
// Pairing
// =============================================================================

#[tokio::test]
async fn test_pairing_bound_confirmed_conflict() {
    let server = setup().await;

    let body = pair(&server.app, 7, "devA").await;
    assert_eq!(body["success"], true);
    assert_eq!(body["outcome"], "bound");
    assert_eq!(body["settings"]["call_track"], true);

    let body = pair(&server.app, 7, "devA").await;
    assert_eq!(body["outcome"], "confirmed");

    assert_eq!(pair(&server.app, 9, "devB").await["outcome"], "bound");

    let (status, body) = post_json(
        &server.app,
        "/api/verify_pairing_code",
        json!({"org_id": "ACME", "user_id": 7, "device_id": "devB"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "PAIRING_CONFLICT");

    let device: Option<String> = sqlx::query_scalar("SELECT device_id FROM employees WHERE org_id = 'ACME' AND id = 7")
        .fetch_one(&server.pool)
        .await
        .unwrap();
    assert_eq!(device.as_deref(), Some("devA"));
}

#[tokio::test]
async fn test_unknown_employee_is_bad_request() {
    let server = setup().await;
    let (status, body) = post_json(
        &server.app,
        "/api/verify_pairing_code",
        json!({"org_id": "ACME", "user_id": 404, "device_id": "devA"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_switched_device_rejects_old_device_writes() {
    let server = setup().await;
    pair(&server.app, 7, "devA").await;
    assert_eq!(pair(&server.app, 7, "devC").await["outcome"], "switched");

    let (status, body) = post_json(&server.app, "/api/start_call", call_body(CALL_ID, "devA", "incoming", 30)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "DEVICE_MISMATCH");

    let (_, body) = post_json(&server.app, "/api/start_call", call_body(CALL_ID, "devC", "incoming", 30)).await;
    assert_eq!(body["success"], true);
}

// =============================================================================
// Call upsert
// =============================================================================

#[tokio::test]
async fn test_start_call_is_idempotent() {
    let server = setup().await;
    pair(&server.app, 7, "devA").await;

    let mut first = call_body(CALL_ID, "devA", "incoming", 30);
    first["device_phone"] = json!("+911111111111");
    let (_, body) = post_json(&server.app, "/api/start_call", first).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["upload_status"], "pending");

    let mut second = call_body(CALL_ID, "devA", "incoming", 30);
    second["device_phone"] = json!("+912222222222");
    let (_, body) = post_json(&server.app, "/api/start_call", second).await;
    assert_eq!(body["success"], true);

    let rows: Vec<(String, Option<String>)> =
        sqlx::query_as("SELECT unique_id, device_phone FROM calls WHERE org_id = 'ACME'")
            .fetch_all(&server.pool)
            .await
            .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1.as_deref(), Some("+912222222222"));
}

#[tokio::test]
async fn test_missed_call_needs_no_recording() {
    let server = setup().await;
    pair(&server.app, 7, "devA").await;

    let (_, body) = post_json(
        &server.app,
        "/api/start_call",
        call_body("missed-devA-+919876543210-1", "devA", "missed", 0),
    )
    .await;
    assert_eq!(body["upload_status"], "completed");
}

#[tokio::test]
async fn test_batch_sync_skips_invalid_entries() {
    let server = setup().await;
    pair(&server.app, 7, "devA").await;

    let good = call_body("outgoing-devA-+15550001111-5", "devA", "outgoing", 12);
    let mut bad = call_body("outgoing-devA-+15550001111-6", "devA", "outgoing", 12);
    bad["call_time"] = json!("not a time");

    let (_, body) = post_json(
        &server.app,
        "/api/batch_sync_calls",
        json!({"org_id": "ACME", "user_id": 7, "device_id": "devA", "calls": [good, bad]}),
    )
    .await;
    assert_eq!(body["success"], true);
    assert_eq!(body["synced_ids"], json!(["outgoing-devA-+15550001111-5"]));
    assert_eq!(body["upload_statuses"]["outgoing-devA-+15550001111-5"], "pending");
    assert!(body["server_time"].as_i64().unwrap() > 0);
}

// =============================================================================
// Recording upload
// =============================================================================

#[tokio::test]
async fn test_chunk_reassembly_is_byte_identical() {
    let server = setup().await;
    pair(&server.app, 7, "devA").await;
    post_json(&server.app, "/api/start_call", call_body(CALL_ID, "devA", "incoming", 30)).await;

    let original: Vec<u8> = (0..(2 * 1024 * 1024 + 512 * 1024)).map(|i| (i % 251) as u8).collect();
    let chunks: Vec<&[u8]> = original.chunks(1024 * 1024).collect();
    assert_eq!(
        chunks.iter().map(|c| c.len()).collect::<Vec<_>>(),
        vec![1_048_576, 1_048_576, 524_288]
    );
    for (index, chunk) in chunks.iter().enumerate() {
        let body = post_chunk(&server.app, "devA", CALL_ID, index as u32, chunk.to_vec()).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["bytes"], chunk.len());
    }

    let (_, body) = post_json(
        &server.app,
        "/api/finalize_upload",
        json!({"org_id": "ACME", "user_id": 7, "device_id": "devA", "unique_id": CALL_ID, "total_chunks": 3}),
    )
    .await;
    assert_eq!(body["success"], true);
    let url = body["recording_url"].as_str().unwrap();
    assert_eq!(
        url,
        "http://files.test/public/ACME/7/2024_03/20240305/919876543210_20240305_102030_30.mp3"
    );

    let stored = std::fs::read(
        server
            .root
            .join("public/ACME/7/2024_03/20240305/919876543210_20240305_102030_30.mp3"),
    )
    .unwrap();
    assert_eq!(stored, original);
    assert!(!server.root.join("tmp_chunks/ACME").join(CALL_ID).exists());

    let (_, body) = post_json(
        &server.app,
        "/api/check_recordings_status",
        json!({"org_id": "ACME", "unique_ids": [CALL_ID, "unknown-id"]}),
    )
    .await;
    assert_eq!(body["completed_ids"], json!([CALL_ID]));

    let used: i64 = sqlx::query_scalar("SELECT storage_used_bytes FROM organizations WHERE org_id = 'ACME'")
        .fetch_one(&server.pool)
        .await
        .unwrap();
    assert_eq!(used, original.len() as i64);
}

#[tokio::test]
async fn test_finalize_twice_succeeds() {
    let server = setup().await;
    pair(&server.app, 7, "devA").await;
    post_json(&server.app, "/api/start_call", call_body(CALL_ID, "devA", "incoming", 30)).await;
    post_chunk(&server.app, "devA", CALL_ID, 0, vec![7u8; 1000]).await;

    let finalize = json!({"org_id": "ACME", "user_id": 7, "device_id": "devA", "unique_id": CALL_ID, "total_chunks": 1});
    let (_, first) = post_json(&server.app, "/api/finalize_upload", finalize.clone()).await;
    assert_eq!(first["success"], true);
    assert_eq!(first["already_completed"], false);

    let (_, second) = post_json(&server.app, "/api/finalize_upload", finalize).await;
    assert_eq!(second["success"], true);
    assert_eq!(second["already_completed"], true);
    assert_eq!(second["recording_url"], first["recording_url"]);

    // Late chunks for a completed call are acknowledged, not stored
    let body = post_chunk(&server.app, "devA", CALL_ID, 0, vec![1u8; 10]).await;
    assert_eq!(body["already_completed"], true);
}

#[tokio::test]
async fn test_racing_finalizes_never_error() {
    let server = setup().await;
    pair(&server.app, 7, "devA").await;
    post_json(&server.app, "/api/start_call", call_body(CALL_ID, "devA", "incoming", 30)).await;
    for index in 0..6u32 {
        post_chunk(&server.app, "devA", CALL_ID, index, vec![index as u8; 8192]).await;
    }

    let finalize = json!({"org_id": "ACME", "user_id": 7, "device_id": "devA", "unique_id": CALL_ID, "total_chunks": 6});
    let (first, second) = tokio::join!(
        post_json(&server.app, "/api/finalize_upload", finalize.clone()),
        post_json(&server.app, "/api/finalize_upload", finalize.clone()),
    );

    for (status, body) in [&first, &second] {
        assert_eq!(*status, StatusCode::OK, "{}", body);
        assert!(body["success"] == true || body["code"] == "CHUNK_MISSING", "{}", body);
    }
    assert!(first.1["success"] == true || second.1["success"] == true);

    // Whatever the loser saw, a retry settles as already completed
    let (_, retry) = post_json(&server.app, "/api/finalize_upload", finalize).await;
    assert_eq!(retry["success"], true);
    assert_eq!(retry["already_completed"], true);
}

#[tokio::test]
async fn test_finalize_with_missing_chunk_then_full_resend() {
    let server = setup().await;
    pair(&server.app, 7, "devA").await;
    post_json(&server.app, "/api/start_call", call_body(CALL_ID, "devA", "incoming", 30)).await;
    post_chunk(&server.app, "devA", CALL_ID, 0, vec![1u8; 100]).await;
    post_chunk(&server.app, "devA", CALL_ID, 2, vec![3u8; 100]).await;

    let finalize = json!({"org_id": "ACME", "user_id": 7, "device_id": "devA", "unique_id": CALL_ID, "total_chunks": 3});
    let (status, body) = post_json(&server.app, "/api/finalize_upload", finalize.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "CHUNK_MISSING");
    assert_eq!(body["error"], "Missing chunk 1");

    for (index, byte) in [1u8, 2, 3].iter().enumerate() {
        post_chunk(&server.app, "devA", CALL_ID, index as u32, vec![*byte; 100]).await;
    }
    let (_, body) = post_json(&server.app, "/api/finalize_upload", finalize).await;
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn test_chunk_for_unknown_call() {
    let server = setup().await;
    pair(&server.app, 7, "devA").await;
    let body = post_chunk(&server.app, "devA", "ghost-call", 0, vec![0u8; 10]).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "CALL_NOT_FOUND");
}

// =============================================================================
// Notes and delta fetch
// =============================================================================

#[tokio::test]
async fn test_update_note_and_fetch_updates() {
    let server = setup().await;
    pair(&server.app, 7, "devA").await;
    post_json(&server.app, "/api/start_call", call_body(CALL_ID, "devA", "incoming", 30)).await;
    post_json(
        &server.app,
        "/api/start_call",
        call_body("outgoing-devA-+919876543210-2", "devA", "outgoing", 5),
    )
    .await;

    let (_, body) = post_json(&server.app, "/api/fetch_updates", json!({"org_id": "ACME", "last_sync_time": 0})).await;
    let cursor = body["server_time"].as_i64().unwrap();
    assert_eq!(body["person_updates"][0]["name"], "Bob");

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let (_, body) = post_json(
        &server.app,
        "/api/update_note",
        json!({
            "org_id": "ACME", "user_id": 7, "device_id": "devA",
            "unique_id": CALL_ID, "note": "call back", "person_note": "prefers mornings", "label": "VIP"
        }),
    )
    .await;
    assert_eq!(body["success"], true);

    let (_, body) = post_json(
        &server.app,
        "/api/get_updates",
        json!({"org_id": "ACME", "last_sync_time": cursor}),
    )
    .await;
    let call_updates = body["call_updates"].as_array().unwrap();
    assert_eq!(call_updates.len(), 2, "label mirrored onto both calls");
    let noted = call_updates.iter().find(|c| c["unique_id"] == CALL_ID).unwrap();
    assert_eq!(noted["note"], "call back");

    let person = &body["person_updates"][0];
    assert_eq!(person["phone"], "+919876543210");
    assert_eq!(person["label"], "VIP");
    assert_eq!(person["person_note"], "prefers mornings");

    let labels: Vec<Option<String>> = sqlx::query_scalar("SELECT labels FROM calls WHERE org_id = 'ACME'")
        .fetch_all(&server.pool)
        .await
        .unwrap();
    assert!(labels.iter().all(|l| l.as_deref() == Some("VIP")));

    let (_, body) = post_json(
        &server.app,
        "/api/fetch_updates",
        json!({"org_id": "OTHER", "last_sync_time": 0}),
    )
    .await;
    assert!(body["call_updates"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_update_note_unknown_call() {
    let server = setup().await;
    pair(&server.app, 7, "devA").await;
    let (_, body) = post_json(
        &server.app,
        "/api/update_note",
        json!({"org_id": "ACME", "user_id": 7, "device_id": "devA", "unique_id": "nope", "note": "x"}),
    )
    .await;
    assert_eq!(body["code"], "CALL_NOT_FOUND");
}

#[tokio::test]
async fn test_fetch_config_returns_exclusions_and_checks_device() {
    let server = setup().await;
    pair(&server.app, 7, "devA").await;
    employees::add_excluded_contact(&server.pool, "ACME", "+15550009999").await.unwrap();
    let policy = callsync_common::api::EmployeeSettings {
        call_record_crm: false,
        default_tracking_starting_date: Some("2024-03-01".to_string()),
        ..Default::default()
    };
    employees::update_settings(&server.pool, "ACME", 7, &policy).await.unwrap();

    let (_, body) = post_json(
        &server.app,
        "/api/fetch_config",
        json!({"org_id": "ACME", "user_id": 7, "device_id": "devA"}),
    )
    .await;
    assert_eq!(body["success"], true);
    assert_eq!(body["excluded_contacts"], json!(["+15550009999"]));
    assert_eq!(body["settings"]["call_record_crm"], false);
    assert_eq!(body["settings"]["call_track"], true);
    assert_eq!(body["settings"]["default_tracking_starting_date"], "2024-03-01");

    let (_, body) = post_json(
        &server.app,
        "/api/fetch_config",
        json!({"org_id": "ACME", "user_id": 7, "device_id": "devZ"}),
    )
    .await;
    assert_eq!(body["code"], "DEVICE_MISMATCH");
}
