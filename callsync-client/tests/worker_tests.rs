//! Metadata and recording worker behaviour against a scripted server

mod support;

use callsync_client::clock::ManualClock;
use callsync_client::error::SyncError;
use callsync_client::locator::RecordingLocator;
use callsync_client::workers::{MetadataSyncWorker, RecordingUploadWorker, GRACE_PERIOD};
use callsync_client::{LocalCallStore, RunMode};
use callsync_common::api::{CallUpdate, EmployeeSettings, CHUNK_SIZE};
use callsync_common::{CallType, RecordingEvent, RecordingSyncStatus, SyncStatus};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use support::{call, paired_store, FakeApi};
use tokio_util::sync::CancellationToken;

const CALL_START: i64 = 1_700_000_000_000;
const CALL_SECS: i64 = 120;
const CALL_END: i64 = CALL_START + CALL_SECS * 1000;

async fn synced_call(store: &LocalCallStore, id: &str, phone: &str) {
    store
        .insert_new_calls(&[call(id, phone, CallType::Incoming, CALL_START, CALL_SECS)])
        .await
        .unwrap();
    store.mark_metadata_synced(&[id.to_string()]).await.unwrap();
}

fn write_recording(dir: &Path, name: &str, len: usize) -> String {
    let path = dir.join(name);
    let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, bytes).unwrap();
    path.to_string_lossy().into_owned()
}

fn recording_worker(
    store: &LocalCallStore,
    api: &Arc<FakeApi>,
    clock: &Arc<ManualClock>,
    locator: Option<RecordingLocator>,
) -> RecordingUploadWorker {
    RecordingUploadWorker::new(store.clone(), api.clone(), clock.clone(), locator, 10)
}

async fn recording_status(store: &LocalCallStore, id: &str) -> RecordingSyncStatus {
    store.recording_status(id).await.unwrap().unwrap()
}

// ============================================================================
// Metadata Sync Worker
// ============================================================================

#[tokio::test]
async fn test_metadata_pushes_pending_calls_and_advances_cursor() {
    let (_dir, store) = paired_store().await;
    let api = Arc::new(FakeApi::new());
    api.with(|s| s.server_time = 5_000);
    store
        .insert_new_calls(&[
            call("a", "+15550001111", CallType::Incoming, CALL_START, 30),
            call("b", "+15550002222", CallType::Outgoing, CALL_START + 1, 45),
            call("c", "+15550003333", CallType::Missed, CALL_START + 2, 0),
        ])
        .await
        .unwrap();

    let worker = MetadataSyncWorker::new(store.clone(), api.clone());
    let report = worker.run(RunMode::Scheduled).await.unwrap();

    assert_eq!(report.pushed_calls, 3);
    assert!(!report.more_remaining);
    assert_eq!(store.last_sync_time().await.unwrap(), 5_000);
    for id in ["a", "b", "c"] {
        assert_eq!(store.get_call(id).await.unwrap().unwrap().sync_status, SyncStatus::Completed);
    }

    // Nothing left to push on the next run
    let report = worker.run(RunMode::Scheduled).await.unwrap();
    assert_eq!(report.pushed_calls, 0);
    assert_eq!(api.with(|s| s.pushed.len()), 3);
    assert_eq!(api.with(|s| s.start_calls), 0);
}

#[tokio::test]
async fn test_excluded_numbers_are_settled_without_push() {
    let (_dir, store) = paired_store().await;
    let api = Arc::new(FakeApi::new());
    api.with(|s| s.excluded = vec!["+1 555 000 2222".to_string()]);
    store
        .insert_new_calls(&[
            call("kept", "+15550001111", CallType::Incoming, CALL_START, 30),
            call("private", "+15550002222", CallType::Incoming, CALL_START + 1, 30),
        ])
        .await
        .unwrap();

    let report = MetadataSyncWorker::new(store.clone(), api.clone())
        .run(RunMode::Scheduled)
        .await
        .unwrap();

    assert_eq!(report.pushed_calls, 1);
    assert_eq!(report.excluded_calls, 1);
    let pushed: Vec<String> = api.with(|s| s.pushed.iter().map(|c| c.unique_id.clone()).collect());
    assert_eq!(pushed, vec!["kept".to_string()]);

    let private = store.get_call("private").await.unwrap().unwrap();
    assert_eq!(private.sync_status, SyncStatus::Completed);
    assert_eq!(private.recording_status, RecordingSyncStatus::NotApplicable);
}

#[tokio::test]
async fn test_rejected_calls_wait_for_manual_retry() {
    let (_dir, store) = paired_store().await;
    let api = Arc::new(FakeApi::new());
    api.with(|s| {
        s.reject_ids.insert("bad".to_string());
    });
    store
        .insert_new_calls(&[
            call("good", "+15550001111", CallType::Incoming, CALL_START, 30),
            call("bad", "+15550002222", CallType::Incoming, CALL_START + 1, 30),
        ])
        .await
        .unwrap();
    let worker = MetadataSyncWorker::new(store.clone(), api.clone());

    let report = worker.run(RunMode::Scheduled).await.unwrap();
    assert_eq!(report.pushed_calls, 1);
    assert_eq!(report.rejected_calls, 1);
    assert_eq!(store.get_call("bad").await.unwrap().unwrap().sync_status, SyncStatus::Failed);

    api.with(|s| s.reject_ids.clear());
    let report = worker.run(RunMode::Scheduled).await.unwrap();
    assert_eq!(report.pushed_calls, 0);

    let report = worker.run(RunMode::Manual).await.unwrap();
    assert_eq!(report.pushed_calls, 1);
    assert_eq!(store.get_call("bad").await.unwrap().unwrap().sync_status, SyncStatus::Completed);
}

#[tokio::test]
async fn test_offline_run_leaves_calls_pending() {
    let (_dir, store) = paired_store().await;
    let api = Arc::new(FakeApi::new());
    api.with(|s| s.offline = true);
    store
        .insert_new_calls(&[call("a", "+15550001111", CallType::Incoming, CALL_START, 30)])
        .await
        .unwrap();

    let err = MetadataSyncWorker::new(store.clone(), api.clone())
        .run(RunMode::Scheduled)
        .await
        .unwrap_err();

    assert!(err.is_transient());
    assert_eq!(store.get_call("a").await.unwrap().unwrap().sync_status, SyncStatus::Pending);
    assert_eq!(store.last_sync_time().await.unwrap(), 0);
}

#[tokio::test]
async fn test_pending_local_note_survives_remote_update() {
    let (_dir, store) = paired_store().await;
    let api = Arc::new(FakeApi::new());
    api.with(|s| s.server_time = 100);
    store
        .insert_new_calls(&[call("a", "+15550001111", CallType::Incoming, CALL_START, 30)])
        .await
        .unwrap();
    let worker = MetadataSyncWorker::new(store.clone(), api.clone());
    worker.run(RunMode::Scheduled).await.unwrap();

    store.update_call_note("a", Some("call back after 5")).await.unwrap();
    api.with(|s| {
        s.server_time = 300;
        s.call_updates.push(CallUpdate {
            unique_id: "a".to_string(),
            note: Some("edited in CRM".to_string()),
            caller_name: Some("Ravi".to_string()),
            updated_at: 200,
        });
    });

    let report = worker.run(RunMode::Scheduled).await.unwrap();
    assert_eq!(report.pushed_notes, 1);

    let stored = store.get_call("a").await.unwrap().unwrap();
    assert_eq!(stored.note.as_deref(), Some("call back after 5"));
    assert!(!stored.note_needs_sync);
    let sent = api.with(|s| s.notes.clone());
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].note.as_deref(), Some("call back after 5"));
}

#[tokio::test]
async fn test_tracking_disabled_skips_push_but_keeps_config() {
    let (_dir, store) = paired_store().await;
    let api = Arc::new(FakeApi::new());
    api.with(|s| {
        s.settings = EmployeeSettings {
            call_track: false,
            ..EmployeeSettings::default()
        };
        s.excluded = vec!["+15559990000".to_string()];
    });
    store
        .insert_new_calls(&[call("a", "+15550001111", CallType::Incoming, CALL_START, 30)])
        .await
        .unwrap();

    let report = MetadataSyncWorker::new(store.clone(), api.clone())
        .run(RunMode::Scheduled)
        .await
        .unwrap();

    assert!(report.tracking_disabled);
    assert_eq!(report.pushed_calls, 0);
    assert!(store.excluded_numbers().await.unwrap().contains("+15559990000"));
    assert!(!store.call_track_enabled().await.unwrap());
}

#[tokio::test]
async fn test_server_completed_status_settles_recording() {
    let (_dir, store) = paired_store().await;
    let api = Arc::new(FakeApi::new());
    api.with(|s| {
        s.completed.insert("a".to_string());
    });
    store
        .insert_new_calls(&[call("a", "+15550001111", CallType::Incoming, CALL_START, 30)])
        .await
        .unwrap();

    let report = MetadataSyncWorker::new(store.clone(), api.clone())
        .run(RunMode::Scheduled)
        .await
        .unwrap();

    assert_eq!(report.recordings_settled, 1);
    let stored = store.get_call("a").await.unwrap().unwrap();
    assert_eq!(stored.recording_status, RecordingSyncStatus::Completed);
    assert_eq!(stored.recording_url.as_deref(), Some("http://calls.test/public/a.mp3"));
    // A lone call goes through start_call
    assert_eq!(api.with(|s| s.start_calls), 1);
}

// ============================================================================
// Recording Upload Worker
// ============================================================================

#[tokio::test]
async fn test_upload_sends_one_mib_chunks_and_finalizes() {
    let (dir, store) = paired_store().await;
    let api = Arc::new(FakeApi::new());
    let clock = Arc::new(ManualClock::new(CALL_END + 60_000));
    synced_call(&store, "a", "+15550001111").await;
    let path = write_recording(dir.path(), "rec.M4A", CHUNK_SIZE * 5 / 2);
    store.set_recording_path("a", Some(&path)).await.unwrap();

    let report = recording_worker(&store, &api, &clock, None)
        .run(RunMode::Scheduled, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.uploaded, 1);
    assert_eq!(report.bytes_sent, (CHUNK_SIZE * 5 / 2) as u64);
    let chunks = api.with(|s| s.chunks.get("a").cloned().unwrap());
    assert_eq!(chunks, vec![CHUNK_SIZE, CHUNK_SIZE, CHUNK_SIZE / 2]);
    let finalized = api.with(|s| s.finalized.clone());
    assert_eq!(finalized[0].total_chunks, 3);
    assert_eq!(finalized[0].extension.as_deref(), Some("m4a"));

    let stored = store.get_call("a").await.unwrap().unwrap();
    assert_eq!(stored.recording_status, RecordingSyncStatus::Completed);
    assert_eq!(stored.recording_url.as_deref(), Some("http://calls.test/public/a.mp3"));
}

#[tokio::test]
async fn test_locator_finds_recording_by_mtime() {
    let (dir, store) = paired_store().await;
    let recordings = dir.path().join("Recordings");
    std::fs::create_dir(&recordings).unwrap();
    let path = write_recording(&recordings, "Call_15550001111.amr", 4096);
    let file = std::fs::File::options().write(true).open(&path).unwrap();
    file.set_modified(UNIX_EPOCH + Duration::from_millis(CALL_END as u64))
        .unwrap();
    drop(file);

    let api = Arc::new(FakeApi::new());
    let clock = Arc::new(ManualClock::new(CALL_END + 60_000));
    synced_call(&store, "a", "+15550001111").await;

    let report = recording_worker(&store, &api, &clock, Some(RecordingLocator::new(&recordings)))
        .run(RunMode::Scheduled, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.uploaded, 1);
    let stored = store.get_call("a").await.unwrap().unwrap();
    assert_eq!(stored.local_recording_path.as_deref(), Some(path.as_str()));
    assert_eq!(stored.recording_status, RecordingSyncStatus::Completed);
}

#[tokio::test]
async fn test_missing_recording_expires_after_grace_period() {
    let (_dir, store) = paired_store().await;
    let api = Arc::new(FakeApi::new());
    let clock = Arc::new(ManualClock::new(CALL_END + 60 * 60 * 1000));
    synced_call(&store, "a", "+15550001111").await;
    let worker = recording_worker(&store, &api, &clock, None);

    let report = worker.run(RunMode::Scheduled, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(recording_status(&store, "a").await, RecordingSyncStatus::Pending);

    clock.set(CALL_END);
    clock.advance(GRACE_PERIOD + Duration::from_secs(60));
    let report = worker.run(RunMode::Scheduled, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.not_applicable, 1);
    assert_eq!(recording_status(&store, "a").await, RecordingSyncStatus::NotApplicable);
}

#[tokio::test]
async fn test_deferred_recordings_do_not_starve_older_calls() {
    let (dir, store) = paired_store().await;
    let api = Arc::new(FakeApi::new());
    let clock = Arc::new(ManualClock::new(CALL_END + 10 * 60 * 1000));

    // One older call whose file is already on disk
    synced_call(&store, "older", "+15550001111").await;
    let path = write_recording(dir.path(), "older.mp3", 2048);
    store.set_recording_path("older", Some(&path)).await.unwrap();

    // Eleven newer calls whose recordings have not appeared yet
    let newer: Vec<String> = (1..=11).map(|i| format!("newer-{}", i)).collect();
    for (i, id) in newer.iter().enumerate() {
        store
            .insert_new_calls(&[call(id, "+15550002222", CallType::Outgoing, CALL_START + 1 + i as i64, CALL_SECS)])
            .await
            .unwrap();
    }
    store.mark_metadata_synced(&newer).await.unwrap();

    let worker = recording_worker(&store, &api, &clock, None);

    let first = worker.run(RunMode::Scheduled, &CancellationToken::new()).await.unwrap();
    assert_eq!(first.deferred, 10);
    assert_eq!(first.uploaded, 0);
    assert!(first.more_remaining);

    // The follow-up run skips the calls just deferred and reaches the rest
    let second = worker.run(RunMode::Scheduled, &CancellationToken::new()).await.unwrap();
    assert_eq!(second.uploaded, 1);
    assert_eq!(second.deferred, 1);
    assert!(!second.more_remaining);
    assert_eq!(recording_status(&store, "older").await, RecordingSyncStatus::Completed);

    // Nothing is due until the recheck window passes
    let third = worker.run(RunMode::Scheduled, &CancellationToken::new()).await.unwrap();
    assert_eq!(third, Default::default());
    assert_eq!(api.with(|s| s.status_checks.len()), 2);

    clock.advance(Duration::from_secs(16 * 60));
    let later = worker.run(RunMode::Scheduled, &CancellationToken::new()).await.unwrap();
    assert_eq!(later.deferred, 10);
    assert!(later.more_remaining);
}

#[tokio::test]
async fn test_recording_waits_for_metadata_sync() {
    let (dir, store) = paired_store().await;
    let api = Arc::new(FakeApi::new());
    let clock = Arc::new(ManualClock::new(CALL_END));
    store
        .insert_new_calls(&[call("a", "+15550001111", CallType::Incoming, CALL_START, CALL_SECS)])
        .await
        .unwrap();
    let path = write_recording(dir.path(), "rec.mp3", 1024);
    store.set_recording_path("a", Some(&path)).await.unwrap();

    let report = recording_worker(&store, &api, &clock, None)
        .run(RunMode::Scheduled, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.uploaded, 0);
    assert!(api.with(|s| s.chunks.is_empty()));
    assert_eq!(recording_status(&store, "a").await, RecordingSyncStatus::Pending);
}

#[tokio::test]
async fn test_stale_uploads_are_reconciled() {
    let (_dir, store) = paired_store().await;
    let api = Arc::new(FakeApi::new());
    let clock = Arc::new(ManualClock::new(CALL_END));
    synced_call(&store, "done", "+15550001111").await;
    store
        .insert_new_calls(&[call("stuck", "+15550002222", CallType::Outgoing, CALL_START + 5, CALL_SECS)])
        .await
        .unwrap();
    store.mark_metadata_synced(&["stuck".to_string()]).await.unwrap();
    for id in ["done", "stuck"] {
        store.transition_recording(id, RecordingEvent::AttemptStarted).await.unwrap();
    }
    api.with(|s| {
        s.completed.insert("done".to_string());
    });

    let report = recording_worker(&store, &api, &clock, None)
        .run(RunMode::Scheduled, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.reconciled, 1);
    assert_eq!(report.reset_stale, 1);
    assert_eq!(recording_status(&store, "done").await, RecordingSyncStatus::Completed);
    assert_eq!(recording_status(&store, "stuck").await, RecordingSyncStatus::Pending);
}

#[tokio::test]
async fn test_cancellation_returns_upload_to_pending() {
    let (dir, store) = paired_store().await;
    let api = Arc::new(FakeApi::new());
    api.with(|s| s.stall_uploads = true);
    let clock = Arc::new(ManualClock::new(CALL_END));
    synced_call(&store, "a", "+15550001111").await;
    let path = write_recording(dir.path(), "rec.mp3", 2048);
    store.set_recording_path("a", Some(&path)).await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = recording_worker(&store, &api, &clock, None)
        .run(RunMode::Scheduled, &cancel)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert!(report.more_remaining);
    assert_eq!(recording_status(&store, "a").await, RecordingSyncStatus::Pending);
}

#[tokio::test]
async fn test_missing_chunk_restarts_from_zero_next_run() {
    let (dir, store) = paired_store().await;
    let api = Arc::new(FakeApi::new());
    api.with(|s| {
        s.finalize_missing.insert("a".to_string());
    });
    let clock = Arc::new(ManualClock::new(CALL_END));
    synced_call(&store, "a", "+15550001111").await;
    let path = write_recording(dir.path(), "rec.mp3", CHUNK_SIZE + 10);
    store.set_recording_path("a", Some(&path)).await.unwrap();
    let worker = recording_worker(&store, &api, &clock, None);

    let report = worker.run(RunMode::Scheduled, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.incomplete, 1);
    assert_eq!(recording_status(&store, "a").await, RecordingSyncStatus::Uploading);

    api.with(|s| s.finalize_missing.clear());
    let report = worker.run(RunMode::Scheduled, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.reset_stale, 1);
    assert_eq!(report.uploaded, 1);
    assert_eq!(
        api.with(|s| s.chunks.get("a").cloned().unwrap()),
        vec![CHUNK_SIZE, 10, CHUNK_SIZE, 10]
    );
    assert_eq!(recording_status(&store, "a").await, RecordingSyncStatus::Completed);
}

#[tokio::test]
async fn test_transient_upload_failure_is_retried() {
    let (dir, store) = paired_store().await;
    let api = Arc::new(FakeApi::new());
    api.with(|s| s.fail_chunks = true);
    let clock = Arc::new(ManualClock::new(CALL_END));
    synced_call(&store, "a", "+15550001111").await;
    let path = write_recording(dir.path(), "rec.mp3", 512);
    store.set_recording_path("a", Some(&path)).await.unwrap();
    let worker = recording_worker(&store, &api, &clock, None);

    let report = worker.run(RunMode::Scheduled, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.failed, 1);
    let stored = store.get_call("a").await.unwrap().unwrap();
    assert_eq!(stored.recording_status, RecordingSyncStatus::Failed);
    assert!(stored.recording_retryable);
    assert!(stored.recording_error.is_some());

    api.with(|s| s.fail_chunks = false);
    let report = worker.run(RunMode::Scheduled, &CancellationToken::new()).await.unwrap();
    assert_eq!(report.uploaded, 1);
    let stored = store.get_call("a").await.unwrap().unwrap();
    assert_eq!(stored.recording_status, RecordingSyncStatus::Completed);
    assert!(stored.recording_error.is_none());
}

#[tokio::test]
async fn test_device_mismatch_stops_run() {
    let (dir, store) = paired_store().await;
    let api = Arc::new(FakeApi::new());
    api.with(|s| s.device_mismatch = true);
    let clock = Arc::new(ManualClock::new(CALL_END));
    synced_call(&store, "a", "+15550001111").await;
    let path = write_recording(dir.path(), "rec.mp3", 512);
    store.set_recording_path("a", Some(&path)).await.unwrap();

    let err = recording_worker(&store, &api, &clock, None)
        .run(RunMode::Scheduled, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::DeviceMismatch(_)));
    assert_eq!(recording_status(&store, "a").await, RecordingSyncStatus::Pending);
}

#[tokio::test]
async fn test_recording_disabled_by_server_setting() {
    let (dir, store) = paired_store().await;
    store
        .apply_employee_settings(&EmployeeSettings {
            call_record_crm: false,
            ..EmployeeSettings::default()
        })
        .await
        .unwrap();
    let api = Arc::new(FakeApi::new());
    let clock = Arc::new(ManualClock::new(CALL_END));
    synced_call(&store, "a", "+15550001111").await;
    let path = write_recording(dir.path(), "rec.mp3", 512);
    store.set_recording_path("a", Some(&path)).await.unwrap();

    let report = recording_worker(&store, &api, &clock, None)
        .run(RunMode::Scheduled, &CancellationToken::new())
        .await
        .unwrap();

    assert!(report.recording_disabled);
    assert!(api.with(|s| s.chunks.is_empty()));
}
