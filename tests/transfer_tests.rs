use aetherdrop::assembly::assemble;
use aetherdrop::error::{ErrorKind, TransferError};
use aetherdrop::events::progress_snapshot;
use aetherdrop::files::file_info;
use aetherdrop::ingest::ingest_chunk;
use aetherdrop::models::{ChunkStatus, NewSession, ProgressSnapshot, RoomEvent, RoomEventKind};
use aetherdrop::session::{cleanup_session, create_session};
use aetherdrop::state::AppState;
use aetherdrop::utils::content_hash;
use std::sync::Arc;
use std::time::Duration;
use xxhash_rust::xxh64::xxh64;

fn test_state() -> (tempfile::TempDir, Arc<AppState>) {
    let temp_dir = tempfile::tempdir().unwrap();
    let state = Arc::new(AppState::with_root(temp_dir.path()));
    (temp_dir, state)
}

fn session(upload_id: &str, total_chunks: usize) -> NewSession {
    NewSession {
        upload_id: upload_id.to_string(),
        filename: "out.bin".to_string(),
        total_chunks,
        share_id: Some("r1".to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_declared_chunk_hash_mismatch_stores_nothing() {
    let (_dir, state) = test_state();
    let mut request = session("u1", 2);
    request.chunk_hashes = Some(vec![content_hash(b"A"), content_hash(b"B")]);
    create_session(&state, request).await.unwrap();

    let err = ingest_chunk(&state, "u1", 0, b"X", None).await.unwrap_err();
    match err {
        TransferError::HashMismatch { index, expected, actual } => {
            assert_eq!(index, 0);
            assert_eq!(expected, content_hash(b"A"));
            assert_eq!(actual, content_hash(b"X"));
        }
        other => panic!("expected HashMismatch, got {:?}", other),
    }
    assert!(!state.store.chunk_path("u1", 0).exists());
    assert!(state.tracker.read("u1").await.unwrap().is_empty());

    // the right bytes are accepted afterwards
    let ok = ingest_chunk(&state, "u1", 0, b"A", None).await.unwrap();
    assert_eq!(ok.status, ChunkStatus::Received);
}

#[tokio::test]
async fn test_declared_hashes_are_case_insensitive() {
    let (_dir, state) = test_state();
    let mut request = session("u1", 1);
    request.chunk_hashes = Some(vec![content_hash(b"A").to_uppercase()]);
    request.file_hash = Some(content_hash(b"A").to_uppercase());
    create_session(&state, request).await.unwrap();

    ingest_chunk(&state, "u1", 0, b"A", None).await.unwrap();
    let done = assemble(&state, "u1").await.unwrap();
    assert_eq!(done.file_hash, content_hash(b"A"));
}

#[tokio::test]
async fn test_different_content_replaces_stored_chunk() {
    let (_dir, state) = test_state();
    create_session(&state, session("u1", 1)).await.unwrap();

    ingest_chunk(&state, "u1", 0, b"old", None).await.unwrap();
    let replaced = ingest_chunk(&state, "u1", 0, b"new", None).await.unwrap();
    assert_eq!(replaced.status, ChunkStatus::Received);

    let done = assemble(&state, "u1").await.unwrap();
    assert_eq!(std::fs::read(&done.file_path).unwrap(), b"new");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ingest_of_every_index() {
    let (_dir, state) = test_state();
    const N: usize = 32;
    create_session(&state, session("u1", N)).await.unwrap();

    let mut handles = Vec::new();
    for index in (0..N).rev() {
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            let data = vec![index as u8; 16];
            ingest_chunk(&state, "u1", index, &data, None).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let received = state.tracker.read("u1").await.unwrap();
    assert_eq!(received, (0..N).collect::<Vec<_>>());

    let done = assemble(&state, "u1").await.unwrap();
    let bytes = std::fs::read(&done.file_path).unwrap();
    assert_eq!(bytes.len(), N * 16);
    for (index, block) in bytes.chunks(16).enumerate() {
        assert!(block.iter().all(|b| *b == index as u8));
    }
}

#[tokio::test]
async fn test_file_hash_mismatch_leaves_no_artifact() {
    let (dir, state) = test_state();
    let mut request = session("u1", 2);
    request.file_hash = Some(content_hash(b"something else"));
    create_session(&state, request).await.unwrap();

    ingest_chunk(&state, "u1", 0, b"A", None).await.unwrap();
    ingest_chunk(&state, "u1", 1, b"B", None).await.unwrap();

    let err = assemble(&state, "u1").await.unwrap_err();
    match err {
        TransferError::FileHashMismatch { actual, .. } => assert_eq!(actual, content_hash(b"AB")),
        other => panic!("expected FileHashMismatch, got {:?}", other),
    }

    let session_dir = dir.path().join("u1");
    assert!(!session_dir.join("out.bin").exists());
    assert!(!session_dir.join("out.bin.part").exists());
    // chunks survive so the upload can still be fixed
    assert!(state.store.chunk_path("u1", 0).exists());
    assert!(!state.store.is_assembled(&state.store.read("u1").await.unwrap()).await);
}

#[tokio::test]
async fn test_assembly_reclaims_chunks_and_locks_out_ingest() {
    let (_dir, state) = test_state();
    create_session(&state, session("u1", 1)).await.unwrap();
    ingest_chunk(&state, "u1", 0, b"A", None).await.unwrap();

    assemble(&state, "u1").await.unwrap();

    assert!(!state.store.chunks_dir("u1").exists());
    assert!(!state.store.received_path("u1").exists());
    assert_eq!(state.tracker.tracked_sessions(), 0);

    let err = ingest_chunk(&state, "u1", 0, b"A", None).await.unwrap_err();
    assert!(matches!(err, TransferError::AlreadyComplete(_)));
    let err = assemble(&state, "u1").await.unwrap_err();
    assert!(matches!(err, TransferError::AlreadyComplete(_)));
}

#[tokio::test]
async fn test_progress_events_follow_ingest() {
    let (_dir, state) = test_state();
    create_session(&state, session("u1", 4)).await.unwrap();

    let mut subscription = state.progress.subscribe("u1");
    ingest_chunk(&state, "u1", 2, b"C", None).await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .unwrap()
        .unwrap();
    let snapshot: ProgressSnapshot = serde_json::from_str(&message).unwrap();
    assert_eq!(snapshot.upload_id, "u1");
    assert_eq!(snapshot.received_chunks, vec![2]);
    assert_eq!(snapshot.received_count, snapshot.received_chunks.len());
    assert_eq!(snapshot.completed_percent, 25);
    assert!(!snapshot.complete);
}

#[tokio::test]
async fn test_progress_snapshot_after_assembly() {
    let (_dir, state) = test_state();
    create_session(&state, session("u1", 2)).await.unwrap();
    ingest_chunk(&state, "u1", 0, b"A", None).await.unwrap();
    ingest_chunk(&state, "u1", 1, b"B", None).await.unwrap();
    assemble(&state, "u1").await.unwrap();

    let snapshot = progress_snapshot(&state, "u1").await.unwrap();
    assert!(snapshot.complete);
    assert_eq!(snapshot.received_count, 2);
    assert_eq!(snapshot.completed_percent, 100);
}

#[tokio::test]
async fn test_room_sees_upload_start() {
    let (_dir, state) = test_state();
    let mut subscription = state.rooms.subscribe("r1");

    create_session(&state, session("u1", 2)).await.unwrap();

    let message = subscription.try_recv().expect("upload_start is published synchronously");
    let event: RoomEvent = serde_json::from_str(&message).unwrap();
    assert_eq!(event.kind, RoomEventKind::UploadStart);
    assert_eq!(event.share_id, "r1");
    assert_eq!(event.upload_id.as_deref(), Some("u1"));
    assert_eq!(event.filename.as_deref(), Some("out.bin"));
}

#[tokio::test]
async fn test_room_sees_upload_complete() {
    let (_dir, state) = test_state();
    create_session(&state, session("u1", 1)).await.unwrap();
    ingest_chunk(&state, "u1", 0, b"AB", None).await.unwrap();

    let mut subscription = state.rooms.subscribe("r1");
    assemble(&state, "u1").await.unwrap();

    let complete = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let message = subscription.recv().await.unwrap();
            let event: RoomEvent = serde_json::from_str(&message).unwrap();
            if event.kind == RoomEventKind::UploadComplete {
                return event;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(complete.upload_id.as_deref(), Some("u1"));
    assert_eq!(complete.data.unwrap()["file_size"], 2);
}

#[tokio::test]
async fn test_dropped_subscription_unregisters() {
    let (_dir, state) = test_state();
    let subscription = state.progress.subscribe("u1");
    assert_eq!(state.progress.subscriber_count("u1"), 1);
    drop(subscription);
    assert_eq!(state.progress.subscriber_count("u1"), 0);
}

#[tokio::test]
async fn test_hashes_match_client_side_xxh64() {
    let (_dir, state) = test_state();
    let chunk_hash = |data: &[u8]| format!("{:016x}", xxh64(data, 0));

    let mut request = session("u1", 2);
    request.chunk_hashes = Some(vec![chunk_hash(b"A"), chunk_hash(b"B")]);
    request.file_hash = Some(chunk_hash(b"AB"));
    create_session(&state, request).await.unwrap();

    let first = ingest_chunk(&state, "u1", 0, b"A", None).await.unwrap();
    assert_eq!(first.chunk_hash, chunk_hash(b"A"));
    ingest_chunk(&state, "u1", 1, b"B", None).await.unwrap();

    let done = assemble(&state, "u1").await.unwrap();
    assert_eq!(done.file_hash, chunk_hash(b"AB"));
    // side-cars go with the chunks once assembled
    assert!(!state.store.chunks_dir("u1").exists());
}

#[tokio::test]
async fn test_streamed_file_hash_spans_copy_buffers() {
    let (_dir, state) = test_state();
    // each chunk is larger than one copy buffer
    let a = vec![7u8; 100_000];
    let b = vec![9u8; 70_000];
    let mut whole = a.clone();
    whole.extend_from_slice(&b);

    let mut request = session("u1", 2);
    request.file_hash = Some(format!("{:016x}", xxh64(&whole, 0)));
    create_session(&state, request).await.unwrap();
    ingest_chunk(&state, "u1", 0, &a, None).await.unwrap();
    ingest_chunk(&state, "u1", 1, &b, None).await.unwrap();

    let done = assemble(&state, "u1").await.unwrap();
    assert_eq!(done.file_size, whole.len() as u64);
    assert_eq!(done.file_hash, content_hash(&whole));
}

#[tokio::test]
async fn test_unknown_sessions_leave_no_lock_entries() {
    let (_dir, state) = test_state();

    for i in 0..100 {
        let id = format!("ghost{}", i);
        let err = ingest_chunk(&state, &id, 0, b"A", None).await.unwrap_err();
        assert!(matches!(err, TransferError::SessionNotFound(_)));
        let err = assemble(&state, &id).await.unwrap_err();
        assert!(matches!(err, TransferError::SessionNotFound(_)));
        let err = cleanup_session(&state, &id).await.unwrap_err();
        assert!(matches!(err, TransferError::SessionNotFound(_)));
    }
    let err = ingest_chunk(&state, "../bad", 0, b"A", None).await.unwrap_err();
    assert!(matches!(err, TransferError::SessionNotFound(_)));

    assert_eq!(state.tracker.tracked_sessions(), 0);
}

#[tokio::test]
async fn test_cleaned_up_session_releases_its_lock_entry() {
    let (_dir, state) = test_state();
    create_session(&state, session("u1", 2)).await.unwrap();
    ingest_chunk(&state, "u1", 0, b"A", None).await.unwrap();
    assert_eq!(state.tracker.tracked_sessions(), 1);

    cleanup_session(&state, "u1").await.unwrap();
    let err = ingest_chunk(&state, "u1", 1, b"B", None).await.unwrap_err();
    assert!(matches!(err, TransferError::SessionNotFound(_)));
    assert_eq!(state.tracker.tracked_sessions(), 0);
}

#[tokio::test]
async fn test_oversized_plans_are_rejected_at_creation() {
    let (_dir, state) = test_state();

    let err = create_session(&state, session("big", 1 << 40)).await.unwrap_err();
    assert!(matches!(err, TransferError::InvalidDescriptor(_)));

    let mut request = session("wide", 4);
    request.chunk_size = u64::MAX / 2;
    let err = create_session(&state, request).await.unwrap_err();
    assert!(matches!(err, TransferError::InvalidDescriptor(_)));
}

#[tokio::test]
async fn test_huge_descriptor_on_disk_does_not_overflow_size() {
    let (dir, state) = test_state();
    // written by hand, bypassing creation limits
    let session_dir = dir.path().join("huge");
    std::fs::create_dir_all(session_dir.join("chunks")).unwrap();
    let descriptor = serde_json::json!({
        "upload_id": "huge",
        "filename": "h.bin",
        "total_chunks": 1u64 << 40,
        "chunk_size": 1u64 << 40,
        "share_id": "r1",
    });
    std::fs::write(session_dir.join("metadata.json"), descriptor.to_string()).unwrap();
    std::fs::write(session_dir.join("received.json"), "[]").unwrap();

    let info = file_info(&state, "huge", Some("r1")).await.unwrap();
    assert_eq!(info.file_size, u64::MAX);
    assert_eq!(info.received_chunks, 0);
}

#[tokio::test]
async fn test_chunk_vanishing_during_assembly() {
    let (dir, state) = test_state();
    create_session(&state, session("u1", 3)).await.unwrap();
    for (index, data) in [(0usize, b"A"), (1, b"B"), (2, b"C")] {
        ingest_chunk(&state, "u1", index, data, None).await.unwrap();
    }
    // tracker still lists index 1, its artifact is gone
    std::fs::remove_file(state.store.chunk_path("u1", 1)).unwrap();

    let err = assemble(&state, "u1").await.unwrap_err();
    assert!(matches!(err, TransferError::ChunkMissingDuringAssembly(1)));
    assert_eq!(err.kind(), ErrorKind::Incomplete);

    let session_dir = dir.path().join("u1");
    assert!(!session_dir.join("out.bin").exists());
    assert!(!session_dir.join("out.bin.part").exists());
    assert_eq!(state.tracker.read("u1").await.unwrap(), vec![0, 1, 2]);

    // re-sending the lost chunk makes the upload completable again
    ingest_chunk(&state, "u1", 1, b"B", None).await.unwrap();
    let done = assemble(&state, "u1").await.unwrap();
    assert_eq!(std::fs::read(&done.file_path).unwrap(), b"ABC");
}
