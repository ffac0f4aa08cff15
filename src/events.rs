//! Progress snapshots and the fire-and-forget emission of hub events.
//!
//! Emission runs on spawned tasks after the triggering change is on disk.
//! Every event is a derived snapshot, so a dropped or reordered one is
//! superseded by the next.

use std::sync::Arc;

use crate::error::{Result, TransferError};
use crate::models::{percent, ProgressSnapshot, SessionDescriptor};
use crate::room::RoomService;
use crate::state::AppState;

/// Build the progress view of one upload from disk.
pub async fn progress_snapshot(state: &AppState, upload_id: &str) -> Result<ProgressSnapshot> {
    let descriptor = state.store.read(upload_id).await?;
    let complete = state.store.is_assembled(&descriptor).await;

    let received_chunks = if complete {
        // tracker file is gone once assembled
        (0..descriptor.total_chunks).collect()
    } else {
        match state.tracker.read(upload_id).await {
            Ok(received) => received,
            Err(TransferError::SessionNotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        }
    };

    Ok(ProgressSnapshot {
        upload_id: descriptor.upload_id,
        filename: descriptor.filename,
        total_chunks: descriptor.total_chunks,
        received_count: received_chunks.len(),
        completed_percent: percent(received_chunks.len(), descriptor.total_chunks),
        received_chunks,
        complete,
    })
}

/// Push the current snapshot to every progress subscriber of `upload_id`.
pub async fn broadcast_progress(state: &AppState, upload_id: &str) -> usize {
    if state.progress.subscriber_count(upload_id) == 0 {
        return 0;
    }
    match progress_snapshot(state, upload_id).await {
        Ok(snapshot) => state.progress.publish(upload_id, &snapshot),
        Err(e) => {
            tracing::debug!("No progress snapshot for {}: {}", upload_id, e);
            0
        }
    }
}

/// Push the aggregated room view to every subscriber of `share_id`.
pub async fn broadcast_room_state(state: &AppState, share_id: &str) -> usize {
    if state.rooms.hub().subscriber_count(share_id) == 0 {
        return 0;
    }
    match state.rooms.state(&state.store, &state.tracker, share_id).await {
        Ok(room) => state.rooms.publish(&RoomService::room_state_event(&room)),
        Err(e) => {
            tracing::warn!("Failed to build room state for {}: {}", share_id, e);
            0
        }
    }
}

pub fn spawn_progress(state: &Arc<AppState>, upload_id: &str) {
    let state = Arc::clone(state);
    let upload_id = upload_id.to_string();
    tokio::spawn(async move {
        broadcast_progress(&state, &upload_id).await;
    });
}

pub fn spawn_room_state(state: &Arc<AppState>, share_id: &str) {
    let state = Arc::clone(state);
    let share_id = share_id.to_string();
    tokio::spawn(async move {
        broadcast_room_state(&state, &share_id).await;
    });
}

/// Session created: zero progress plus an `upload_start` room event.
pub fn spawn_session_started(state: &Arc<AppState>, descriptor: &SessionDescriptor) {
    spawn_progress(state, &descriptor.upload_id);
    // touches the room expiry synchronously, only delivery is deferred
    state.rooms.notify_upload_start(descriptor);
}

/// A chunk landed: progress snapshot plus a `chunk_received` room event.
pub fn spawn_chunk_received(state: &Arc<AppState>, descriptor: &SessionDescriptor) {
    let state = Arc::clone(state);
    let descriptor = descriptor.clone();
    tokio::spawn(async move {
        broadcast_progress(&state, &descriptor.upload_id).await;
        if state.rooms.hub().subscriber_count(&descriptor.share_id) > 0 {
            let received = state
                .tracker
                .peek(&descriptor.upload_id)
                .await
                .map(|r| r.len())
                .unwrap_or(0);
            state.rooms.notify_chunk_received(&descriptor, received);
        }
    });
}

/// Assembly succeeded: final progress plus an `upload_complete` room event.
pub fn spawn_upload_complete(state: &Arc<AppState>, descriptor: &SessionDescriptor, file_size: u64) {
    let state = Arc::clone(state);
    let descriptor = descriptor.clone();
    tokio::spawn(async move {
        broadcast_progress(&state, &descriptor.upload_id).await;
        state.rooms.notify_upload_complete(&descriptor, file_size);
    });
}
