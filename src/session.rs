//! Session lifecycle around the chunk and assembly engines: create, status,
//! cleanup.

use std::sync::Arc;

use tokio::fs;

use crate::error::{Result, TransferError};
use crate::events;
use crate::models::{CleanupResponse, NewSession, SessionDescriptor, StatusResponse};
use crate::state::AppState;
use crate::utils::is_valid_upload_id;

pub async fn create_session(state: &Arc<AppState>, request: NewSession) -> Result<SessionDescriptor> {
    let descriptor = state.store.create(request).await?;

    tracing::info!(
        "📤 Initialized upload {} for {} ({} chunks, room {})",
        descriptor.upload_id,
        descriptor.filename,
        descriptor.total_chunks,
        descriptor.share_id
    );

    events::spawn_session_started(state, &descriptor);
    Ok(descriptor)
}

/// Received indices of an upload; every index once it is assembled.
pub async fn session_status(state: &AppState, upload_id: &str) -> Result<StatusResponse> {
    let descriptor = state.store.read(upload_id).await?;
    let complete = state.store.is_assembled(&descriptor).await;

    let received_chunks = if complete {
        (0..descriptor.total_chunks).collect()
    } else {
        match state.tracker.read(upload_id).await {
            Ok(received) => received,
            Err(TransferError::SessionNotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        }
    };

    Ok(StatusResponse {
        upload_id: descriptor.upload_id,
        received_chunks,
        total_chunks: descriptor.total_chunks,
        complete,
    })
}

/// Delete every trace of an unfinished upload. Assembled uploads are
/// immutable through this path.
pub async fn cleanup_session(state: &Arc<AppState>, upload_id: &str) -> Result<CleanupResponse> {
    let dir = state.store.session_dir(upload_id);
    if !is_valid_upload_id(upload_id) || !fs::try_exists(&dir).await.unwrap_or(false) {
        return Err(TransferError::SessionNotFound(upload_id.to_string()));
    }
    let _gate = state.tracker.enter_exclusive(upload_id).await;

    // deleted by whoever held the gate before us
    if !fs::try_exists(&dir).await.unwrap_or(false) {
        state.tracker.forget(upload_id);
        return Err(TransferError::SessionNotFound(upload_id.to_string()));
    }

    // a directory with unreadable metadata is still deletable
    let descriptor = state.store.read(upload_id).await.ok();
    if let Some(descriptor) = &descriptor {
        if state.store.is_assembled(descriptor).await {
            tracing::warn!("🚫 Refusing to clean up completed upload {}", upload_id);
            return Err(TransferError::CompletedImmutable(upload_id.to_string()));
        }
    }

    state.store.remove(upload_id).await?;
    state.tracker.forget(upload_id);

    tracing::info!("🗑️  Deleted upload session {}", upload_id);

    if let Some(descriptor) = descriptor {
        events::spawn_room_state(state, &descriptor.share_id);
    }

    Ok(CleanupResponse {
        message: "Upload session deleted".to_string(),
        upload_id: upload_id.to_string(),
    })
}
