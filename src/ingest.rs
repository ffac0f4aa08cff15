//! Chunk ingestion: validate, hash, durably store one chunk, then record it.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{Result, TransferError};
use crate::events;
use crate::models::{ChunkStatus, ChunkUploadResponse};
use crate::state::AppState;
use crate::store::write_atomic;
use crate::utils::{content_hash, move_file};

/// Store chunk `index` of `upload_id`.
///
/// `content_length` is the length the client declared, if any; it is checked
/// against the upload ceiling together with the bytes actually received.
///
/// Re-sending byte-identical content for an index that is already on disk
/// succeeds with [`ChunkStatus::AlreadyReceived`] and touches nothing. Different
/// content for a stored index replaces it, subject to the declared hash.
pub async fn ingest_chunk(
    state: &Arc<AppState>,
    upload_id: &str,
    index: usize,
    data: &[u8],
    content_length: Option<u64>,
) -> Result<ChunkUploadResponse> {
    if !state.store.exists(upload_id).await {
        return Err(TransferError::SessionNotFound(upload_id.to_string()));
    }
    // shared: other indices may land concurrently, assembly/cleanup may not
    let _gate = state.tracker.enter_shared(upload_id).await;

    let descriptor = state.tracker.revalidate(upload_id, state.store.read(upload_id).await)?;
    if index >= descriptor.total_chunks {
        return Err(TransferError::IndexOutOfRange {
            index,
            total: descriptor.total_chunks,
        });
    }
    if state.store.is_assembled(&descriptor).await {
        return Err(TransferError::AlreadyComplete(upload_id.to_string()));
    }
    let size = content_length.unwrap_or(0).max(data.len() as u64);
    if size > state.max_upload_size {
        return Err(TransferError::PayloadTooLarge {
            size,
            limit: state.max_upload_size,
        });
    }
    if data.is_empty() {
        return Err(TransferError::EmptyPayload);
    }

    let actual = content_hash(data);
    let chunk_path = state.store.chunk_path(upload_id, index);
    let hash_path = state.store.chunk_hash_path(upload_id, index);

    if let Some((stored_len, stored_hash)) = existing_chunk(&chunk_path, &hash_path).await? {
        if stored_hash.as_deref() == Some(actual.as_str()) {
            tracing::debug!(
                "♻️  Chunk {} for upload {} already received (hash match)",
                index,
                upload_id
            );
            // heals a tracker update that was lost after the original write
            if let Err(e) = state.tracker.append(upload_id, index).await {
                tracing::warn!("Failed to re-record chunk {} for {}: {}", index, upload_id, e);
            }
            return Ok(ChunkUploadResponse {
                status: ChunkStatus::AlreadyReceived,
                index,
                received_bytes: stored_len,
                chunk_hash: actual,
            });
        }
        tracing::warn!(
            "Chunk {} for upload {} has a different hash than the stored copy, replacing",
            index,
            upload_id
        );
    }

    if let Some(expected) = descriptor.expected_chunk_hash(index) {
        if !expected.eq_ignore_ascii_case(&actual) {
            tracing::warn!(
                "🚫 Hash mismatch for upload {} chunk {}: expected {} actual {}",
                upload_id,
                index,
                expected,
                actual
            );
            return Err(TransferError::HashMismatch {
                index,
                expected: expected.to_string(),
                actual,
            });
        }
    }

    write_chunk(&chunk_path, &hash_path, data, &actual).await?;

    // the artifact is durable at this point; a lost tracker update self-heals
    // on the next ingest of this index
    if let Err(e) = state.tracker.append(upload_id, index).await {
        tracing::warn!("Failed to record chunk {} for {}: {}", index, upload_id, e);
    }

    tracing::debug!(
        "📦 Received chunk {}/{} for upload {} ({} bytes)",
        index,
        descriptor.total_chunks,
        upload_id,
        data.len()
    );

    events::spawn_chunk_received(state, &descriptor);

    Ok(ChunkUploadResponse {
        status: ChunkStatus::Received,
        index,
        received_bytes: data.len() as u64,
        chunk_hash: actual,
    })
}

// length and side-car hash of a stored chunk, if there is one
async fn existing_chunk(chunk_path: &Path, hash_path: &Path) -> Result<Option<(u64, Option<String>)>> {
    let len = match fs::metadata(chunk_path).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(TransferError::storage(
                format!("failed to stat chunk {:?}", chunk_path),
                e,
            ))
        }
    };
    let hash = fs::read_to_string(hash_path)
        .await
        .ok()
        .map(|h| h.trim().to_string());
    Ok(Some((len, hash)))
}

async fn write_chunk(chunk_path: &Path, hash_path: &Path, data: &[u8], hash: &str) -> Result<()> {
    let tmp = chunk_path.with_extension(format!("{}.part", uuid::Uuid::new_v4().simple()));

    let written = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await
    }
    .await;
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp).await;
        return Err(TransferError::storage(format!("failed to write chunk {:?}", tmp), e));
    }

    // a stale side-car must never vouch for the new bytes
    match fs::remove_file(hash_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            let _ = fs::remove_file(&tmp).await;
            return Err(TransferError::storage(
                format!("failed to drop old hash {:?}", hash_path),
                e,
            ));
        }
    }

    if let Err(e) = move_file(&tmp, chunk_path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(TransferError::storage(
            format!("failed to finalize chunk {:?}", chunk_path),
            e,
        ));
    }

    write_atomic(hash_path, hash.as_bytes()).await
}
