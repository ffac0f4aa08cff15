//! Assembly: concatenate every chunk in index order into the final artifact.
//!
//! The artifact only appears under its canonical name once it is fully
//! written, synced and verified, so an observer never sees a partial file.

use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;

use xxhash_rust::xxh64::Xxh64;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};

use crate::error::{Result, TransferError};
use crate::events;
use crate::models::{AssembleResponse, SessionDescriptor};
use crate::state::AppState;
use crate::utils::{format_hash, HASH_SEED};

const COPY_BUFFER: usize = 64 * 1024;

pub async fn assemble(state: &Arc<AppState>, upload_id: &str) -> Result<AssembleResponse> {
    if !state.store.exists(upload_id).await {
        return Err(TransferError::SessionNotFound(upload_id.to_string()));
    }
    // exclusive: no chunk may land while the output is being built
    let _gate = state.tracker.enter_exclusive(upload_id).await;

    let descriptor = state.tracker.revalidate(upload_id, state.store.read(upload_id).await)?;
    if state.store.is_assembled(&descriptor).await {
        return Err(TransferError::AlreadyComplete(upload_id.to_string()));
    }

    let received = match state.tracker.read(upload_id).await {
        Ok(received) => received,
        Err(TransferError::SessionNotFound(_)) => Vec::new(),
        Err(e) => return Err(e),
    };
    let missing: Vec<usize> = (0..descriptor.total_chunks)
        .filter(|i| received.binary_search(i).is_err())
        .collect();
    if !missing.is_empty() {
        tracing::warn!(
            "Upload {} cannot be completed, missing {} of {} chunks",
            upload_id,
            missing.len(),
            descriptor.total_chunks
        );
        return Err(TransferError::Incomplete {
            missing,
            received: received.len(),
            total: descriptor.total_chunks,
        });
    }

    let out_path = state.store.artifact_path(&descriptor);
    let tmp_path = out_path.with_file_name(format!("{}.part", descriptor.filename));

    let (file_hash, file_size) = match concat_chunks(state, &descriptor, &tmp_path).await {
        Ok(done) => done,
        Err(e) => {
            discard(&tmp_path).await;
            return Err(e);
        }
    };

    if let Some(expected) = descriptor.expected_file_hash() {
        if !expected.eq_ignore_ascii_case(&file_hash) {
            tracing::warn!(
                "🚫 File hash mismatch for upload {}: expected {} actual {}",
                upload_id,
                expected,
                file_hash
            );
            discard(&tmp_path).await;
            return Err(TransferError::FileHashMismatch {
                expected: expected.to_string(),
                actual: file_hash,
            });
        }
    }

    if let Err(e) = fs::rename(&tmp_path, &out_path).await {
        discard(&tmp_path).await;
        return Err(TransferError::storage(
            format!("failed to publish assembled file {:?}", out_path),
            e,
        ));
    }

    reclaim_chunks(state, upload_id).await;
    state.tracker.forget(upload_id);

    tracing::info!(
        "✅ Assembled upload {}: {} ({} bytes)",
        upload_id,
        descriptor.filename,
        file_size
    );

    events::spawn_upload_complete(state, &descriptor, file_size);

    Ok(AssembleResponse {
        status: "assembled".to_string(),
        file_path: out_path.to_string_lossy().to_string(),
        file_hash,
        file_size,
        download_url: download_url(&descriptor),
    })
}

/// where a share holder fetches the assembled file
pub fn download_url(descriptor: &SessionDescriptor) -> String {
    format!(
        "/download/{}/{}?share_id={}",
        descriptor.upload_id, descriptor.filename, descriptor.share_id
    )
}

// stream chunks in index order into `tmp_path`, hashing as we go
async fn concat_chunks(
    state: &AppState,
    descriptor: &SessionDescriptor,
    tmp_path: &Path,
) -> Result<(String, u64)> {
    let file = fs::File::create(tmp_path).await.map_err(|e| {
        TransferError::storage(format!("failed to create output file {:?}", tmp_path), e)
    })?;
    let mut out = BufWriter::new(file);
    let mut hasher = Xxh64::new(HASH_SEED);
    let mut size = 0u64;
    let mut buf = vec![0u8; COPY_BUFFER];

    for index in 0..descriptor.total_chunks {
        let chunk_path = state.store.chunk_path(&descriptor.upload_id, index);
        let mut chunk = match fs::File::open(&chunk_path).await {
            Ok(chunk) => chunk,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::error!(
                    "Chunk {} of upload {} vanished during assembly",
                    index,
                    descriptor.upload_id
                );
                return Err(TransferError::ChunkMissingDuringAssembly(index));
            }
            Err(e) => {
                return Err(TransferError::storage(
                    format!("failed to open chunk {:?}", chunk_path),
                    e,
                ))
            }
        };

        loop {
            let n = chunk.read(&mut buf).await.map_err(|e| {
                TransferError::storage(format!("failed to read chunk {:?}", chunk_path), e)
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n]).await.map_err(|e| {
                TransferError::storage(format!("failed to write output {:?}", tmp_path), e)
            })?;
            size += n as u64;
        }
    }

    out.flush()
        .await
        .map_err(|e| TransferError::storage(format!("failed to flush output {:?}", tmp_path), e))?;
    out.get_ref()
        .sync_all()
        .await
        .map_err(|e| TransferError::storage(format!("failed to sync output {:?}", tmp_path), e))?;

    Ok((format_hash(hasher.digest()), size))
}

async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            tracing::warn!("Failed to discard temp output {:?}: {}", path, e);
        }
    }
}

// chunk artifacts, side-cars and the tracker are redundant once the file exists
async fn reclaim_chunks(state: &AppState, upload_id: &str) {
    let chunks_dir = state.store.chunks_dir(upload_id);
    tracing::debug!("Cleaning up chunks for completed upload {}", upload_id);
    if let Err(e) = fs::remove_dir_all(&chunks_dir).await {
        tracing::warn!("Failed to remove chunks {:?}: {}", chunks_dir, e);
    }
    if let Err(e) = state.tracker.remove(upload_id).await {
        tracing::warn!("Failed to remove received set for {}: {}", upload_id, e);
    }
}
