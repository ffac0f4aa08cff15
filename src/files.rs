//! Share-gated reads: listings, per-upload info and download resolution.

use std::path::PathBuf;

use tokio::fs;

use crate::error::{Result, TransferError};
use crate::models::{FileInfo, FileListResponse, SessionDescriptor};
use crate::state::AppState;
use crate::utils::{sanitize_filename, to_utc};

/// The presented token must be non-empty and equal the session's.
pub fn authorize(descriptor: &SessionDescriptor, share_id: Option<&str>) -> Result<()> {
    let share_id = share_id
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(TransferError::MissingShareId)?;
    if share_id != descriptor.share_id {
        tracing::warn!("🚫 Share id mismatch for upload {}", descriptor.upload_id);
        return Err(TransferError::AccessDenied);
    }
    Ok(())
}

async fn describe(state: &AppState, descriptor: SessionDescriptor) -> Result<FileInfo> {
    let upload_time = fs::metadata(state.store.metadata_path(&descriptor.upload_id))
        .await
        .and_then(|m| m.modified())
        .map(to_utc)
        .map_err(|e| {
            TransferError::storage(
                format!("failed to stat metadata of {}", descriptor.upload_id),
                e,
            )
        })?;

    let assembled = state.store.assembled_size(&descriptor).await;
    let received = match assembled {
        Some(_) => descriptor.total_chunks,
        None => state
            .tracker
            .peek(&descriptor.upload_id)
            .await
            .map(|r| r.len())
            .unwrap_or(0),
    };
    let completion_percentage = if descriptor.total_chunks == 0 {
        0.0
    } else {
        received as f64 / descriptor.total_chunks as f64 * 100.0
    };

    Ok(FileInfo {
        file_size: assembled.unwrap_or_else(|| descriptor.estimated_size()),
        status: (if assembled.is_some() { "complete" } else { "incomplete" }).to_string(),
        upload_id: descriptor.upload_id,
        filename: descriptor.filename,
        total_chunks: descriptor.total_chunks,
        received_chunks: received,
        upload_time,
        completion_percentage,
    })
}

pub async fn file_info(state: &AppState, upload_id: &str, share_id: Option<&str>) -> Result<FileInfo> {
    let descriptor = state.store.read(upload_id).await?;
    authorize(&descriptor, share_id)?;
    describe(state, descriptor).await
}

/// Every upload carrying `share_id`, newest first.
pub async fn list_files(state: &AppState, share_id: Option<&str>) -> Result<FileListResponse> {
    let share_id = share_id
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(TransferError::MissingShareId)?;

    let mut files = Vec::new();
    for upload_id in state.store.list().await? {
        let descriptor = match state.store.read(&upload_id).await {
            Ok(descriptor) if descriptor.share_id == share_id => descriptor,
            Ok(_) | Err(TransferError::SessionNotFound(_)) => continue,
            Err(e) => {
                tracing::warn!("Skipping unreadable session {}: {}", upload_id, e);
                continue;
            }
        };
        match describe(state, descriptor).await {
            Ok(info) => files.push(info),
            Err(e) => tracing::warn!("Skipping session {}: {}", upload_id, e),
        }
    }

    files.sort_by(|a, b| b.upload_time.cmp(&a.upload_time));
    tracing::debug!("Found {} files for share {}", files.len(), share_id);
    Ok(FileListResponse {
        count: files.len(),
        files,
    })
}

/// Path of an assembled artifact the caller may read.
pub async fn resolve_download(
    state: &AppState,
    upload_id: &str,
    filename: &str,
    share_id: Option<&str>,
) -> Result<PathBuf> {
    let descriptor = state.store.read(upload_id).await?;
    authorize(&descriptor, share_id)?;

    if sanitize_filename(filename) != descriptor.filename
        || !state.store.is_assembled(&descriptor).await
    {
        return Err(TransferError::FileNotFound(format!("{}/{}", upload_id, filename)));
    }
    Ok(state.store.artifact_path(&descriptor))
}
