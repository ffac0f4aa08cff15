use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use xxhash_rust::xxh64::xxh64;
use tokio::fs;

// strip everything that could escape the session directory
pub fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    cleaned.trim_start_matches('.').to_string()
}

/// upload ids name directories, so only a conservative alphabet is accepted
pub fn is_valid_upload_id(upload_id: &str) -> bool {
    !upload_id.is_empty()
        && upload_id.len() <= 128
        && upload_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
}

/// fresh share token: 16 random bytes as 32 hex chars
pub fn generate_share_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// seed shared with clients computing declared hashes
pub const HASH_SEED: u64 = 0;

/// xxh64 of a buffer as 16 lowercase hex chars
pub fn content_hash(data: &[u8]) -> String {
    format_hash(xxh64(data, HASH_SEED))
}

pub fn format_hash(digest: u64) -> String {
    format!("{:016x}", digest)
}

/// rename `src` onto `dst`, falling back to copy + delete when rename fails
/// (e.g. across filesystems)
pub async fn move_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    match fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::debug!("rename {:?} -> {:?} failed ({}), copying instead", src, dst, e);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::copy(src, dst).await?;
            fs::remove_file(src).await
        }
    }
}

pub fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

/// wait for ctrl-c or sigterm
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("🛑 Shutdown signal received, draining connections");
}
