//! Durable session descriptors and the on-disk layout of a session directory.
//!
//! ```text
//! <root>/<upload_id>/metadata.json
//! <root>/<upload_id>/received.json
//! <root>/<upload_id>/chunks/chunk_000042{,.xxhash}
//! <root>/<upload_id>/<filename>            assembled artifact
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::error::{Result, TransferError};
use crate::models::{NewSession, SessionDescriptor};
use crate::utils::{generate_share_id, is_valid_upload_id, sanitize_filename};

pub const METADATA_FILE: &str = "metadata.json";
pub const RECEIVED_FILE: &str = "received.json";
pub const CHUNKS_DIR: &str = "chunks";

/// Suffix of the side-car file holding a chunk's content hash.
pub const HASH_SUFFIX: &str = "xxhash";

const RESERVED_NAMES: [&str; 3] = [METADATA_FILE, RECEIVED_FILE, CHUNKS_DIR];

/// Default ceiling on `total_chunks` for a new session.
pub const DEFAULT_MAX_CHUNKS: usize = 1_000_000;

#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
    max_chunks: usize,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_chunks: DEFAULT_MAX_CHUNKS,
        }
    }

    pub fn with_max_chunks(mut self, max_chunks: usize) -> Self {
        self.max_chunks = max_chunks.max(1);
        self
    }

    pub fn session_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(upload_id)
    }

    pub fn metadata_path(&self, upload_id: &str) -> PathBuf {
        self.session_dir(upload_id).join(METADATA_FILE)
    }

    pub fn received_path(&self, upload_id: &str) -> PathBuf {
        self.session_dir(upload_id).join(RECEIVED_FILE)
    }

    pub fn chunks_dir(&self, upload_id: &str) -> PathBuf {
        self.session_dir(upload_id).join(CHUNKS_DIR)
    }

    pub fn chunk_path(&self, upload_id: &str, index: usize) -> PathBuf {
        self.chunks_dir(upload_id).join(format!("chunk_{:06}", index))
    }

    pub fn chunk_hash_path(&self, upload_id: &str, index: usize) -> PathBuf {
        self.chunks_dir(upload_id)
            .join(format!("chunk_{:06}.{}", index, HASH_SUFFIX))
    }

    pub fn artifact_path(&self, descriptor: &SessionDescriptor) -> PathBuf {
        self.session_dir(&descriptor.upload_id)
            .join(&descriptor.filename)
    }

    /// Persist a new descriptor and an empty received-set.
    pub async fn create(&self, request: NewSession) -> Result<SessionDescriptor> {
        let descriptor = self.validate(request)?;
        let dir = self.session_dir(&descriptor.upload_id);

        // create_dir (not create_dir_all) doubles as the existence check
        match fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(TransferError::AlreadyExists(descriptor.upload_id));
            }
            Err(e) => {
                return Err(TransferError::storage(
                    format!("failed to create session directory {:?}", dir),
                    e,
                ));
            }
        }

        if let Err(e) = self.write_initial_state(&descriptor).await {
            // don't leave a half-created session behind
            let _ = fs::remove_dir_all(&dir).await;
            return Err(e);
        }

        tracing::debug!("Persisted descriptor for upload {}", descriptor.upload_id);
        Ok(descriptor)
    }

    async fn write_initial_state(&self, descriptor: &SessionDescriptor) -> Result<()> {
        let upload_id = &descriptor.upload_id;
        let chunks_dir = self.chunks_dir(upload_id);
        fs::create_dir(&chunks_dir).await.map_err(|e| {
            TransferError::storage(format!("failed to create chunks directory {:?}", chunks_dir), e)
        })?;

        let body = serde_json::to_vec_pretty(descriptor).map_err(|source| {
            TransferError::CorruptMetadata {
                upload_id: upload_id.clone(),
                source,
            }
        })?;
        write_atomic(&self.metadata_path(upload_id), &body).await?;
        write_atomic(&self.received_path(upload_id), b"[]").await
    }

    fn validate(&self, request: NewSession) -> Result<SessionDescriptor> {
        if !is_valid_upload_id(&request.upload_id) {
            return Err(TransferError::InvalidDescriptor(
                "upload_id must be 1-128 characters of [A-Za-z0-9_-]".to_string(),
            ));
        }
        if request.total_chunks == 0 {
            return Err(TransferError::InvalidDescriptor(
                "total_chunks must be positive".to_string(),
            ));
        }
        if request.total_chunks > self.max_chunks {
            return Err(TransferError::InvalidDescriptor(format!(
                "total_chunks {} exceeds the limit of {}",
                request.total_chunks, self.max_chunks
            )));
        }
        if (request.total_chunks as u64)
            .checked_mul(request.chunk_size)
            .is_none()
        {
            return Err(TransferError::InvalidDescriptor(
                "total_chunks * chunk_size overflows".to_string(),
            ));
        }

        let filename = sanitize_filename(&request.filename);
        if filename.is_empty() {
            return Err(TransferError::InvalidDescriptor(
                "filename is empty after sanitizing".to_string(),
            ));
        }
        if RESERVED_NAMES.contains(&filename.as_str()) || filename.ends_with(".part") {
            return Err(TransferError::InvalidDescriptor(format!(
                "filename {:?} is reserved",
                filename
            )));
        }

        let chunk_hashes = match request.chunk_hashes {
            Some(hashes) if hashes.len() == request.total_chunks => hashes
                .into_iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .collect(),
            Some(hashes) => {
                tracing::warn!(
                    "Ignoring {} chunk hashes for upload {} with {} chunks",
                    hashes.len(),
                    request.upload_id,
                    request.total_chunks
                );
                Vec::new()
            }
            None => Vec::new(),
        };

        let share_id = request
            .share_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(generate_share_id);

        Ok(SessionDescriptor {
            upload_id: request.upload_id,
            filename,
            total_chunks: request.total_chunks,
            chunk_size: request.chunk_size,
            chunk_hashes,
            file_hash: request
                .file_hash
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty()),
            share_id,
        })
    }

    pub async fn read(&self, upload_id: &str) -> Result<SessionDescriptor> {
        if !is_valid_upload_id(upload_id) {
            return Err(TransferError::SessionNotFound(upload_id.to_string()));
        }
        let path = self.metadata_path(upload_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(TransferError::SessionNotFound(upload_id.to_string()));
            }
            Err(e) => {
                return Err(TransferError::storage(
                    format!("failed to read metadata {:?}", path),
                    e,
                ));
            }
        };
        serde_json::from_slice(&bytes).map_err(|source| TransferError::CorruptMetadata {
            upload_id: upload_id.to_string(),
            source,
        })
    }

    pub async fn exists(&self, upload_id: &str) -> bool {
        is_valid_upload_id(upload_id) && fs::try_exists(self.metadata_path(upload_id)).await.unwrap_or(false)
    }

    /// size of the assembled artifact, `None` while the upload is in flight
    pub async fn assembled_size(&self, descriptor: &SessionDescriptor) -> Option<u64> {
        fs::metadata(self.artifact_path(descriptor))
            .await
            .ok()
            .filter(|m| m.is_file())
            .map(|m| m.len())
    }

    pub async fn is_assembled(&self, descriptor: &SessionDescriptor) -> bool {
        self.assembled_size(descriptor).await.is_some()
    }

    /// Names of every directory under the storage root.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(TransferError::StorageUnavailable)?;

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(TransferError::StorageUnavailable)?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if is_valid_upload_id(&name) {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Delete a whole session directory.
    pub async fn remove(&self, upload_id: &str) -> Result<()> {
        let dir = self.session_dir(upload_id);
        fs::remove_dir_all(&dir).await.map_err(|e| {
            TransferError::storage(format!("failed to delete session directory {:?}", dir), e)
        })
    }
}

/// write to a sibling temp file, fsync, then rename over `path`
pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    let result = async {
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&tmp, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp).await;
        return Err(TransferError::storage(format!("failed to write {:?}", path), e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(upload_id: &str, filename: &str, total_chunks: usize) -> NewSession {
        NewSession {
            upload_id: upload_id.to_string(),
            filename: filename.to_string(),
            total_chunks,
            chunk_size: 4,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_then_read_round_trips_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        let created = store.create(request("u1", "report.pdf", 3)).await.unwrap();
        assert_eq!(created.share_id.len(), 32);

        let read = store.read("u1").await.unwrap();
        assert_eq!(read, created);
        assert!(store.chunks_dir("u1").is_dir());
        assert_eq!(std::fs::read_to_string(store.received_path("u1")).unwrap(), "[]");
        assert!(store.exists("u1").await);
        assert!(!store.exists("u2").await);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        store.create(request("dup", "a.txt", 1)).await.unwrap();
        let err = store.create(request("dup", "b.txt", 1)).await.unwrap_err();
        assert!(matches!(err, TransferError::AlreadyExists(_)));
        // first descriptor untouched
        assert_eq!(store.read("dup").await.unwrap().filename, "a.txt");
    }

    #[tokio::test]
    async fn wrong_length_chunk_hashes_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        let mut req = request("h", "a.bin", 3);
        req.chunk_hashes = Some(vec!["aa".into(), "bb".into()]);
        let created = store.create(req).await.unwrap();
        assert!(created.chunk_hashes.is_empty());
        assert_eq!(created.expected_chunk_hash(0), None);
    }

    #[tokio::test]
    async fn invalid_descriptors_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());

        for req in [
            request("../escape", "a.txt", 1),
            request("ok", "a.txt", 0),
            request("ok", "///", 1),
            request("ok", "metadata.json", 1),
            request("ok", "chunks", 1),
            request("ok", "a.txt", DEFAULT_MAX_CHUNKS + 1),
            NewSession {
                chunk_size: u64::MAX,
                ..request("ok", "a.txt", 2)
            },
        ] {
            let err = store.create(req).await.unwrap_err();
            assert!(matches!(err, TransferError::InvalidDescriptor(_)), "{err:?}");
        }
        assert!(!store.session_dir("ok").exists());
    }

    #[tokio::test]
    async fn read_missing_session_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let err = store.read("ghost").await.unwrap_err();
        assert!(matches!(err, TransferError::SessionNotFound(_)));
    }
}
