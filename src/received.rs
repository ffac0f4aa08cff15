//! Received-set tracker: which chunk indices of a session are durably on disk.
//!
//! Every read-modify-write of `received.json` runs under a per-session mutex
//! created on first use. The same per-session entry carries a gate that
//! ingestion takes shared and assembly/cleanup take exclusive.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::fs;
use tokio::sync::{Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::error::{Result, TransferError};
use crate::store::{write_atomic, SessionStore, HASH_SUFFIX};

#[derive(Debug, Default)]
pub struct SessionLock {
    gate: Arc<RwLock<()>>,
    received: Mutex<()>,
}

pub struct ReceivedTracker {
    store: SessionStore,
    locks: DashMap<String, Arc<SessionLock>>,
}

impl ReceivedTracker {
    pub fn new(store: SessionStore) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, upload_id: &str) -> Arc<SessionLock> {
        // clone the Arc out so no map shard guard is held across an await
        self.locks
            .entry(upload_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Shared access to a session: many chunk writers at once.
    pub async fn enter_shared(&self, upload_id: &str) -> OwnedRwLockReadGuard<()> {
        self.lock_for(upload_id).gate.clone().read_owned().await
    }

    /// Exclusive access to a session: no chunk lands while this is held.
    pub async fn enter_exclusive(&self, upload_id: &str) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(upload_id).gate.clone().write_owned().await
    }

    /// Drop the lock entry of a retired session. Call while holding its
    /// exclusive gate so every waiter re-validates against the new disk state.
    pub fn forget(&self, upload_id: &str) {
        self.locks.remove(upload_id);
    }

    /// Pass through a descriptor read taken under the gate, dropping the lock
    /// entry when the session turned out to be gone.
    pub fn revalidate<T>(&self, upload_id: &str, read: Result<T>) -> Result<T> {
        if let Err(TransferError::SessionNotFound(_)) = &read {
            self.forget(upload_id);
        }
        read
    }

    pub fn tracked_sessions(&self) -> usize {
        self.locks.len()
    }

    /// Record `index`. Returns `true` if it was not present before.
    pub async fn append(&self, upload_id: &str, index: usize) -> Result<bool> {
        let lock = self.lock_for(upload_id);
        let _guard = lock.received.lock().await;

        let path = self.store.received_path(upload_id);
        let mut set = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<usize>>(&bytes) {
                Ok(list) => list.into_iter().collect::<BTreeSet<_>>(),
                Err(e) => {
                    tracing::warn!(
                        "Corrupt received set for upload {} ({}), rebuilding from chunks on disk",
                        upload_id,
                        e
                    );
                    self.scan_chunks(upload_id).await?
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => {
                return Err(TransferError::storage(
                    format!("failed to read received set {:?}", path),
                    e,
                ));
            }
        };

        if !set.insert(index) {
            return Ok(false);
        }

        let list: Vec<usize> = set.into_iter().collect();
        let body = serde_json::to_vec(&list).map_err(|source| TransferError::CorruptMetadata {
            upload_id: upload_id.to_string(),
            source,
        })?;
        write_atomic(&path, &body).await?;
        Ok(true)
    }

    /// Current set, sorted ascending.
    pub async fn read(&self, upload_id: &str) -> Result<Vec<usize>> {
        let lock = self.lock_for(upload_id);
        let _guard = lock.received.lock().await;
        self.load(upload_id).await
    }

    /// Lock-free read for observers that tolerate staleness. The tracker file
    /// is only ever replaced by rename, so this never sees a torn write.
    pub async fn peek(&self, upload_id: &str) -> Result<Vec<usize>> {
        self.load(upload_id).await
    }

    async fn load(&self, upload_id: &str) -> Result<Vec<usize>> {
        let path = self.store.received_path(upload_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(TransferError::SessionNotFound(upload_id.to_string()));
            }
            Err(e) => {
                return Err(TransferError::storage(
                    format!("failed to read received set {:?}", path),
                    e,
                ));
            }
        };

        match serde_json::from_slice::<Vec<usize>>(&bytes) {
            Ok(list) => Ok(list
                .into_iter()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()),
            Err(e) => {
                tracing::warn!("Corrupt received set for upload {}: {}", upload_id, e);
                Ok(self.scan_chunks(upload_id).await?.into_iter().collect())
            }
        }
    }

    /// Delete the tracker file; already gone is fine.
    pub async fn remove(&self, upload_id: &str) -> Result<()> {
        let lock = self.lock_for(upload_id);
        let _guard = lock.received.lock().await;

        let path = self.store.received_path(upload_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TransferError::storage(
                format!("failed to delete received set {:?}", path),
                e,
            )),
        }
    }

    // indices whose chunk artifact and hash side-car are both present
    async fn scan_chunks(&self, upload_id: &str) -> Result<BTreeSet<usize>> {
        let dir = self.store.chunks_dir(upload_id);
        let mut found = BTreeSet::new();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(found),
            Err(e) => {
                return Err(TransferError::storage(
                    format!("failed to scan chunks in {:?}", dir),
                    e,
                ))
            }
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| TransferError::storage(format!("failed to scan chunks in {:?}", dir), e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(index) = name
                .strip_prefix("chunk_")
                .and_then(|rest| rest.strip_suffix(&format!(".{}", HASH_SUFFIX)))
                .and_then(|digits| digits.parse::<usize>().ok())
            else {
                continue;
            };
            if fs::try_exists(self.store.chunk_path(upload_id, index))
                .await
                .unwrap_or(false)
            {
                found.insert(index);
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewSession;

    async fn setup(total_chunks: usize) -> (tempfile::TempDir, Arc<ReceivedTracker>) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store
            .create(NewSession {
                upload_id: "s".into(),
                filename: "f.bin".into(),
                total_chunks,
                ..Default::default()
            })
            .await
            .unwrap();
        (dir, Arc::new(ReceivedTracker::new(store)))
    }

    #[tokio::test]
    async fn append_keeps_set_sorted_and_deduplicated() {
        let (_dir, tracker) = setup(8).await;

        assert!(tracker.append("s", 5).await.unwrap());
        assert!(tracker.append("s", 1).await.unwrap());
        assert!(!tracker.append("s", 5).await.unwrap());
        assert!(tracker.append("s", 3).await.unwrap());

        assert_eq!(tracker.read("s").await.unwrap(), vec![1, 3, 5]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_lose_nothing() {
        let (_dir, tracker) = setup(64).await;

        let mut handles = Vec::new();
        for i in 0..64 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move { tracker.append("s", i).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(tracker.read("s").await.unwrap(), (0..64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn read_without_tracker_file_is_not_found() {
        let (_dir, tracker) = setup(2).await;
        tracker.remove("s").await.unwrap();
        // removing twice is fine
        tracker.remove("s").await.unwrap();

        let err = tracker.read("s").await.unwrap_err();
        assert!(matches!(err, TransferError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn corrupt_tracker_is_rebuilt_from_chunks() {
        let (dir, tracker) = setup(4).await;
        let chunks = dir.path().join("s").join("chunks");
        std::fs::write(chunks.join("chunk_000002"), b"x").unwrap();
        std::fs::write(chunks.join("chunk_000002.xxhash"), b"abc").unwrap();
        // artifact without side-car is not trusted
        std::fs::write(chunks.join("chunk_000003"), b"y").unwrap();
        std::fs::write(dir.path().join("s").join("received.json"), b"{not json").unwrap();

        assert_eq!(tracker.read("s").await.unwrap(), vec![2]);
        assert!(tracker.append("s", 0).await.unwrap());
        assert_eq!(tracker.read("s").await.unwrap(), vec![0, 2]);
    }

    #[tokio::test]
    async fn forget_drops_lock_entry() {
        let (_dir, tracker) = setup(1).await;
        tracker.append("s", 0).await.unwrap();
        assert_eq!(tracker.tracked_sessions(), 1);
        tracker.forget("s");
        assert_eq!(tracker.tracked_sessions(), 0);
    }
}
