//! Rooms: every upload sharing a share id, its live event feed, and a
//! rolling expiry clock kept in memory only.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tokio::fs;

use crate::error::{Result, TransferError};
use crate::hub::{BroadcastHub, Subscription};
use crate::models::{
    percent, ActiveUpload, CompletedFile, RoomEvent, RoomEventKind, RoomState, SessionDescriptor,
};
use crate::received::ReceivedTracker;
use crate::store::SessionStore;
use crate::utils::to_utc;

pub struct RoomService {
    hub: Arc<BroadcastHub>,
    expiry: DashMap<String, DateTime<Utc>>,
    window: chrono::Duration,
}

impl RoomService {
    pub fn new(window: Duration, subscriber_buffer: usize) -> Self {
        Self {
            hub: Arc::new(BroadcastHub::new("room", subscriber_buffer)),
            expiry: DashMap::new(),
            window: chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::hours(24)),
        }
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn subscribe(&self, share_id: &str) -> Subscription {
        self.hub.subscribe(share_id)
    }

    /// Restart the expiry window for a room.
    pub fn touch(&self, share_id: &str) -> DateTime<Utc> {
        let expires_at = self.window_from_now();
        self.expiry.insert(share_id.to_string(), expires_at);
        expires_at
    }

    /// Current expiry, opening a fresh window for a room never seen before.
    pub fn expiry(&self, share_id: &str) -> DateTime<Utc> {
        *self
            .expiry
            .entry(share_id.to_string())
            .or_insert_with(|| self.window_from_now())
            .value()
    }

    fn window_from_now(&self) -> DateTime<Utc> {
        Utc::now()
            .checked_add_signed(self.window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn publish(&self, event: &RoomEvent) -> usize {
        self.hub.publish(&event.share_id, event)
    }

    pub fn notify_upload_start(&self, descriptor: &SessionDescriptor) -> usize {
        self.touch(&descriptor.share_id);
        self.publish(
            &RoomEvent::new(RoomEventKind::UploadStart, &descriptor.share_id)
                .upload(&descriptor.upload_id)
                .filename(&descriptor.filename)
                .data(json!({ "total_chunks": descriptor.total_chunks })),
        )
    }

    pub fn notify_chunk_received(&self, descriptor: &SessionDescriptor, received: usize) -> usize {
        let total = descriptor.total_chunks;
        self.publish(
            &RoomEvent::new(RoomEventKind::ChunkReceived, &descriptor.share_id)
                .upload(&descriptor.upload_id)
                .filename(&descriptor.filename)
                .data(json!({
                    "received_chunks": received,
                    "total_chunks": total,
                    "percent": percent(received, total),
                })),
        )
    }

    pub fn notify_upload_complete(&self, descriptor: &SessionDescriptor, file_size: u64) -> usize {
        self.publish(
            &RoomEvent::new(RoomEventKind::UploadComplete, &descriptor.share_id)
                .upload(&descriptor.upload_id)
                .filename(&descriptor.filename)
                .data(json!({ "file_size": file_size })),
        )
    }

    pub fn room_state_event(state: &RoomState) -> RoomEvent {
        let data = serde_json::to_value(state).unwrap_or_default();
        RoomEvent::new(RoomEventKind::RoomState, &state.share_id).data(data)
    }

    /// Scan every session on disk and build the view for `share_id`.
    ///
    /// Only a failure to list the storage root is an error. Sessions that
    /// cannot be read are skipped.
    pub async fn state(
        &self,
        store: &SessionStore,
        tracker: &ReceivedTracker,
        share_id: &str,
    ) -> Result<RoomState> {
        let mut active_uploads = Vec::new();
        let mut completed_files = Vec::new();
        let mut last_updated: Option<DateTime<Utc>> = None;

        for upload_id in store.list().await? {
            let descriptor = match store.read(&upload_id).await {
                Ok(descriptor) => descriptor,
                // stray directory without metadata
                Err(TransferError::SessionNotFound(_)) => continue,
                Err(e) => {
                    tracing::warn!("Skipping unreadable session {} in room scan: {}", upload_id, e);
                    continue;
                }
            };
            if descriptor.share_id != share_id {
                continue;
            }

            let started_at = match fs::metadata(store.metadata_path(&upload_id))
                .await
                .and_then(|m| m.modified())
            {
                Ok(t) => to_utc(t),
                Err(e) => {
                    tracing::warn!("Skipping session {} with unreadable timestamps: {}", upload_id, e);
                    continue;
                }
            };
            let mut touched = started_at;

            match fs::metadata(store.artifact_path(&descriptor)).await {
                Ok(meta) if meta.is_file() => {
                    let completed_at = meta.modified().map(to_utc).unwrap_or(started_at);
                    touched = touched.max(completed_at);
                    completed_files.push(CompletedFile {
                        upload_id,
                        filename: descriptor.filename,
                        file_size: meta.len(),
                        completed_at,
                    });
                }
                _ => {
                    if let Ok(t) = fs::metadata(store.received_path(&upload_id))
                        .await
                        .and_then(|m| m.modified())
                    {
                        touched = touched.max(to_utc(t));
                    }
                    let received = tracker.peek(&upload_id).await.map(|r| r.len()).unwrap_or(0);
                    active_uploads.push(ActiveUpload {
                        upload_id,
                        filename: descriptor.filename,
                        total_chunks: descriptor.total_chunks,
                        received_chunks: received,
                        completion_percent: percent(received, descriptor.total_chunks),
                        started_at,
                    });
                }
            }

            last_updated = Some(last_updated.map_or(touched, |prev| prev.max(touched)));
        }

        active_uploads.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        completed_files.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));

        let expires_at = self.expiry(share_id);
        let expires_in = (expires_at - Utc::now()).num_seconds().max(0);

        Ok(RoomState {
            share_id: share_id.to_string(),
            active_uploads,
            completed_files,
            last_updated,
            expires_at,
            expires_in,
        })
    }
}
