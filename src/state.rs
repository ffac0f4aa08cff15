use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::hub::BroadcastHub;
use crate::received::ReceivedTracker;
use crate::room::RoomService;
use crate::store::SessionStore;

/// shared application state, built once at startup
pub struct AppState {
    pub store: SessionStore,
    pub tracker: ReceivedTracker,
    /// per-upload progress feed
    pub progress: Arc<BroadcastHub>,
    pub rooms: RoomService,
    /// per-request ceiling for chunk bodies
    pub max_upload_size: u64,
    pub heartbeat_interval: Duration,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        let store = SessionStore::new(config.storage_root.clone()).with_max_chunks(config.max_chunks);
        Self {
            tracker: ReceivedTracker::new(store.clone()),
            store,
            progress: Arc::new(BroadcastHub::new("progress", config.subscriber_buffer)),
            rooms: RoomService::new(config.room_expiry, config.subscriber_buffer),
            max_upload_size: config.max_upload_size as u64,
            heartbeat_interval: config.heartbeat_interval,
        }
    }

    /// state over `storage_root` with every other setting at its default
    pub fn with_root(storage_root: impl Into<PathBuf>) -> Self {
        Self::new(&Config {
            storage_root: storage_root.into(),
            ..Config::default()
        })
    }
}
