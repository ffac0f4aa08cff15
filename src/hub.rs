//! In-memory publish/subscribe fan-out keyed by upload id or share id.
//!
//! Every subscriber owns a bounded queue. Publishing never waits: a full
//! queue loses that one message for that one subscriber.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::Stream;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

pub type Message = Arc<str>;

pub struct BroadcastHub {
    name: &'static str,
    capacity: usize,
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<String, HashMap<u64, mpsc::Sender<Message>>>>,
}

impl BroadcastHub {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(self: &Arc<Self>, key: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .entry(key.to_string())
            .or_default()
            .insert(id, tx);
        tracing::debug!("{} hub: subscriber {} joined {}", self.name, id, key);

        Subscription {
            hub: Arc::clone(self),
            key: key.to_string(),
            id,
            rx,
        }
    }

    pub fn unsubscribe(&self, key: &str, id: u64) {
        let mut subscribers = self.subscribers.write();
        if let Some(channels) = subscribers.get_mut(key) {
            channels.remove(&id);
            if channels.is_empty() {
                subscribers.remove(key);
            }
        }
        drop(subscribers);
        tracing::debug!("{} hub: subscriber {} left {}", self.name, id, key);
    }

    /// Serialize `event` once and hand a copy to every subscriber of `key`.
    /// Returns how many subscribers accepted it.
    pub fn publish<E: Serialize>(&self, key: &str, event: &E) -> usize {
        let message: Message = match serde_json::to_string(event) {
            Ok(json) => json.into(),
            Err(e) => {
                tracing::error!("{} hub: failed to serialize event for {}: {}", self.name, key, e);
                return 0;
            }
        };

        // snapshot under the lock, deliver after releasing it
        let targets: Vec<(u64, mpsc::Sender<Message>)> = match self.subscribers.read().get(key) {
            Some(channels) => channels.iter().map(|(id, tx)| (*id, tx.clone())).collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for (id, tx) in targets {
            match tx.try_send(Arc::clone(&message)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::trace!("{} hub: subscriber {} of {} is full, dropping", self.name, id, key);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::trace!("{} hub: subscriber {} of {} already gone", self.name, id, key);
                }
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.subscribers.read().get(key).map_or(0, HashMap::len)
    }

    pub fn key_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

/// A live registration. Dropping it unregisters from the hub.
pub struct Subscription {
    hub: Arc<BroadcastHub>,
    key: String,
    id: u64,
    rx: mpsc::Receiver<Message>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// The subscription as a stream; dropping the stream unsubscribes.
    pub fn into_stream(self) -> impl Stream<Item = Message> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            let message = sub.recv().await?;
            Some((message, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.key, self.id);
    }
}
