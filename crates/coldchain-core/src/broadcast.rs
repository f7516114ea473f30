//! Live fan-out of decoded readings to attached subscribers.
//!
//! Every subscriber attached when a reading is published receives it.
//! Subscribers detach by dropping their [`Subscription`]; the registry entry
//! is removed at the same moment, so [`LiveBroadcaster::subscriber_count`]
//! never reports a subscriber that can no longer receive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use coldchain_types::Reading;

/// Default number of events buffered per subscriber.
pub const DEFAULT_CAPACITY: usize = 256;

/// Event delivered to subscribers: the routing key and the reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEvent {
    /// `warehouse/unit/{unitId}/sensor/{sensorKind}`.
    pub topic: String,
    pub message: Reading,
}

impl BroadcastEvent {
    pub fn new(reading: Reading) -> Self {
        Self {
            topic: reading.topic(),
            message: reading,
        }
    }
}

/// Registry entry for one attached subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberInfo {
    pub id: Uuid,
    /// Free-form description, e.g. the peer address.
    pub label: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub attached_at: OffsetDateTime,
}

type Registry = Arc<Mutex<HashMap<Uuid, SubscriberInfo>>>;

/// Fan-out hub for decoded readings.
#[derive(Debug, Clone)]
pub struct LiveBroadcaster {
    sender: broadcast::Sender<BroadcastEvent>,
    registry: Registry,
}

impl Default for LiveBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LiveBroadcaster {
    /// Create a broadcaster buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Attach a new subscriber.
    pub fn attach(&self, label: Option<String>) -> Subscription {
        let info = SubscriberInfo {
            id: Uuid::new_v4(),
            label,
            attached_at: OffsetDateTime::now_utc(),
        };
        let receiver = self.sender.subscribe();
        let count = {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry.insert(info.id, info.clone());
            registry.len()
        };
        info!(
            "Subscriber {} attached ({} total)",
            info.label.as_deref().unwrap_or("<anonymous>"),
            count
        );
        Subscription {
            info,
            receiver,
            registry: Arc::clone(&self.registry),
        }
    }

    /// Deliver a reading to every attached subscriber.
    ///
    /// Returns the number of subscribers the event was queued for. Zero
    /// subscribers is not an error.
    pub fn publish(&self, reading: &Reading) -> usize {
        self.sender
            .send(BroadcastEvent::new(reading.clone()))
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Registry entries, oldest attachment first.
    pub fn subscribers(&self) -> Vec<SubscriberInfo> {
        let mut list: Vec<SubscriberInfo> = self
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        list.sort_by_key(|s| s.attached_at);
        list
    }
}

/// Handle held by one subscriber. Dropping it detaches the subscriber.
#[derive(Debug)]
pub struct Subscription {
    info: SubscriberInfo,
    receiver: broadcast::Receiver<BroadcastEvent>,
    registry: Registry,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.info.id
    }

    pub fn info(&self) -> &SubscriberInfo {
        &self.info
    }

    /// Wait for the next event.
    ///
    /// A subscriber that falls behind skips the events it missed. Returns
    /// `None` once the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<BroadcastEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Subscriber {} lagged, skipped {} events", self.info.id, skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<BroadcastEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("Subscriber {} lagged, skipped {} events", self.info.id, skipped);
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let remaining = {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry.remove(&self.info.id);
            registry.len()
        };
        debug!(
            "Subscriber {} detached ({} remaining)",
            self.info.id, remaining
        );
    }
}
