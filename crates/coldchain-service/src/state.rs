//! Application state shared across handlers.
//!
//! # Live Broadcast
//!
//! [`AppState::broadcaster`] is the same [`LiveBroadcaster`] the pipeline
//! publishes into. Each WebSocket connection attaches its own subscription;
//! a subscriber that falls more than `server.broadcast_buffer` events behind
//! loses the oldest ones instead of slowing ingestion down.

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;

use coldchain_core::{BufferStats, LiveBroadcaster, PipelineMetrics};
use coldchain_store::Store;
use coldchain_types::ConnectionState;

use crate::config::Config;
use crate::transport::TransportHandle;

/// Shared application state.
pub struct AppState {
    /// The reading store (shared with the persistence sink).
    pub store: Arc<Mutex<Store>>,
    /// Configuration the service was started with.
    pub config: Config,
    /// Fan-out of decoded readings to live subscribers.
    pub broadcaster: LiveBroadcaster,
    /// Pipeline counters.
    pub metrics: Arc<PipelineMetrics>,
    /// Occupancy of the aggregation buffer.
    pub buffer_stats: watch::Receiver<BufferStats>,
    /// MQTT connection state.
    pub connection: watch::Receiver<ConnectionState>,
    /// Publishing handle, present while the transport runs.
    pub transport: Option<TransportHandle>,
    /// Fired when the service shuts down.
    pub shutdown: CancellationToken,
    started_at: OffsetDateTime,
}

impl AppState {
    /// Create state with no running collector.
    ///
    /// The broadcast capacity comes from `config.server.broadcast_buffer`.
    pub fn new(store: Arc<Mutex<Store>>, config: Config) -> Self {
        let broadcaster = LiveBroadcaster::new(config.server.broadcast_buffer);
        let (_, buffer_stats) = watch::channel(BufferStats::default());
        let (_, connection) = watch::channel(ConnectionState::Offline);
        Self {
            store,
            config,
            broadcaster,
            metrics: Arc::new(PipelineMetrics::new()),
            buffer_stats,
            connection,
            transport: None,
            shutdown: CancellationToken::new(),
            started_at: OffsetDateTime::now_utc(),
        }
    }

    /// Attach the running collector's live views.
    #[must_use]
    pub fn with_collector(mut self, collector: &crate::collector::RunningCollector) -> Self {
        self.buffer_stats = collector.buffer_stats();
        self.connection = collector.connection();
        self.transport = Some(collector.transport());
        self
    }

    /// Current MQTT connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn started_at(&self) -> OffsetDateTime {
        self.started_at
    }

    /// Whole seconds since the state was created.
    pub fn uptime_seconds(&self) -> u64 {
        (OffsetDateTime::now_utc() - self.started_at)
            .whole_seconds()
            .max(0) as u64
    }

    /// Wrap in an `Arc` for sharing with handlers.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coldchain_core::{Reading, SensorKind};

    fn test_state() -> AppState {
        let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        AppState::new(store, Config::default())
    }

    #[tokio::test]
    async fn test_app_state_new() {
        let state = test_state();
        assert_eq!(state.config.server.bind, "127.0.0.1:8080");
        assert_eq!(state.connection_state(), ConnectionState::Offline);
        assert!(state.transport.is_none());
        assert!(!state.shutdown.is_cancelled());
        assert_eq!(state.buffer_stats.borrow().buffered, 0);
        assert!(state.started_at() <= OffsetDateTime::now_utc());

        let store = state.store.lock().await;
        assert_eq!(store.count_readings(None).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_broadcaster_reaches_subscribers() {
        let state = test_state();
        let mut subscription = state.broadcaster.attach(Some("test".to_string()));
        assert_eq!(state.broadcaster.subscriber_count(), 1);

        let reading = Reading::new("3", SensorKind::Temperature, 4.0, OffsetDateTime::now_utc());
        assert_eq!(state.broadcaster.publish(&reading), 1);

        let event = subscription.recv().await.unwrap();
        assert_eq!(event.topic, "warehouse/unit/3/sensor/temperature");
        assert_eq!(event.message, reading);

        drop(subscription);
        assert_eq!(state.broadcaster.subscriber_count(), 0);
    }
}
