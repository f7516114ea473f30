//! Background collector: MQTT transport feeding the ingestion pipeline.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use coldchain_core::{
    AggregationBuffer, BoundsSynchronizer, BufferStats, HttpAlertChannel, HttpBoundsTarget,
    LiveBroadcaster, Pipeline, PipelineMetrics, StaticSafeRanges, ThresholdAlerter,
};
use coldchain_store::Store;
use coldchain_types::ConnectionState;

use crate::config::Config;
use crate::sink::StoreSink;
use crate::state::AppState;
use crate::transport::{TransportClient, TransportError, TransportHandle, TransportOptions};

/// Collector errors.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("Failed to set up MQTT transport: {0}")]
    Transport(#[from] TransportError),
    #[error("Failed to set up pipeline: {0}")]
    Pipeline(#[from] coldchain_core::Error),
}

/// Builds and starts the transport and pipeline tasks.
pub struct Collector {
    config: Config,
    store: Arc<Mutex<Store>>,
    broadcaster: LiveBroadcaster,
    metrics: Arc<PipelineMetrics>,
    sync_enabled: bool,
}

impl Collector {
    /// Create a collector sharing the store, broadcaster and metrics of `state`.
    pub fn new(state: &AppState) -> Self {
        Self {
            config: state.config.clone(),
            store: Arc::clone(&state.store),
            broadcaster: state.broadcaster.clone(),
            metrics: Arc::clone(&state.metrics),
            sync_enabled: true,
        }
    }

    /// Compute bounds on flush but never push them.
    #[must_use]
    pub fn without_sync(mut self) -> Self {
        self.sync_enabled = false;
        self
    }

    /// Assemble the pipeline from configuration.
    pub fn build_pipeline(&self) -> Result<Pipeline, CollectorError> {
        let mut pipeline = Pipeline::new(self.config.pipeline_options(), self.broadcaster.clone())
            .with_metrics(Arc::clone(&self.metrics))
            .with_sink(Arc::new(StoreSink::new(Arc::clone(&self.store))));

        let sync = &self.config.sync;
        match (&sync.endpoint, self.sync_enabled) {
            (Some(endpoint), true) => {
                let policy = sync.retry_policy();
                policy.validate()?;
                let target = HttpBoundsTarget::new(endpoint, Duration::from_secs(sync.timeout))?;
                info!(
                    "Bounds sync to {} (up to {} attempts)",
                    target.endpoint(),
                    policy.max_attempts()
                );
                pipeline =
                    pipeline.with_synchronizer(BoundsSynchronizer::new(Arc::new(target), policy));
            }
            (Some(_), false) => info!("Bounds sync disabled"),
            (None, _) => info!("No sync endpoint configured, bounds will only be logged"),
        }

        let alerts = &self.config.alerts;
        if let Some(endpoint) = &alerts.endpoint {
            if alerts.units.is_empty() {
                warn!("Alert endpoint configured but no unit safe ranges are defined");
            }
            let channel = HttpAlertChannel::new(endpoint, alerts.timeout())?;
            let ranges = StaticSafeRanges::new(alerts.units.iter().cloned());
            info!(
                "Threshold alerts to {} for {} unit(s)",
                channel.url(),
                ranges.len()
            );
            pipeline =
                pipeline.with_alerter(ThresholdAlerter::new(Arc::new(ranges), Arc::new(channel)));
        }

        Ok(pipeline)
    }

    /// Start the transport and pipeline tasks.
    ///
    /// Both stop when `cancel` fires.
    pub fn start(self, cancel: CancellationToken) -> Result<RunningCollector, CollectorError> {
        let options = TransportOptions::from_config(&self.config.mqtt)?;
        let pipeline = self.build_pipeline()?;

        let client = TransportClient::new(options);
        let transport = client.handle();
        let connection = client.state();
        let buffer_stats = pipeline.buffer_stats();

        let (tx, rx) = mpsc::channel(self.config.mqtt.channel_capacity.max(1));
        let transport_task = tokio::spawn(client.run(tx, cancel.clone()));
        let pipeline_task = tokio::spawn(pipeline.run(rx, cancel));

        info!("Collector started");

        Ok(RunningCollector {
            transport,
            connection,
            buffer_stats,
            transport_task,
            pipeline_task,
        })
    }
}

/// Handles to a started collector.
pub struct RunningCollector {
    transport: TransportHandle,
    connection: watch::Receiver<ConnectionState>,
    buffer_stats: watch::Receiver<BufferStats>,
    transport_task: JoinHandle<()>,
    pipeline_task: JoinHandle<AggregationBuffer>,
}

impl RunningCollector {
    pub fn transport(&self) -> TransportHandle {
        self.transport.clone()
    }

    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    pub fn buffer_stats(&self) -> watch::Receiver<BufferStats> {
        self.buffer_stats.clone()
    }

    /// Wait for both tasks to finish after cancellation.
    ///
    /// Returns the aggregation buffer as it stood at shutdown.
    pub async fn join(self) -> Option<AggregationBuffer> {
        if let Err(e) = self.transport_task.await {
            warn!("MQTT transport task failed: {}", e);
        }
        match self.pipeline_task.await {
            Ok(buffer) => {
                if !buffer.is_empty() {
                    info!(
                        "{} buffered readings were not flushed before shutdown",
                        buffer.len()
                    );
                }
                Some(buffer)
            }
            Err(e) => {
                warn!("Pipeline task failed: {}", e);
                None
            }
        }
    }
}
