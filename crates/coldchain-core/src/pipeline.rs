//! The ingestion pipeline.
//!
//! A single consumer task owns the [`AggregationBuffer`] and processes
//! transport messages one at a time, in arrival order:
//!
//! 1. decode (malformed messages are dropped and logged)
//! 2. hand the reading to the persistence worker (bounded queue, never blocks)
//! 3. broadcast it to live subscribers
//! 4. for critical kinds, queue a threshold check (bounded queue, never blocks)
//! 5. ingest it into the buffer and start a flush when the policy is met
//!
//! A flush computes bounds over the taken batch and syncs them in a separate
//! task. Its outcome comes back to the consumer loop, which then drops or
//! restores the batch. Ingestion keeps running while a sync is retrying.
//! A restored batch is only flushed again once a new reading arrives.
//!
//! # Shutdown
//!
//! When the cancellation token fires (or the transport channel closes), no
//! new message is processed and no new flush starts. An in-flight sync gets
//! up to the configured grace period to finish and is aborted after it. The
//! persistence queue is then drained; queued threshold checks get a short
//! grace of their own.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use coldchain_types::{AggregateBounds, Reading};

use crate::alert::{RangeCheck, ThresholdAlerter};
use crate::broadcast::LiveBroadcaster;
use crate::buffer::{
    AggregationBuffer, BufferStats, DEFAULT_MAX_READINGS, FlushPolicy, RetentionPolicy,
    compute_bounds,
};
use crate::decode::decode;
use crate::metrics::PipelineMetrics;
use crate::sync::{BoundsSynchronizer, SyncOutcome};
use crate::traits::ReadingSink;

/// One message as delivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Bytes,
    /// When the transport handed the message over.
    pub received_at: OffsetDateTime,
}

impl RawMessage {
    /// A message received now.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Tunables for [`Pipeline`].
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub flush_policy: FlushPolicy,
    /// What happens to a batch whose sync exhausted its retries.
    pub retention: RetentionPolicy,
    /// Widening applied to computed bounds.
    pub margin: f64,
    /// Cap on buffered readings; oldest are evicted beyond it.
    pub max_buffered: usize,
    /// Capacity of the persistence queue.
    pub sink_queue: usize,
    /// Capacity of the threshold-check queue.
    pub alert_queue: usize,
    /// How long shutdown waits for an in-flight sync.
    pub shutdown_grace: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            flush_policy: FlushPolicy::default(),
            retention: RetentionPolicy::default(),
            margin: 0.0,
            max_buffered: DEFAULT_MAX_READINGS,
            sink_queue: 1024,
            alert_queue: 64,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// Result of a sync task, returned to the consumer loop.
struct FlushResult {
    batch: Vec<Reading>,
    bounds: AggregateBounds,
    outcome: SyncOutcome,
}

/// Background task that writes readings to the sink.
struct SinkWorker {
    tx: mpsc::Sender<Reading>,
    handle: JoinHandle<()>,
    metrics: Arc<PipelineMetrics>,
}

impl SinkWorker {
    fn spawn(sink: Arc<dyn ReadingSink>, capacity: usize, metrics: Arc<PipelineMetrics>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Reading>(capacity.max(1));
        let worker_metrics = Arc::clone(&metrics);
        let handle = tokio::spawn(async move {
            while let Some(reading) = rx.recv().await {
                match sink.record(&reading).await {
                    Ok(()) => worker_metrics.record_persisted(),
                    Err(e) => {
                        worker_metrics.record_persist_failure();
                        warn!(
                            "Failed to persist {} reading for unit {}: {}",
                            reading.sensor_kind, reading.unit_id, e
                        );
                    }
                }
            }
        });
        Self {
            tx,
            handle,
            metrics,
        }
    }

    fn submit(&self, reading: Reading) {
        match self.tx.try_send(reading) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(reading)) => {
                self.metrics.record_persist_failure();
                warn!(
                    "Persistence queue full, dropping {} reading for unit {}",
                    reading.sensor_kind, reading.unit_id
                );
            }
            Err(mpsc::error::TrySendError::Closed(reading)) => {
                self.metrics.record_persist_failure();
                warn!(
                    "Persistence worker stopped, dropping reading for unit {}",
                    reading.unit_id
                );
            }
        }
    }

    async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.handle.await {
            warn!("Persistence worker ended abnormally: {}", e);
        }
    }
}

/// How long shutdown waits for queued threshold checks.
const ALERT_DRAIN_GRACE: Duration = Duration::from_secs(5);

/// Background task that runs threshold checks one at a time.
struct AlertWorker {
    tx: mpsc::Sender<Reading>,
    handle: JoinHandle<()>,
    metrics: Arc<PipelineMetrics>,
}

impl AlertWorker {
    fn spawn(alerter: Arc<ThresholdAlerter>, capacity: usize, metrics: Arc<PipelineMetrics>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Reading>(capacity.max(1));
        let worker_metrics = Arc::clone(&metrics);
        let handle = tokio::spawn(async move {
            while let Some(reading) = rx.recv().await {
                if let RangeCheck::OutOfRange { .. } = alerter.process(&reading).await {
                    worker_metrics.record_alert();
                }
            }
        });
        Self {
            tx,
            handle,
            metrics,
        }
    }

    fn submit(&self, reading: Reading) {
        if let Err(e) = self.tx.try_send(reading) {
            self.metrics.record_alert_dropped();
            let reading = match e {
                mpsc::error::TrySendError::Full(r) | mpsc::error::TrySendError::Closed(r) => r,
            };
            warn!(
                "Alert queue unavailable, skipping threshold check of {} for unit {}",
                reading.sensor_kind, reading.unit_id
            );
        }
    }

    async fn shutdown(self) {
        drop(self.tx);
        let mut handle = self.handle;
        match tokio::time::timeout(ALERT_DRAIN_GRACE, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Alert worker ended abnormally: {}", e),
            Err(_) => {
                warn!("Abandoning queued threshold checks at shutdown");
                handle.abort();
            }
        }
    }
}

/// Consumer of transport messages. See the module docs for the flow.
pub struct Pipeline {
    options: PipelineOptions,
    buffer: AggregationBuffer,
    broadcaster: LiveBroadcaster,
    sink: Option<Arc<dyn ReadingSink>>,
    synchronizer: Option<Arc<BoundsSynchronizer>>,
    alerter: Option<Arc<ThresholdAlerter>>,
    sync_task: Option<JoinHandle<()>>,
    metrics: Arc<PipelineMetrics>,
    stats_tx: watch::Sender<BufferStats>,
}

impl Pipeline {
    pub fn new(options: PipelineOptions, broadcaster: LiveBroadcaster) -> Self {
        let buffer = AggregationBuffer::new(options.flush_policy.clone())
            .with_max_readings(options.max_buffered);
        let (stats_tx, _) = watch::channel(buffer.stats());
        Self {
            options,
            buffer,
            broadcaster,
            sink: None,
            synchronizer: None,
            alerter: None,
            sync_task: None,
            metrics: Arc::new(PipelineMetrics::new()),
            stats_tx,
        }
    }

    /// Persist every decoded reading to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ReadingSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Push bounds on every flush. Without one, flushes only log the bounds.
    #[must_use]
    pub fn with_synchronizer(mut self, synchronizer: BoundsSynchronizer) -> Self {
        self.synchronizer = Some(Arc::new(synchronizer));
        self
    }

    /// Check critical readings against safe ranges.
    #[must_use]
    pub fn with_alerter(mut self, alerter: ThresholdAlerter) -> Self {
        self.alerter = Some(Arc::new(alerter));
        self
    }

    /// Share an existing metrics instance.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> Arc<PipelineMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Receiver of buffer occupancy, updated after every change.
    pub fn buffer_stats(&self) -> watch::Receiver<BufferStats> {
        self.stats_tx.subscribe()
    }

    /// Consume messages until `cancel` fires or `rx` closes.
    ///
    /// Returns the buffer as it stood at shutdown.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<RawMessage>,
        cancel: CancellationToken,
    ) -> AggregationBuffer {
        let sink_worker = self.sink.take().map(|sink| {
            SinkWorker::spawn(sink, self.options.sink_queue, Arc::clone(&self.metrics))
        });
        let alert_worker = self.alerter.take().map(|alerter| {
            AlertWorker::spawn(alerter, self.options.alert_queue, Arc::clone(&self.metrics))
        });
        let (outcome_tx, mut outcome_rx) = mpsc::channel::<FlushResult>(1);

        info!(
            "Pipeline started (flush policy: {:?}, retention: {:?}, sync: {})",
            self.options.flush_policy,
            self.options.retention,
            if self.synchronizer.is_some() {
                "enabled"
            } else {
                "disabled"
            }
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Pipeline cancelled");
                    break;
                }

                Some(result) = outcome_rx.recv() => {
                    self.complete_flush(result, &outcome_tx);
                }

                message = rx.recv() => match message {
                    Some(message) => self.handle_message(
                        message,
                        sink_worker.as_ref(),
                        alert_worker.as_ref(),
                        &outcome_tx,
                    ),
                    None => {
                        info!("Transport channel closed, stopping pipeline");
                        break;
                    }
                },
            }
        }

        if self.buffer.flush_in_flight() {
            info!(
                "Waiting up to {:?} for in-flight bounds sync",
                self.options.shutdown_grace
            );
            match tokio::time::timeout(self.options.shutdown_grace, outcome_rx.recv()).await {
                Ok(Some(result)) => {
                    self.settle_flush(result);
                }
                Ok(None) => {}
                Err(_) => {
                    warn!("In-flight bounds sync did not finish before shutdown, aborting it");
                    if let Some(task) = self.sync_task.take() {
                        task.abort();
                    }
                }
            }
        }

        if let Some(worker) = sink_worker {
            worker.shutdown().await;
        }
        if let Some(worker) = alert_worker {
            worker.shutdown().await;
        }

        self.publish_stats();
        info!(
            "Pipeline stopped with {} buffered readings",
            self.buffer.len()
        );
        self.buffer
    }

    fn handle_message(
        &mut self,
        message: RawMessage,
        sink: Option<&SinkWorker>,
        alerts: Option<&AlertWorker>,
        outcome_tx: &mpsc::Sender<FlushResult>,
    ) {
        self.metrics.record_received();

        let reading = match decode(&message.topic, &message.payload, message.received_at) {
            Ok(reading) => reading,
            Err(e) => {
                self.metrics.record_dropped();
                warn!("Dropping message on '{}': {}", message.topic, e);
                return;
            }
        };
        self.metrics.record_decoded();
        debug!(
            "Unit {} {} = {}",
            reading.unit_id, reading.sensor_kind, reading.value
        );

        if let Some(worker) = sink {
            worker.submit(reading.clone());
        }

        let delivered = self.broadcaster.publish(&reading);
        if delivered > 0 {
            self.metrics.record_broadcast();
        }

        if reading.sensor_kind.is_critical()
            && let Some(worker) = alerts
        {
            worker.submit(reading.clone());
        }

        self.buffer.ingest(reading);
        self.maybe_flush(outcome_tx);
        self.publish_stats();
    }

    fn maybe_flush(&mut self, outcome_tx: &mpsc::Sender<FlushResult>) {
        let Some(batch) = self.buffer.begin_flush() else {
            return;
        };
        self.metrics.record_flush_started();

        let bounds = match compute_bounds(&batch, self.options.margin) {
            Ok(bounds) => bounds,
            Err(e) => {
                self.metrics.record_flush_abandoned();
                warn!("Discarding flush of {} readings: {}", batch.len(), e);
                self.buffer.finish_flush(batch, false);
                return;
            }
        };

        info!(
            "Flushing {} readings: temp [{}, {}], humidity [{}, {}]",
            batch.len(),
            bounds.min_temp,
            bounds.max_temp,
            bounds.min_humidity,
            bounds.max_humidity
        );

        let Some(synchronizer) = self.synchronizer.clone() else {
            debug!("Bounds sync disabled, dropping flushed batch");
            self.buffer.finish_flush(batch, false);
            return;
        };

        let tx = outcome_tx.clone();
        let metrics = Arc::clone(&self.metrics);
        self.sync_task = Some(tokio::spawn(async move {
            let started = Instant::now();
            let outcome = synchronizer.sync(&bounds).await;
            if outcome.is_success() {
                metrics.bounds_sync().record_success(started.elapsed());
            } else {
                metrics.bounds_sync().record_failure(started.elapsed());
            }
            let result = FlushResult {
                batch,
                bounds,
                outcome,
            };
            if tx.send(result).await.is_err() {
                debug!("Pipeline stopped before the bounds sync outcome was delivered");
            }
        }));
    }

    fn complete_flush(&mut self, result: FlushResult, outcome_tx: &mpsc::Sender<FlushResult>) {
        // Readings that arrived during the sync may already satisfy the policy.
        // A restored batch waits for the next reading instead.
        if !self.settle_flush(result) {
            self.maybe_flush(outcome_tx);
        }
        self.publish_stats();
    }

    /// Apply a sync outcome to the buffer. Returns whether the batch was restored.
    fn settle_flush(&mut self, result: FlushResult) -> bool {
        self.sync_task = None;
        let FlushResult {
            batch,
            bounds,
            outcome,
        } = result;
        let retain = matches!(outcome, SyncOutcome::Exhausted { .. })
            && self.options.retention == RetentionPolicy::Retain;

        match &outcome {
            SyncOutcome::Succeeded { attempts } => {
                debug!("Bounds {:?} accepted after {} attempts", bounds, attempts);
            }
            SyncOutcome::Failed { error, .. } => {
                self.metrics.record_flush_abandoned();
                warn!(
                    "Bounds update rejected ({}), discarding {} readings",
                    error,
                    batch.len()
                );
            }
            SyncOutcome::Exhausted { last_error, .. } if retain => {
                self.metrics.record_batch_retained();
                warn!(
                    "Bounds sync exhausted ({}), keeping {} readings for the next flush",
                    last_error,
                    batch.len()
                );
            }
            SyncOutcome::Exhausted { last_error, .. } => {
                self.metrics.record_flush_abandoned();
                warn!(
                    "Bounds sync exhausted ({}), discarding {} readings",
                    last_error,
                    batch.len()
                );
            }
        }

        self.buffer.finish_flush(batch, retain);
        retain
    }

    fn publish_stats(&self) {
        self.stats_tx.send_replace(self.buffer.stats());
    }
}
