//! Ingestion core for cold-storage sensor telemetry.
//!
//! This crate turns raw transport messages from field sensors into
//! [`Reading`]s and drives everything that happens to them afterwards.
//!
//! # Features
//!
//! - **Decoding**: strict topic parsing and tolerant timestamp handling
//! - **Persistence hand-off**: every reading goes to a [`ReadingSink`] without blocking ingestion
//! - **Live fan-out**: [`LiveBroadcaster`] delivers readings to attached subscribers
//! - **Aggregation**: [`AggregationBuffer`] collects readings until a [`FlushPolicy`] is met
//! - **Bounds sync**: [`BoundsSynchronizer`] pushes min/max bounds with bounded retry
//! - **Threshold alerts**: [`ThresholdAlerter`] flags temperature/humidity outside a unit's safe range
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use coldchain_core::mock::MockBoundsTarget;
//! use coldchain_core::{
//!     BoundsSynchronizer, LiveBroadcaster, Pipeline, PipelineOptions, RawMessage, RetryPolicy,
//! };
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let broadcaster = LiveBroadcaster::default();
//!     let target = Arc::new(MockBoundsTarget::new());
//!     let pipeline = Pipeline::new(PipelineOptions::default(), broadcaster.clone())
//!         .with_synchronizer(BoundsSynchronizer::new(target, RetryPolicy::default()));
//!
//!     let (tx, rx) = mpsc::channel(256);
//!     let cancel = CancellationToken::new();
//!     let task = tokio::spawn(pipeline.run(rx, cancel.clone()));
//!
//!     tx.send(RawMessage::new("warehouse/unit/5/sensor/temperature", r#"{"value": 4.1}"#))
//!         .await
//!         .unwrap();
//!
//!     cancel.cancel();
//!     let buffer = task.await.unwrap();
//!     println!("{} readings left in buffer", buffer.len());
//! }
//! ```

pub mod alert;
pub mod broadcast;
pub mod buffer;
pub mod decode;
pub mod error;
#[cfg(feature = "http")]
pub mod http;
pub mod metrics;
pub mod mock;
pub mod pipeline;
pub mod retry;
pub mod sync;
pub mod traits;

pub use alert::{Alert, AlertStatus, RangeCheck, StaticSafeRanges, ThresholdAlerter};
pub use broadcast::{BroadcastEvent, LiveBroadcaster, SubscriberInfo, Subscription};
pub use buffer::{AggregationBuffer, BufferStats, FlushPolicy, RetentionPolicy, compute_bounds};
pub use decode::decode;
pub use error::{DecodeError, Error, PushError, Result};
#[cfg(feature = "http")]
pub use http::{HttpAlertChannel, HttpBoundsTarget};
pub use metrics::{MetricsSnapshot, OperationMetrics, PipelineMetrics};
pub use pipeline::{Pipeline, PipelineOptions, RawMessage};
pub use retry::RetryPolicy;
pub use sync::{BoundsSynchronizer, SyncAttempt, SyncOutcome};
pub use traits::{AlertChannel, BoundsTarget, ReadingSink, SafeRangeLookup};

// Re-export the shared value types
pub use coldchain_types::{
    AggregateBounds, BoundsPayload, ConnectionState, Reading, SafeRange, SensorKind, UnitClimate,
};
