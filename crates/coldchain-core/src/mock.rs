//! In-memory collaborators for testing.
//!
//! These types implement the traits in [`crate::traits`] without a network
//! or database, so the pipeline can be exercised end to end in unit tests.
//!
//! # Features
//!
//! - **Scripted responses**: [`MockBoundsTarget`] answers from a queue of statuses
//! - **Call recording**: every mock keeps what it was sent, with virtual timestamps
//! - **Failure injection**: [`MemorySink`] and [`MockAlertChannel`] can be told to fail
//! - **Latency simulation**: [`MemorySink`] can delay each write

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use coldchain_types::{BoundsPayload, Reading, UnitClimate};

use crate::alert::Alert;
use crate::error::{Error, PushError, Result};
use crate::traits::{AlertChannel, BoundsTarget, ReadingSink, SafeRangeLookup};

fn status_response(status: u16) -> std::result::Result<(), PushError> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(PushError::Status(status))
    }
}

/// A bounds target that replays scripted responses.
///
/// Once the script is used up every call succeeds.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use coldchain_core::mock::MockBoundsTarget;
/// use coldchain_core::{BoundsSynchronizer, RetryPolicy, SyncOutcome};
/// use coldchain_types::AggregateBounds;
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() {
///     let target = Arc::new(MockBoundsTarget::with_statuses([200]));
///     let sync = BoundsSynchronizer::new(target.clone(), RetryPolicy::default());
///     let bounds = AggregateBounds { min_temp: 1.0, max_temp: 2.0, min_humidity: 3.0, max_humidity: 4.0 };
///
///     assert_eq!(sync.sync(&bounds).await, SyncOutcome::Succeeded { attempts: 1 });
///     assert_eq!(target.call_count(), 1);
/// }
/// ```
#[derive(Debug, Default)]
pub struct MockBoundsTarget {
    script: Mutex<VecDeque<std::result::Result<(), PushError>>>,
    calls: Mutex<Vec<(Instant, BoundsPayload)>>,
}

impl MockBoundsTarget {
    /// A target that accepts every update.
    pub fn new() -> Self {
        Self::default()
    }

    /// A target answering with the given HTTP statuses in order.
    pub fn with_statuses(statuses: impl IntoIterator<Item = u16>) -> Self {
        let target = Self::new();
        for status in statuses {
            target.push_response(status_response(status));
        }
        target
    }

    /// Queue one more response.
    pub fn push_response(&self, response: std::result::Result<(), PushError>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(response);
    }

    /// Payloads received so far.
    pub fn calls(&self) -> Vec<BoundsPayload> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// When each call arrived (tokio clock, so paused-time tests see virtual time).
    pub fn call_times(&self) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(at, _)| *at)
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl BoundsTarget for MockBoundsTarget {
    async fn put_bounds(&self, payload: &BoundsPayload) -> std::result::Result<(), PushError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((Instant::now(), payload.clone()));
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(Ok(()))
    }
}

/// An alert channel that records alerts.
#[derive(Debug, Default)]
pub struct MockAlertChannel {
    alerts: Mutex<Vec<Alert>>,
    failure: Mutex<Option<PushError>>,
    attempts: AtomicUsize,
}

impl MockAlertChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every delivery fail with `error` (or succeed again with `None`).
    pub fn fail_with(&self, error: Option<PushError>) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = error;
    }

    /// Alerts delivered successfully.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Delivery attempts, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AlertChannel for MockAlertChannel {
    async fn send_alert(&self, alert: &Alert) -> std::result::Result<(), PushError> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if let Some(error) = self
            .failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(error);
        }
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert.clone());
        Ok(())
    }
}

/// A reading sink that keeps readings in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    readings: Mutex<Vec<Reading>>,
    should_fail: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail.
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::Relaxed);
    }

    /// Delay each write by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn readings(&self) -> Vec<Reading> {
        self.readings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.readings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ReadingSink for MemorySink {
    async fn record(&self, reading: &Reading) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(Error::sink("mock sink failure"));
        }
        self.readings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(reading.clone());
        Ok(())
    }
}

/// A safe-range lookup with settable entries and failure injection.
#[derive(Debug, Default)]
pub struct MockSafeRanges {
    units: Mutex<HashMap<String, UnitClimate>>,
    should_fail: AtomicBool,
}

impl MockSafeRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, climate: UnitClimate) {
        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(climate.unit_id.clone(), climate);
    }

    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl SafeRangeLookup for MockSafeRanges {
    async fn unit_climate(&self, unit_id: &str) -> Result<Option<UnitClimate>> {
        if self.should_fail.load(Ordering::Relaxed) {
            return Err(Error::Lookup("mock lookup failure".to_string()));
        }
        Ok(self
            .units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(unit_id)
            .cloned())
    }
}
