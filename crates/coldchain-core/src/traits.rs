//! Trait abstractions for the pipeline's external collaborators.
//!
//! Each trait has an HTTP or database implementation used in production and
//! an in-memory implementation in [`crate::mock`] for tests.

use async_trait::async_trait;

use coldchain_types::{BoundsPayload, Reading, UnitClimate};

use crate::alert::Alert;
use crate::error::{PushError, Result};

/// Durable storage for decoded readings.
///
/// # Example
///
/// ```ignore
/// use coldchain_core::{ReadingSink, Result};
/// use coldchain_types::Reading;
///
/// async fn store_all<S: ReadingSink>(sink: &S, readings: &[Reading]) -> Result<()> {
///     for reading in readings {
///         sink.record(reading).await?;
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait ReadingSink: Send + Sync {
    /// Persist one reading.
    async fn record(&self, reading: &Reading) -> Result<()>;
}

/// Control surface that accepts aggregate bounds updates.
#[async_trait]
pub trait BoundsTarget: Send + Sync {
    /// Send one bounds update. A single call is a single attempt.
    async fn put_bounds(&self, payload: &BoundsPayload) -> std::result::Result<(), PushError>;
}

/// Source of per-unit climate-control configuration.
#[async_trait]
pub trait SafeRangeLookup: Send + Sync {
    /// Look up a unit's safe ranges.
    ///
    /// Returns `Ok(None)` when the unit is unknown or has no climate control.
    async fn unit_climate(&self, unit_id: &str) -> Result<Option<UnitClimate>>;
}

/// Destination for out-of-range alerts.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    /// Deliver one alert.
    async fn send_alert(&self, alert: &Alert) -> std::result::Result<(), PushError>;
}
