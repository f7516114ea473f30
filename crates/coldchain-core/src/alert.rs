//! Threshold alerting for critical sensor kinds.
//!
//! Temperature and humidity readings are compared against the safe range
//! configured for their storage unit. A value outside the inclusive range
//! produces one [`Alert`] with status `critical`.
//!
//! # Example
//!
//! ```
//! use coldchain_core::alert::{RangeCheck, check};
//! use coldchain_types::{Reading, SafeRange, SensorKind, UnitClimate};
//! use time::OffsetDateTime;
//!
//! let climate = UnitClimate {
//!     unit_id: "5".into(),
//!     warehouse_id: Some("north".into()),
//!     temperature: SafeRange { min: 2.0, max: 8.0 },
//!     humidity: SafeRange { min: 30.0, max: 60.0 },
//! };
//!
//! let warm = Reading::new("5", SensorKind::Temperature, 9.5, OffsetDateTime::now_utc());
//! assert!(matches!(check(&warm, &climate), RangeCheck::OutOfRange { .. }));
//!
//! let door = Reading::new("5", SensorKind::Proximity(1), 1.0, OffsetDateTime::now_utc());
//! assert_eq!(check(&door, &climate), RangeCheck::NotMonitored);
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use coldchain_types::{Reading, SafeRange, SensorKind, UnitClimate};

use crate::error::Result;
use crate::traits::{AlertChannel, SafeRangeLookup};

/// Result of comparing one reading with its unit's safe range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RangeCheck {
    /// The kind is not checked, or the unit has no configuration.
    NotMonitored,
    /// Value inside the safe range (bounds included).
    InRange,
    /// Value outside the safe range.
    OutOfRange { range: SafeRange },
}

/// Compare a reading with a unit's climate configuration.
pub fn check(reading: &Reading, climate: &UnitClimate) -> RangeCheck {
    match climate.range_for(reading.sensor_kind) {
        None => RangeCheck::NotMonitored,
        Some(range) if range.contains(reading.value) => RangeCheck::InRange,
        Some(range) => RangeCheck::OutOfRange { range },
    }
}

/// Alert severity. Only critical alerts are raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Critical,
}

/// Notification sent when a critical reading leaves its safe range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub unit_id: String,
    pub warehouse_id: Option<String>,
    pub sensor_kind: SensorKind,
    pub value: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub status: AlertStatus,
}

impl Alert {
    /// Build a critical alert for `reading`.
    pub fn critical(reading: &Reading, climate: &UnitClimate) -> Self {
        Self {
            unit_id: reading.unit_id.clone(),
            warehouse_id: climate.warehouse_id.clone(),
            sensor_kind: reading.sensor_kind,
            value: reading.value,
            timestamp: reading.timestamp,
            status: AlertStatus::Critical,
        }
    }
}

/// Checks critical readings and raises alerts through an [`AlertChannel`].
#[derive(Clone)]
pub struct ThresholdAlerter {
    ranges: Arc<dyn SafeRangeLookup>,
    channel: Arc<dyn AlertChannel>,
}

impl ThresholdAlerter {
    pub fn new(ranges: Arc<dyn SafeRangeLookup>, channel: Arc<dyn AlertChannel>) -> Self {
        Self { ranges, channel }
    }

    /// Check one reading and send an alert if it is out of range.
    ///
    /// Lookup and delivery failures are logged; they never propagate.
    pub async fn process(&self, reading: &Reading) -> RangeCheck {
        if !reading.sensor_kind.is_critical() {
            return RangeCheck::NotMonitored;
        }

        let climate = match self.ranges.unit_climate(&reading.unit_id).await {
            Ok(Some(climate)) => climate,
            Ok(None) => {
                debug!("No climate control configured for unit {}", reading.unit_id);
                return RangeCheck::NotMonitored;
            }
            Err(e) => {
                warn!(
                    "Safe-range lookup failed for unit {}: {}",
                    reading.unit_id, e
                );
                return RangeCheck::NotMonitored;
            }
        };

        let result = check(reading, &climate);
        if let RangeCheck::OutOfRange { range } = result {
            warn!(
                "Unit {} {} reading {} outside safe range [{}, {}]",
                reading.unit_id, reading.sensor_kind, reading.value, range.min, range.max
            );
            let alert = Alert::critical(reading, &climate);
            match self.channel.send_alert(&alert).await {
                Ok(()) => info!(
                    "Critical alert sent for unit {} ({})",
                    alert.unit_id, alert.sensor_kind
                ),
                Err(e) => warn!(
                    "Failed to send alert for unit {}: {}",
                    alert.unit_id, e
                ),
            }
        }
        result
    }
}

/// Safe ranges held in memory, typically loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticSafeRanges {
    units: HashMap<String, UnitClimate>,
}

impl StaticSafeRanges {
    pub fn new(units: impl IntoIterator<Item = UnitClimate>) -> Self {
        Self {
            units: units
                .into_iter()
                .map(|climate| (climate.unit_id.clone(), climate))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

#[async_trait]
impl SafeRangeLookup for StaticSafeRanges {
    async fn unit_climate(&self, unit_id: &str) -> Result<Option<UnitClimate>> {
        Ok(self.units.get(unit_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PushError;
    use crate::mock::MockAlertChannel;
    use time::macros::datetime;

    fn climate() -> UnitClimate {
        UnitClimate {
            unit_id: "5".to_string(),
            warehouse_id: Some("north".to_string()),
            temperature: SafeRange { min: 2.0, max: 8.0 },
            humidity: SafeRange {
                min: 30.0,
                max: 60.0,
            },
        }
    }

    fn alerter(channel: Arc<MockAlertChannel>) -> ThresholdAlerter {
        ThresholdAlerter::new(Arc::new(StaticSafeRanges::new([climate()])), channel)
    }

    fn reading(unit: &str, kind: SensorKind, value: f64) -> Reading {
        Reading::new(unit, kind, value, datetime!(2024-05-01 10:00 UTC))
    }

    #[test]
    fn test_check_inclusive_bounds() {
        let climate = climate();
        assert_eq!(
            check(&reading("5", SensorKind::Temperature, 8.0), &climate),
            RangeCheck::InRange
        );
        assert_eq!(
            check(&reading("5", SensorKind::Temperature, 2.0), &climate),
            RangeCheck::InRange
        );
        assert_eq!(
            check(&reading("5", SensorKind::Humidity, 61.0), &climate),
            RangeCheck::OutOfRange {
                range: SafeRange {
                    min: 30.0,
                    max: 60.0
                }
            }
        );
    }

    #[test]
    fn test_alert_json_shape() {
        let alert = Alert::critical(&reading("5", SensorKind::Temperature, 9.5), &climate());
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["unitId"], "5");
        assert_eq!(json["warehouseId"], "north");
        assert_eq!(json["sensorKind"], "temperature");
        assert_eq!(json["value"], 9.5);
        assert_eq!(json["timestamp"], "2024-05-01T10:00:00Z");
        assert_eq!(json["status"], "critical");
    }

    #[tokio::test]
    async fn test_out_of_range_sends_one_alert() {
        let channel = Arc::new(MockAlertChannel::new());
        let alerter = alerter(channel.clone());

        let result = alerter
            .process(&reading("5", SensorKind::Temperature, 12.0))
            .await;

        assert!(matches!(result, RangeCheck::OutOfRange { .. }));
        let alerts = channel.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].value, 12.0);
        assert_eq!(alerts[0].status, AlertStatus::Critical);
    }

    #[tokio::test]
    async fn test_in_range_sends_nothing() {
        let channel = Arc::new(MockAlertChannel::new());
        let alerter = alerter(channel.clone());

        let result = alerter.process(&reading("5", SensorKind::Humidity, 45.0)).await;

        assert_eq!(result, RangeCheck::InRange);
        assert!(channel.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_unit_and_proximity_not_monitored() {
        let channel = Arc::new(MockAlertChannel::new());
        let alerter = alerter(channel.clone());

        assert_eq!(
            alerter
                .process(&reading("99", SensorKind::Temperature, 100.0))
                .await,
            RangeCheck::NotMonitored
        );
        assert_eq!(
            alerter
                .process(&reading("5", SensorKind::Proximity(1), 100.0))
                .await,
            RangeCheck::NotMonitored
        );
        assert!(channel.alerts().is_empty());
    }

    #[tokio::test]
    async fn test_delivery_failure_is_swallowed() {
        let channel = Arc::new(MockAlertChannel::new());
        channel.fail_with(Some(PushError::Status(500)));
        let alerter = alerter(channel.clone());

        let result = alerter
            .process(&reading("5", SensorKind::Temperature, -4.0))
            .await;

        assert!(matches!(result, RangeCheck::OutOfRange { .. }));
        assert_eq!(channel.attempts(), 1);
    }
}
