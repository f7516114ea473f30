//! Data models for stored data.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use coldchain_types::{Reading, SensorKind};

/// A reading stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredReading {
    /// Database row ID.
    pub id: i64,
    pub unit_id: String,
    pub sensor_kind: SensorKind,
    pub value: f64,
    /// Producer time of the sample (millisecond precision).
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl StoredReading {
    /// Convert back to a [`Reading`].
    pub fn to_reading(&self) -> Reading {
        Reading::new(
            self.unit_id.clone(),
            self.sensor_kind,
            self.value,
            self.timestamp,
        )
    }
}

/// A storage unit that has reported at least one reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredUnit {
    pub id: String,
    /// When the first reading from this unit was stored.
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    /// When the latest reading from this unit was stored.
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    /// Readings currently held for this unit.
    pub reading_count: u64,
}
