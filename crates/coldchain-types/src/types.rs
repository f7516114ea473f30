//! Core types for cold-storage sensor telemetry.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;

use crate::error::{ParseError, ParseResult};

/// MQTT subscription pattern covering every unit and every sensor.
pub const SUBSCRIBE_PATTERN: &str = "warehouse/unit/+/sensor/+";

/// Build the routing key for a unit/sensor pair.
///
/// The result has the same shape as the MQTT topic the reading arrived on:
/// `warehouse/unit/{unit_id}/sensor/{kind}`.
///
/// # Examples
///
/// ```
/// use coldchain_types::{SensorKind, topic_for};
///
/// assert_eq!(topic_for("5", SensorKind::Humidity), "warehouse/unit/5/sensor/humidity");
/// ```
pub fn topic_for(unit_id: &str, kind: SensorKind) -> String {
    format!("warehouse/unit/{}/sensor/{}", unit_id, kind)
}

/// Category of measurement reported by a field sensor.
///
/// Ordering is `Temperature < Humidity < Proximity(0) < Proximity(1) < ...`,
/// which keeps sets of kinds stable when logged.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new sensor kinds
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[non_exhaustive]
pub enum SensorKind {
    /// Air temperature in degrees Celsius.
    Temperature,
    /// Relative humidity percentage.
    Humidity,
    /// Door/occupancy proximity channel `N`.
    Proximity(u8),
}

impl SensorKind {
    /// Whether readings of this kind are checked against a unit's safe range.
    #[must_use]
    pub const fn is_critical(&self) -> bool {
        matches!(self, SensorKind::Temperature | SensorKind::Humidity)
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorKind::Temperature => write!(f, "temperature"),
            SensorKind::Humidity => write!(f, "humidity"),
            SensorKind::Proximity(channel) => write!(f, "proximity{}", channel),
        }
    }
}

impl FromStr for SensorKind {
    type Err = ParseError;

    /// Parse a sensor kind from its topic segment.
    ///
    /// Matching is case-insensitive. Proximity channels may be written as
    /// `proximity1`, `proximity-1` or `proximity_1`.
    ///
    /// # Examples
    ///
    /// ```
    /// use coldchain_types::SensorKind;
    ///
    /// assert_eq!("temperature".parse(), Ok(SensorKind::Temperature));
    /// assert_eq!("Humidity".parse(), Ok(SensorKind::Humidity));
    /// assert_eq!("proximity-2".parse(), Ok(SensorKind::Proximity(2)));
    /// assert!("pressure".parse::<SensorKind>().is_err());
    /// ```
    fn from_str(s: &str) -> ParseResult<Self> {
        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "temperature" => Ok(SensorKind::Temperature),
            "humidity" => Ok(SensorKind::Humidity),
            _ => match lower.strip_prefix("proximity") {
                Some(rest) => {
                    let digits = rest.trim_start_matches(['-', '_']);
                    digits
                        .parse::<u8>()
                        .map(SensorKind::Proximity)
                        .map_err(|_| ParseError::InvalidProximityChannel(s.to_string()))
                }
                None => Err(ParseError::UnknownSensorKind(s.to_string())),
            },
        }
    }
}

#[cfg(feature = "serde")]
impl Serialize for SensorKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for SensorKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// One sensor sample from one storage unit.
///
/// Readings are produced by the decoder from a single transport message and
/// are never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct Reading {
    /// Identifier of the physical storage unit.
    pub unit_id: String,
    /// What was measured.
    pub sensor_kind: SensorKind,
    /// Measured value.
    pub value: f64,
    /// Producer-assigned time of the sample (receipt time if the producer sent none).
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
}

impl Reading {
    /// Create a new reading.
    pub fn new(
        unit_id: impl Into<String>,
        sensor_kind: SensorKind,
        value: f64,
        timestamp: OffsetDateTime,
    ) -> Self {
        Self {
            unit_id: unit_id.into(),
            sensor_kind,
            value,
            timestamp,
        }
    }

    /// Routing key for this reading (same shape as its MQTT topic).
    pub fn topic(&self) -> String {
        topic_for(&self.unit_id, self.sensor_kind)
    }
}

/// Minimum/maximum temperature and humidity over one flushed window.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct AggregateBounds {
    /// Lowest temperature in the window.
    pub min_temp: f64,
    /// Highest temperature in the window.
    pub max_temp: f64,
    /// Lowest humidity in the window.
    pub min_humidity: f64,
    /// Highest humidity in the window.
    pub max_humidity: f64,
}

impl AggregateBounds {
    /// Widen every bound by `margin` (minimums decrease, maximums increase).
    ///
    /// # Examples
    ///
    /// ```
    /// use coldchain_types::AggregateBounds;
    ///
    /// let bounds = AggregateBounds { min_temp: 2.0, max_temp: 6.0, min_humidity: 40.0, max_humidity: 55.0 };
    /// let wide = bounds.with_margin(1.0);
    /// assert_eq!(wide.min_temp, 1.0);
    /// assert_eq!(wide.max_humidity, 56.0);
    /// ```
    #[must_use]
    pub fn with_margin(self, margin: f64) -> Self {
        Self {
            min_temp: self.min_temp - margin,
            max_temp: self.max_temp + margin,
            min_humidity: self.min_humidity - margin,
            max_humidity: self.max_humidity + margin,
        }
    }

    /// Wire form sent to the control surface.
    pub fn to_payload(&self) -> BoundsPayload {
        BoundsPayload {
            min_temp: self.min_temp.to_string(),
            max_temp: self.max_temp.to_string(),
            min_humidity: self.min_humidity.to_string(),
            max_humidity: self.max_humidity.to_string(),
        }
    }
}

/// Body of the bounds update request: each bound as a decimal string.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct BoundsPayload {
    pub min_temp: String,
    pub max_temp: String,
    pub min_humidity: String,
    pub max_humidity: String,
}

/// Inclusive `[min, max]` range a measurement must stay inside.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SafeRange {
    pub min: f64,
    pub max: f64,
}

impl SafeRange {
    /// Create a range, rejecting `min > max`.
    pub fn new(min: f64, max: f64) -> ParseResult<Self> {
        if min > max {
            return Err(ParseError::InvertedRange { min, max });
        }
        Ok(Self { min, max })
    }

    /// Whether `value` lies within the range (bounds included).
    #[must_use]
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Climate-control configuration of one storage unit.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UnitClimate {
    /// Storage unit identifier (matches the topic segment).
    pub unit_id: String,
    /// Warehouse the unit belongs to, if known.
    #[cfg_attr(feature = "serde", serde(default))]
    pub warehouse_id: Option<String>,
    /// Allowed temperature range.
    pub temperature: SafeRange,
    /// Allowed humidity range.
    pub humidity: SafeRange,
}

impl UnitClimate {
    /// Safe range for a sensor kind, if that kind is monitored.
    pub fn range_for(&self, kind: SensorKind) -> Option<SafeRange> {
        match kind {
            SensorKind::Temperature => Some(self.temperature),
            SensorKind::Humidity => Some(self.humidity),
            SensorKind::Proximity(_) => None,
        }
    }
}

/// Connectivity of the transport client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ConnectionState {
    /// First connection attempt in progress.
    Connecting,
    /// Connected and subscribed (or subscribing).
    Connected,
    /// Connection lost; a new attempt is underway.
    Reconnecting,
    /// Connection lost; waiting before the next attempt.
    Offline,
    /// Deliberately closed; no further reconnects.
    Closed,
}

impl ConnectionState {
    /// Whether messages can currently flow.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Offline => "offline",
            ConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}
