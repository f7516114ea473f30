//! Decoding of transport messages into [`Reading`]s.
//!
//! A message is accepted only when its topic has exactly the shape
//! `warehouse/unit/{unitId}/sensor/{sensorKind}` and its payload is a JSON
//! object carrying a finite numeric `value`. The optional `timestamp` may be
//! an RFC 3339 string, a naive `YYYY-MM-DD HH:MM:SS[.fff]` string (taken as
//! UTC), or a Unix epoch number in seconds or milliseconds. A missing or
//! null timestamp falls back to the receipt time.

use coldchain_types::{Reading, SensorKind};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::error::DecodeError;

/// Epoch values at or above this magnitude are read as milliseconds.
const EPOCH_MILLIS_THRESHOLD: f64 = 1e11;

/// Decode one transport message.
///
/// Pure function: the same inputs always yield the same reading or error.
///
/// # Examples
///
/// ```
/// use coldchain_core::decode;
/// use coldchain_types::SensorKind;
/// use time::macros::datetime;
///
/// let received = datetime!(2024-05-01 12:00 UTC);
/// let reading = decode(
///     "warehouse/unit/5/sensor/temperature",
///     br#"{"value": 4.2, "timestamp": "2024-05-01 11:59:58"}"#,
///     received,
/// )
/// .unwrap();
///
/// assert_eq!(reading.unit_id, "5");
/// assert_eq!(reading.sensor_kind, SensorKind::Temperature);
/// assert_eq!(reading.timestamp, datetime!(2024-05-01 11:59:58 UTC));
/// ```
pub fn decode(
    topic: &str,
    payload: &[u8],
    received_at: OffsetDateTime,
) -> Result<Reading, DecodeError> {
    let (unit_id, sensor_kind) = parse_topic(topic)?;

    let body: Value =
        serde_json::from_slice(payload).map_err(|e| DecodeError::InvalidPayload(e.to_string()))?;
    let object = body
        .as_object()
        .ok_or_else(|| DecodeError::InvalidPayload("expected a JSON object".to_string()))?;

    let value = object
        .get("value")
        .and_then(Value::as_f64)
        .filter(|v| v.is_finite())
        .ok_or(DecodeError::NonNumericValue)?;

    let timestamp = match object.get("timestamp") {
        None | Some(Value::Null) => received_at,
        Some(raw) => parse_timestamp(raw)?,
    };

    Ok(Reading::new(unit_id, sensor_kind, value, timestamp))
}

/// Split a topic into its unit identifier and sensor kind.
///
/// # Examples
///
/// ```
/// use coldchain_core::decode::parse_topic;
/// use coldchain_types::SensorKind;
///
/// let (unit, kind) = parse_topic("warehouse/unit/A-12/sensor/proximity1").unwrap();
/// assert_eq!(unit, "A-12");
/// assert_eq!(kind, SensorKind::Proximity(1));
///
/// assert!(parse_topic("warehouse/unit/5/sensor").is_err());
/// ```
pub fn parse_topic(topic: &str) -> Result<(String, SensorKind), DecodeError> {
    let segments: Vec<&str> = topic.split('/').collect();
    if segments.len() != 5 {
        return Err(DecodeError::TopicShape {
            topic: topic.to_string(),
            segments: segments.len(),
        });
    }

    if segments[0] != "warehouse"
        || segments[1] != "unit"
        || segments[3] != "sensor"
        || segments[2].is_empty()
    {
        return Err(DecodeError::TopicPattern {
            topic: topic.to_string(),
        });
    }

    let kind = segments[4].parse::<SensorKind>()?;
    Ok((segments[2].to_string(), kind))
}

fn parse_timestamp(raw: &Value) -> Result<OffsetDateTime, DecodeError> {
    match raw {
        Value::String(text) => parse_timestamp_str(text),
        Value::Number(number) => number
            .as_f64()
            .and_then(from_epoch)
            .ok_or_else(|| DecodeError::InvalidTimestamp(number.to_string())),
        other => Err(DecodeError::InvalidTimestamp(other.to_string())),
    }
}

fn parse_timestamp_str(text: &str) -> Result<OffsetDateTime, DecodeError> {
    let trimmed = text.trim();

    if let Ok(ts) = OffsetDateTime::parse(trimmed, &Rfc3339) {
        return Ok(ts);
    }

    let naive = PrimitiveDateTime::parse(
        trimmed,
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    )
    .or_else(|_| {
        PrimitiveDateTime::parse(
            trimmed,
            format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]"),
        )
    })
    .or_else(|_| {
        PrimitiveDateTime::parse(
            trimmed,
            format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
        )
    })
    .or_else(|_| {
        PrimitiveDateTime::parse(
            trimmed,
            format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]"),
        )
    });
    if let Ok(dt) = naive {
        return Ok(dt.assume_utc());
    }

    trimmed
        .parse::<f64>()
        .ok()
        .and_then(from_epoch)
        .ok_or_else(|| DecodeError::InvalidTimestamp(text.to_string()))
}

fn from_epoch(value: f64) -> Option<OffsetDateTime> {
    if !value.is_finite() {
        return None;
    }
    let nanos = if value.abs() >= EPOCH_MILLIS_THRESHOLD {
        value * 1e6
    } else {
        value * 1e9
    };
    OffsetDateTime::from_unix_timestamp_nanos(nanos as i128).ok()
}
