//! Error types for coldchain-core.
//!
//! # Error Handling Strategy
//!
//! None of these errors stop the ingestion pipeline. Each class has a fixed
//! local recovery:
//!
//! | Error | Raised by | Recovery |
//! |-------|-----------|----------|
//! | [`DecodeError`] | [`crate::decode`] | Message dropped and logged, no retry |
//! | [`Error::Sink`] | [`crate::ReadingSink`] implementations | Logged and counted, pipeline continues |
//! | [`PushError::Status`] with a retryable status | [`crate::BoundsTarget`] | Retried per [`crate::RetryPolicy`] |
//! | [`PushError::Unreachable`] | [`crate::BoundsTarget`] | Retried per [`crate::RetryPolicy`] |
//! | Any other [`PushError`] | [`crate::BoundsTarget`] | Flush abandoned (terminal) |
//! | [`Error::EmptyPopulation`] | [`crate::compute_bounds`] | Flush abandoned, batch discarded |
//! | [`Error::Lookup`] / alert [`PushError`] | [`crate::ThresholdAlerter`] | Logged, reading still ingested |

use coldchain_types::{ParseError, SensorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur in the ingestion core.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A transport message could not be turned into a reading.
    #[error("Decode failed: {0}")]
    Decode(#[from] DecodeError),

    /// Bounds were requested over a set with no readings of a bounded kind.
    #[error("Cannot compute bounds: no {0} readings in the flushed set")]
    EmptyPopulation(SensorKind),

    /// An outbound request failed.
    #[error("Push failed: {0}")]
    Push(#[from] PushError),

    /// The persistence sink rejected a reading.
    #[error("Sink error: {0}")]
    Sink(String),

    /// The safe-range lookup failed.
    #[error("Safe-range lookup failed: {0}")]
    Lookup(String),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// HTTP client construction failed.
    #[cfg(feature = "http")]
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Create a sink error from any displayable cause.
    pub fn sink(cause: impl std::fmt::Display) -> Self {
        Self::Sink(cause.to_string())
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }
}

/// Reasons a transport message is rejected by the decoder.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// The topic does not have exactly five `/`-separated segments.
    #[error("topic '{topic}' has {segments} segments, expected 5")]
    TopicShape { topic: String, segments: usize },

    /// The topic has five segments but not the `warehouse/unit/{{id}}/sensor/{{kind}}` layout.
    #[error("topic '{topic}' does not match warehouse/unit/{{unitId}}/sensor/{{sensorKind}}")]
    TopicPattern { topic: String },

    /// The sensor segment is not a known sensor kind.
    #[error(transparent)]
    SensorKind(#[from] ParseError),

    /// The payload is not a JSON object.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The payload has no finite numeric `value`.
    #[error("payload value is missing or not numeric")]
    NonNumericValue,

    /// The payload `timestamp` could not be interpreted.
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Failure of one outbound request (bounds update or alert).
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
#[non_exhaustive]
pub enum PushError {
    /// The endpoint answered with a non-success HTTP status.
    #[error("endpoint returned HTTP {0}")]
    Status(u16),

    /// The endpoint could not be reached (connect failure or timeout).
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// The request could not be built or sent for another reason.
    #[error("request failed: {0}")]
    Request(String),
}

/// Result type alias using coldchain-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::EmptyPopulation(SensorKind::Humidity);
        assert_eq!(
            err.to_string(),
            "Cannot compute bounds: no humidity readings in the flushed set"
        );

        let err = Error::from(PushError::Status(502));
        assert_eq!(err.to_string(), "Push failed: endpoint returned HTTP 502");

        let err = Error::sink("disk full");
        assert_eq!(err.to_string(), "Sink error: disk full");
    }

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError::TopicShape {
            topic: "warehouse/unit/5/sensor".to_string(),
            segments: 4,
        };
        assert!(err.to_string().contains("4 segments"));

        let err = DecodeError::TopicPattern {
            topic: "a/b/c/d/e".to_string(),
        };
        assert!(err.to_string().contains("warehouse/unit/{unitId}/sensor/{sensorKind}"));

        let err = DecodeError::from(ParseError::UnknownSensorKind("co2".to_string()));
        assert_eq!(err.to_string(), "Unknown sensor kind: 'co2'");
    }

    #[test]
    fn test_decode_error_converts_into_error() {
        let err: Error = DecodeError::NonNumericValue.into();
        assert!(matches!(err, Error::Decode(DecodeError::NonNumericValue)));
    }
}
