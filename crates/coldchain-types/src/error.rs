//! Error types for parsing telemetry values in coldchain-types.

use thiserror::Error;

/// Errors that can occur when parsing telemetry values.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The sensor kind text is not one of the known kinds.
    #[error("Unknown sensor kind: '{0}'")]
    UnknownSensorKind(String),

    /// A proximity channel suffix was missing or not a number.
    #[error("Invalid proximity channel in '{0}'")]
    InvalidProximityChannel(String),

    /// A safe range with `min > max`.
    #[error("Invalid range: min {min} is greater than max {max}")]
    InvertedRange { min: f64, max: f64 },
}

/// Result type alias using coldchain-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
