//! Platform-agnostic types for cold-storage sensor telemetry.
//!
//! This crate provides the value types shared by the ingestion core
//! (coldchain-core), the reading store (coldchain-store) and the service.
//!
//! # Features
//!
//! - Sensor readings and sensor kinds
//! - Aggregate bounds and their wire payload
//! - Per-unit safe ranges for threshold alerts
//! - Transport connection state
//!
//! # Example
//!
//! ```
//! use coldchain_types::{Reading, SensorKind};
//! use time::OffsetDateTime;
//!
//! let reading = Reading::new("5", SensorKind::Temperature, 4.2, OffsetDateTime::now_utc());
//! assert_eq!(reading.topic(), "warehouse/unit/5/sensor/temperature");
//! ```

pub mod error;
pub mod types;

pub use error::{ParseError, ParseResult};
pub use types::{
    AggregateBounds, BoundsPayload, ConnectionState, Reading, SUBSCRIBE_PATTERN, SafeRange,
    SensorKind, UnitClimate, topic_for,
};
