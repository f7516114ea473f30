//! MQTT ingestion service for cold-storage sensor telemetry.
//!
//! This crate provides a service that:
//! - Subscribes to `warehouse/unit/+/sensor/+` on an MQTT broker
//! - Stores every decoded reading in the local database, optionally pruning old ones
//! - Pushes min/max bounds to a control endpoint when enough readings arrive
//! - Raises alerts when a unit leaves its safe climate range
//! - Streams readings to WebSocket clients as they arrive
//!
//! # REST API Endpoints
//!
//! - `GET /api/health` - Service health and MQTT connection state
//! - `GET /api/status` - Pipeline counters, buffer occupancy, live subscribers
//! - `GET /api/readings` - Stored readings with filters
//! - `GET /api/units` - Units that have reported
//! - `GET /api/units/{id}` - One unit
//! - `GET /api/units/{id}/latest` - Most recent reading of a unit (`?kind=` to filter)
//! - `WS /api/ws` - Live readings stream
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/coldchain/service.toml`
//! (see [`config`] for every section). `MQTT_BROKER_URL`, `MQTT_USERNAME`,
//! `MQTT_PASSWORD`, `SYNC_ENDPOINT` and `ALERTS_API_URL` override the file.

pub mod api;
pub mod collector;
pub mod config;
pub mod retention;
pub mod sink;
pub mod state;
pub mod transport;
pub mod ws;

pub use collector::{Collector, CollectorError, RunningCollector};
pub use config::{
    AggregationConfig, AlertsConfig, Config, ConfigError, FlushTrigger, MqttConfig, ServerConfig,
    StorageConfig, SyncConfig, ValidationError,
};
pub use sink::StoreSink;
pub use state::AppState;
pub use transport::{
    SessionTracker, TransportClient, TransportError, TransportHandle, TransportOptions,
};

use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// The complete HTTP surface: REST API and WebSocket endpoint.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(api::router())
        .merge(ws::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
