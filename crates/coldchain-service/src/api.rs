//! REST API endpoints for the coldchain-service.
//!
//! # Locking
//!
//! Only `state.store` is behind a mutex. It is shared with the persistence
//! sink, so handlers hold it for a single query and never across an await.
//!
//! ## Error Handling
//!
//! All endpoints return structured JSON errors via [`AppError`]. Store errors
//! map to HTTP 500; bad query parameters to 400; unknown units to 404.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use coldchain_core::{BufferStats, MetricsSnapshot, SubscriberInfo};
use coldchain_store::{ReadingQuery, StoredReading, StoredUnit};
use coldchain_types::{ConnectionState, SensorKind};

use crate::state::AppState;

/// Readings returned when `limit` is not given.
pub const DEFAULT_READINGS_LIMIT: u32 = 100;
/// Largest accepted `limit`.
pub const MAX_READINGS_LIMIT: u32 = 1000;

/// Create the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(get_status))
        .route("/api/readings", get(get_readings))
        .route("/api/units", get(list_units))
        .route("/api/units/{id}", get(get_unit))
        .route("/api/units/{id}/latest", get(get_latest_reading))
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub mqtt: ConnectionState,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        mqtt: state.connection_state(),
        timestamp: OffsetDateTime::now_utc(),
    })
}

/// Service status: pipeline counters, buffer occupancy and live subscribers.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub uptime_seconds: u64,
    pub mqtt: ConnectionState,
    /// Whether a sync endpoint is configured.
    pub sync_configured: bool,
    /// Units with configured safe ranges.
    pub monitored_units: usize,
    pub pipeline: MetricsSnapshot,
    pub buffer: BufferStats,
    pub subscribers: Vec<SubscriberInfo>,
}

async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let buffer = state.buffer_stats.borrow().clone();

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        timestamp: OffsetDateTime::now_utc(),
        started_at: state.started_at(),
        uptime_seconds: state.uptime_seconds(),
        mqtt: state.connection_state(),
        sync_configured: state.config.sync.endpoint.is_some(),
        monitored_units: state.config.alerts.units.len(),
        pipeline: state.metrics.snapshot(),
        buffer,
        subscribers: state.broadcaster.subscribers(),
    })
}

/// Query parameters for `/api/readings`.
#[derive(Debug, Default, Deserialize)]
pub struct ReadingsQuery {
    pub unit: Option<String>,
    pub kind: Option<String>,
    /// Unix timestamp (seconds), inclusive.
    pub since: Option<i64>,
    /// Unix timestamp (seconds), inclusive.
    pub until: Option<i64>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ReadingsQuery {
    /// Validate parameters and turn them into a store query.
    pub fn to_store_query(&self) -> Result<ReadingQuery, AppError> {
        if let (Some(since), Some(until)) = (self.since, self.until)
            && since > until
        {
            return Err(AppError::BadRequest(format!(
                "Invalid time range: 'since' ({}) must be less than or equal to 'until' ({})",
                since, until
            )));
        }

        let limit = self.limit.unwrap_or(DEFAULT_READINGS_LIMIT);
        if limit == 0 || limit > MAX_READINGS_LIMIT {
            return Err(AppError::BadRequest(format!(
                "Invalid limit {}: must be between 1 and {}",
                limit, MAX_READINGS_LIMIT
            )));
        }

        let mut query = ReadingQuery::new().limit(limit);

        if let Some(unit) = &self.unit {
            query = query.unit(unit);
        }
        if let Some(kind) = &self.kind {
            query = query.kind(parse_kind(kind)?);
        }
        if let Some(since) = self.since {
            query = query.since(unix_seconds(since)?);
        }
        if let Some(until) = self.until {
            query = query.until(unix_seconds(until)?);
        }
        if let Some(offset) = self.offset {
            query = query.offset(offset);
        }

        Ok(query)
    }
}

/// Query parameters for `/api/units/{id}/latest`.
#[derive(Debug, Default, Deserialize)]
pub struct LatestQuery {
    pub kind: Option<String>,
}

fn parse_kind(kind: &str) -> Result<SensorKind, AppError> {
    kind.parse()
        .map_err(|e| AppError::BadRequest(format!("Invalid kind '{}': {}", kind, e)))
}

fn unix_seconds(secs: i64) -> Result<OffsetDateTime, AppError> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| AppError::BadRequest(format!("Invalid timestamp {}: {}", secs, e)))
}

/// Latest readings, newest first.
///
/// # Query Parameters
///
/// - `unit`: storage unit id
/// - `kind`: `temperature`, `humidity` or `proximityN`
/// - `since` / `until`: Unix timestamps (inclusive)
/// - `limit`: 1 to 1000, default 100
/// - `offset`: readings to skip
async fn get_readings(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ReadingsQuery>,
) -> Result<Json<Vec<StoredReading>>, AppError> {
    let query = params.to_store_query()?;
    let store = state.store.lock().await;
    let readings = store.query_readings(&query)?;
    Ok(Json(readings))
}

async fn list_units(State(state): State<Arc<AppState>>) -> Result<Json<Vec<StoredUnit>>, AppError> {
    let store = state.store.lock().await;
    Ok(Json(store.list_units()?))
}

async fn get_unit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<StoredUnit>, AppError> {
    let store = state.store.lock().await;
    store
        .get_unit(&id)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Unit not found: {}", id)))
}

/// Most recent reading of a unit, optionally restricted to one `kind`.
///
/// Returns 404 when the unit has no matching readings.
async fn get_latest_reading(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<LatestQuery>,
) -> Result<Json<StoredReading>, AppError> {
    let kind = params.kind.as_deref().map(parse_kind).transpose()?;
    let store = state.store.lock().await;
    store.latest_reading(&id, kind)?.map(Json).ok_or_else(|| {
        AppError::NotFound(match kind {
            Some(kind) => format!("No {} readings for unit {}", kind, id),
            None => format!("No readings for unit {}", id),
        })
    })
}

/// Application error type.
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Store(coldchain_store::Error),
}

impl From<coldchain_store::Error> for AppError {
    fn from(e: coldchain_store::Error) -> Self {
        AppError::Store(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Store(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use coldchain_core::Reading;
    use coldchain_store::Store;
    use http_body_util::BodyExt;
    use time::macros::datetime;
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    use crate::config::Config;

    fn create_test_state() -> Arc<AppState> {
        let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        AppState::new(store, Config::default()).shared()
    }

    async fn seed(state: &AppState) {
        let base = datetime!(2024-05-01 10:00 UTC);
        let mut store = state.store.lock().await;
        store
            .insert_readings(&[
                Reading::new("5", SensorKind::Temperature, 3.0, base),
                Reading::new("5", SensorKind::Humidity, 45.0, base + time::Duration::minutes(1)),
                Reading::new("6", SensorKind::Temperature, 4.0, base + time::Duration::minutes(2)),
            ])
            .unwrap();
    }

    async fn get_json(state: Arc<AppState>, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router()
            .with_state(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (status, json) = get_json(create_test_state(), "/api/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["mqtt"], "offline");
        assert!(json["version"].is_string());
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let state = create_test_state();
        let _subscription = state.broadcaster.attach(Some("dashboard".to_string()));

        let (status, json) = get_json(state, "/api/status").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["pipeline"]["messages_received"], 0);
        assert_eq!(json["buffer"]["buffered"], 0);
        assert_eq!(json["sync_configured"], false);
        assert_eq!(json["subscribers"].as_array().unwrap().len(), 1);
        assert_eq!(json["subscribers"][0]["label"], "dashboard");
    }

    #[tokio::test]
    async fn test_readings_empty() {
        let (status, json) = get_json(create_test_state(), "/api/readings").await;
        assert_eq!(status, StatusCode::OK);
        assert!(json.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_readings_filtered() {
        let state = create_test_state();
        seed(&state).await;

        let (status, json) = get_json(Arc::clone(&state), "/api/readings").await;
        assert_eq!(status, StatusCode::OK);
        let readings = json.as_array().unwrap();
        assert_eq!(readings.len(), 3);
        assert_eq!(readings[0]["unitId"], "6");

        let (_, json) = get_json(Arc::clone(&state), "/api/readings?unit=5&kind=humidity").await;
        let readings = json.as_array().unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0]["sensorKind"], "humidity");
        assert_eq!(readings[0]["value"], 45.0);

        let (_, json) = get_json(state, "/api/readings?limit=1&offset=1").await;
        let readings = json.as_array().unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0]["sensorKind"], "humidity");
    }

    #[tokio::test]
    async fn test_readings_bad_parameters() {
        let state = create_test_state();

        let (status, json) = get_json(Arc::clone(&state), "/api/readings?kind=pressure").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("pressure"));

        let (status, _) = get_json(Arc::clone(&state), "/api/readings?limit=5000").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = get_json(state, "/api/readings?since=200&until=100").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_units_endpoints() {
        let state = create_test_state();
        seed(&state).await;

        let (status, json) = get_json(Arc::clone(&state), "/api/units").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 2);

        let (status, json) = get_json(Arc::clone(&state), "/api/units/5").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["id"], "5");
        assert_eq!(json["readingCount"], 2);

        let (status, json) = get_json(state, "/api/units/404").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json["error"].as_str().unwrap().contains("404"));
    }

    #[tokio::test]
    async fn test_latest_reading_endpoint() {
        let state = create_test_state();
        seed(&state).await;

        let (status, json) = get_json(Arc::clone(&state), "/api/units/5/latest").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["unitId"], "5");
        assert_eq!(json["sensorKind"], "humidity");
        assert_eq!(json["value"], 45.0);

        let (status, json) =
            get_json(Arc::clone(&state), "/api/units/5/latest?kind=temperature").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["value"], 3.0);

        let (status, json) =
            get_json(Arc::clone(&state), "/api/units/6/latest?kind=humidity").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json["error"].as_str().unwrap().contains("humidity"));

        let (status, _) = get_json(Arc::clone(&state), "/api/units/9/latest").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = get_json(state, "/api/units/5/latest?kind=pressure").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_readings_query_default_limit() {
        let query = ReadingsQuery::default().to_store_query().unwrap();
        assert_eq!(query.limit, Some(DEFAULT_READINGS_LIMIT));
        assert!(query.newest_first);
    }

    #[test]
    fn test_app_error_store() {
        let error = AppError::Store(coldchain_store::Error::InvalidTimestamp("x".into()));
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
