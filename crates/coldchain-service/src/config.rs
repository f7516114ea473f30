//! Service configuration.
//!
//! Loaded from TOML, then selectively overridden by environment variables
//! and command-line flags.
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:8080"
//!
//! [mqtt]
//! broker = "mqtts://broker.example.com:8883"
//! username = "ingest"
//! password = "secret"
//!
//! [aggregation]
//! trigger = "per_kind"
//! expected_kinds = ["temperature", "humidity"]
//! min_samples = 10
//! on_sync_failure = "retain"
//!
//! [storage]
//! retention_days = 90
//!
//! [sync]
//! endpoint = "https://control.example.com/api/thresholds/42"
//!
//! [alerts]
//! endpoint = "https://control.example.com"
//!
//! [[alerts.units]]
//! unit_id = "5"
//! warehouse_id = "north"
//! temperature = { min = 2.0, max = 8.0 }
//! humidity = { min = 30.0, max = 60.0 }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use coldchain_core::retry::DEFAULT_RETRYABLE_STATUSES;
use coldchain_core::{FlushPolicy, PipelineOptions, RetentionPolicy, RetryPolicy};
use coldchain_types::{SafeRange, SensorKind, UnitClimate};

use crate::transport::{normalize_broker_url, parse_broker_url};

/// Environment variable overriding `mqtt.broker`.
pub const ENV_BROKER_URL: &str = "MQTT_BROKER_URL";
/// Environment variable overriding `mqtt.username`.
pub const ENV_USERNAME: &str = "MQTT_USERNAME";
/// Environment variable overriding `mqtt.password`.
pub const ENV_PASSWORD: &str = "MQTT_PASSWORD";
/// Environment variable overriding `sync.endpoint`.
pub const ENV_SYNC_ENDPOINT: &str = "SYNC_ENDPOINT";
/// Environment variable overriding `alerts.endpoint`.
pub const ENV_ALERTS_URL: &str = "ALERTS_API_URL";

/// Service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub mqtt: MqttConfig,
    pub aggregation: AggregationConfig,
    pub sync: SyncConfig,
    pub alerts: AlertsConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Apply overrides from the process environment.
    ///
    /// Returns the names of the variables that were applied.
    pub fn apply_env(&mut self) -> Vec<&'static str> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup. Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Vec<&'static str>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut applied = Vec::new();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(ENV_BROKER_URL) {
            self.mqtt.broker = normalize_broker_url(url.trim());
            applied.push(ENV_BROKER_URL);
        }
        if let Some(username) = get(ENV_USERNAME) {
            self.mqtt.username = Some(username);
            applied.push(ENV_USERNAME);
        }
        if let Some(password) = get(ENV_PASSWORD) {
            self.mqtt.password = Some(password);
            applied.push(ENV_PASSWORD);
        }
        if let Some(endpoint) = get(ENV_SYNC_ENDPOINT) {
            self.sync.endpoint = Some(endpoint.trim().to_string());
            applied.push(ENV_SYNC_ENDPOINT);
        }
        if let Some(url) = get(ENV_ALERTS_URL) {
            self.alerts.endpoint = Some(url.trim().to_string());
            applied.push(ENV_ALERTS_URL);
        }

        applied
    }

    /// Validate the configuration and return every problem found.
    ///
    /// # Example
    ///
    /// ```
    /// use coldchain_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        errors.extend(self.storage.validate());
        errors.extend(self.mqtt.validate());
        errors.extend(self.aggregation.validate());
        errors.extend(self.sync.validate());
        errors.extend(self.alerts.validate());

        if self.aggregation.on_sync_failure == RetentionPolicy::Retain && self.sync.retry_delay == 0
        {
            errors.push(ValidationError::new(
                "aggregation.on_sync_failure",
                "retain requires a non-zero sync.retry_delay",
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Pipeline tunables derived from `[aggregation]` and `[sync]`.
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            flush_policy: self.aggregation.flush_policy(),
            retention: self.aggregation.on_sync_failure,
            margin: self.aggregation.margin,
            max_buffered: self.aggregation.max_buffered,
            shutdown_grace: Duration::from_secs(self.sync.shutdown_grace),
            ..Default::default()
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind: String,
    /// Per-subscriber queue length of the live broadcast channel.
    pub broadcast_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            broadcast_buffer: coldchain_core::broadcast::DEFAULT_CAPACITY,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.bind.is_empty() {
            errors.push(ValidationError::new(
                "server.bind",
                "bind address cannot be empty",
            ));
        } else {
            let parts: Vec<&str> = self.bind.rsplitn(2, ':').collect();
            if parts.len() != 2 {
                errors.push(ValidationError::new(
                    "server.bind",
                    format!(
                        "invalid bind address '{}': expected format 'host:port'",
                        self.bind
                    ),
                ));
            } else {
                match parts[0].parse::<u16>() {
                    Ok(0) => errors.push(ValidationError::new("server.bind", "port cannot be 0")),
                    Err(_) => errors.push(ValidationError::new(
                        "server.bind",
                        format!("invalid port '{}': must be a number 1-65535", parts[0]),
                    )),
                    Ok(_) => {}
                }
            }
        }

        if self.broadcast_buffer == 0 {
            errors.push(ValidationError::new(
                "server.broadcast_buffer",
                "broadcast buffer must be at least 1",
            ));
        }

        errors
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path.
    pub path: PathBuf,
    /// Delete readings older than this many days. Kept forever when unset.
    pub retention_days: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: coldchain_store::default_db_path(),
            retention_days: None,
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.path.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.path",
                "database path cannot be empty",
            ));
        }

        if self.retention_days == Some(0) {
            errors.push(ValidationError::new(
                "storage.retention_days",
                "retention must be at least 1 day",
            ));
        }

        errors
    }
}

/// MQTT broker connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker URL (`mqtt://host:port` or `mqtts://host:port`).
    pub broker: String,
    /// Client identifier. A random `coldchain_xxxxxx` id is used when unset.
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Keep-alive interval in seconds.
    pub keep_alive: u64,
    /// Seconds to wait before reconnecting after a connection error.
    pub reconnect_delay: u64,
    /// Subscription QoS level (0, 1, or 2).
    pub qos: u8,
    /// Messages the transport may queue ahead of the pipeline.
    pub channel_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "mqtt://localhost:1883".to_string(),
            client_id: None,
            username: None,
            password: None,
            keep_alive: 60,
            reconnect_delay: 5,
            qos: 1,
            channel_capacity: 256,
        }
    }
}

impl MqttConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Err(e) = parse_broker_url(&self.broker) {
            errors.push(ValidationError::new("mqtt.broker", e.to_string()));
        }

        if let Some(id) = &self.client_id
            && id.is_empty()
        {
            errors.push(ValidationError::new(
                "mqtt.client_id",
                "client id cannot be empty string (omit it for a random id)",
            ));
        }

        if self.password.is_some() && self.username.is_none() {
            errors.push(ValidationError::new(
                "mqtt.password",
                "password given without a username",
            ));
        }

        if self.keep_alive == 0 {
            errors.push(ValidationError::new(
                "mqtt.keep_alive",
                "keep-alive must be at least 1 second",
            ));
        }

        if self.reconnect_delay == 0 {
            errors.push(ValidationError::new(
                "mqtt.reconnect_delay",
                "reconnect delay must be at least 1 second",
            ));
        }

        if self.qos > 2 {
            errors.push(ValidationError::new(
                "mqtt.qos",
                format!("invalid QoS {}: must be 0, 1 or 2", self.qos),
            ));
        }

        if self.channel_capacity == 0 {
            errors.push(ValidationError::new(
                "mqtt.channel_capacity",
                "channel capacity must be at least 1",
            ));
        }

        errors
    }
}

/// Which flush trigger the aggregation buffer uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    /// Every expected kind needs `min_samples` readings.
    #[default]
    PerKind,
    /// `buffer_size` readings of any kind.
    BufferSize,
}

/// Aggregation buffer and bounds computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub trigger: FlushTrigger,
    /// Kinds that must be represented before a per-kind flush.
    pub expected_kinds: Vec<SensorKind>,
    pub min_samples: usize,
    pub buffer_size: usize,
    /// Symmetric widening applied to computed bounds.
    pub margin: f64,
    /// What to do with a batch whose sync ran out of retries.
    pub on_sync_failure: RetentionPolicy,
    /// Upper bound on buffered readings.
    pub max_buffered: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            trigger: FlushTrigger::PerKind,
            expected_kinds: vec![SensorKind::Temperature, SensorKind::Humidity],
            min_samples: 10,
            buffer_size: 20,
            margin: 0.0,
            on_sync_failure: RetentionPolicy::Discard,
            max_buffered: coldchain_core::buffer::DEFAULT_MAX_READINGS,
        }
    }
}

impl AggregationConfig {
    pub fn flush_policy(&self) -> FlushPolicy {
        match self.trigger {
            FlushTrigger::PerKind => {
                FlushPolicy::per_kind(self.expected_kinds.iter().copied(), self.min_samples)
            }
            FlushTrigger::BufferSize => FlushPolicy::buffer_size(self.buffer_size),
        }
    }

    /// Readings needed before the configured trigger can fire.
    fn threshold(&self) -> usize {
        match self.trigger {
            FlushTrigger::PerKind => self.min_samples.saturating_mul(self.expected_kinds.len()),
            FlushTrigger::BufferSize => self.buffer_size,
        }
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        match self.trigger {
            FlushTrigger::PerKind => {
                for required in [SensorKind::Temperature, SensorKind::Humidity] {
                    if !self.expected_kinds.contains(&required) {
                        errors.push(ValidationError::new(
                            "aggregation.expected_kinds",
                            format!("must include '{}' to compute bounds", required),
                        ));
                    }
                }
                if self.min_samples == 0 {
                    errors.push(ValidationError::new(
                        "aggregation.min_samples",
                        "min samples must be at least 1",
                    ));
                }
            }
            FlushTrigger::BufferSize => {
                if self.buffer_size == 0 {
                    errors.push(ValidationError::new(
                        "aggregation.buffer_size",
                        "buffer size must be at least 1",
                    ));
                }
            }
        }

        if !self.margin.is_finite() || self.margin < 0.0 {
            errors.push(ValidationError::new(
                "aggregation.margin",
                format!("margin {} must be a non-negative number", self.margin),
            ));
        }

        if self.max_buffered < self.threshold().max(1) {
            errors.push(ValidationError::new(
                "aggregation.max_buffered",
                format!(
                    "max buffered {} is below the {} readings needed to flush",
                    self.max_buffered,
                    self.threshold()
                ),
            ));
        }

        errors
    }
}

/// Bounds synchronization target and retry behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// URL receiving `PUT` requests with the bounds. Sync is off when unset.
    pub endpoint: Option<String>,
    /// Request timeout in seconds.
    pub timeout: u64,
    pub max_retries: u32,
    /// Seconds between attempts (before backoff).
    pub retry_delay: u64,
    pub backoff_multiplier: f64,
    /// Upper bound on the delay between attempts, in seconds.
    pub max_delay: u64,
    pub jitter: bool,
    /// HTTP statuses treated as transient.
    pub retryable_statuses: Vec<u16>,
    /// Seconds shutdown waits for an in-flight sync.
    pub shutdown_grace: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout: 10,
            max_retries: 3,
            retry_delay: 5,
            backoff_multiplier: 1.0,
            max_delay: 60,
            jitter: false,
            retryable_statuses: DEFAULT_RETRYABLE_STATUSES.to_vec(),
            shutdown_grace: 30,
        }
    }
}

impl SyncConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries)
            .initial_delay(Duration::from_secs(self.retry_delay))
            .max_delay(Duration::from_secs(self.max_delay))
            .backoff_multiplier(self.backoff_multiplier)
            .jitter(self.jitter)
            .retryable_statuses(self.retryable_statuses.iter().copied())
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Some(endpoint) = &self.endpoint {
            errors.extend(validate_http_url("sync.endpoint", endpoint));
        }

        if self.timeout == 0 {
            errors.push(ValidationError::new(
                "sync.timeout",
                "timeout must be at least 1 second",
            ));
        }

        if let Err(e) = self.retry_policy().validate() {
            errors.push(ValidationError::new("sync", e.to_string()));
        }

        for status in &self.retryable_statuses {
            if !(100..=599).contains(status) {
                errors.push(ValidationError::new(
                    "sync.retryable_statuses",
                    format!("{} is not an HTTP status code", status),
                ));
            }
        }

        errors
    }
}

/// Threshold alerting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Base URL of the alert API (`/api/alerts` is appended).
    pub endpoint: Option<String>,
    /// Request timeout in seconds.
    pub timeout: Option<u64>,
    /// Safe climate ranges per unit.
    pub units: Vec<UnitClimate>,
}

impl AlertsConfig {
    /// Request timeout, defaulting to 10 seconds.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.unwrap_or(10))
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Some(endpoint) = &self.endpoint {
            errors.extend(validate_http_url("alerts.endpoint", endpoint));
        }

        if self.timeout == Some(0) {
            errors.push(ValidationError::new(
                "alerts.timeout",
                "timeout must be at least 1 second",
            ));
        }

        let mut seen = HashSet::new();
        for (i, unit) in self.units.iter().enumerate() {
            let prefix = format!("alerts.units[{}]", i);

            if unit.unit_id.is_empty() {
                errors.push(ValidationError::new(
                    format!("{}.unit_id", prefix),
                    "unit id cannot be empty",
                ));
            } else if !seen.insert(unit.unit_id.as_str()) {
                errors.push(ValidationError::new(
                    format!("{}.unit_id", prefix),
                    format!("duplicate unit '{}'", unit.unit_id),
                ));
            }

            for (name, range) in [("temperature", unit.temperature), ("humidity", unit.humidity)] {
                if let Err(e) = SafeRange::new(range.min, range.max) {
                    errors.push(ValidationError::new(
                        format!("{}.{}", prefix, name),
                        e.to_string(),
                    ));
                }
            }
        }

        errors
    }
}

fn validate_http_url(field: &str, url: &str) -> Option<ValidationError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        None
    } else {
        Some(ValidationError::new(
            field,
            format!("'{}' must start with http:// or https://", url),
        ))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `mqtt.broker` or `alerts.units[0].unit_id`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("coldchain")
        .join("service.toml")
}
