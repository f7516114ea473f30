//! MQTT transport client.
//!
//! Keeps a persistent connection to the broker, subscribes to every unit's
//! sensor topics and forwards each publish to the pipeline as a
//! [`RawMessage`].
//!
//! # Reconnection
//!
//! Connection errors never end the message stream. The client logs the
//! error, goes `Offline`, waits the configured reconnect delay and polls
//! again. Each new session (every ConnAck) triggers exactly one
//! subscription request; with a clean session the broker forgets
//! subscriptions across reconnects, so delivery resumes once it is granted.
//!
//! # Example Configuration
//!
//! ```toml
//! [mqtt]
//! broker = "mqtts://broker.example.com:8883"
//! username = "ingest"
//! password = "secret"
//! keep_alive = 60
//! reconnect_delay = 5
//! ```

use std::time::Duration;

use rumqttc::{
    AsyncClient, ClientError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use coldchain_core::RawMessage;
use coldchain_types::{ConnectionState, SUBSCRIBE_PATTERN};

use crate::config::MqttConfig;

/// Requests the client may queue for the event loop.
const REQUEST_CAPACITY: usize = 100;

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid broker URL '{url}': {reason}")]
    InvalidBrokerUrl { url: String, reason: String },
    #[error("Invalid publish topic '{0}'")]
    InvalidTopic(String),
    #[error("MQTT client error: {0}")]
    Client(#[from] ClientError),
}

/// Prefix bare `host[:port]` strings with `mqtt://`.
pub fn normalize_broker_url(url: &str) -> String {
    if url.contains("://") {
        url.to_string()
    } else {
        format!("mqtt://{}", url)
    }
}

/// Parse an MQTT broker URL into (host, port, use_tls).
pub fn parse_broker_url(url: &str) -> Result<(String, u16, bool), TransportError> {
    let invalid = |reason: String| TransportError::InvalidBrokerUrl {
        url: url.to_string(),
        reason,
    };

    let (scheme, rest) = if let Some(stripped) = url.strip_prefix("mqtt://") {
        ("mqtt", stripped)
    } else if let Some(stripped) = url.strip_prefix("mqtts://") {
        ("mqtts", stripped)
    } else {
        return Err(invalid(
            "URL must start with mqtt:// or mqtts://".to_string(),
        ));
    };

    let use_tls = scheme == "mqtts";
    let default_port = if use_tls { 8883 } else { 1883 };
    let rest = rest.trim_end_matches('/');

    let (host, port) = if let Some((h, p)) = rest.rsplit_once(':') {
        let port = p
            .parse::<u16>()
            .map_err(|_| invalid(format!("invalid port '{}'", p)))?;
        (h.to_string(), port)
    } else {
        (rest.to_string(), default_port)
    };

    if host.is_empty() {
        return Err(invalid("host cannot be empty".to_string()));
    }

    Ok((host, port, use_tls))
}

/// A random client id of the form `coldchain_xxxxxx`.
pub fn random_client_id() -> String {
    format!("coldchain_{:06x}", rand::random::<u32>() & 0x00ff_ffff)
}

fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// Resolved connection settings.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
    pub qos: QoS,
}

impl TransportOptions {
    pub fn from_config(config: &MqttConfig) -> Result<Self, TransportError> {
        let (host, port, use_tls) = parse_broker_url(&config.broker)?;
        let credentials = config
            .username
            .as_ref()
            .map(|u| (u.clone(), config.password.clone().unwrap_or_default()));

        Ok(Self {
            host,
            port,
            use_tls,
            client_id: config.client_id.clone().unwrap_or_else(random_client_id),
            credentials,
            keep_alive: Duration::from_secs(config.keep_alive.max(1)),
            reconnect_delay: Duration::from_secs(config.reconnect_delay),
            qos: qos_from_level(config.qos),
        })
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);

        if let Some((username, password)) = &self.credentials {
            options.set_credentials(username, password);
        }

        if self.use_tls {
            options.set_transport(rumqttc::Transport::tls_with_config(
                rumqttc::TlsConfiguration::Native,
            ));
        }

        options
    }
}

/// Session bookkeeping for the transport, separate from any I/O.
///
/// Tracks the connection state and makes sure each broker session gets
/// exactly one subscription request.
#[derive(Debug, Clone)]
pub struct SessionTracker {
    state: ConnectionState,
    sessions: u64,
    subscribe_requests: u64,
    subscribed: bool,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTracker {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
            sessions: 0,
            subscribe_requests: 0,
            subscribed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Number of sessions established so far.
    pub fn sessions(&self) -> u64 {
        self.sessions
    }

    /// Number of subscription requests issued so far.
    pub fn subscribe_requests(&self) -> u64 {
        self.subscribe_requests
    }

    /// Whether the broker granted the subscription for the current session.
    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    /// A ConnAck arrived. Returns `true` if a subscription must be requested.
    ///
    /// A repeated ConnAck within the same session does not request again.
    pub fn on_connected(&mut self) -> bool {
        if self.state == ConnectionState::Connected || self.state == ConnectionState::Closed {
            return false;
        }
        self.state = ConnectionState::Connected;
        self.sessions += 1;
        self.subscribed = false;
        self.subscribe_requests += 1;
        true
    }

    /// The broker answered the subscription request.
    pub fn on_subscribe_ack(&mut self, granted: bool) {
        self.subscribed = granted;
    }

    /// The connection failed.
    pub fn on_error(&mut self) -> ConnectionState {
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Offline;
            self.subscribed = false;
        }
        self.state
    }

    /// A new connection attempt starts after a failure.
    pub fn on_retry(&mut self) -> ConnectionState {
        if self.state == ConnectionState::Offline {
            self.state = ConnectionState::Reconnecting;
        }
        self.state
    }

    /// The client was shut down deliberately.
    pub fn on_closed(&mut self) -> ConnectionState {
        self.state = ConnectionState::Closed;
        self.subscribed = false;
        self.state
    }
}

/// Cloneable handle for publishing through the live connection.
#[derive(Clone)]
pub struct TransportHandle {
    client: AsyncClient,
    qos: QoS,
}

impl TransportHandle {
    /// Publish a payload to `topic`. Wildcard topics are rejected.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if topic.is_empty() || topic.contains(['#', '+']) {
            return Err(TransportError::InvalidTopic(topic.to_string()));
        }
        self.client.publish(topic, self.qos, false, payload).await?;
        debug!("Published {} to MQTT", topic);
        Ok(())
    }
}

/// MQTT client feeding the ingestion pipeline.
pub struct TransportClient {
    options: TransportOptions,
    client: AsyncClient,
    eventloop: EventLoop,
    state_tx: watch::Sender<ConnectionState>,
}

impl TransportClient {
    pub fn new(options: TransportOptions) -> Self {
        let (client, eventloop) = AsyncClient::new(options.mqtt_options(), REQUEST_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        Self {
            options,
            client,
            eventloop,
            state_tx,
        }
    }

    pub fn handle(&self) -> TransportHandle {
        TransportHandle {
            client: self.client.clone(),
            qos: self.options.qos,
        }
    }

    /// Receiver of connection state changes.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Drive the connection until `cancel` fires or `tx` is closed.
    ///
    /// Dropping `tx` on return closes the pipeline's input.
    pub async fn run(mut self, tx: mpsc::Sender<RawMessage>, cancel: CancellationToken) {
        let mut tracker = SessionTracker::new();
        info!(
            "Connecting to MQTT broker {}:{} as {}",
            self.options.host, self.options.port, self.options.client_id
        );

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    let first = tracker.sessions() == 0;
                    if tracker.on_connected() {
                        if first {
                            info!("MQTT connected ({:?})", ack.code);
                        } else {
                            info!("MQTT reconnected ({:?})", ack.code);
                        }
                        self.state_tx.send_replace(tracker.state());
                        if let Err(e) = self.client.try_subscribe(SUBSCRIBE_PATTERN, self.options.qos)
                        {
                            error!("Failed to request subscription to {}: {}", SUBSCRIBE_PATTERN, e);
                        }
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let granted = !ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure));
                    tracker.on_subscribe_ack(granted);
                    if granted {
                        info!("Subscribed to {}", SUBSCRIBE_PATTERN);
                    } else {
                        error!("Broker rejected subscription to {}", SUBSCRIBE_PATTERN);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = RawMessage {
                        topic: publish.topic,
                        payload: publish.payload,
                        received_at: OffsetDateTime::now_utc(),
                    };
                    // Waiting here applies backpressure to the broker connection.
                    let sent = tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = tx.send(message) => sent,
                    };
                    if sent.is_err() {
                        info!("Pipeline input closed, stopping MQTT transport");
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::PingResp)) => {
                    debug!("MQTT ping response received");
                }
                Ok(_) => {}
                Err(e) => {
                    tracker.on_error();
                    self.state_tx.send_replace(tracker.state());
                    warn!(
                        "MQTT connection error: {}. Reconnecting in {:?}",
                        e, self.options.reconnect_delay
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.options.reconnect_delay) => {}
                    }

                    tracker.on_retry();
                    self.state_tx.send_replace(tracker.state());
                    info!("Reconnecting to MQTT broker");
                }
            }
        }

        self.disconnect().await;
        tracker.on_closed();
        self.state_tx.send_replace(tracker.state());
        info!("MQTT connection closed");
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("Error disconnecting MQTT client: {}", e);
            return;
        }

        let eventloop = &mut self.eventloop;
        let flushed = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;

        if flushed.is_err() {
            debug!("Timed out sending MQTT disconnect");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broker_url_mqtt() {
        let (host, port, tls) = parse_broker_url("mqtt://localhost:1883").unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 1883);
        assert!(!tls);
    }

    #[test]
    fn test_parse_broker_url_mqtts() {
        let (host, port, tls) = parse_broker_url("mqtts://broker.example.com:8883").unwrap();
        assert_eq!(host, "broker.example.com");
        assert_eq!(port, 8883);
        assert!(tls);
    }

    #[test]
    fn test_parse_broker_url_default_port() {
        assert_eq!(
            parse_broker_url("mqtt://localhost").unwrap(),
            ("localhost".to_string(), 1883, false)
        );
        assert_eq!(
            parse_broker_url("mqtts://secure.example.com/").unwrap(),
            ("secure.example.com".to_string(), 8883, true)
        );
    }

    #[test]
    fn test_parse_broker_url_invalid() {
        assert!(parse_broker_url("http://localhost:1883").is_err());
        assert!(parse_broker_url("localhost:1883").is_err());
        assert!(parse_broker_url("mqtt://:1883").is_err());
        assert!(parse_broker_url("mqtt://localhost:99999").is_err());
    }

    #[test]
    fn test_normalize_broker_url() {
        assert_eq!(normalize_broker_url("broker:1883"), "mqtt://broker:1883");
        assert_eq!(normalize_broker_url("mqtt://broker"), "mqtt://broker");
        assert_eq!(normalize_broker_url("mqtts://broker"), "mqtts://broker");
    }

    #[test]
    fn test_random_client_id() {
        let id = random_client_id();
        let suffix = id.strip_prefix("coldchain_").unwrap();
        assert_eq!(suffix.len(), 6);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_options_from_config() {
        let config = MqttConfig {
            broker: "mqtts://broker.example.com".to_string(),
            client_id: Some("ingest-1".to_string()),
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            qos: 0,
            ..Default::default()
        };
        let options = TransportOptions::from_config(&config).unwrap();
        assert_eq!(options.port, 8883);
        assert!(options.use_tls);
        assert_eq!(options.client_id, "ingest-1");
        assert_eq!(
            options.credentials,
            Some(("user".to_string(), "pass".to_string()))
        );
        assert_eq!(options.keep_alive, Duration::from_secs(60));
        assert_eq!(options.reconnect_delay, Duration::from_secs(5));
        assert_eq!(options.qos, QoS::AtMostOnce);

        let generated = TransportOptions::from_config(&MqttConfig::default()).unwrap();
        assert!(generated.client_id.starts_with("coldchain_"));
        assert!(generated.credentials.is_none());
    }

    #[test]
    fn test_session_subscribes_once_per_connection() {
        let mut tracker = SessionTracker::new();
        assert_eq!(tracker.state(), ConnectionState::Connecting);

        assert!(tracker.on_connected());
        assert!(!tracker.on_connected());
        tracker.on_subscribe_ack(true);
        assert!(tracker.is_subscribed());
        assert_eq!(tracker.subscribe_requests(), 1);
    }

    #[test]
    fn test_session_resubscribes_exactly_once_after_reconnect() {
        let mut tracker = SessionTracker::new();
        assert!(tracker.on_connected());
        tracker.on_subscribe_ack(true);

        assert_eq!(tracker.on_error(), ConnectionState::Offline);
        assert!(!tracker.is_subscribed());
        // A failed reconnect attempt in between.
        assert_eq!(tracker.on_retry(), ConnectionState::Reconnecting);
        assert_eq!(tracker.on_error(), ConnectionState::Offline);
        assert_eq!(tracker.on_retry(), ConnectionState::Reconnecting);

        assert!(tracker.on_connected());
        assert!(!tracker.on_connected());
        assert_eq!(tracker.state(), ConnectionState::Connected);
        assert_eq!(tracker.sessions(), 2);
        assert_eq!(tracker.subscribe_requests(), 2);
    }

    #[test]
    fn test_rejected_subscription_recovers_on_next_session() {
        let mut tracker = SessionTracker::new();
        assert!(tracker.on_connected());
        tracker.on_subscribe_ack(false);
        assert!(!tracker.is_subscribed());

        tracker.on_error();
        tracker.on_retry();
        assert!(tracker.on_connected());
        tracker.on_subscribe_ack(true);
        assert!(tracker.is_subscribed());
    }

    #[test]
    fn test_closed_session_stays_closed() {
        let mut tracker = SessionTracker::new();
        tracker.on_connected();
        assert_eq!(tracker.on_closed(), ConnectionState::Closed);
        assert_eq!(tracker.on_error(), ConnectionState::Closed);
        assert_eq!(tracker.on_retry(), ConnectionState::Closed);
        assert!(!tracker.on_connected());
    }

    #[tokio::test]
    async fn test_publish_rejects_wildcards() {
        let client = TransportClient::new(
            TransportOptions::from_config(&MqttConfig::default()).unwrap(),
        );
        let handle = client.handle();
        assert!(matches!(
            handle.publish("warehouse/unit/+/sensor/+", b"{}".to_vec()).await,
            Err(TransportError::InvalidTopic(_))
        ));
        assert!(matches!(
            handle.publish("", Vec::new()).await,
            Err(TransportError::InvalidTopic(_))
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel_and_reports_closed() {
        // Nothing listens on the discard port, so the client stays disconnected.
        let config = MqttConfig {
            broker: "mqtt://127.0.0.1:9".to_string(),
            reconnect_delay: 1,
            ..Default::default()
        };
        let client = TransportClient::new(TransportOptions::from_config(&config).unwrap());
        let mut state = client.state();
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(client.run(tx, cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(*state.borrow_and_update(), ConnectionState::Closed);
        assert!(rx.recv().await.is_none());
    }
}
