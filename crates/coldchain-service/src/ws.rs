//! WebSocket handler for live readings.
//!
//! Every connection attaches one subscription to the live broadcaster and
//! receives `{"topic": ..., "message": {...}}` text frames. Clients may send
//! the same shape back to publish a message to the MQTT broker.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, header},
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::state::AppState;

/// Create the WebSocket router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/api/ws", get(ws_handler))
}

/// A client request to publish to the broker.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PublishRequest {
    pub topic: String,
    pub message: serde_json::Value,
}

impl PublishRequest {
    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Payload as published: the JSON encoding of `message`.
    pub fn payload(&self) -> Vec<u8> {
        self.message.to_string().into_bytes()
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let label = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    ws.on_upgrade(move |socket| handle_socket(socket, state, label))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, label: Option<String>) {
    let (mut sender, mut receiver) = socket.split();

    let mut subscription = state.broadcaster.attach(label);
    let id = subscription.id();
    info!(
        "WebSocket client {} connected ({} subscribers)",
        id,
        state.broadcaster.subscriber_count()
    );

    // The subscription lives in this task; ending it detaches the client.
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(j) => j,
                Err(e) => {
                    warn!("Failed to serialize event: {}", e);
                    continue;
                }
            };

            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let publish_state = Arc::clone(&state);
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Text(text)) => handle_client_frame(&publish_state, text.as_str()).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    warn!("WebSocket receive error: {}", e);
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        },
        _ = &mut recv_task => {
            send_task.abort();
        },
        _ = state.shutdown.cancelled() => {
            send_task.abort();
            recv_task.abort();
        },
    }

    info!("WebSocket client {} disconnected", id);
}

async fn handle_client_frame(state: &AppState, text: &str) {
    let request = match PublishRequest::parse(text) {
        Ok(request) => request,
        Err(e) => {
            debug!("Ignoring WebSocket frame: {}", e);
            return;
        }
    };

    let Some(transport) = &state.transport else {
        warn!("Dropping publish to {}: MQTT transport not running", request.topic);
        return;
    };

    match transport.publish(&request.topic, request.payload()).await {
        Ok(()) => info!("Published client message to {}", request.topic),
        Err(e) => warn!("Failed to publish client message: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_publish_request() {
        let request = PublishRequest::parse(
            r#"{"topic": "warehouse/unit/5/sensor/temperature", "message": {"value": 4.5}}"#,
        )
        .unwrap();
        assert_eq!(request.topic, "warehouse/unit/5/sensor/temperature");
        assert_eq!(request.payload(), br#"{"value":4.5}"#.to_vec());
    }

    #[test]
    fn test_parse_publish_request_rejects_other_frames() {
        assert!(PublishRequest::parse("ping").is_err());
        assert!(PublishRequest::parse(r#"{"message": 1}"#).is_err());
    }
}
