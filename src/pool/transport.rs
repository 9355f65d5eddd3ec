//! Pooled-connection transport
//!
//! [`SocketConnector::open`] creates one transport object and returns
//! immediately; the handshake and everything after it is reported through
//! the [`SocketLink`] event channel. Dropping the link's outbound sender
//! closes the transport.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;

use super::config::ConnectionConfig;
use super::error::{PoolError, PoolResult};

/// Events a transport reports to the pool
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// Handshake completed
    Open,
    /// Application message
    Message { event: String, payload: Value },
    /// Liveness reply
    Pong,
    /// Transport-level error
    Error(String),
    /// Transport closed; no further events follow
    Closed { reason: Option<String> },
}

/// Outbound application message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub event: String,
    #[serde(rename = "data")]
    pub payload: Value,
}

/// Both halves of a live transport object
pub struct SocketLink {
    pub outbound: mpsc::UnboundedSender<OutboundMessage>,
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

impl SocketLink {
    /// Create a link and the transport-side ends of its channels
    pub fn pair() -> (
        Self,
        mpsc::UnboundedReceiver<OutboundMessage>,
        mpsc::UnboundedSender<SocketEvent>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: outbound_tx,
                events: events_rx,
            },
            outbound_rx,
            events_tx,
        )
    }
}

/// Factory for transport objects
pub trait SocketConnector: Send + Sync + 'static {
    fn open(&self, config: &ConnectionConfig) -> PoolResult<SocketLink>;
}

/// WebSocket transport over tokio-tungstenite.
///
/// Frames are JSON text `{"event": name, "data": payload}`. An inbound
/// `pong` event or a WebSocket pong frame counts as a heartbeat.
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self
    }
}

impl SocketConnector for TungsteniteConnector {
    fn open(&self, config: &ConnectionConfig) -> PoolResult<SocketLink> {
        let supported = config
            .options
            .transports
            .iter()
            .any(|t| t.eq_ignore_ascii_case("websocket"));
        if !supported {
            return Err(PoolError::UnsupportedTransport(
                config.options.transports.clone(),
            ));
        }

        let url = config.endpoint()?;
        let (link, outbound, events) = SocketLink::pair();

        tokio::spawn(run_socket(
            url,
            config.options.timeout,
            config.options.ping_interval,
            outbound,
            events,
        ));

        Ok(link)
    }
}

async fn run_socket(
    url: String,
    handshake_timeout: Duration,
    ping_interval: Duration,
    mut outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    events: mpsc::UnboundedSender<SocketEvent>,
) {
    let stream = match tokio::time::timeout(handshake_timeout, connect_async(url.as_str())).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => {
            let _ = events.send(SocketEvent::Error(e.to_string()));
            return;
        }
        Err(_) => {
            let _ = events.send(SocketEvent::Error("transport handshake timeout".to_string()));
            return;
        }
    };

    if events.send(SocketEvent::Open).is_err() {
        // Pool already gave up on this attempt
        return;
    }

    let (mut sink, mut frames) = stream.split();
    let mut ping = tokio::time::interval(ping_interval);
    ping.tick().await;

    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => {
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::error!(error = %e, event = %message.event, "Failed to serialize outbound message");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        let _ = events.send(SocketEvent::Error(e.to_string()));
                        let _ = events.send(SocketEvent::Closed { reason: Some("send failed".to_string()) });
                        return;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = events.send(SocketEvent::Closed { reason: Some("client disconnect".to_string()) });
                    return;
                }
            },
            frame = frames.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = decode_frame(text.as_str()) {
                        let _ = events.send(event);
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    let _ = events.send(SocketEvent::Pong);
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string());
                    let _ = events.send(SocketEvent::Closed { reason });
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events.send(SocketEvent::Error(e.to_string()));
                    let _ = events.send(SocketEvent::Closed { reason: None });
                    return;
                }
                None => {
                    let _ = events.send(SocketEvent::Closed { reason: None });
                    return;
                }
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    let _ = events.send(SocketEvent::Closed { reason: Some("ping failed".to_string()) });
                    return;
                }
            }
        }
    }
}

#[derive(Deserialize)]
struct InboundFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

fn decode_frame(text: &str) -> Option<SocketEvent> {
    match serde_json::from_str::<InboundFrame>(text) {
        Ok(frame) if frame.event == "pong" => Some(SocketEvent::Pong),
        Ok(frame) => Some(SocketEvent::Message {
            event: frame.event,
            payload: frame.data,
        }),
        Err(e) => {
            tracing::debug!(error = %e, "Dropping undecodable socket frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ConnectionOptions;
    use serde_json::json;

    #[test]
    fn test_decode_message_frame() {
        let event = decode_frame(r#"{"event":"bus:locationUpdate","data":{"busId":"b1","lat":1.5}}"#);
        assert_eq!(
            event,
            Some(SocketEvent::Message {
                event: "bus:locationUpdate".to_string(),
                payload: json!({"busId": "b1", "lat": 1.5}),
            })
        );
    }

    #[test]
    fn test_decode_pong_and_garbage() {
        assert_eq!(decode_frame(r#"{"event":"pong"}"#), Some(SocketEvent::Pong));
        assert_eq!(decode_frame("not json"), None);
        assert_eq!(decode_frame(r#"{"data":1}"#), None);
    }

    #[test]
    fn test_outbound_wire_shape() {
        let message = OutboundMessage {
            event: "driver:location".to_string(),
            payload: json!({"lat": 1}),
        };
        let text = serde_json::to_string(&message).unwrap();
        assert_eq!(text, r#"{"event":"driver:location","data":{"lat":1}}"#);
    }

    #[test]
    fn test_connector_rejects_unsupported_transport() {
        let config = ConnectionConfig::new("x", "ws://localhost:1").options(ConnectionOptions {
            transports: vec!["polling".to_string()],
            ..Default::default()
        });
        assert!(matches!(
            TungsteniteConnector::new().open(&config),
            Err(PoolError::UnsupportedTransport(_))
        ));
    }
}
