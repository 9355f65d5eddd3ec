//! Supabase Realtime replication client
//!
//! Speaks the Phoenix channel protocol (`vsn=1.0.0`) over one shared
//! WebSocket. Every subscription is its own channel joined with a
//! `postgres_changes` config; change payloads arrive as `postgres_changes`
//! events and their `data` object is forwarded untouched.
//!
//! The socket is started lazily by the first channel, reconnected with
//! backoff while any channel exists, and every channel is rejoined after a
//! reconnect.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;

use super::channel::{
    ChangeCallback, ChannelHandle, ChannelRequest, ChannelStatus, ReplicationClient, StatusCallback,
};
use super::error::{SubscriptionError, SubscriptionResult};
use crate::backoff::Backoff;
use crate::sync::{isolate, lock};

#[derive(Debug, Clone)]
pub struct PhoenixConfig {
    /// Project URL, e.g. `https://xyz.supabase.co`
    pub url: String,
    pub api_key: String,
    /// User JWT sent with each join; the API key is used when absent
    pub access_token: Option<String>,
    pub heartbeat_interval: Duration,
    /// A join with no reply after this long is reported as timed out
    pub join_timeout: Duration,
    pub backoff: Backoff,
}

impl Default for PhoenixConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:54321".to_string(),
            api_key: String::new(),
            access_token: None,
            heartbeat_interval: Duration::from_secs(30),
            join_timeout: Duration::from_secs(10),
            backoff: Backoff::pooled(),
        }
    }
}

impl PhoenixConfig {
    /// Realtime socket endpoint with the key and protocol version
    pub fn endpoint(&self) -> SubscriptionResult<String> {
        let base = self.url.trim().trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else if base.starts_with("ws://") || base.starts_with("wss://") {
            base.to_string()
        } else {
            return Err(SubscriptionError::InvalidUrl {
                url: self.url.clone(),
                message: "expected an http(s) or ws(s) URL".to_string(),
            });
        };

        Ok(format!(
            "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            ws_base,
            urlencoding::encode(&self.api_key)
        ))
    }
}

struct ChannelEntry {
    request: ChannelRequest,
    on_change: Arc<ChangeCallback>,
    on_status: Arc<StatusCallback>,
    join_ref: Option<String>,
    joined: bool,
}

#[derive(Default)]
struct SocketState {
    channels: HashMap<String, ChannelEntry>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    task: Option<JoinHandle<()>>,
    connected: bool,
}

struct PhoenixInner {
    config: PhoenixConfig,
    endpoint: String,
    state: Mutex<SocketState>,
    next_ref: AtomicU64,
    next_topic: AtomicU64,
}

#[derive(Clone)]
pub struct PhoenixReplicationClient {
    inner: Arc<PhoenixInner>,
}

impl PhoenixReplicationClient {
    pub fn new(config: PhoenixConfig) -> SubscriptionResult<Self> {
        let endpoint = config.endpoint()?;
        Ok(Self {
            inner: Arc::new(PhoenixInner {
                config,
                endpoint,
                state: Mutex::new(SocketState::default()),
                next_ref: AtomicU64::new(1),
                next_topic: AtomicU64::new(1),
            }),
        })
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.state).connected
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.inner.state).channels.len()
    }
}

impl ReplicationClient for PhoenixReplicationClient {
    fn open_channel(
        &self,
        request: ChannelRequest,
        on_change: Arc<ChangeCallback>,
        on_status: Arc<StatusCallback>,
    ) -> SubscriptionResult<ChannelHandle> {
        let topic = format!(
            "realtime:{}-{}",
            request.table,
            self.inner.next_topic.fetch_add(1, Ordering::Relaxed)
        );
        let handle = ChannelHandle {
            topic: topic.clone(),
            table: request.table.clone(),
        };

        let mut state = lock(&self.inner.state);
        state.channels.insert(
            topic.clone(),
            ChannelEntry {
                request,
                on_change,
                on_status,
                join_ref: None,
                joined: false,
            },
        );

        if state.task.is_none() {
            let (tx, rx) = mpsc::unbounded_channel();
            state.outbound = Some(tx);
            state.task = Some(tokio::spawn(run_socket(Arc::clone(&self.inner), rx)));
        } else if state.connected {
            // Otherwise the join goes out with the rest once connected
            if let Some(frame) = self.inner.join_frame(&mut state, &topic) {
                if let Some(tx) = &state.outbound {
                    let _ = tx.send(frame);
                }
            }
        }

        Ok(handle)
    }

    fn remove_channel(&self, handle: &ChannelHandle) -> bool {
        let mut state = lock(&self.inner.state);
        if state.channels.remove(&handle.topic).is_none() {
            return false;
        }

        if state.connected {
            let frame = self.inner.frame(&handle.topic, "phx_leave", json!({}));
            if let Some(tx) = &state.outbound {
                let _ = tx.send(frame);
            }
        }

        if state.channels.is_empty() {
            if let Some(task) = state.task.take() {
                task.abort();
            }
            state.outbound = None;
            state.connected = false;
            tracing::debug!("Last channel removed, replication socket closed");
        }
        true
    }
}

impl PhoenixInner {
    fn next_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn frame(&self, topic: &str, event: &str, payload: Value) -> String {
        json!({
            "topic": topic,
            "event": event,
            "payload": payload,
            "ref": self.next_ref(),
        })
        .to_string()
    }

    /// Build a join for `topic`, recording its ref and arming the join timeout
    fn join_frame(self: &Arc<Self>, state: &mut SocketState, topic: &str) -> Option<String> {
        let token = self
            .config
            .access_token
            .clone()
            .unwrap_or_else(|| self.config.api_key.clone());
        let join_ref = self.next_ref();

        let channel = state.channels.get_mut(topic)?;
        channel.join_ref = Some(join_ref.clone());
        channel.joined = false;

        let mut change = json!({
            "event": channel.request.event.as_str(),
            "schema": channel.request.schema,
            "table": channel.request.table,
        });
        if let Some(filter) = &channel.request.filter {
            change["filter"] = json!(filter);
        }

        let frame = json!({
            "topic": topic,
            "event": "phx_join",
            "payload": {
                "config": {
                    "broadcast": {"self": false},
                    "presence": {"key": ""},
                    "postgres_changes": [change],
                },
                "access_token": token,
            },
            "ref": join_ref,
            "join_ref": join_ref,
        });

        let inner = Arc::clone(self);
        let topic = topic.to_string();
        let timeout = self.config.join_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let status = {
                let state = lock(&inner.state);
                state
                    .channels
                    .get(&topic)
                    .filter(|c| !c.joined && c.join_ref.as_deref() == Some(join_ref.as_str()))
                    .map(|c| Arc::clone(&c.on_status))
            };
            if let Some(on_status) = status {
                notify(&on_status, ChannelStatus::TimedOut);
            }
        });

        Some(frame.to_string())
    }

    fn handle_frame(&self, text: &str) {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping undecodable replication frame");
                return;
            }
        };

        if frame.topic == "phoenix" {
            return;
        }

        match frame.event.as_str() {
            "postgres_changes" => {
                let callback = lock(&self.state)
                    .channels
                    .get(&frame.topic)
                    .map(|c| Arc::clone(&c.on_change));
                let Some(callback) = callback else {
                    return;
                };
                let data = frame.payload.get("data").cloned().unwrap_or(Value::Null);
                if let Err(panic) = isolate(|| callback(&data)) {
                    tracing::error!(topic = %frame.topic, error = %panic, "Change callback panicked");
                }
            }
            "phx_reply" => {
                let status = {
                    let mut state = lock(&self.state);
                    let Some(channel) = state.channels.get_mut(&frame.topic) else {
                        return;
                    };
                    if channel.join_ref.is_none() || channel.join_ref != frame.reference {
                        return;
                    }
                    let ok = frame.payload.get("status").and_then(Value::as_str) == Some("ok");
                    channel.joined = ok;
                    let status = if ok {
                        ChannelStatus::Subscribed
                    } else {
                        let reason = frame
                            .payload
                            .pointer("/response/reason")
                            .and_then(Value::as_str)
                            .unwrap_or("join rejected")
                            .to_string();
                        ChannelStatus::ChannelError(reason)
                    };
                    (Arc::clone(&channel.on_status), status)
                };
                notify(&status.0, status.1);
            }
            "phx_error" | "phx_close" => {
                let on_status = {
                    let mut state = lock(&self.state);
                    let Some(channel) = state.channels.get_mut(&frame.topic) else {
                        return;
                    };
                    channel.joined = false;
                    Arc::clone(&channel.on_status)
                };
                let status = if frame.event == "phx_error" {
                    ChannelStatus::ChannelError("channel crashed on server".to_string())
                } else {
                    ChannelStatus::Closed
                };
                notify(&on_status, status);
            }
            other => {
                tracing::trace!(topic = %frame.topic, event = %other, "Ignoring replication event");
            }
        }
    }

    /// Mark the socket down and tell every channel
    fn socket_lost(&self) {
        let callbacks: Vec<Arc<StatusCallback>> = {
            let mut state = lock(&self.state);
            state.connected = false;
            state
                .channels
                .values_mut()
                .map(|c| {
                    c.joined = false;
                    Arc::clone(&c.on_status)
                })
                .collect()
        };
        for on_status in callbacks {
            notify(&on_status, ChannelStatus::Closed);
        }
    }
}

fn notify(on_status: &Arc<StatusCallback>, status: ChannelStatus) {
    if let Err(panic) = isolate(|| on_status(status)) {
        tracing::error!(error = %panic, "Channel status callback panicked");
    }
}

#[derive(Deserialize)]
struct InboundFrame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

async fn run_socket(inner: Arc<PhoenixInner>, mut outbound: mpsc::UnboundedReceiver<String>) {
    let mut attempts: u32 = 0;

    loop {
        let stream = match connect_async(inner.endpoint.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                attempts += 1;
                let delay = inner.config.backoff.delay(attempts);
                tracing::warn!(
                    error = %e,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Replication socket connect failed"
                );
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        attempts = 0;
        tracing::info!("Replication socket connected");
        let (mut sink, mut frames) = stream.split();

        let joins: Vec<String> = {
            let mut state = lock(&inner.state);
            state.connected = true;
            let topics: Vec<String> = state.channels.keys().cloned().collect();
            topics
                .iter()
                .filter_map(|topic| inner.join_frame(&mut state, topic))
                .collect()
        };

        let mut healthy = true;
        for join in joins {
            if sink.send(Message::Text(join.into())).await.is_err() {
                healthy = false;
                break;
            }
        }

        let mut heartbeat = tokio::time::interval(inner.config.heartbeat_interval);
        heartbeat.tick().await;

        while healthy {
            tokio::select! {
                message = outbound.recv() => match message {
                    Some(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            healthy = false;
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        return;
                    }
                },
                frame = frames.next() => match frame {
                    Some(Ok(Message::Text(text))) => inner.handle_frame(text.as_str()),
                    Some(Ok(Message::Close(_))) | None => healthy = false,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Replication socket error");
                        healthy = false;
                    }
                },
                _ = heartbeat.tick() => {
                    let beat = inner.frame("phoenix", "heartbeat", json!({}));
                    if sink.send(Message::Text(beat.into())).await.is_err() {
                        healthy = false;
                    }
                }
            }
        }

        inner.socket_lost();
        attempts += 1;
        let delay = inner.config.backoff.delay(attempts);
        tracing::warn!(delay_ms = delay.as_millis() as u64, "Replication socket lost, reconnecting");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::ChangeEvent;

    fn client() -> PhoenixReplicationClient {
        PhoenixReplicationClient::new(PhoenixConfig {
            url: "https://demo.supabase.co".to_string(),
            api_key: "anon key".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    fn watch(
        client: &PhoenixReplicationClient,
        table: &str,
    ) -> (ChannelHandle, Arc<Mutex<Vec<Value>>>, Arc<Mutex<Vec<ChannelStatus>>>) {
        let changes = Arc::new(Mutex::new(Vec::new()));
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let change_sink = Arc::clone(&changes);
        let status_sink = Arc::clone(&statuses);
        let handle = client
            .open_channel(
                ChannelRequest::new(table, ChangeEvent::All),
                Arc::new(move |v: &Value| lock(&change_sink).push(v.clone())),
                Arc::new(move |s: ChannelStatus| lock(&status_sink).push(s)),
            )
            .unwrap();
        (handle, changes, statuses)
    }

    #[test]
    fn test_endpoint() {
        let config = PhoenixConfig {
            url: "https://demo.supabase.co/".to_string(),
            api_key: "a b".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.endpoint().unwrap(),
            "wss://demo.supabase.co/realtime/v1/websocket?apikey=a%20b&vsn=1.0.0"
        );

        let bad = PhoenixConfig {
            url: "demo.supabase.co".to_string(),
            ..Default::default()
        };
        assert!(bad.endpoint().is_err());
    }

    #[tokio::test]
    async fn test_join_frame_shape() {
        let client = client();
        let (handle, _, _) = watch(&client, "buses");
        let frame: Value = {
            let mut state = lock(&client.inner.state);
            let text = client.inner.join_frame(&mut state, &handle.topic).unwrap();
            serde_json::from_str(&text).unwrap()
        };

        assert_eq!(frame["event"], "phx_join");
        assert_eq!(frame["topic"], handle.topic.as_str());
        assert_eq!(frame["ref"], frame["join_ref"]);
        let change = &frame["payload"]["config"]["postgres_changes"][0];
        assert_eq!(change["table"], "buses");
        assert_eq!(change["schema"], "public");
        assert_eq!(change["event"], "*");
        assert_eq!(frame["payload"]["access_token"], "anon key");
    }

    #[tokio::test]
    async fn test_changes_and_replies_are_routed_by_topic() {
        let client = client();
        let (buses, bus_changes, bus_status) = watch(&client, "buses");
        let (_, route_changes, _) = watch(&client, "routes");

        let join_ref = {
            let mut state = lock(&client.inner.state);
            client.inner.join_frame(&mut state, &buses.topic);
            state.channels[&buses.topic].join_ref.clone().unwrap()
        };

        client.inner.handle_frame(
            &json!({"topic": buses.topic, "event": "phx_reply", "ref": join_ref,
                    "payload": {"status": "ok", "response": {}}})
            .to_string(),
        );
        client.inner.handle_frame(
            &json!({"topic": buses.topic, "event": "postgres_changes", "ref": null,
                    "payload": {"ids": [1], "data": {"type": "UPDATE", "record": {"id": 9}}}})
            .to_string(),
        );
        client.inner.handle_frame("garbage");

        assert_eq!(*lock(&bus_status), vec![ChannelStatus::Subscribed]);
        assert_eq!(
            *lock(&bus_changes),
            vec![json!({"type": "UPDATE", "record": {"id": 9}})]
        );
        assert!(lock(&route_changes).is_empty());
    }

    #[tokio::test]
    async fn test_rejected_join_reports_reason() {
        let client = client();
        let (handle, _, statuses) = watch(&client, "routes");
        let join_ref = {
            let mut state = lock(&client.inner.state);
            client.inner.join_frame(&mut state, &handle.topic);
            state.channels[&handle.topic].join_ref.clone().unwrap()
        };

        client.inner.handle_frame(
            &json!({"topic": handle.topic, "event": "phx_reply", "ref": join_ref,
                    "payload": {"status": "error", "response": {"reason": "unauthorized"}}})
            .to_string(),
        );
        assert_eq!(
            *lock(&statuses),
            vec![ChannelStatus::ChannelError("unauthorized".to_string())]
        );
    }

    #[tokio::test]
    async fn test_remove_last_channel_stops_socket() {
        let client = client();
        let (first, _, _) = watch(&client, "buses");
        let (second, _, _) = watch(&client, "routes");
        assert_eq!(client.channel_count(), 2);

        assert!(client.remove_channel(&first));
        assert!(!client.remove_channel(&first));
        assert!(lock(&client.inner.state).task.is_some());

        assert!(client.remove_channel(&second));
        assert!(lock(&client.inner.state).task.is_none());
        assert!(!client.is_connected());
    }
}
