//! SSE Client
//!
//! One inbound event stream with typed dispatch to subscribers and
//! exponential-backoff recovery.
//!
//! ```text
//! Idle -> Connecting -> Open -> (error, closed) -> Reconnecting -> Connecting ...
//!                                               \-> Failed (attempts exhausted)
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::error::{SseError, SseResult};
use super::source::{EventSource, EventSourceFactory, ReadyState, StreamHandle, StreamOptions, StreamSignal};
use crate::backoff::Backoff;
use crate::sync::{isolate, lock};

/// Named stream events the client listens for
pub const STREAM_EVENT_TYPES: [&str; 5] = [
    "bus-location-update",
    "bus-status-update",
    "route-update",
    "system-notification",
    "message",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SseState {
    #[default]
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Failed,
    /// Explicitly disconnected
    Closed,
}

impl fmt::Display for SseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SseState::Idle => "idle",
            SseState::Connecting => "connecting",
            SseState::Open => "open",
            SseState::Reconnecting => "reconnecting",
            SseState::Failed => "failed",
            SseState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Parsed stream event handed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SseEvent {
    pub event_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

pub type SseCallback = dyn Fn(&SseEvent) + Send + Sync;

struct SseSubscription {
    id: String,
    event_type: String,
    callback: Arc<SseCallback>,
    active: AtomicBool,
}

/// Client settings
#[derive(Debug, Clone)]
pub struct SseConfig {
    /// Backend base URL, e.g. `http://localhost:3001`
    pub base_url: String,
    /// Stream path appended to the base URL
    pub path: String,
    pub max_reconnect_attempts: u32,
    pub backoff: Backoff,
    /// Rich construction options; dropped on fallback
    pub options: Option<StreamOptions>,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3001".to_string(),
            path: "/api/sse/events".to_string(),
            max_reconnect_attempts: 5,
            backoff: Backoff::sse(),
            options: None,
        }
    }
}

impl SseConfig {
    /// Absolute stream URL
    pub fn url(&self) -> String {
        if self.path.starts_with("http://") || self.path.starts_with("https://") {
            return self.path.clone();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SseHealthDetails {
    pub state: SseState,
    pub ready_state: Option<ReadyState>,
    pub reconnect_attempts: u32,
    pub subscriptions: usize,
    pub url: String,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SseHealth {
    pub healthy: bool,
    pub details: SseHealthDetails,
}

#[derive(Default)]
struct ClientState {
    state: SseState,
    generation: u64,
    attempts: u32,
    last_error: Option<String>,
    source: Option<Arc<dyn EventSource>>,
    reader: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
    subscriptions: Vec<Arc<SseSubscription>>,
}

impl ClientState {
    fn teardown(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(source) = self.source.take() {
            source.close();
        }
    }
}

struct ClientInner {
    config: SseConfig,
    factory: Arc<dyn EventSourceFactory>,
    state: Mutex<ClientState>,
    next_seq: AtomicU64,
}

/// Single event-stream client. Cheap to clone.
#[derive(Clone)]
pub struct SseClient {
    inner: Arc<ClientInner>,
}

impl SseClient {
    pub fn new(config: SseConfig, factory: Arc<dyn EventSourceFactory>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                factory,
                state: Mutex::new(ClientState::default()),
                next_seq: AtomicU64::new(1),
            }),
        }
    }

    pub fn url(&self) -> String {
        self.inner.config.url()
    }

    /// Open the stream.
    ///
    /// Returns once the transport object exists; the open itself is
    /// reported asynchronously. A no-op while connecting or open.
    pub fn connect(&self) -> SseResult<()> {
        self.inner.begin_connect()
    }

    /// Close the stream and cancel any pending reconnect
    pub fn disconnect(&self) {
        let mut state = lock(&self.inner.state);
        state.generation += 1;
        state.teardown();
        if state.state != SseState::Closed {
            tracing::info!(url = %self.inner.config.url(), "SSE disconnected");
        }
        state.state = SseState::Closed;
    }

    pub fn reconnect(&self) -> SseResult<()> {
        self.disconnect();
        self.connect()
    }

    /// Subscribe to one event type. Returns the subscription id.
    pub fn subscribe<F>(&self, event_type: &str, callback: F) -> String
    where
        F: Fn(&SseEvent) + Send + Sync + 'static,
    {
        let id = format!(
            "sse_{}_{}",
            Utc::now().timestamp_millis(),
            self.inner.next_seq.fetch_add(1, Ordering::Relaxed)
        );
        let subscription = Arc::new(SseSubscription {
            id: id.clone(),
            event_type: event_type.to_string(),
            callback: Arc::new(callback),
            active: AtomicBool::new(true),
        });
        lock(&self.inner.state).subscriptions.push(subscription);
        tracing::debug!(subscription = %id, event_type = %event_type, "SSE subscription added");
        id
    }

    pub fn unsubscribe(&self, id: &str) -> bool {
        let mut state = lock(&self.inner.state);
        let Some(index) = state.subscriptions.iter().position(|s| s.id == id) else {
            return false;
        };
        let subscription = state.subscriptions.remove(index);
        subscription.active.store(false, Ordering::SeqCst);
        true
    }

    /// Remove every subscription, returning how many there were
    pub fn unsubscribe_all(&self) -> usize {
        let removed = std::mem::take(&mut lock(&self.inner.state).subscriptions);
        for subscription in &removed {
            subscription.active.store(false, Ordering::SeqCst);
        }
        removed.len()
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.inner.state).subscriptions.len()
    }

    pub fn state(&self) -> SseState {
        lock(&self.inner.state).state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        lock(&self.inner.state).attempts
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SseState::Open
    }

    /// Connected and the transport agrees it is open
    pub fn healthy(&self) -> bool {
        self.health_check().healthy
    }

    pub fn health_check(&self) -> SseHealth {
        let state = lock(&self.inner.state);
        let ready_state = state.source.as_ref().map(|s| s.ready_state());
        let healthy = state.state == SseState::Open && ready_state == Some(ReadyState::Open);

        SseHealth {
            healthy,
            details: SseHealthDetails {
                state: state.state,
                ready_state,
                reconnect_attempts: state.attempts,
                subscriptions: state.subscriptions.len(),
                url: self.inner.config.url(),
                last_error: state.last_error.clone(),
            },
        }
    }

    #[cfg(test)]
    fn dispatch(&self, event_type: &str, data: Value) {
        self.inner.handle_event(event_type, data);
    }
}

impl ClientInner {
    fn begin_connect(self: &Arc<Self>) -> SseResult<()> {
        let url = self.config.url();
        let mut state = lock(&self.state);

        if matches!(state.state, SseState::Connecting | SseState::Open) {
            tracing::debug!(url = %url, state = %state.state, "SSE connect ignored");
            return Ok(());
        }

        state.teardown();
        state.generation += 1;
        let generation = state.generation;
        state.state = SseState::Connecting;

        match self.construct(&url) {
            Ok(StreamHandle { source, signals }) => {
                state.source = Some(source);
                state.reader = Some(tokio::spawn(read_signals(
                    Arc::clone(self),
                    generation,
                    signals,
                )));
                tracing::info!(url = %url, attempt = state.attempts, "SSE connecting");
                Ok(())
            }
            Err(e) => {
                tracing::error!(url = %url, error = %e, "Failed to create event stream");
                state.last_error = Some(e.to_string());
                self.schedule_reconnect(&mut state);
                Err(e)
            }
        }
    }

    /// Rich construction first, minimal construction on failure
    fn construct(&self, url: &str) -> SseResult<StreamHandle> {
        let Some(options) = self.config.options.as_ref() else {
            return self.factory.open(url, None);
        };

        match self.factory.open(url, Some(options)) {
            Ok(handle) => Ok(handle),
            Err(rich) => {
                tracing::warn!(error = %rich, "Event stream rejected options, retrying without them");
                self.factory
                    .open(url, None)
                    .map_err(|e| SseError::Construction(e.to_string()))
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, state: &mut ClientState) {
        if state.attempts >= self.config.max_reconnect_attempts {
            state.state = SseState::Failed;
            tracing::error!(
                url = %self.config.url(),
                attempts = state.attempts,
                "SSE max reconnect attempts reached, giving up"
            );
            return;
        }

        state.attempts += 1;
        let attempt = state.attempts;
        if attempt >= self.config.max_reconnect_attempts {
            state.state = SseState::Failed;
            tracing::error!(
                url = %self.config.url(),
                attempts = attempt,
                "SSE max reconnect attempts reached, giving up"
            );
            return;
        }

        let delay = self.config.backoff.delay(attempt);
        let generation = state.generation;
        state.state = SseState::Reconnecting;

        tracing::info!(
            attempt,
            max = self.config.max_reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling SSE reconnect"
        );

        let inner = Arc::clone(self);
        if let Some(timer) = state.reconnect_timer.take() {
            timer.abort();
        }
        state.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = lock(&inner.state);
                if state.generation != generation || state.state != SseState::Reconnecting {
                    return;
                }
                state.reconnect_timer = None;
            }
            if let Err(e) = inner.begin_connect() {
                tracing::warn!(error = %e, "SSE reconnect attempt failed");
            }
        }));
    }

    fn handle_open(&self, generation: u64) -> bool {
        let mut state = lock(&self.state);
        if state.generation != generation {
            return false;
        }
        state.state = SseState::Open;
        state.attempts = 0;
        state.last_error = None;
        tracing::info!(url = %self.config.url(), "SSE connected");
        true
    }

    /// Returns whether the reader should keep going
    fn handle_error(self: &Arc<Self>, generation: u64, message: String) -> bool {
        let mut state = lock(&self.state);
        if state.generation != generation {
            return false;
        }

        let ready_state = state.source.as_ref().map(|s| s.ready_state());
        tracing::warn!(
            url = %self.config.url(),
            error = %message,
            ready_state = ?ready_state,
            attempts = state.attempts,
            "SSE connection error"
        );
        state.last_error = Some(message);

        if ready_state == Some(ReadyState::Closed) || ready_state.is_none() {
            if let Some(source) = state.source.take() {
                source.close();
            }
            // This runs on the reader; detach rather than abort it
            state.reader = None;
            self.schedule_reconnect(&mut state);
            return false;
        }

        // The transport is retrying on its own
        state.state = SseState::Connecting;
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.state).generation == generation
    }

    fn handle_raw(&self, event_type: &str, data: &str) {
        if !STREAM_EVENT_TYPES.contains(&event_type) {
            tracing::debug!(event_type = %event_type, "Ignoring unlistened stream event");
            return;
        }

        match serde_json::from_str::<Value>(data) {
            Ok(value) => self.handle_event(event_type, value),
            Err(e) => {
                tracing::error!(event_type = %event_type, error = %e, "Failed to parse SSE payload, dropping");
            }
        }
    }

    fn handle_event(&self, event_type: &str, data: Value) {
        let event = SseEvent {
            event_type: event_type.to_string(),
            data,
            timestamp: Utc::now(),
        };

        let matching: Vec<Arc<SseSubscription>> = lock(&self.state)
            .subscriptions
            .iter()
            .filter(|s| s.event_type == event_type)
            .cloned()
            .collect();

        for subscription in matching {
            if !subscription.active.load(Ordering::SeqCst) {
                continue;
            }
            if let Err(panic) = isolate(|| (subscription.callback)(&event)) {
                tracing::error!(
                    subscription = %subscription.id,
                    event_type = %event_type,
                    error = %panic,
                    "SSE subscriber panicked"
                );
            }
        }
    }
}

async fn read_signals(
    inner: Arc<ClientInner>,
    generation: u64,
    mut signals: mpsc::UnboundedReceiver<StreamSignal>,
) {
    loop {
        let keep_going = match signals.recv().await {
            Some(StreamSignal::Open) => inner.handle_open(generation),
            Some(StreamSignal::Event { event_type, data }) => {
                let current = inner.is_current(generation);
                if current {
                    inner.handle_raw(&event_type, &data);
                }
                current
            }
            Some(StreamSignal::Error(message)) => inner.handle_error(generation, message),
            None => {
                inner.handle_error(generation, "event stream dropped".to_string());
                false
            }
        };

        if !keep_going {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeEventSourceFactory;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::Instant;

    fn client_with(factory: &Arc<FakeEventSourceFactory>, config: SseConfig) -> SseClient {
        SseClient::new(config, Arc::clone(factory) as Arc<dyn EventSourceFactory>)
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&SseEvent) + Send + Sync + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let clone = Arc::clone(&hits);
        (hits, move |_: &SseEvent| {
            clone.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_url_building() {
        let config = SseConfig {
            base_url: "http://api.local:3001/".to_string(),
            path: "/api/sse/events".to_string(),
            ..Default::default()
        };
        assert_eq!(config.url(), "http://api.local:3001/api/sse/events");

        let absolute = SseConfig {
            path: "https://stream.local/events".to_string(),
            ..Default::default()
        };
        assert_eq!(absolute.url(), "https://stream.local/events");
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_and_typed_dispatch() {
        let factory = FakeEventSourceFactory::new();
        let client = client_with(&factory, SseConfig::default());
        let (locations, on_location) = counter();
        let (routes, on_route) = counter();
        client.subscribe("bus-location-update", on_location);
        client.subscribe("route-update", on_route);

        client.connect().unwrap();
        let stream = factory.stream(0);
        stream.open();
        stream.event("bus-location-update", r#"{"busId":"b1"}"#);
        stream.event("bus-location-update", "{not json");
        stream.event("unknown-type", "{}");
        tokio::task::yield_now().await;

        assert!(client.is_connected());
        assert!(client.healthy());
        assert_eq!(locations.load(Ordering::SeqCst), 1);
        assert_eq!(routes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rich_construction_falls_back_to_minimal() {
        let factory = FakeEventSourceFactory::new();
        factory.reject_options();
        let config = SseConfig {
            options: Some(StreamOptions::default().bearer("t")),
            ..Default::default()
        };
        let client = client_with(&factory, config);

        assert!(client.connect().is_ok());
        assert_eq!(factory.calls(), vec![true, false]);
        assert_eq!(client.state(), SseState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_stops_delivery() {
        let factory = FakeEventSourceFactory::new();
        let client = client_with(&factory, SseConfig::default());
        let (hits, on_event) = counter();
        let id = client.subscribe("bus-status-update", on_event);
        assert!(id.starts_with("sse_"));

        client.dispatch("bus-status-update", json!({"n": 1}));
        assert!(client.unsubscribe(&id));
        assert!(!client.unsubscribe(&id));
        client.dispatch("bus-status-update", json!({"n": 2}));
        client.dispatch("bus-status-update", json!({"n": 3}));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_from_inside_dispatch() {
        let factory = FakeEventSourceFactory::new();
        let client = client_with(&factory, SseConfig::default());
        let (hits, on_event) = counter();

        let slot: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let remover = client.clone();
        let target = Arc::clone(&slot);
        client.subscribe("route-update", move |_| {
            if let Some(id) = lock(&target).take() {
                remover.unsubscribe(&id);
            }
        });
        let second = client.subscribe("route-update", on_event);
        *lock(&slot) = Some(second);

        // Snapshot was taken before removal, but the inactive flag wins
        client.dispatch("route-update", json!({}));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(client.subscription_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_subscriber_is_isolated() {
        let factory = FakeEventSourceFactory::new();
        let client = client_with(&factory, SseConfig::default());
        let (hits, on_event) = counter();
        client.subscribe("system-notification", |_| panic!("subscriber failed"));
        client.subscribe("system-notification", on_event);

        client.dispatch("system-notification", json!({"msg": "a"}));
        client.dispatch("system-notification", json!({"msg": "b"}));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_until_failed() {
        let factory = FakeEventSourceFactory::new();
        factory.fail_on_open("connection refused");
        let client = client_with(&factory, SseConfig::default());
        let start = Instant::now();

        client.connect().unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;

        let offsets: Vec<u64> = factory
            .open_times()
            .iter()
            .map(|t| t.duration_since(start).as_millis() as u64)
            .collect();
        // Five opens in total: the counter reaching the max stops retries
        assert_eq!(offsets, vec![0, 1000, 3000, 7000, 15000]);
        assert_eq!(client.state(), SseState::Failed);
        assert_eq!(client.reconnect_attempts(), 5);
        assert!(!client.healthy());

        // An explicit connect makes one more attempt, then settles again
        client.connect().unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(factory.count(), 6);
        assert_eq!(client.state(), SseState::Failed);
        assert_eq!(client.reconnect_attempts(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_while_transport_retrying_does_not_reconnect() {
        let factory = FakeEventSourceFactory::new();
        let client = client_with(&factory, SseConfig::default());

        client.connect().unwrap();
        let stream = factory.stream(0);
        stream.open();
        stream.hiccup("network blip");
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(factory.count(), 1);
        assert_eq!(client.state(), SseState::Connecting);
        assert_eq!(client.reconnect_attempts(), 0);

        stream.open();
        tokio::task::yield_now().await;
        assert!(client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_reconnect() {
        let factory = FakeEventSourceFactory::new();
        let client = client_with(&factory, SseConfig::default());

        client.connect().unwrap();
        factory.stream(0).fail("boom");
        tokio::task::yield_now().await;
        assert_eq!(client.state(), SseState::Reconnecting);

        client.disconnect();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(factory.count(), 1);
        assert_eq!(client.state(), SseState::Closed);
        assert!(factory.stream(0).is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_resets_attempts_and_reconnect_recreates_stream() {
        let factory = FakeEventSourceFactory::new();
        let client = client_with(&factory, SseConfig::default());

        client.connect().unwrap();
        factory.stream(0).fail("boom");
        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert_eq!(client.reconnect_attempts(), 1);

        factory.stream(1).open();
        tokio::task::yield_now().await;
        assert_eq!(client.reconnect_attempts(), 0);
        assert!(client.health_check().details.last_error.is_none());

        client.reconnect().unwrap();
        assert_eq!(factory.count(), 3);
        assert!(factory.stream(1).is_closed());
        assert_eq!(client.state(), SseState::Connecting);
    }
}
