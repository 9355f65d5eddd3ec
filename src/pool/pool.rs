//! Connection Pool
//!
//! Owns N independent named connections. Each one has its own state machine,
//! backoff counter and generation; nothing one connection does touches
//! another's state.
//!
//! Every async callback (driver events, connect watchdog, reconnect timer)
//! remembers the generation it was started under and is ignored once the
//! entry has moved on, so a late timer can never resurrect a connection
//! that was explicitly closed.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::config::{ConnectionConfig, PoolSettings};
use super::error::{PoolError, PoolResult};
use super::status::{ConnectionState, ConnectionStatus};
use super::transport::{OutboundMessage, SocketConnector, SocketEvent};
use crate::listeners::{ListenerId, ListenerRegistry};
use crate::sync::{isolate, lock};

/// Callback for an inbound pooled-connection event
pub type SocketListener = dyn Fn(&Value) + Send + Sync;

struct ActiveLink {
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    driver: JoinHandle<()>,
}

#[derive(Default)]
struct StatusRecord {
    state: ConnectionState,
    last_heartbeat: Option<(Instant, DateTime<Utc>)>,
    reconnect_attempts: u32,
    error: Option<String>,
}

impl StatusRecord {
    fn beat(&mut self) {
        self.last_heartbeat = Some((Instant::now(), Utc::now()));
    }
}

struct Entry {
    config: ConnectionConfig,
    record: StatusRecord,
    generation: u64,
    link: Option<ActiveLink>,
    reconnect_timer: Option<JoinHandle<()>>,
    /// Resolves the `connect()` call that started the current attempt
    pending_ready: Option<oneshot::Sender<PoolResult<()>>>,
    listeners: ListenerRegistry<SocketListener>,
}

impl Entry {
    fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            record: StatusRecord::default(),
            generation: 0,
            link: None,
            reconnect_timer: None,
            pending_ready: None,
            listeners: ListenerRegistry::new(),
        }
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            name: self.config.name.clone(),
            state: self.record.state,
            is_connected: self.record.state == ConnectionState::Open,
            is_connecting: self.record.state == ConnectionState::Connecting,
            last_heartbeat: self.record.last_heartbeat.map(|(_, wall)| wall),
            reconnect_attempts: self.record.reconnect_attempts,
            error: self.record.error.clone(),
        }
    }

    /// Drop the transport. The driver is only aborted when the caller is not
    /// the driver itself.
    fn release_link(&mut self, abort_driver: bool) {
        if let Some(link) = self.link.take() {
            if abort_driver {
                link.driver.abort();
            }
        }
    }

    fn cancel_reconnect_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    fn resolve_pending(&mut self, outcome: PoolResult<()>) {
        if let Some(tx) = self.pending_ready.take() {
            let _ = tx.send(outcome);
        }
    }
}

struct PoolInner {
    connector: Arc<dyn SocketConnector>,
    settings: PoolSettings,
    entries: Mutex<HashMap<String, Entry>>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

/// Named set of independent pooled connections.
///
/// Cheap to clone; clones share the same connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a pool with the default timing policy
    pub fn new(connector: Arc<dyn SocketConnector>) -> Self {
        Self::with_settings(connector, PoolSettings::default())
    }

    pub fn with_settings(connector: Arc<dyn SocketConnector>, settings: PoolSettings) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                settings,
                entries: Mutex::new(HashMap::new()),
                sweep_task: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Register a named connection.
    ///
    /// Re-registering an existing name replaces its config but keeps its
    /// status and listeners.
    pub fn register(&self, config: ConnectionConfig) {
        let name = config.name.clone();
        let mut entries = lock(&self.inner.entries);
        match entries.get_mut(&name) {
            Some(entry) => {
                tracing::warn!(connection = %name, "Overwriting connection config");
                entry.config = config;
            }
            None => {
                tracing::debug!(connection = %name, url = %config.url, "Registered connection");
                entries.insert(name, Entry::new(config));
            }
        }
    }

    /// Open the named connection and wait for the attempt's outcome.
    ///
    /// A no-op returning `Ok` if the connection is already open or an attempt
    /// is in flight. A failed attempt has already scheduled its reconnect
    /// (when allowed) by the time the error is returned.
    pub async fn connect(&self, name: &str) -> PoolResult<()> {
        let Some(ready) = self.inner.begin_connect(name)? else {
            return Ok(());
        };

        ready
            .await
            .unwrap_or_else(|_| Err(PoolError::Aborted(name.to_string())))
    }

    /// Close the named connection and cancel any pending reconnect.
    ///
    /// Keeps the registration and the reconnect counter.
    pub fn disconnect(&self, name: &str) -> bool {
        let mut entries = lock(&self.inner.entries);
        let Some(entry) = entries.get_mut(name) else {
            return false;
        };

        entry.generation += 1;
        entry.cancel_reconnect_timer();
        entry.release_link(true);
        entry.resolve_pending(Err(PoolError::Aborted(name.to_string())));
        let was = entry.record.state;
        entry.record.state = ConnectionState::Idle;

        if was != ConnectionState::Idle {
            tracing::info!(connection = %name, previous = %was, "Disconnected");
        }
        true
    }

    pub fn disconnect_all(&self) {
        for name in self.names() {
            self.disconnect(&name);
        }
    }

    /// Send an event on the named connection.
    ///
    /// Dropped with a warning if the connection is not open; nothing is
    /// queued or retried.
    pub fn emit(&self, name: &str, event: &str, payload: Value) -> bool {
        let entries = lock(&self.inner.entries);
        let link = entries
            .get(name)
            .filter(|entry| entry.record.state == ConnectionState::Open)
            .and_then(|entry| entry.link.as_ref());

        match link {
            Some(link) => link
                .outbound
                .send(OutboundMessage {
                    event: event.to_string(),
                    payload,
                })
                .is_ok(),
            None => {
                tracing::warn!(connection = %name, event = %event, "Not connected, dropping emit");
                false
            }
        }
    }

    /// Listen for an inbound event on the named connection.
    ///
    /// Listeners belong to the pool entry and survive reconnects.
    pub fn on<F>(&self, name: &str, event: &str, callback: F) -> PoolResult<ListenerId>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut entries = lock(&self.inner.entries);
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| PoolError::ConfigNotFound(name.to_string()))?;
        Ok(entry.listeners.add(event, Arc::new(callback)))
    }

    pub fn off(&self, name: &str, event: &str, id: ListenerId) -> bool {
        let mut entries = lock(&self.inner.entries);
        entries
            .get_mut(name)
            .map(|entry| entry.listeners.remove(event, id))
            .unwrap_or(false)
    }

    pub fn status(&self, name: &str) -> Option<ConnectionStatus> {
        lock(&self.inner.entries).get(name).map(Entry::status)
    }

    /// Status of every registered connection, sorted by name
    pub fn all_statuses(&self) -> Vec<ConnectionStatus> {
        let mut statuses: Vec<_> = lock(&self.inner.entries).values().map(Entry::status).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn is_connected(&self, name: &str) -> bool {
        lock(&self.inner.entries)
            .get(name)
            .map(|entry| entry.record.state == ConnectionState::Open)
            .unwrap_or(false)
    }

    pub fn connected_count(&self) -> usize {
        lock(&self.inner.entries)
            .values()
            .filter(|entry| entry.record.state == ConnectionState::Open)
            .count()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.inner.entries).keys().cloned().collect();
        names.sort();
        names
    }

    /// Force-reconnect every open connection whose last heartbeat is older
    /// than the heartbeat timeout. Returns the names that were recycled.
    pub fn sweep_stale_connections(&self) -> Vec<String> {
        let now = Instant::now();
        let timeout = self.inner.settings.heartbeat_timeout;

        let stale: Vec<String> = lock(&self.inner.entries)
            .iter()
            .filter(|(_, entry)| entry.record.state == ConnectionState::Open)
            .filter(|(_, entry)| {
                entry
                    .record
                    .last_heartbeat
                    .map_or(true, |(at, _)| now.duration_since(at) > timeout)
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in &stale {
            tracing::warn!(connection = %name, "No heartbeat within window, forcing reconnect");
            self.disconnect(name);
            if let Err(e) = self.inner.begin_connect(name) {
                tracing::error!(connection = %name, error = %e, "Forced reconnect failed");
            }
        }

        stale
    }

    /// Start the periodic liveness sweep (idempotent)
    pub fn start_liveness_sweep(&self) {
        let mut task = lock(&self.inner.sweep_task);
        if task.is_some() {
            return;
        }

        let pool = self.clone();
        let every = self.inner.settings.sweep_interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // Skip the first immediate tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let recycled = pool.sweep_stale_connections();
                if !recycled.is_empty() {
                    tracing::debug!(count = recycled.len(), "Liveness sweep recycled connections");
                }
            }
        }));
    }

    pub fn stop_liveness_sweep(&self) {
        if let Some(task) = lock(&self.inner.sweep_task).take() {
            task.abort();
        }
    }

    /// Stop the sweep, close everything and forget every registration
    pub fn destroy(&self) {
        self.stop_liveness_sweep();
        self.disconnect_all();
        let mut entries = lock(&self.inner.entries);
        for entry in entries.values_mut() {
            entry.listeners.clear();
        }
        entries.clear();
        tracing::info!("Connection pool destroyed");
    }
}

impl PoolInner {
    /// Start an attempt if the entry is eligible. `Ok(None)` means no-op.
    fn begin_connect(
        self: &Arc<Self>,
        name: &str,
    ) -> PoolResult<Option<oneshot::Receiver<PoolResult<()>>>> {
        let mut entries = lock(&self.entries);
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| PoolError::ConfigNotFound(name.to_string()))?;

        match entry.record.state {
            ConnectionState::Open => {
                tracing::debug!(connection = %name, "Already connected");
                return Ok(None);
            }
            ConnectionState::Connecting => {
                tracing::debug!(connection = %name, "Connect already in flight");
                return Ok(None);
            }
            _ => {}
        }

        entry.cancel_reconnect_timer();
        entry.generation += 1;
        let generation = entry.generation;
        entry.record.state = ConnectionState::Connecting;

        match self.connector.open(&entry.config) {
            Ok(link) => {
                let (ready_tx, ready_rx) = oneshot::channel();
                entry.pending_ready = Some(ready_tx);

                let driver = tokio::spawn(drive_connection(
                    Arc::clone(self),
                    name.to_string(),
                    generation,
                    link.events,
                    self.settings.connect_timeout,
                ));
                entry.link = Some(ActiveLink {
                    outbound: link.outbound,
                    driver,
                });

                tracing::info!(
                    connection = %name,
                    url = %entry.config.url,
                    attempt = entry.record.reconnect_attempts,
                    "Connecting"
                );
                Ok(Some(ready_rx))
            }
            Err(e) => {
                tracing::error!(connection = %name, error = %e, "Failed to create transport");
                self.fail_attempt(entry, name, e.clone());
                Err(e)
            }
        }
    }

    /// Shared failure path for transport errors, the watchdog and close
    /// before open.
    fn fail_attempt(self: &Arc<Self>, entry: &mut Entry, name: &str, error: PoolError) {
        entry.record.error = Some(match &error {
            PoolError::ConnectTimeout(_) => "Connection timeout".to_string(),
            PoolError::ConnectFailed { message, .. } => message.clone(),
            other => other.to_string(),
        });
        entry.release_link(false);
        entry.resolve_pending(Err(error));
        self.schedule_reconnect(entry, name);
    }

    /// Arm the reconnect timer if the entry may retry, else settle it.
    fn schedule_reconnect(self: &Arc<Self>, entry: &mut Entry, name: &str) {
        if !entry.config.auto_reconnect {
            entry.record.state = ConnectionState::Idle;
            return;
        }

        if entry.record.reconnect_attempts >= entry.config.max_reconnect_attempts {
            entry.record.state = ConnectionState::Failed;
            tracing::error!(
                connection = %name,
                attempts = entry.record.reconnect_attempts,
                "Max reconnect attempts reached, giving up"
            );
            return;
        }

        entry.record.reconnect_attempts += 1;
        let attempt = entry.record.reconnect_attempts;
        if attempt >= entry.config.max_reconnect_attempts {
            entry.record.state = ConnectionState::Failed;
            tracing::error!(
                connection = %name,
                attempts = attempt,
                "Max reconnect attempts reached, giving up"
            );
            return;
        }

        let delay = self.settings.backoff.delay(attempt);
        let generation = entry.generation;
        entry.record.state = ConnectionState::Reconnecting;

        tracing::info!(
            connection = %name,
            attempt,
            max = entry.config.max_reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );

        let inner = Arc::clone(self);
        let owned_name = name.to_string();
        entry.cancel_reconnect_timer();
        entry.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.fire_reconnect(&owned_name, generation);
        }));
    }

    fn fire_reconnect(self: &Arc<Self>, name: &str, generation: u64) {
        {
            let mut entries = lock(&self.entries);
            let Some(entry) = entries.get_mut(name) else {
                return;
            };
            let eligible = entry.generation == generation
                && entry.record.state == ConnectionState::Reconnecting
                && entry.record.reconnect_attempts < entry.config.max_reconnect_attempts;
            if !eligible {
                tracing::debug!(connection = %name, "Ignoring stale reconnect timer");
                return;
            }
            // This task is the timer; detach instead of aborting it
            entry.reconnect_timer = None;
        }

        if let Err(e) = self.begin_connect(name) {
            tracing::warn!(connection = %name, error = %e, "Reconnect attempt failed");
        }
    }

    /// Run `f` on the entry only if `generation` is still current
    fn with_current<R>(
        &self,
        name: &str,
        generation: u64,
        f: impl FnOnce(&mut Entry) -> R,
    ) -> Option<R> {
        let mut entries = lock(&self.entries);
        entries
            .get_mut(name)
            .filter(|entry| entry.generation == generation)
            .map(f)
    }

    fn handle_open(&self, name: &str, generation: u64) -> bool {
        self.with_current(name, generation, |entry| {
            entry.record.state = ConnectionState::Open;
            entry.record.reconnect_attempts = 0;
            entry.record.error = None;
            entry.record.beat();
            entry.resolve_pending(Ok(()));
            tracing::info!(connection = %name, "Connected");
        })
        .is_some()
    }

    fn handle_heartbeat(&self, name: &str, generation: u64) -> bool {
        self.with_current(name, generation, |entry| entry.record.beat())
            .is_some()
    }

    fn handle_timeout(self: &Arc<Self>, name: &str, generation: u64) {
        let mut entries = lock(&self.entries);
        let Some(entry) = entries.get_mut(name) else {
            return;
        };
        if entry.generation != generation || entry.record.state != ConnectionState::Connecting {
            return;
        }
        tracing::warn!(
            connection = %name,
            timeout_ms = self.settings.connect_timeout.as_millis() as u64,
            "Connection timeout"
        );
        self.fail_attempt(entry, name, PoolError::ConnectTimeout(name.to_string()));
    }

    /// Returns whether the driver should keep running
    fn handle_error(self: &Arc<Self>, name: &str, generation: u64, message: String) -> bool {
        let mut entries = lock(&self.entries);
        let Some(entry) = entries.get_mut(name) else {
            return false;
        };
        if entry.generation != generation {
            return false;
        }

        if entry.record.state == ConnectionState::Connecting {
            tracing::warn!(connection = %name, error = %message, "Connection error");
            let error = PoolError::ConnectFailed {
                name: name.to_string(),
                message,
            };
            self.fail_attempt(entry, name, error);
            return false;
        }

        tracing::warn!(connection = %name, error = %message, "Transport error");
        entry.record.error = Some(message);
        true
    }

    fn handle_close(self: &Arc<Self>, name: &str, generation: u64, reason: Option<String>) {
        let mut entries = lock(&self.entries);
        let Some(entry) = entries.get_mut(name) else {
            return;
        };
        if entry.generation != generation {
            return;
        }

        let reason = reason.unwrap_or_else(|| "closed by transport".to_string());
        if entry.record.state == ConnectionState::Connecting {
            let error = PoolError::ConnectFailed {
                name: name.to_string(),
                message: reason,
            };
            self.fail_attempt(entry, name, error);
            return;
        }

        tracing::info!(connection = %name, reason = %reason, "Connection closed");
        entry.release_link(false);
        self.schedule_reconnect(entry, name);
    }

    fn dispatch(&self, name: &str, generation: u64, event: &str, payload: &Value) -> bool {
        let Some(listeners) = self.with_current(name, generation, |entry| {
            entry.listeners.snapshot(event)
        }) else {
            return false;
        };

        for listener in listeners {
            if let Err(panic) = isolate(|| listener(payload)) {
                tracing::error!(connection = %name, event = %event, error = %panic, "Socket listener panicked");
            }
        }
        true
    }
}

/// Per-attempt event loop: watchdog until open, then event dispatch until
/// the transport closes or the generation goes stale.
async fn drive_connection(
    inner: Arc<PoolInner>,
    name: String,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<SocketEvent>,
    connect_timeout: Duration,
) {
    let watchdog = tokio::time::sleep(connect_timeout);
    tokio::pin!(watchdog);
    let mut opened = false;

    loop {
        let event = tokio::select! {
            _ = &mut watchdog, if !opened => {
                inner.handle_timeout(&name, generation);
                return;
            }
            event = events.recv() => event,
        };

        let keep_going = match event {
            Some(SocketEvent::Open) => {
                opened = inner.handle_open(&name, generation);
                opened
            }
            Some(SocketEvent::Pong) => inner.handle_heartbeat(&name, generation),
            Some(SocketEvent::Message { event, payload }) => {
                inner.dispatch(&name, generation, &event, &payload)
            }
            Some(SocketEvent::Error(message)) => inner.handle_error(&name, generation, message),
            Some(SocketEvent::Closed { reason }) => {
                inner.handle_close(&name, generation, reason);
                false
            }
            None => {
                inner.handle_close(&name, generation, Some("transport dropped".to_string()));
                false
            }
        };

        if !keep_going {
            return;
        }
    }
}
