//! Realtime Manager
//!
//! Single entry point for "give me realtime updates". Runs every enabled
//! transport side by side and forwards all of their events; the same
//! logical update may arrive twice from different transports and is not
//! deduplicated here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::error::{RealtimeError, RealtimeResult};
use super::events::{
    pool_for_priority, RealtimeEvent, TransportKind, GENERAL_POOL, LOCATION_POOL, POOL_ROUTES,
    SSE_ROUTES, TABLE_ROUTES_MAP,
};
use super::health::{HealthProbe, HealthReport, TokenProvider};
use crate::interaction::{InteractionScheduler, ThrottleOptions};
use crate::listeners::{ListenerId, ListenerRegistry};
use crate::pool::{ConnectionConfig, ConnectionPool, ConnectionStatus, Priority};
use crate::sse::{SseClient, SseHealth};
use crate::subscriptions::{ChangeEvent, SubscriptionHealth, SubscriptionService};
use crate::sync::{isolate, lock};

pub type RealtimeListener = dyn Fn(&RealtimeEvent) + Send + Sync;

/// Reserved tie-breaking policy; dispatch is always additive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackStrategy {
    #[default]
    Graceful,
    Aggressive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    pub enable_websocket: bool,
    pub enable_supabase_realtime: bool,
    pub enable_sse: bool,
    /// Preferred transport order (informational)
    pub priority: Vec<TransportKind>,
    pub fallback_strategy: FallbackStrategy,
    /// WebSocket base URL for the baseline pools
    pub ws_url: String,
    pub health_check_interval: Duration,
    pub history_limit: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            enable_websocket: true,
            enable_supabase_realtime: true,
            enable_sse: true,
            priority: vec![
                TransportKind::PooledConnection,
                TransportKind::Subscription,
                TransportKind::Sse,
            ],
            fallback_strategy: FallbackStrategy::Graceful,
            ws_url: "ws://localhost:3001".to_string(),
            health_check_interval: Duration::from_secs(30),
            history_limit: 100,
        }
    }
}

/// The three transports the manager drives
#[derive(Clone)]
pub struct Transports {
    pub pool: ConnectionPool,
    pub subscriptions: SubscriptionService,
    pub sse: SseClient,
}

/// Outcome of one transport's init routine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum TransportOutcome {
    Ready,
    Disabled,
    Failed(String),
}

impl TransportOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, TransportOutcome::Ready)
    }

    fn from_result(kind: TransportKind, result: Option<RealtimeResult<()>>) -> Self {
        match result {
            None => TransportOutcome::Disabled,
            Some(Ok(())) => TransportOutcome::Ready,
            Some(Err(e)) => {
                tracing::warn!(transport = %kind, error = %e, "Transport failed to initialize");
                TransportOutcome::Failed(e.to_string())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitSummary {
    pub websocket: TransportOutcome,
    pub subscriptions: TransportOutcome,
    pub sse: TransportOutcome,
}

impl InitSummary {
    pub fn ready_count(&self) -> usize {
        [&self.websocket, &self.subscriptions, &self.sse]
            .iter()
            .filter(|o| o.is_ready())
            .count()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventStats {
    pub total: u64,
    pub pooled_connection: u64,
    pub subscription: u64,
    pub sse: u64,
    pub listener_panics: u64,
    pub last_event_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub initialized: bool,
    pub enable_websocket: bool,
    pub enable_supabase_realtime: bool,
    pub enable_sse: bool,
    pub priority: Vec<TransportKind>,
    pub fallback_strategy: FallbackStrategy,
    pub pools: Vec<ConnectionStatus>,
    pub subscriptions: SubscriptionHealth,
    pub sse: SseHealth,
    pub last_health: Option<HealthReport>,
    pub listeners: usize,
    pub stats: EventStats,
}

#[derive(Default)]
struct Wiring {
    pools_wired: bool,
    pool_listeners: Vec<(&'static str, &'static str, ListenerId)>,
    subscription_ids: Vec<String>,
    sse_ids: Vec<String>,
}

struct ManagerState {
    initialized: bool,
    summary: Option<InitSummary>,
    listeners: ListenerRegistry<RealtimeListener>,
    history: VecDeque<RealtimeEvent>,
    stats: EventStats,
    last_health: Option<HealthReport>,
    health_task: Option<JoinHandle<()>>,
    wiring: Wiring,
}

struct ManagerInner {
    config: ManagerConfig,
    transports: Transports,
    probe: Arc<dyn HealthProbe>,
    state: Mutex<ManagerState>,
    /// Held for the whole of `initialize` so overlapping calls run once
    init_gate: tokio::sync::Mutex<()>,
    scheduler: InteractionScheduler,
    next_throttle: AtomicU64,
}

/// Cheap to clone; clones share one manager.
#[derive(Clone)]
pub struct RealtimeManager {
    inner: Arc<ManagerInner>,
}

impl RealtimeManager {
    /// Build the manager and register the two baseline pools
    pub fn new(
        config: ManagerConfig,
        transports: Transports,
        probe: Arc<dyn HealthProbe>,
        token: Arc<dyn TokenProvider>,
    ) -> Self {
        let bearer = token.bearer_token();
        for (name, priority) in [(LOCATION_POOL, Priority::High), (GENERAL_POOL, Priority::Medium)] {
            let mut pool_config = ConnectionConfig::new(name, config.ws_url.clone())
                .priority(priority)
                .query("client", name);
            if let Some(token) = &bearer {
                pool_config = pool_config.query("token", token.clone());
            }
            transports.pool.register(pool_config);
        }

        Self {
            inner: Arc::new(ManagerInner {
                config,
                transports,
                probe,
                state: Mutex::new(ManagerState {
                    initialized: false,
                    summary: None,
                    listeners: ListenerRegistry::new(),
                    history: VecDeque::new(),
                    stats: EventStats::default(),
                    last_health: None,
                    health_task: None,
                    wiring: Wiring::default(),
                }),
                init_gate: tokio::sync::Mutex::new(()),
                scheduler: InteractionScheduler::new(),
                next_throttle: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn transports(&self) -> &Transports {
        &self.inner.transports
    }

    /// Bring up every enabled transport independently.
    ///
    /// Never fails as a whole: each transport reports its own outcome. A
    /// second call while initialized, or one overlapping a call in
    /// progress, returns the first summary.
    pub async fn initialize(&self) -> InitSummary {
        let _gate = self.inner.init_gate.lock().await;
        if let Some(summary) = lock(&self.inner.state).summary.clone() {
            tracing::debug!("Realtime manager already initialized");
            return summary;
        }

        let config = &self.inner.config;
        let (websocket, subscriptions, sse) = tokio::join!(
            async {
                if config.enable_websocket {
                    Some(self.inner.initialize_websocket().await)
                } else {
                    None
                }
            },
            async {
                config
                    .enable_supabase_realtime
                    .then(|| self.inner.initialize_subscriptions())
            },
            async { config.enable_sse.then(|| self.inner.initialize_sse()) },
        );

        let summary = InitSummary {
            websocket: TransportOutcome::from_result(TransportKind::PooledConnection, websocket),
            subscriptions: TransportOutcome::from_result(TransportKind::Subscription, subscriptions),
            sse: TransportOutcome::from_result(TransportKind::Sse, sse),
        };

        let ready = summary.ready_count();
        if ready == 0 {
            tracing::warn!("No realtime transport came up; manager is inert");
        } else {
            tracing::info!(ready, "Realtime manager initialized");
        }

        {
            let mut state = lock(&self.inner.state);
            state.initialized = true;
            state.summary = Some(summary.clone());
        }
        self.start_health_checks();

        summary
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.inner.state).initialized
    }

    /// Listen for one semantic event type, whichever transport delivers it
    pub fn on<F>(&self, event_type: &str, callback: F) -> ListenerId
    where
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        lock(&self.inner.state)
            .listeners
            .add(event_type, Arc::new(callback))
    }

    /// Like [`on`](Self::on), but each bucket picked by `key` runs the
    /// callback at most once per window (leading call plus the latest
    /// trailing one). Events without a key share one bucket.
    ///
    /// Trailing calls run on a spawned task, so events must be handled
    /// inside a tokio runtime.
    pub fn on_throttled<K, F>(
        &self,
        event_type: &str,
        options: ThrottleOptions,
        key: K,
        callback: F,
    ) -> ListenerId
    where
        K: Fn(&RealtimeEvent) -> Option<String> + Send + Sync + 'static,
        F: Fn(&RealtimeEvent) + Send + Sync + 'static,
    {
        let scope = self.inner.next_throttle.fetch_add(1, Ordering::Relaxed);
        let scheduler = self.inner.scheduler.clone();
        let callback = Arc::new(callback);

        self.on(event_type, move |event| {
            let bucket = format!(
                "{}:{}:{}",
                scope,
                event.event_type,
                key(event).unwrap_or_default()
            );
            let callback = Arc::clone(&callback);
            let event = event.clone();
            scheduler.throttle(&bucket, &options, move || {
                if let Err(panic) = isolate(|| callback(&event)) {
                    tracing::error!(event_type = %event.event_type, error = %panic, "Throttled listener panicked");
                }
            });
        })
    }

    pub fn off(&self, event_type: &str, id: ListenerId) -> bool {
        lock(&self.inner.state).listeners.remove(event_type, id)
    }

    pub fn listener_count(&self, event_type: &str) -> usize {
        lock(&self.inner.state).listeners.count(event_type)
    }

    /// Send on the pool matching `priority`. Dropped if it is not connected.
    pub fn emit(&self, event: &str, data: Value, priority: Priority) -> bool {
        self.inner
            .transports
            .pool
            .emit(pool_for_priority(priority), event, data)
    }

    /// Feed an event into the fan-out as if a transport delivered it
    pub fn handle_event(&self, event_type: &str, source: TransportKind, data: Value, priority: Priority) {
        self.inner.handle_event(event_type, source, data, priority);
    }

    /// Up to `limit` most recent events, oldest first
    pub fn recent_events(&self, limit: usize) -> Vec<RealtimeEvent> {
        let state = lock(&self.inner.state);
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn stats(&self) -> EventStats {
        lock(&self.inner.state).stats.clone()
    }

    /// Compute health now; run a recovery pass if nothing is up
    pub fn check_health(&self) -> HealthReport {
        self.inner.check_health()
    }

    pub fn last_health(&self) -> Option<HealthReport> {
        lock(&self.inner.state).last_health.clone()
    }

    pub fn status(&self) -> ManagerStatus {
        let transports = &self.inner.transports;
        let pools = transports.pool.all_statuses();
        let subscriptions = transports.subscriptions.health();
        let sse = transports.sse.health_check();
        let config = &self.inner.config;

        let state = lock(&self.inner.state);
        ManagerStatus {
            initialized: state.initialized,
            enable_websocket: config.enable_websocket,
            enable_supabase_realtime: config.enable_supabase_realtime,
            enable_sse: config.enable_sse,
            priority: config.priority.clone(),
            fallback_strategy: config.fallback_strategy,
            pools,
            subscriptions,
            sse,
            last_health: state.last_health.clone(),
            listeners: state.listeners.total(),
            stats: state.stats.clone(),
        }
    }

    /// Stop health checks, tear down every transport and forget listeners
    pub fn destroy(&self) {
        let (task, wiring) = {
            let mut state = lock(&self.inner.state);
            state.initialized = false;
            state.summary = None;
            state.listeners.clear();
            (state.health_task.take(), std::mem::take(&mut state.wiring))
        };
        if let Some(task) = task {
            task.abort();
        }
        self.inner.scheduler.cancel_all();

        let transports = &self.inner.transports;
        for (pool, event, id) in wiring.pool_listeners {
            transports.pool.off(pool, event, id);
        }
        transports.pool.stop_liveness_sweep();
        transports.pool.disconnect_all();

        for id in &wiring.subscription_ids {
            transports.subscriptions.unsubscribe(id);
        }

        for id in &wiring.sse_ids {
            transports.sse.unsubscribe(id);
        }
        transports.sse.disconnect();

        tracing::info!("Realtime manager destroyed");
    }

    fn start_health_checks(&self) {
        let mut state = lock(&self.inner.state);
        if state.health_task.is_some() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let every = self.inner.config.health_check_interval;
        state.health_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // Skip the first immediate tick
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.check_health();
            }
        }));
    }
}

impl ManagerInner {
    async fn initialize_websocket(self: &Arc<Self>) -> RealtimeResult<()> {
        if let Err(e) = self.probe.probe().await {
            tracing::warn!(error = %e, "Backend health probe failed, skipping pooled connections");
            return Err(e);
        }

        self.wire_pool_routes()?;
        let pool = &self.transports.pool;
        let (location, general) = tokio::join!(pool.connect(LOCATION_POOL), pool.connect(GENERAL_POOL));
        pool.start_liveness_sweep();

        match (location, general) {
            (Err(first), Err(second)) => {
                tracing::warn!(error = %second, connection = GENERAL_POOL, "Baseline pool failed");
                Err(RealtimeError::Pool(first))
            }
            (location, general) => {
                for (name, result) in [(LOCATION_POOL, location), (GENERAL_POOL, general)] {
                    if let Err(e) = result {
                        tracing::warn!(connection = name, error = %e, "Baseline pool failed, retrying in background");
                    }
                }
                Ok(())
            }
        }
    }

    /// Attach the pool routes once; recovery may bring pools up without
    /// `initialize_websocket` ever getting past the probe.
    fn wire_pool_routes(self: &Arc<Self>) -> RealtimeResult<()> {
        {
            let mut state = lock(&self.state);
            if state.wiring.pools_wired {
                return Ok(());
            }
            state.wiring.pools_wired = true;
        }

        let pool = &self.transports.pool;
        let mut wired = Vec::with_capacity(POOL_ROUTES.len());
        let mut first_error = None;
        for route in POOL_ROUTES {
            let weak = Arc::downgrade(self);
            let result = pool.on(route.origin, route.raw, move |payload| {
                forward(&weak, route.event_type, TransportKind::PooledConnection, payload, route.priority);
            });
            match result {
                Ok(id) => wired.push((route.origin, route.raw, id)),
                Err(e) => {
                    tracing::warn!(connection = route.origin, event = route.raw, error = %e, "Pool route not wired");
                    first_error.get_or_insert(e);
                }
            }
        }
        lock(&self.state).wiring.pool_listeners.extend(wired);

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn initialize_subscriptions(self: &Arc<Self>) -> RealtimeResult<()> {
        let service = &self.transports.subscriptions;
        service.set_enabled(true);

        let mut first_error = None;
        for route in TABLE_ROUTES_MAP {
            let weak = Arc::downgrade(self);
            let result = service.subscribe(
                route.origin,
                ChangeEvent::All,
                move |payload| {
                    forward(&weak, route.event_type, TransportKind::Subscription, payload, route.priority);
                },
                None,
            );
            match result {
                Ok(id) => lock(&self.state).wiring.subscription_ids.push(id),
                Err(e) => {
                    tracing::warn!(table = route.origin, error = %e, "Canonical subscription failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn initialize_sse(self: &Arc<Self>) -> RealtimeResult<()> {
        let sse = &self.transports.sse;
        for route in SSE_ROUTES {
            let weak = Arc::downgrade(self);
            let id = sse.subscribe(route.raw, move |event| {
                forward(&weak, route.event_type, TransportKind::Sse, &event.data, route.priority);
            });
            lock(&self.state).wiring.sse_ids.push(id);
        }

        sse.connect()?;
        Ok(())
    }

    fn handle_event(&self, event_type: &str, source: TransportKind, data: Value, priority: Priority) {
        let event = RealtimeEvent::new(event_type, source, data, priority);

        let listeners = {
            let mut state = lock(&self.state);
            state.history.push_back(event.clone());
            while state.history.len() > self.config.history_limit {
                state.history.pop_front();
            }

            let stats = &mut state.stats;
            stats.total += 1;
            match source {
                TransportKind::PooledConnection => stats.pooled_connection += 1,
                TransportKind::Subscription => stats.subscription += 1,
                TransportKind::Sse => stats.sse += 1,
            }
            stats.last_event_at = Some(event.timestamp);

            state.listeners.snapshot(event_type)
        };

        let mut panics = 0;
        for listener in listeners {
            if let Err(panic) = isolate(|| listener(&event)) {
                panics += 1;
                tracing::error!(event_type = %event_type, source = %source, error = %panic, "Realtime listener panicked");
            }
        }
        if panics > 0 {
            lock(&self.state).stats.listener_panics += panics;
        }
    }

    fn check_health(self: &Arc<Self>) -> HealthReport {
        let transports = &self.transports;
        let report = HealthReport::from_flags(
            transports.pool.connected_count() > 0,
            transports.subscriptions.healthy(),
            transports.sse.healthy(),
        );
        lock(&self.state).last_health = Some(report.clone());

        if report.overall {
            tracing::debug!(
                websocket = report.websocket,
                subscriptions = report.subscriptions,
                sse = report.sse,
                "Realtime health check passed"
            );
            return report;
        }

        tracing::warn!("All realtime transports down, attempting recovery");
        if self.config.enable_websocket {
            if let Err(e) = self.wire_pool_routes() {
                tracing::warn!(error = %e, "Pool routes incomplete during recovery");
            }
            transports.pool.start_liveness_sweep();
            for name in [LOCATION_POOL, GENERAL_POOL] {
                let pool = transports.pool.clone();
                tokio::spawn(async move {
                    if let Err(e) = pool.connect(name).await {
                        tracing::warn!(connection = name, error = %e, "Pool recovery failed");
                    }
                });
            }
        }
        if self.config.enable_sse {
            if let Err(e) = transports.sse.reconnect() {
                tracing::warn!(error = %e, "SSE recovery failed");
            }
        }

        report
    }
}

fn forward(
    manager: &Weak<ManagerInner>,
    event_type: &str,
    source: TransportKind,
    payload: &Value,
    priority: Priority,
) {
    if let Some(inner) = manager.upgrade() {
        inner.handle_event(event_type, source, payload.clone(), priority);
    }
}
