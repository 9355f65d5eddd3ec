//! # Bustrack
//!
//! Realtime transport orchestration for campus bus tracking. Pooled
//! WebSocket connections, Supabase logical-replication change feeds and a
//! Server-Sent Events stream run side by side behind one normalized event
//! feed.
//!
//! ## Features
//!
//! - **Pooled connections**: named, prioritized WebSockets with per-connection
//!   backoff, heartbeat liveness and generation-guarded timers
//! - **Change feeds**: per-table replication subscriptions, revocable by id
//! - **Event stream**: SSE with typed subscriptions and bounded reconnects
//! - **Orchestration**: additive fan-out, cross-transport health, recovery
//! - **Interaction scheduling**: keyed debounce and throttle
//!
//! ## Modules
//!
//! - [`pool`]: Connection pool and WebSocket transport
//! - [`sse`]: Event stream client, transport and parser
//! - [`subscriptions`]: Replication subscription service
//! - [`realtime`]: Orchestrating manager and event normalization
//! - [`interaction`]: Debounce/throttle engine
//! - [`config`]: TOML + environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bustrack::pool::{ConnectionPool, TungsteniteConnector};
//! use bustrack::realtime::*;
//! use bustrack::sse::{HttpEventSourceFactory, SseClient, SseConfig};
//! use bustrack::subscriptions::{PhoenixConfig, PhoenixReplicationClient, SubscriptionService};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transports = Transports {
//!         pool: ConnectionPool::new(Arc::new(TungsteniteConnector::new())),
//!         subscriptions: SubscriptionService::new(Arc::new(PhoenixReplicationClient::new(
//!             PhoenixConfig::default(),
//!         )?)),
//!         sse: SseClient::new(SseConfig::default(), Arc::new(HttpEventSourceFactory::new())),
//!     };
//!     let probe = HttpHealthProbe::new("http://localhost:3001", Duration::from_secs(5))?;
//!
//!     let manager = RealtimeManager::new(
//!         ManagerConfig::default(),
//!         transports,
//!         Arc::new(probe),
//!         Arc::new(StaticToken::new(None)),
//!     );
//!     manager.on(BUS_LOCATION_UPDATE, |event| {
//!         println!("{} via {}: {}", event.event_type, event.source, event.data);
//!     });
//!
//!     let summary = manager.initialize().await;
//!     println!("{} transports ready", summary.ready_count());
//!
//!     manager.destroy();
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod config;
pub mod interaction;
pub mod listeners;
pub mod pool;
pub mod realtime;
pub mod sse;
pub mod subscriptions;
mod sync;

#[cfg(test)]
mod testing;

// Re-export top-level types for convenience
pub use backoff::Backoff;
pub use listeners::ListenerId;

pub use pool::{
    ConnectionConfig, ConnectionPool, ConnectionState, ConnectionStatus, PoolError, PoolResult,
    PoolSettings, Priority, TungsteniteConnector,
};

pub use sse::{HttpEventSourceFactory, SseClient, SseConfig, SseError, SseResult, SseState};

pub use subscriptions::{
    ChangeEvent, PhoenixConfig, PhoenixReplicationClient, SubscriptionError, SubscriptionResult,
    SubscriptionService,
};

pub use realtime::{
    HealthReport, HttpHealthProbe, InitSummary, ManagerConfig, RealtimeError, RealtimeEvent,
    RealtimeManager, RealtimeResult, StaticToken, TransportKind, TransportOutcome, Transports,
};

pub use interaction::{DebounceOptions, InteractionScheduler, ThrottleOptions};

pub use config::{Config, ConfigError, LoggingConfig};
