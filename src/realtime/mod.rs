//! Realtime Orchestration
//!
//! Runs the pooled connections, replication subscriptions and the event
//! stream concurrently and presents them as one normalized event feed.
//!
//! ## Architecture
//!
//! - **RealtimeManager**: initialization, fan-out, health loop, teardown
//! - **Event routing tables**: raw transport events to semantic event types
//! - **HealthProbe**: backend pre-flight check before pooled connections
//! - **TokenProvider**: bearer token for connection query parameters
//!
//! Transports are additive. An update delivered by two transports reaches
//! listeners twice, each copy tagged with its source.

mod error;
mod events;
mod health;
mod manager;

pub use error::{RealtimeError, RealtimeResult};
pub use events::{
    pool_for_priority, EventRoute, RealtimeEvent, TransportKind, BUS_ARRIVING,
    BUS_LOCATION_UPDATE, BUS_STATUS_UPDATE, DRIVER_ASSIGNMENT_UPDATE, DRIVER_CONNECTED,
    DRIVER_DISCONNECTED, EVENT_TYPES, GENERAL_POOL, LOCATION_POOL, POOL_ROUTES, ROUTE_UPDATE,
    SSE_ROUTES, SYSTEM_NOTIFICATION, TABLE_ROUTES_MAP,
};
pub use health::{HealthProbe, HealthReport, HttpHealthProbe, StaticToken, TokenProvider};
pub use manager::{
    EventStats, FallbackStrategy, InitSummary, ManagerConfig, ManagerStatus, RealtimeListener,
    RealtimeManager, TransportOutcome, Transports,
};
