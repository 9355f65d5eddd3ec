//! Normalized realtime events
//!
//! Every transport's raw events are mapped onto one set of semantic event
//! names before listeners see them. The source transport is kept for
//! diagnostics only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::pool::Priority;
use crate::subscriptions::{
    TABLE_BUSES, TABLE_DRIVER_ASSIGNMENTS, TABLE_LIVE_LOCATIONS, TABLE_ROUTES,
};

pub const BUS_LOCATION_UPDATE: &str = "bus-location-update";
pub const BUS_ARRIVING: &str = "bus-arriving";
pub const BUS_STATUS_UPDATE: &str = "bus-status-update";
pub const ROUTE_UPDATE: &str = "route-update";
pub const DRIVER_CONNECTED: &str = "driver-connected";
pub const DRIVER_DISCONNECTED: &str = "driver-disconnected";
pub const DRIVER_ASSIGNMENT_UPDATE: &str = "driver-assignment-update";
pub const SYSTEM_NOTIFICATION: &str = "system-notification";

/// Every event type a listener can receive
pub const EVENT_TYPES: [&str; 8] = [
    BUS_LOCATION_UPDATE,
    BUS_ARRIVING,
    BUS_STATUS_UPDATE,
    ROUTE_UPDATE,
    DRIVER_CONNECTED,
    DRIVER_DISCONNECTED,
    DRIVER_ASSIGNMENT_UPDATE,
    SYSTEM_NOTIFICATION,
];

pub const LOCATION_POOL: &str = "location-updates";
pub const GENERAL_POOL: &str = "general-updates";

/// The three delivery mechanisms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    PooledConnection,
    Subscription,
    Sse,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportKind::PooledConnection => "pooled-connection",
            TransportKind::Subscription => "subscription",
            TransportKind::Sse => "sse",
        };
        f.write_str(s)
    }
}

/// The only event shape application listeners see
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealtimeEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: TransportKind,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub priority: Priority,
}

impl RealtimeEvent {
    pub fn new(event_type: &str, source: TransportKind, data: Value, priority: Priority) -> Self {
        Self {
            event_type: event_type.to_string(),
            source,
            data,
            timestamp: Utc::now(),
            priority,
        }
    }

    /// Bus the payload is about, under either key style
    pub fn bus_id(&self) -> Option<String> {
        let id = self.data.get("busId").or_else(|| self.data.get("bus_id"))?;
        match id {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// One raw-to-semantic mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRoute {
    /// Pool name, table or stream event type the raw event comes from
    pub origin: &'static str,
    pub raw: &'static str,
    pub event_type: &'static str,
    pub priority: Priority,
}

pub const POOL_ROUTES: [EventRoute; 4] = [
    EventRoute {
        origin: LOCATION_POOL,
        raw: "bus:locationUpdate",
        event_type: BUS_LOCATION_UPDATE,
        priority: Priority::High,
    },
    EventRoute {
        origin: LOCATION_POOL,
        raw: "bus:arriving",
        event_type: BUS_ARRIVING,
        priority: Priority::High,
    },
    EventRoute {
        origin: GENERAL_POOL,
        raw: "driver:connected",
        event_type: DRIVER_CONNECTED,
        priority: Priority::Medium,
    },
    EventRoute {
        origin: GENERAL_POOL,
        raw: "driver:disconnected",
        event_type: DRIVER_DISCONNECTED,
        priority: Priority::Medium,
    },
];

pub const TABLE_ROUTES_MAP: [EventRoute; 4] = [
    EventRoute {
        origin: TABLE_LIVE_LOCATIONS,
        raw: "*",
        event_type: BUS_LOCATION_UPDATE,
        priority: Priority::High,
    },
    EventRoute {
        origin: TABLE_BUSES,
        raw: "*",
        event_type: BUS_STATUS_UPDATE,
        priority: Priority::Medium,
    },
    EventRoute {
        origin: TABLE_ROUTES,
        raw: "*",
        event_type: ROUTE_UPDATE,
        priority: Priority::Low,
    },
    EventRoute {
        origin: TABLE_DRIVER_ASSIGNMENTS,
        raw: "*",
        event_type: DRIVER_ASSIGNMENT_UPDATE,
        priority: Priority::Medium,
    },
];

pub const SSE_ROUTES: [EventRoute; 4] = [
    EventRoute {
        origin: "sse",
        raw: BUS_LOCATION_UPDATE,
        event_type: BUS_LOCATION_UPDATE,
        priority: Priority::High,
    },
    EventRoute {
        origin: "sse",
        raw: BUS_STATUS_UPDATE,
        event_type: BUS_STATUS_UPDATE,
        priority: Priority::Medium,
    },
    EventRoute {
        origin: "sse",
        raw: ROUTE_UPDATE,
        event_type: ROUTE_UPDATE,
        priority: Priority::Low,
    },
    EventRoute {
        origin: "sse",
        raw: SYSTEM_NOTIFICATION,
        event_type: SYSTEM_NOTIFICATION,
        priority: Priority::Medium,
    },
];

/// Pool that carries outbound messages of the given priority
pub fn pool_for_priority(priority: Priority) -> &'static str {
    match priority {
        Priority::High => LOCATION_POOL,
        Priority::Medium | Priority::Low => GENERAL_POOL,
    }
}
