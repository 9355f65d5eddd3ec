//! Logical-Replication Subscriptions
//!
//! Change feeds (INSERT/UPDATE/DELETE) keyed by table, each exposed as an
//! independently revocable subscription id.
//!
//! ## Architecture
//!
//! - **SubscriptionService**: subscription records, enable switch, health
//! - **ReplicationClient**: opens and removes channels
//! - **PhoenixReplicationClient**: Supabase Realtime over one WebSocket
//!
//! Payloads reach callbacks exactly as the replication feed sent them;
//! normalization happens in [`crate::realtime`].

mod channel;
mod error;
mod phoenix;
mod service;

pub use channel::{
    ChangeCallback, ChangeEvent, ChannelHandle, ChannelRequest, ChannelStatus, ReplicationClient,
    StatusCallback,
};
pub use error::{SubscriptionError, SubscriptionResult};
pub use phoenix::{PhoenixConfig, PhoenixReplicationClient};
pub use service::{
    SubscriptionHealth, SubscriptionInfo, SubscriptionService, TABLE_BUSES,
    TABLE_DRIVER_ASSIGNMENTS, TABLE_LIVE_LOCATIONS, TABLE_ROUTES,
};
