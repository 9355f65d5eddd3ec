//! Replication channel types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use super::error::SubscriptionResult;

/// Row change kinds a subscription listens for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeEvent {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "*")]
    All,
}

impl ChangeEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeEvent::Insert => "INSERT",
            ChangeEvent::Update => "UPDATE",
            ChangeEvent::Delete => "DELETE",
            ChangeEvent::All => "*",
        }
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one channel is scoped to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelRequest {
    pub schema: String,
    pub table: String,
    pub event: ChangeEvent,
    /// Row filter, e.g. `route_id=eq.42`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl ChannelRequest {
    pub fn new(table: impl Into<String>, event: ChangeEvent) -> Self {
        Self {
            schema: "public".to_string(),
            table: table.into(),
            event,
            filter: None,
        }
    }

    pub fn filter(mut self, filter: Option<String>) -> Self {
        self.filter = filter;
        self
    }
}

/// Channel lifecycle reported by the replication client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    ChannelError(String),
    TimedOut,
    Closed,
}

/// Identifies one open channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelHandle {
    pub topic: String,
    pub table: String,
}

/// Receives the raw change payload (old/new row) unmodified
pub type ChangeCallback = dyn Fn(&Value) + Send + Sync;
pub type StatusCallback = dyn Fn(ChannelStatus) + Send + Sync;

/// Logical-replication transport
pub trait ReplicationClient: Send + Sync + 'static {
    /// Open a channel. Readiness is reported later through `on_status`.
    fn open_channel(
        &self,
        request: ChannelRequest,
        on_change: Arc<ChangeCallback>,
        on_status: Arc<StatusCallback>,
    ) -> SubscriptionResult<ChannelHandle>;

    /// Close a channel. `false` if it was not open.
    fn remove_channel(&self, handle: &ChannelHandle) -> bool;
}
