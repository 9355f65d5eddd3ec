//! Subscription Service
//!
//! Per-table change subscriptions as named, independently revocable
//! handles. Each subscription owns exactly one replication channel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::channel::{
    ChangeCallback, ChangeEvent, ChannelHandle, ChannelRequest, ChannelStatus, ReplicationClient,
};
use super::error::{SubscriptionError, SubscriptionResult};
use crate::sync::lock;

pub const TABLE_LIVE_LOCATIONS: &str = "live_locations";
pub const TABLE_BUSES: &str = "buses";
pub const TABLE_ROUTES: &str = "routes";
pub const TABLE_DRIVER_ASSIGNMENTS: &str = "driver_bus_assignments";

struct SubscriptionRecord {
    id: String,
    table: String,
    event: ChangeEvent,
    filter: Option<String>,
    handle: ChannelHandle,
    created_at: DateTime<Utc>,
}

/// Bookkeeping view of one subscription
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionInfo {
    pub id: String,
    pub table: String,
    pub event: ChangeEvent,
    pub filter: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionHealth {
    pub healthy: bool,
    pub enabled: bool,
    pub active_subscriptions: usize,
}

struct ServiceState {
    enabled: bool,
    subscriptions: HashMap<String, SubscriptionRecord>,
}

/// Cheap to clone; clones share the same subscriptions.
#[derive(Clone)]
pub struct SubscriptionService {
    client: Arc<dyn ReplicationClient>,
    state: Arc<Mutex<ServiceState>>,
}

impl SubscriptionService {
    pub fn new(client: Arc<dyn ReplicationClient>) -> Self {
        Self {
            client,
            state: Arc::new(Mutex::new(ServiceState {
                enabled: true,
                subscriptions: HashMap::new(),
            })),
        }
    }

    /// Subscribe to changes on `table`.
    ///
    /// The callback receives each raw change payload. Channel readiness is
    /// only logged; the returned id does not imply the channel is live.
    pub fn subscribe<F>(
        &self,
        table: &str,
        event: ChangeEvent,
        callback: F,
        filter: Option<String>,
    ) -> SubscriptionResult<String>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        if !self.is_enabled() {
            return Err(SubscriptionError::Disabled);
        }

        let id = format!("{}-{}", table, Uuid::new_v4());
        let request = ChannelRequest::new(table, event).filter(filter.clone());
        let on_change: Arc<ChangeCallback> = Arc::new(callback);

        let log_id = id.clone();
        let log_table = table.to_string();
        let on_status = Arc::new(move |status: ChannelStatus| match status {
            ChannelStatus::Subscribed => {
                tracing::info!(subscription = %log_id, table = %log_table, "Channel subscribed");
            }
            ChannelStatus::ChannelError(reason) => {
                tracing::error!(subscription = %log_id, table = %log_table, error = %reason, "Channel error");
            }
            ChannelStatus::TimedOut => {
                tracing::warn!(subscription = %log_id, table = %log_table, "Channel join timed out");
            }
            ChannelStatus::Closed => {
                tracing::debug!(subscription = %log_id, table = %log_table, "Channel closed");
            }
        });

        let handle = self.client.open_channel(request, on_change, on_status)?;

        let mut state = lock(&self.state);
        if !state.enabled {
            // Disabled while the channel was being opened
            self.client.remove_channel(&handle);
            return Err(SubscriptionError::Disabled);
        }
        state.subscriptions.insert(
            id.clone(),
            SubscriptionRecord {
                id: id.clone(),
                table: table.to_string(),
                event,
                filter,
                handle,
                created_at: Utc::now(),
            },
        );

        tracing::debug!(subscription = %id, table = %table, event = %event, "Subscription created");
        Ok(id)
    }

    pub fn subscribe_to_bus_locations<F>(&self, callback: F) -> SubscriptionResult<String>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe(TABLE_LIVE_LOCATIONS, ChangeEvent::All, callback, None)
    }

    pub fn subscribe_to_buses<F>(&self, callback: F) -> SubscriptionResult<String>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe(TABLE_BUSES, ChangeEvent::All, callback, None)
    }

    pub fn subscribe_to_routes<F>(&self, callback: F) -> SubscriptionResult<String>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe(TABLE_ROUTES, ChangeEvent::All, callback, None)
    }

    pub fn subscribe_to_driver_assignments<F>(&self, callback: F) -> SubscriptionResult<String>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.subscribe(TABLE_DRIVER_ASSIGNMENTS, ChangeEvent::All, callback, None)
    }

    /// Remove the channel and the record together.
    ///
    /// Returns `false` without changing anything if either half is missing.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let mut state = lock(&self.state);
        let Some(record) = state.subscriptions.get(id) else {
            return false;
        };

        if !self.client.remove_channel(&record.handle) {
            tracing::warn!(subscription = %id, topic = %record.handle.topic, "Channel already gone, keeping record");
            return false;
        }

        state.subscriptions.remove(id);
        tracing::debug!(subscription = %id, "Subscription removed");
        true
    }

    /// Returns how many subscriptions were removed
    pub fn unsubscribe_all(&self) -> usize {
        let ids: Vec<String> = lock(&self.state).subscriptions.keys().cloned().collect();
        let removed = ids.iter().filter(|id| self.unsubscribe(id)).count();
        if removed > 0 {
            tracing::info!(count = removed, "Removed all subscriptions");
        }
        removed
    }

    /// Disabling drops every subscription. Enabling does not restore them.
    pub fn set_enabled(&self, enabled: bool) {
        lock(&self.state).enabled = enabled;
        if !enabled {
            self.unsubscribe_all();
        }
        tracing::info!(enabled, "Subscription service toggled");
    }

    pub fn is_enabled(&self) -> bool {
        lock(&self.state).enabled
    }

    pub fn subscription_count(&self) -> usize {
        lock(&self.state).subscriptions.len()
    }

    /// Oldest first
    pub fn active_subscriptions(&self) -> Vec<SubscriptionInfo> {
        let mut infos: Vec<SubscriptionInfo> = lock(&self.state)
            .subscriptions
            .values()
            .map(|record| SubscriptionInfo {
                id: record.id.clone(),
                table: record.table.clone(),
                event: record.event,
                filter: record.filter.clone(),
                created_at: record.created_at,
            })
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    /// Enabled with at least one subscription
    pub fn healthy(&self) -> bool {
        self.health().healthy
    }

    pub fn health(&self) -> SubscriptionHealth {
        let state = lock(&self.state);
        let active = state.subscriptions.len();
        SubscriptionHealth {
            healthy: state.enabled && active > 0,
            enabled: state.enabled,
            active_subscriptions: active,
        }
    }
}
