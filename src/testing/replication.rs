//! Fake replication channels

use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::subscriptions::{
    ChangeCallback, ChannelHandle, ChannelRequest, ChannelStatus, ReplicationClient,
    StatusCallback, SubscriptionError, SubscriptionResult,
};
use crate::sync::lock;

struct FakeChannel {
    handle: ChannelHandle,
    on_change: Arc<ChangeCallback>,
}

#[derive(Default)]
pub struct FakeReplicationClient {
    fail: AtomicBool,
    next_topic: AtomicUsize,
    requests: Mutex<Vec<ChannelRequest>>,
    channels: Mutex<Vec<FakeChannel>>,
}

impl FakeReplicationClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every request ever made, open or not
    pub fn requests(&self) -> Vec<ChannelRequest> {
        lock(&self.requests).clone()
    }

    pub fn open_count(&self) -> usize {
        lock(&self.channels).len()
    }

    pub fn fail_opens(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Forget channels behind the service's back
    pub fn drop_all_channels(&self) {
        lock(&self.channels).clear();
    }

    /// Deliver a change to every open channel on `table`
    pub fn push(&self, table: &str, payload: Value) {
        let callbacks: Vec<Arc<ChangeCallback>> = lock(&self.channels)
            .iter()
            .filter(|c| c.handle.table == table)
            .map(|c| Arc::clone(&c.on_change))
            .collect();
        for callback in callbacks {
            callback(&payload);
        }
    }
}

impl ReplicationClient for FakeReplicationClient {
    fn open_channel(
        &self,
        request: ChannelRequest,
        on_change: Arc<ChangeCallback>,
        on_status: Arc<StatusCallback>,
    ) -> SubscriptionResult<ChannelHandle> {
        lock(&self.requests).push(request.clone());

        if self.fail.load(Ordering::SeqCst) {
            return Err(SubscriptionError::Channel {
                table: request.table,
                message: "channel rejected".to_string(),
            });
        }

        let n = self.next_topic.fetch_add(1, Ordering::SeqCst);
        let handle = ChannelHandle {
            topic: format!("realtime:{}-{}", request.table, n),
            table: request.table,
        };
        lock(&self.channels).push(FakeChannel {
            handle: handle.clone(),
            on_change,
        });
        on_status(ChannelStatus::Subscribed);
        Ok(handle)
    }

    fn remove_channel(&self, handle: &ChannelHandle) -> bool {
        let mut channels = lock(&self.channels);
        let before = channels.len();
        channels.retain(|c| &c.handle != handle);
        channels.len() != before
    }
}
