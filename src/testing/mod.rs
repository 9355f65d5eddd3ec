//! In-memory transports for unit tests

mod replication;
mod sockets;
mod streams;

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::pool::{ConnectionPool, SocketConnector};
use crate::realtime::{HealthProbe, RealtimeError, RealtimeResult, Transports};
use crate::sse::{EventSourceFactory, SseClient, SseConfig};
use crate::subscriptions::{ReplicationClient, SubscriptionService};
use crate::sync::lock;

pub use replication::FakeReplicationClient;
pub use sockets::{FakeConnector, OpenMode};
pub use streams::FakeEventSourceFactory;

#[derive(Default)]
pub struct FakeProbe {
    calls: AtomicUsize,
    failure: Mutex<Option<u16>>,
}

impl FakeProbe {
    pub fn fail_with(&self, status: u16) {
        *lock(&self.failure) = Some(status);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for FakeProbe {
    async fn probe(&self) -> RealtimeResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match *lock(&self.failure) {
            Some(status) => Err(RealtimeError::BackendUnavailable(format!(
                "health probe returned HTTP {}",
                status
            ))),
            None => Ok(()),
        }
    }
}

/// One of every fake, ready to hand to a manager
pub struct Harness {
    pub connector: Arc<FakeConnector>,
    pub streams: Arc<FakeEventSourceFactory>,
    pub replication: Arc<FakeReplicationClient>,
    pub probe: Arc<FakeProbe>,
}

impl Harness {
    pub fn new(mode: OpenMode) -> Self {
        Self {
            connector: FakeConnector::new(mode),
            streams: FakeEventSourceFactory::new(),
            replication: FakeReplicationClient::new(),
            probe: Arc::new(FakeProbe::default()),
        }
    }

    pub fn transports(&self, sse: SseConfig) -> Transports {
        Transports {
            pool: ConnectionPool::new(Arc::clone(&self.connector) as Arc<dyn SocketConnector>),
            subscriptions: SubscriptionService::new(
                Arc::clone(&self.replication) as Arc<dyn ReplicationClient>
            ),
            sse: SseClient::new(sse, Arc::clone(&self.streams) as Arc<dyn EventSourceFactory>),
        }
    }
}
