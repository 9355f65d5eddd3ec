//! Fake pooled connections

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::pool::{
    ConnectionConfig, OutboundMessage, PoolResult, SocketConnector, SocketEvent, SocketLink,
};
use crate::sync::lock;

/// How fake sockets behave once created
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Nothing happens until the test sends events
    Manual,
    /// Handshake succeeds immediately
    AutoOpen,
    /// Handshake fails immediately
    Refuse,
}

/// Test side of one fake transport object
#[derive(Clone)]
pub struct FakeSocket {
    pub name: String,
    events: mpsc::UnboundedSender<SocketEvent>,
    outbound: Arc<Mutex<mpsc::UnboundedReceiver<OutboundMessage>>>,
}

impl FakeSocket {
    /// `false` once the pool has dropped this transport
    pub fn send(&self, event: SocketEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Drain everything the pool has emitted so far
    pub fn sent(&self) -> Vec<OutboundMessage> {
        let mut outbound = lock(&self.outbound);
        let mut messages = Vec::new();
        while let Ok(message) = outbound.try_recv() {
            messages.push(message);
        }
        messages
    }
}

pub struct FakeConnector {
    mode: OpenMode,
    refused: Mutex<HashSet<String>>,
    sockets: Mutex<Vec<FakeSocket>>,
    configs: Mutex<Vec<ConnectionConfig>>,
    times: Mutex<Vec<Instant>>,
}

impl FakeConnector {
    pub fn new(mode: OpenMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            refused: Mutex::new(HashSet::new()),
            sockets: Mutex::new(Vec::new()),
            configs: Mutex::new(Vec::new()),
            times: Mutex::new(Vec::new()),
        })
    }

    /// Refuse every handshake for `name` regardless of mode
    pub fn refuse(&self, name: &str) {
        lock(&self.refused).insert(name.to_string());
    }

    pub fn open_count(&self) -> usize {
        lock(&self.sockets).len()
    }

    pub fn open_times(&self) -> Vec<Instant> {
        lock(&self.times).clone()
    }

    pub fn socket(&self, index: usize) -> FakeSocket {
        lock(&self.sockets)[index].clone()
    }

    pub fn config(&self, index: usize) -> ConnectionConfig {
        lock(&self.configs)[index].clone()
    }

    /// Most recent socket created for `name`
    pub fn latest(&self, name: &str) -> FakeSocket {
        lock(&self.sockets)
            .iter()
            .rev()
            .find(|s| s.name == name)
            .cloned()
            .unwrap_or_else(|| panic!("no socket opened for {}", name))
    }
}

impl SocketConnector for FakeConnector {
    fn open(&self, config: &ConnectionConfig) -> PoolResult<SocketLink> {
        let (link, outbound, events) = SocketLink::pair();

        let mode = if lock(&self.refused).contains(&config.name) {
            OpenMode::Refuse
        } else {
            self.mode
        };
        match mode {
            OpenMode::Manual => {}
            OpenMode::AutoOpen => {
                let _ = events.send(SocketEvent::Open);
            }
            OpenMode::Refuse => {
                let _ = events.send(SocketEvent::Error("connection refused".to_string()));
            }
        }

        lock(&self.times).push(Instant::now());
        lock(&self.configs).push(config.clone());
        lock(&self.sockets).push(FakeSocket {
            name: config.name.clone(),
            events,
            outbound: Arc::new(Mutex::new(outbound)),
        });
        Ok(link)
    }
}
