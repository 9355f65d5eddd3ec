//! Pooled Realtime Connections
//!
//! A small pool of named, long-lived bidirectional connections to the
//! tracking backend, each with its own reconnect policy and listeners.
//!
//! ## Architecture
//!
//! - **ConnectionPool**: registry, state machines and reconnect timers
//! - **SocketConnector**: creates one transport object per attempt
//! - **TungsteniteConnector**: WebSocket transport with JSON event frames
//!
//! ## Lifecycle
//!
//! ```text
//! register -> connect -> Connecting -> Open
//!                            |           | close
//!                            v           v
//!                        Reconnecting <--+   (1s, 2s, 4s ... capped at 30s)
//!                            | attempts exhausted
//!                            v
//!                          Failed
//! ```
//!
//! Open connections are expected to heartbeat; the liveness sweep recycles
//! any that stay silent longer than the heartbeat timeout.

mod config;
mod error;
#[allow(clippy::module_inception)]
mod pool;
mod status;
mod transport;

pub use config::{ConnectionConfig, ConnectionOptions, PoolSettings, Priority};
pub use error::{PoolError, PoolResult};
pub use pool::{ConnectionPool, SocketListener};
pub use status::{ConnectionState, ConnectionStatus};
pub use transport::{OutboundMessage, SocketConnector, SocketEvent, SocketLink, TungsteniteConnector};
