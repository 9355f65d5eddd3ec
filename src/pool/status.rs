//! Connection runtime status

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Lifecycle of one named connection
///
/// ```text
/// Idle -> Connecting -> Open -> (close) -> Reconnecting -> Connecting ...
///                  \-> (error|timeout) -> Reconnecting | Failed
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    /// A reconnect timer is pending
    Reconnecting,
    /// Retries exhausted; only an explicit `connect` resumes
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Snapshot of a connection's runtime state, for status indicators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub name: String,
    pub state: ConnectionState,
    pub is_connected: bool,
    pub is_connecting: bool,
    /// Last liveness signal (open or pong)
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Resets to 0 only on a successful open
    pub reconnect_attempts: u32,
    /// Last failure message, cleared on a successful open
    pub error: Option<String>,
}
