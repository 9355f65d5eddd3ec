//! Connection descriptors
//!
//! A [`ConnectionConfig`] is the static description of one named pooled
//! connection. It is immutable once registered.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use super::error::{PoolError, PoolResult};
use crate::backoff::Backoff;

/// Delivery priority, shared by pooled connections and normalized events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        };
        f.write_str(s)
    }
}

/// Pass-through transport options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Acceptable wire transports, in preference order
    pub transports: Vec<String>,
    /// Transport handshake timeout
    pub timeout: Duration,
    /// Query parameters appended to the URL (client identification, token)
    pub query: BTreeMap<String, String>,
    /// How often the transport pings the server
    pub ping_interval: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            transports: vec!["websocket".to_string()],
            timeout: Duration::from_secs(10),
            query: BTreeMap::new(),
            ping_interval: Duration::from_secs(25),
        }
    }
}

/// Static descriptor of one named connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Unique key within the pool
    pub name: String,
    /// Target URL (`ws://` or `wss://`)
    pub url: String,
    pub priority: Priority,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub options: ConnectionOptions,
}

impl ConnectionConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            priority: Priority::Medium,
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            options: ConnectionOptions::default(),
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.query.insert(key.into(), value.into());
        self
    }

    /// Full URL including the encoded query parameters
    pub fn endpoint(&self) -> PoolResult<String> {
        let url = self.url.trim();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(PoolError::InvalidUrl {
                url: self.url.clone(),
                message: "expected a ws:// or wss:// URL".to_string(),
            });
        }

        if self.options.query.is_empty() {
            return Ok(url.to_string());
        }

        let query = self
            .options
            .query
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");
        let separator = if url.contains('?') { '&' } else { '?' };

        Ok(format!("{}{}{}", url, separator, query))
    }
}

/// Pool-wide timing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Client-side watchdog on a single connection attempt
    pub connect_timeout: Duration,
    /// How often the liveness sweep runs
    pub sweep_interval: Duration,
    /// An open connection with no heartbeat for longer than this is dead
    pub heartbeat_timeout: Duration,
    pub backoff: Backoff,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            sweep_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            backoff: Backoff::pooled(),
        }
    }
}
