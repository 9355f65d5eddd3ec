//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and `BUSTRACK_*` environment variable
//! overrides. Endpoint resolution happens here; the realtime core only ever
//! sees resolved URL strings.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backoff::Backoff;
use crate::pool::PoolSettings;
use crate::realtime::{FallbackStrategy, ManagerConfig, TransportKind};
use crate::sse::{SseConfig, StreamOptions};
use crate::subscriptions::PhoenixConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub endpoints: EndpointsConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub sse: SseSection,

    #[serde(default)]
    pub supabase: SupabaseConfig,

    #[serde(default)]
    pub realtime: RealtimeConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Backend endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointsConfig {
    /// Explicit HTTP API base URL
    pub api_url: Option<String>,

    /// Explicit WebSocket base URL
    pub ws_url: Option<String>,

    /// Origin of the hosting page, e.g. `https://campus.example.edu`
    pub page_origin: Option<String>,

    #[serde(default = "default_backend_port")]
    pub default_port: u16,
}

fn default_backend_port() -> u16 {
    3001
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            ws_url: None,
            page_origin: None,
            default_port: default_backend_port(),
        }
    }
}

impl EndpointsConfig {
    /// Explicit value, then the page origin's host, then localhost
    pub fn resolve_api_url(&self) -> String {
        self.resolve(self.api_url.as_deref(), false)
    }

    /// Same layering as the API URL, with `ws`/`wss` schemes
    pub fn resolve_ws_url(&self) -> String {
        self.resolve(self.ws_url.as_deref(), true)
    }

    fn resolve(&self, explicit: Option<&str>, websocket: bool) -> String {
        if let Some(url) = explicit.map(str::trim).filter(|u| !u.is_empty()) {
            return url.trim_end_matches('/').to_string();
        }

        let (secure, host) = self
            .page_origin
            .as_deref()
            .and_then(origin_host)
            .unwrap_or((false, "localhost"));

        let scheme = match (websocket, secure) {
            (false, false) => "http",
            (false, true) => "https",
            (true, false) => "ws",
            (true, true) => "wss",
        };
        format!("{}://{}:{}", scheme, host, self.default_port)
    }
}

/// `(is_https, hostname)` of a page origin
fn origin_host(origin: &str) -> Option<(bool, &str)> {
    let origin = origin.trim();
    let (secure, rest) = if let Some(rest) = origin.strip_prefix("https://") {
        (true, rest)
    } else if let Some(rest) = origin.strip_prefix("http://") {
        (false, rest)
    } else {
        return None;
    };

    let authority = rest.split(&['/', '?', '#'][..]).next().unwrap_or_default();
    let host = match authority.strip_prefix('[') {
        // IPv6 literal keeps its brackets
        Some(v6) => &authority[..v6.find(']')? + 2],
        None => authority.split(':').next().unwrap_or_default(),
    };

    if host.is_empty() {
        None
    } else {
        Some((secure, host))
    }
}

/// Pooled-connection tunables
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_ms: u64,
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_heartbeat_timeout() -> u64 {
    60
}

fn default_backoff_base() -> u64 {
    1000
}

fn default_backoff_cap() -> u64 {
    30_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            backoff_base_ms: default_backoff_base(),
            backoff_cap_ms: default_backoff_cap(),
        }
    }
}

/// Event stream settings
#[derive(Debug, Clone, Deserialize)]
pub struct SseSection {
    #[serde(default = "default_sse_path")]
    pub path: String,

    #[serde(default = "default_sse_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
}

fn default_sse_path() -> String {
    "/api/sse/events".to_string()
}

fn default_sse_attempts() -> u32 {
    5
}

impl Default for SseSection {
    fn default() -> Self {
        Self {
            path: default_sse_path(),
            max_reconnect_attempts: default_sse_attempts(),
            backoff_base_ms: default_backoff_base(),
        }
    }
}

/// Supabase Realtime project
#[derive(Debug, Clone, Deserialize)]
pub struct SupabaseConfig {
    pub url: Option<String>,

    pub anon_key: Option<String>,

    #[serde(default = "default_phoenix_heartbeat")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_join_timeout")]
    pub join_timeout_secs: u64,
}

fn default_phoenix_heartbeat() -> u64 {
    30
}

fn default_join_timeout() -> u64 {
    10
}

impl Default for SupabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            anon_key: None,
            heartbeat_interval_secs: default_phoenix_heartbeat(),
            join_timeout_secs: default_join_timeout(),
        }
    }
}

/// Orchestration settings
#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
    #[serde(default = "default_true")]
    pub enable_websocket: bool,

    #[serde(default = "default_true")]
    pub enable_supabase_realtime: bool,

    #[serde(default = "default_true")]
    pub enable_sse: bool,

    #[serde(default = "default_priority")]
    pub priority: Vec<TransportKind>,

    #[serde(default)]
    pub fallback_strategy: FallbackStrategy,

    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,

    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Per-bus rate limit for location updates handled by the monitor
    #[serde(default = "default_location_throttle")]
    pub location_throttle_ms: u64,

    /// Bearer token passed to pools, the stream and replication joins
    pub auth_token: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_priority() -> Vec<TransportKind> {
    vec![
        TransportKind::PooledConnection,
        TransportKind::Subscription,
        TransportKind::Sse,
    ]
}

fn default_health_interval() -> u64 {
    30
}

fn default_history_limit() -> usize {
    100
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_location_throttle() -> u64 {
    1000
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enable_websocket: true,
            enable_supabase_realtime: true,
            enable_sse: true,
            priority: default_priority(),
            fallback_strategy: FallbackStrategy::default(),
            health_check_interval_secs: default_health_interval(),
            history_limit: default_history_limit(),
            probe_timeout_secs: default_probe_timeout(),
            location_throttle_ms: default_location_throttle(),
            auth_token: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("bustrack").join("config.toml")),
            Some(PathBuf::from("/etc/bustrack/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!(path = ?path, "Loaded config");
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!(path = ?path, error = %e, "Failed to load config");
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // Endpoints
        if let Some(url) = var("BUSTRACK_API_URL") {
            self.endpoints.api_url = Some(url);
        }
        if let Some(url) = var("BUSTRACK_WS_URL") {
            self.endpoints.ws_url = Some(url);
        }
        if let Some(origin) = var("BUSTRACK_PAGE_ORIGIN") {
            self.endpoints.page_origin = Some(origin);
        }

        // Supabase
        if let Some(url) = var("BUSTRACK_SUPABASE_URL") {
            self.supabase.url = Some(url);
        }
        if let Some(key) = var("BUSTRACK_SUPABASE_KEY") {
            self.supabase.anon_key = Some(key);
        }

        if let Some(token) = var("BUSTRACK_AUTH_TOKEN") {
            self.realtime.auth_token = Some(token);
        }

        // Logging
        if let Some(level) = var("BUSTRACK_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("BUSTRACK_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            connect_timeout: Duration::from_secs(self.pool.connect_timeout_secs),
            sweep_interval: Duration::from_secs(self.pool.sweep_interval_secs),
            heartbeat_timeout: Duration::from_secs(self.pool.heartbeat_timeout_secs),
            backoff: Backoff::new(
                Duration::from_millis(self.pool.backoff_base_ms),
                Some(Duration::from_millis(self.pool.backoff_cap_ms)),
            ),
        }
    }

    pub fn sse_config(&self) -> SseConfig {
        SseConfig {
            base_url: self.endpoints.resolve_api_url(),
            path: self.sse.path.clone(),
            max_reconnect_attempts: self.sse.max_reconnect_attempts,
            backoff: Backoff::new(Duration::from_millis(self.sse.backoff_base_ms), None),
            options: self
                .realtime
                .auth_token
                .as_deref()
                .filter(|t| !t.is_empty())
                .map(|token| StreamOptions::default().bearer(token)),
        }
    }

    /// `None` unless both the project URL and key are set
    pub fn phoenix_config(&self) -> Option<PhoenixConfig> {
        let url = self.supabase.url.clone().filter(|u| !u.is_empty())?;
        let api_key = self.supabase.anon_key.clone().filter(|k| !k.is_empty())?;

        Some(PhoenixConfig {
            url,
            api_key,
            access_token: self.realtime.auth_token.clone(),
            heartbeat_interval: Duration::from_secs(self.supabase.heartbeat_interval_secs),
            join_timeout: Duration::from_secs(self.supabase.join_timeout_secs),
            ..PhoenixConfig::default()
        })
    }

    pub fn manager_config(&self) -> ManagerConfig {
        let realtime = &self.realtime;
        ManagerConfig {
            enable_websocket: realtime.enable_websocket,
            enable_supabase_realtime: realtime.enable_supabase_realtime
                && self.phoenix_config().is_some(),
            enable_sse: realtime.enable_sse,
            priority: realtime.priority.clone(),
            fallback_strategy: realtime.fallback_strategy,
            ws_url: self.endpoints.resolve_ws_url(),
            health_check_interval: Duration::from_secs(realtime.health_check_interval_secs),
            history_limit: realtime.history_limit,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Bustrack Configuration
#
# Environment variables override these settings:
# - BUSTRACK_API_URL
# - BUSTRACK_WS_URL
# - BUSTRACK_PAGE_ORIGIN
# - BUSTRACK_SUPABASE_URL
# - BUSTRACK_SUPABASE_KEY
# - BUSTRACK_AUTH_TOKEN
# - BUSTRACK_LOG_LEVEL
# - BUSTRACK_LOG_FORMAT

[endpoints]
# Explicit backend URLs. When unset they are derived from page_origin's
# host and default_port, then fall back to localhost.
# api_url = "http://localhost:3001"
# ws_url = "ws://localhost:3001"
# page_origin = "https://campus.example.edu"
default_port = 3001

[pool]
# Watchdog on a single connection attempt (seconds)
connect_timeout_secs = 15

# Liveness sweep cadence and heartbeat timeout (seconds)
sweep_interval_secs = 30
heartbeat_timeout_secs = 60

# Reconnect backoff: base doubled per attempt, capped (milliseconds)
backoff_base_ms = 1000
backoff_cap_ms = 30000

[sse]
# Stream path on the API backend
path = "/api/sse/events"

# Give up after this many consecutive failed reconnects
max_reconnect_attempts = 5
backoff_base_ms = 1000

[supabase]
# Change feeds are only used when both are set
# url = "https://your-project.supabase.co"
# anon_key = ""
heartbeat_interval_secs = 30
join_timeout_secs = 10

[realtime]
enable_websocket = true
enable_supabase_realtime = true
enable_sse = true

# Preferred transport order (informational)
priority = ["pooled-connection", "subscription", "sse"]

# graceful or aggressive (reserved)
fallback_strategy = "graceful"

# Cross-transport health check cadence (seconds)
health_check_interval_secs = 30

# Recent events kept in memory
history_limit = 100

# Backend /health probe timeout (seconds)
probe_timeout_secs = 5

# Handle at most one location update per bus per window (milliseconds)
location_throttle_ms = 1000

# auth_token = ""

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
