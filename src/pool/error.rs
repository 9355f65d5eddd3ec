//! Connection pool error types

use thiserror::Error;

/// Errors that can occur in the connection pool
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// `connect`/`on` called for a name that was never registered
    #[error("Connection configuration not found: {0}")]
    ConfigNotFound(String),

    /// Transport rejected the connection or errored before opening
    #[error("Connection {name} failed: {message}")]
    ConnectFailed { name: String, message: String },

    /// Client-side watchdog fired before the transport opened
    #[error("Connection timeout: {0}")]
    ConnectTimeout(String),

    /// Attempt was torn down by `disconnect` before it resolved
    #[error("Connection {0} was closed before it opened")]
    Aborted(String),

    /// None of the acceptable wire transports is supported
    #[error("Unsupported transports {0:?}")]
    UnsupportedTransport(Vec<String>),

    /// Target URL could not be built
    #[error("Invalid connection URL {url}: {message}")]
    InvalidUrl { url: String, message: String },
}

/// Result type alias for pool operations
pub type PoolResult<T> = Result<T, PoolError>;
