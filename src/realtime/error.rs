//! Realtime manager error types

use thiserror::Error;

use crate::pool::PoolError;
use crate::sse::SseError;
use crate::subscriptions::SubscriptionError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RealtimeError {
    /// Pre-flight health probe failed; pooled connections were skipped
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("SSE error: {0}")]
    Sse(#[from] SseError),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    /// HTTP client could not be built
    #[error("HTTP client error: {0}")]
    Http(String),
}

/// Result type alias for realtime operations
pub type RealtimeResult<T> = Result<T, RealtimeError>;
