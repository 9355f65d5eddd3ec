//! Subscription service error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The service is switched off
    #[error("Subscription service is disabled")]
    Disabled,

    /// The replication client could not open the channel
    #[error("Failed to open channel for {table}: {message}")]
    Channel { table: String, message: String },

    /// Replication endpoint could not be built
    #[error("Invalid replication URL {url}: {message}")]
    InvalidUrl { url: String, message: String },
}

/// Result type alias for subscription operations
pub type SubscriptionResult<T> = Result<T, SubscriptionError>;
