//! SSE client error types

use thiserror::Error;

/// Errors that can occur in the SSE client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SseError {
    /// Stream URL could not be built or parsed
    #[error("Invalid stream URL {url}: {message}")]
    InvalidUrl { url: String, message: String },

    /// The transport refused the construction options
    #[error("Unsupported stream option: {0}")]
    UnsupportedOption(String),

    /// Neither the rich nor the minimal construction succeeded
    #[error("Failed to open event stream: {0}")]
    Construction(String),

    /// Server answered the stream request with a non-success status
    #[error("Event stream rejected with HTTP {0}")]
    Status(u16),
}

/// Result type alias for SSE operations
pub type SseResult<T> = Result<T, SseError>;
