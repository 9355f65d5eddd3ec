//! Server-Sent Events
//!
//! A single inbound event stream from the tracking backend.
//!
//! ## Architecture
//!
//! - **SseClient**: state machine, subscriptions, backoff recovery
//! - **EventSourceFactory**: constructs the stream, rich options first
//! - **SseParser**: incremental `text/event-stream` decoder
//!
//! Stream payloads are JSON; anything that fails to parse is logged and
//! dropped before reaching subscribers.

mod client;
mod error;
mod parser;
mod source;

pub use client::{
    SseCallback, SseClient, SseConfig, SseEvent, SseHealth, SseHealthDetails, SseState,
    STREAM_EVENT_TYPES,
};
pub use error::{SseError, SseResult};
pub use parser::{SseFrame, SseParser};
pub use source::{
    EventSource, EventSourceFactory, HttpEventSourceFactory, ReadyState, StreamHandle,
    StreamOptions, StreamSignal,
};
