//! Event stream transport
//!
//! An [`EventSource`] mirrors the browser object: it has a ready state and
//! reports open, named events and errors through a [`StreamHandle`] signal
//! channel. [`HttpEventSourceFactory`] implements it over a reqwest byte
//! stream.

use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CACHE_CONTROL};
use reqwest::{Client, Url};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::error::{SseError, SseResult};
use super::parser::SseParser;
use crate::sync::lock;

/// Ready state of an event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyState {
    Connecting,
    Open,
    /// Terminal; the stream will not recover by itself
    Closed,
}

impl ReadyState {
    fn as_u8(self) -> u8 {
        match self {
            ReadyState::Connecting => 0,
            ReadyState::Open => 1,
            ReadyState::Closed => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            _ => ReadyState::Closed,
        }
    }
}

/// What a stream reports to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSignal {
    Open,
    Event { event_type: String, data: String },
    /// Check the source's ready state to tell a drop from a hiccup
    Error(String),
}

/// Optional construction settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamOptions {
    /// Extra request headers (e.g. `Authorization`)
    pub headers: BTreeMap<String, String>,
}

impl StreamOptions {
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {}", token))
    }
}

pub trait EventSource: Send + Sync {
    fn ready_state(&self) -> ReadyState;
    fn close(&self);
}

/// A constructed stream and its signal channel
pub struct StreamHandle {
    pub source: Arc<dyn EventSource>,
    pub signals: mpsc::UnboundedReceiver<StreamSignal>,
}

/// Constructs event streams.
///
/// `open` fails synchronously when the options cannot be honoured; the
/// caller may then retry with `None`.
pub trait EventSourceFactory: Send + Sync + 'static {
    fn open(&self, url: &str, options: Option<&StreamOptions>) -> SseResult<StreamHandle>;
}

/// Event streams over HTTP
#[derive(Debug, Clone, Default)]
pub struct HttpEventSourceFactory {
    client: Client,
}

impl HttpEventSourceFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl EventSourceFactory for HttpEventSourceFactory {
    fn open(&self, url: &str, options: Option<&StreamOptions>) -> SseResult<StreamHandle> {
        let url = Url::parse(url).map_err(|e| SseError::InvalidUrl {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        if let Some(options) = options {
            for (name, value) in &options.headers {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| SseError::UnsupportedOption(format!("header name {:?}", name)))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|_| SseError::UnsupportedOption(format!("value of header {}", name)))?;
                headers.insert(name, value);
            }
        }

        let source = Arc::new(HttpEventSource {
            state: AtomicU8::new(ReadyState::Connecting.as_u8()),
            task: Mutex::new(None),
        });
        let (tx, signals) = mpsc::unbounded_channel();

        let request = self.client.get(url).headers(headers);
        let task = tokio::spawn(read_stream(Arc::clone(&source), request, tx));
        *lock(&source.task) = Some(task);

        Ok(StreamHandle { source, signals })
    }
}

struct HttpEventSource {
    state: AtomicU8,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpEventSource {
    fn set_state(&self, state: ReadyState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }
}

impl EventSource for HttpEventSource {
    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn close(&self) {
        self.set_state(ReadyState::Closed);
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

async fn read_stream(
    source: Arc<HttpEventSource>,
    request: reqwest::RequestBuilder,
    signals: mpsc::UnboundedSender<StreamSignal>,
) {
    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            source.set_state(ReadyState::Closed);
            let _ = signals.send(StreamSignal::Error(e.to_string()));
            return;
        }
    };

    if !response.status().is_success() {
        source.set_state(ReadyState::Closed);
        let _ = signals.send(StreamSignal::Error(
            SseError::Status(response.status().as_u16()).to_string(),
        ));
        return;
    }

    source.set_state(ReadyState::Open);
    let _ = signals.send(StreamSignal::Open);

    let mut parser = SseParser::new();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        match chunk {
            Ok(bytes) => {
                for frame in parser.feed(&bytes) {
                    let signal = StreamSignal::Event {
                        event_type: frame.event,
                        data: frame.data,
                    };
                    if signals.send(signal).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                source.set_state(ReadyState::Closed);
                let _ = signals.send(StreamSignal::Error(e.to_string()));
                return;
            }
        }
    }

    source.set_state(ReadyState::Closed);
    let _ = signals.send(StreamSignal::Error("event stream ended".to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_url_is_rejected() {
        let factory = HttpEventSourceFactory::new();
        assert!(matches!(
            factory.open("not a url", None),
            Err(SseError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_unrepresentable_header_rejects_rich_construction() {
        let factory = HttpEventSourceFactory::new();
        let options = StreamOptions::default().header("X-Client", "line\nbreak");
        assert!(matches!(
            factory.open("http://localhost:3001/events", Some(&options)),
            Err(SseError::UnsupportedOption(_))
        ));
    }

    #[test]
    fn test_bearer_header() {
        let options = StreamOptions::default().bearer("abc");
        assert_eq!(options.headers["Authorization"], "Bearer abc");
    }
}
