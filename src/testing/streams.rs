//! Fake event streams

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::sse::{
    EventSource, EventSourceFactory, ReadyState, SseError, SseResult, StreamHandle,
    StreamOptions, StreamSignal,
};
use crate::sync::lock;

struct FakeSource {
    state: Mutex<ReadyState>,
}

impl EventSource for FakeSource {
    fn ready_state(&self) -> ReadyState {
        *lock(&self.state)
    }

    fn close(&self) {
        *lock(&self.state) = ReadyState::Closed;
    }
}

/// Test side of one fake event stream
#[derive(Clone)]
pub struct FakeStream {
    source: Arc<FakeSource>,
    signals: mpsc::UnboundedSender<StreamSignal>,
}

impl FakeStream {
    fn set(&self, state: ReadyState) {
        *lock(&self.source.state) = state;
    }

    pub fn open(&self) {
        self.set(ReadyState::Open);
        let _ = self.signals.send(StreamSignal::Open);
    }

    pub fn event(&self, event_type: &str, data: &str) {
        let _ = self.signals.send(StreamSignal::Event {
            event_type: event_type.to_string(),
            data: data.to_string(),
        });
    }

    /// Terminal failure: the transport gives up
    pub fn fail(&self, message: &str) {
        self.set(ReadyState::Closed);
        let _ = self.signals.send(StreamSignal::Error(message.to_string()));
    }

    /// Transient error while the transport keeps retrying
    pub fn hiccup(&self, message: &str) {
        self.set(ReadyState::Connecting);
        let _ = self.signals.send(StreamSignal::Error(message.to_string()));
    }

    pub fn is_closed(&self) -> bool {
        self.source.ready_state() == ReadyState::Closed
    }
}

#[derive(Default)]
pub struct FakeEventSourceFactory {
    reject_options: AtomicBool,
    fail_construction: AtomicBool,
    fail_on_open: Mutex<Option<String>>,
    calls: Mutex<Vec<bool>>,
    streams: Mutex<Vec<FakeStream>>,
    times: Mutex<Vec<Instant>>,
}

impl FakeEventSourceFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuse any construction that carries options
    pub fn reject_options(&self) {
        self.reject_options.store(true, Ordering::SeqCst);
    }

    /// Refuse every construction
    pub fn fail_construction(&self) {
        self.fail_construction.store(true, Ordering::SeqCst);
    }

    /// Every stream created from now on fails terminally right away
    pub fn fail_on_open(&self, message: &str) {
        *lock(&self.fail_on_open) = Some(message.to_string());
    }

    /// One entry per construction attempt: whether options were passed
    pub fn calls(&self) -> Vec<bool> {
        lock(&self.calls).clone()
    }

    pub fn count(&self) -> usize {
        lock(&self.streams).len()
    }

    pub fn open_times(&self) -> Vec<Instant> {
        lock(&self.times).clone()
    }

    pub fn stream(&self, index: usize) -> FakeStream {
        lock(&self.streams)[index].clone()
    }
}

impl EventSourceFactory for FakeEventSourceFactory {
    fn open(&self, _url: &str, options: Option<&StreamOptions>) -> SseResult<StreamHandle> {
        lock(&self.calls).push(options.is_some());

        if self.fail_construction.load(Ordering::SeqCst) {
            return Err(SseError::Construction("stream unavailable".to_string()));
        }
        if options.is_some() && self.reject_options.load(Ordering::SeqCst) {
            return Err(SseError::UnsupportedOption("headers".to_string()));
        }

        let (tx, signals) = mpsc::unbounded_channel();
        let source = Arc::new(FakeSource {
            state: Mutex::new(ReadyState::Connecting),
        });
        let stream = FakeStream {
            source: Arc::clone(&source),
            signals: tx,
        };
        if let Some(message) = lock(&self.fail_on_open).clone() {
            stream.fail(&message);
        }

        lock(&self.times).push(Instant::now());
        lock(&self.streams).push(stream);
        Ok(StreamHandle { source, signals })
    }
}
