//! Listener registries
//!
//! Callbacks keyed by event type. Removal is by [`ListenerId`], handed out
//! at registration, so two identical closures are still told apart.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Handle returned by every `on(...)`; pass it back to `off(...)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

pub(crate) struct ListenerRegistry<T: ?Sized> {
    by_event: HashMap<String, Vec<(ListenerId, Arc<T>)>>,
}

impl<T: ?Sized> Default for ListenerRegistry<T> {
    fn default() -> Self {
        Self {
            by_event: HashMap::new(),
        }
    }
}

impl<T: ?Sized> ListenerRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, event: &str, listener: Arc<T>) -> ListenerId {
        let id = ListenerId::next();
        self.by_event
            .entry(event.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    pub fn remove(&mut self, event: &str, id: ListenerId) -> bool {
        let Some(listeners) = self.by_event.get_mut(event) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            self.by_event.remove(event);
        }
        removed
    }

    /// Copy of the listeners for `event`, safe to invoke after the lock
    /// protecting the registry has been released.
    pub fn snapshot(&self, event: &str) -> Vec<Arc<T>> {
        self.by_event
            .get(event)
            .map(|listeners| listeners.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, event: &str) -> usize {
        self.by_event.get(event).map(Vec::len).unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.by_event.values().map(Vec::len).sum()
    }

    pub fn clear(&mut self) {
        self.by_event.clear();
    }
}
