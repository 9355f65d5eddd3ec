//! Keyed debounce/throttle engine
//!
//! One timer per key. Every armed timer carries a sequence number; a timer
//! whose sequence no longer matches the key's pending slot (because it was
//! cancelled or re-armed) does nothing when it wakes.
//!
//! A key with no pending call whose last window has elapsed is idle: its
//! next call starts a fresh burst, and idle keys are evicted so per-bus keys
//! do not accumulate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::sync::lock;

/// Options for [`InteractionScheduler::debounce`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceOptions {
    /// Quiet period before a trailing fire
    pub delay: Duration,
    /// Fire at the start of a burst
    pub leading: bool,
    /// Fire once the key has been quiet for `delay`
    pub trailing: bool,
    /// Hard ceiling on how long a fire can be deferred
    pub max_wait: Option<Duration>,
}

impl Default for DebounceOptions {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(300),
            leading: false,
            trailing: true,
            max_wait: None,
        }
    }
}

impl DebounceOptions {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn leading(mut self, leading: bool) -> Self {
        self.leading = leading;
        self
    }

    pub fn trailing(mut self, trailing: bool) -> Self {
        self.trailing = trailing;
        self
    }

    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }
}

/// Options for [`InteractionScheduler::throttle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleOptions {
    /// Window length
    pub delay: Duration,
    /// Fire at the start of a window
    pub leading: bool,
    /// Fire at the end of a window
    pub trailing: bool,
}

impl Default for ThrottleOptions {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(1000),
            leading: true,
            trailing: true,
        }
    }
}

impl ThrottleOptions {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn leading(mut self, leading: bool) -> Self {
        self.leading = leading;
        self
    }

    pub fn trailing(mut self, trailing: bool) -> Self {
        self.trailing = trailing;
        self
    }
}

struct PendingTimer {
    seq: u64,
    handle: JoinHandle<()>,
}

/// Idle keys are swept once the map holds this many entries
const PRUNE_FLOOR: usize = 64;
/// At most one sweep per interval
const PRUNE_EVERY: Duration = Duration::from_secs(1);

#[derive(Default)]
struct KeyState {
    last_fire: Option<Instant>,
    /// End of the window opened by the last fire
    quiet_until: Option<Instant>,
    /// First call of the current burst, used while the key has never fired
    burst_start: Option<Instant>,
    pending: Option<PendingTimer>,
}

impl KeyState {
    fn cancel_pending(&mut self) -> bool {
        match self.pending.take() {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    fn mark_fired(&mut self, at: Instant, window: Duration) {
        self.cancel_pending();
        self.last_fire = Some(at);
        self.quiet_until = Some(at + window);
        self.burst_start = None;
    }

    fn is_idle(&self, now: Instant) -> bool {
        self.pending.is_none() && self.quiet_until.map_or(true, |until| now >= until)
    }
}

#[derive(Default)]
struct SchedulerState {
    keys: HashMap<String, KeyState>,
    next_seq: u64,
    last_prune: Option<Instant>,
}

impl SchedulerState {
    /// Fetch the key's state, resetting it if it has gone idle
    fn key(&mut self, key: &str, now: Instant) -> &mut KeyState {
        let prune_due = self
            .last_prune
            .map_or(true, |at| now.duration_since(at) >= PRUNE_EVERY);
        if self.keys.len() >= PRUNE_FLOOR && prune_due {
            self.prune(now);
        }

        let entry = self.keys.entry(key.to_string()).or_default();
        if entry.is_idle(now) {
            *entry = KeyState::default();
        }
        entry
    }

    fn prune(&mut self, now: Instant) {
        self.last_prune = Some(now);
        let before = self.keys.len();
        self.keys.retain(|_, entry| !entry.is_idle(now));
        let evicted = before - self.keys.len();
        if evicted > 0 {
            tracing::trace!(evicted, remaining = self.keys.len(), "Evicted idle scheduler keys");
        }
    }
}

fn debounce_window(options: &DebounceOptions) -> Duration {
    options.max_wait.map_or(options.delay, |max_wait| max_wait.max(options.delay))
}

/// Keyed debounce and throttle.
///
/// Cheap to clone; clones share the same keys. Trailing fires run on a
/// spawned tokio task, so the scheduler must be used inside a runtime.
#[derive(Clone, Default)]
pub struct InteractionScheduler {
    state: Arc<Mutex<SchedulerState>>,
}

impl InteractionScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Debounce `f` under `key`.
    ///
    /// Returns `true` if `f` ran immediately (leading edge or `max_wait`).
    /// Otherwise `f` replaces any pending call for the key and runs once the
    /// key is quiet for `delay`, or is dropped when `trailing` is off.
    pub fn debounce<F>(&self, key: &str, options: &DebounceOptions, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let now = Instant::now();
        let window = debounce_window(options);
        let mut state = lock(&self.state);
        let entry = state.key(key, now);

        let since_fire = entry.last_fire.map(|t| now.duration_since(t));
        let leading_due = since_fire.map_or(true, |elapsed| elapsed >= options.delay);

        if options.leading && leading_due {
            entry.mark_fired(now, window);
            drop(state);
            f();
            return true;
        }

        if let Some(max_wait) = options.max_wait {
            let reference = entry.last_fire.or(entry.burst_start);
            if let Some(reference) = reference {
                if now.duration_since(reference) >= max_wait {
                    entry.mark_fired(now, window);
                    drop(state);
                    tracing::trace!(key = %key, "debounce max_wait reached");
                    f();
                    return true;
                }
            }
        }

        if options.trailing {
            entry.burst_start.get_or_insert(now);
            self.arm(&mut state, key, options.delay, window, f);
        }

        false
    }

    /// Throttle `f` under `key`.
    ///
    /// Returns `true` if `f` ran immediately at the start of a window.
    /// Otherwise, with `trailing` on, `f` is scheduled for the end of the
    /// current window (not a full `delay` from now).
    pub fn throttle<F>(&self, key: &str, options: &ThrottleOptions, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let now = Instant::now();
        let mut state = lock(&self.state);
        let entry = state.key(key, now);

        let since_fire = entry.last_fire.map(|t| now.duration_since(t));
        let leading_due = since_fire.map_or(true, |elapsed| elapsed >= options.delay);

        if options.leading && leading_due {
            entry.mark_fired(now, options.delay);
            drop(state);
            f();
            return true;
        }

        if options.trailing {
            let window_start = match entry.last_fire {
                Some(fired) => fired,
                None => *entry.burst_start.get_or_insert(now),
            };
            let remaining = options
                .delay
                .saturating_sub(now.duration_since(window_start));
            self.arm(&mut state, key, remaining, options.delay, f);
        }

        false
    }

    /// Drop the pending call for `key` without running it
    pub fn cancel(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut state = lock(&self.state);
        let Some(entry) = state.keys.get_mut(key) else {
            return false;
        };

        let cancelled = entry.cancel_pending();
        if entry.is_idle(now) {
            state.keys.remove(key);
        }
        cancelled
    }

    /// Drop every pending call
    pub fn cancel_all(&self) {
        let now = Instant::now();
        let mut state = lock(&self.state);
        for entry in state.keys.values_mut() {
            entry.cancel_pending();
        }
        state.prune(now);
    }

    /// Number of keys still holding state (pending or inside a window)
    pub fn tracked_keys(&self) -> usize {
        lock(&self.state).keys.len()
    }

    /// Whether a trailing call is waiting for `key`
    pub fn is_pending(&self, key: &str) -> bool {
        lock(&self.state)
            .keys
            .get(key)
            .map(|entry| entry.pending.is_some())
            .unwrap_or(false)
    }

    /// Number of keys with a pending trailing call
    pub fn pending_count(&self) -> usize {
        lock(&self.state)
            .keys
            .values()
            .filter(|entry| entry.pending.is_some())
            .count()
    }

    /// Arm the trailing call; `window` is the quiet period once it fires
    fn arm<F>(&self, state: &mut SchedulerState, key: &str, delay: Duration, window: Duration, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        state.next_seq += 1;
        let seq = state.next_seq;

        let shared = Arc::clone(&self.state);
        let owned_key = key.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            {
                let mut state = lock(&shared);
                let Some(entry) = state.keys.get_mut(&owned_key) else {
                    return;
                };
                match &entry.pending {
                    Some(timer) if timer.seq == seq => {}
                    _ => return,
                }
                entry.pending = None;
                let fired = Instant::now();
                entry.last_fire = Some(fired);
                entry.quiet_until = Some(fired + window);
                entry.burst_start = None;
            }

            f();
        });

        if let Some(entry) = state.keys.get_mut(key) {
            entry.cancel_pending();
            entry.pending = Some(PendingTimer { seq, handle });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    type Fires = Arc<StdMutex<Vec<(u64, u32)>>>;

    fn recorder(start: Instant, fires: &Fires, arg: u32) -> impl FnOnce() + Send + 'static {
        let fires = Arc::clone(fires);
        move || {
            let at = Instant::now().duration_since(start).as_millis() as u64;
            fires.lock().unwrap().push((at, arg));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_trailing_fires_once_with_last_arguments() {
        let scheduler = InteractionScheduler::new();
        let fires: Fires = Arc::default();
        let start = Instant::now();
        let options = DebounceOptions::new(Duration::from_millis(300));

        for arg in [0u32, 100, 200] {
            let at = start + Duration::from_millis(arg as u64);
            tokio::time::sleep_until(at).await;
            assert!(!scheduler.debounce("search", &options, recorder(start, &fires, arg)));
        }

        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert_eq!(*fires.lock().unwrap(), vec![(500, 200)]);
        assert!(!scheduler.is_pending("search"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_leading_fires_immediately_then_suppresses() {
        let scheduler = InteractionScheduler::new();
        let fires: Fires = Arc::default();
        let start = Instant::now();
        let options = DebounceOptions::new(Duration::from_millis(300))
            .leading(true)
            .trailing(false);

        assert!(scheduler.debounce("k", &options, recorder(start, &fires, 1)));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!scheduler.debounce("k", &options, recorder(start, &fires, 2)));
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(scheduler.debounce("k", &options, recorder(start, &fires, 3)));

        assert_eq!(*fires.lock().unwrap(), vec![(0, 1), (500, 3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_max_wait_caps_deferral() {
        let scheduler = InteractionScheduler::new();
        let fires: Fires = Arc::default();
        let start = Instant::now();
        let options = DebounceOptions::new(Duration::from_millis(300))
            .max_wait(Duration::from_millis(1000));

        // Continuous input every 100ms never goes quiet for 300ms.
        for i in 0..15u32 {
            scheduler.debounce("gps", &options, recorder(start, &fires, i));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let fires = fires.lock().unwrap();
        assert_eq!(fires[0], (1000, 10));
        assert_eq!(fires.last().copied(), Some((1700, 14)));
        assert_eq!(fires.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_without_edges_never_fires() {
        let scheduler = InteractionScheduler::new();
        let fires: Fires = Arc::default();
        let start = Instant::now();
        let options = DebounceOptions::new(Duration::from_millis(50))
            .leading(false)
            .trailing(false);

        for i in 0..5 {
            scheduler.debounce("noop", &options, recorder(start, &fires, i));
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(fires.lock().unwrap().is_empty());
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_fires_once_per_window_plus_trailing() {
        let scheduler = InteractionScheduler::new();
        let fires: Fires = Arc::default();
        let start = Instant::now();
        let options = ThrottleOptions::new(Duration::from_millis(1000));

        for i in 0..25u32 {
            tokio::time::sleep_until(start + Duration::from_millis(i as u64 * 100)).await;
            scheduler.throttle("scroll", &options, recorder(start, &fires, i));
        }
        tokio::time::sleep(Duration::from_millis(2000)).await;

        let fires = fires.lock().unwrap();
        let times: Vec<u64> = fires.iter().map(|(t, _)| *t).collect();
        assert_eq!(times, vec![0, 1000, 2000, 3000]);
        assert_eq!(fires.last().map(|(_, arg)| *arg), Some(24));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_trailing_uses_remaining_window() {
        let scheduler = InteractionScheduler::new();
        let fires: Fires = Arc::default();
        let start = Instant::now();
        let options = ThrottleOptions::new(Duration::from_millis(1000));

        assert!(scheduler.throttle("t", &options, recorder(start, &fires, 0)));
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(!scheduler.throttle("t", &options, recorder(start, &fires, 1)));
        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert_eq!(*fires.lock().unwrap(), vec![(0, 0), (1000, 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending_call() {
        let scheduler = InteractionScheduler::new();
        let fires: Fires = Arc::default();
        let start = Instant::now();
        let options = DebounceOptions::new(Duration::from_millis(300));

        scheduler.debounce("a", &options, recorder(start, &fires, 1));
        scheduler.debounce("b", &options, recorder(start, &fires, 2));
        scheduler.debounce("c", &options, recorder(start, &fires, 3));
        assert_eq!(scheduler.pending_count(), 3);

        assert!(scheduler.cancel("a"));
        assert!(!scheduler.cancel("a"));
        assert!(!scheduler.cancel("unknown"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.cancel_all();
        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert!(fires.lock().unwrap().is_empty());
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_keys_are_evicted() {
        let scheduler = InteractionScheduler::new();
        let fires: Fires = Arc::default();
        let start = Instant::now();
        let options = DebounceOptions::new(Duration::from_millis(300));

        for i in 0..100u32 {
            scheduler.debounce(&format!("bus-{}", i), &options, recorder(start, &fires, i));
        }
        assert_eq!(scheduler.tracked_keys(), 100);

        // Fired keys stay tracked until their quiet window closes
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(fires.lock().unwrap().len(), 100);
        assert_eq!(scheduler.tracked_keys(), 100);

        tokio::time::sleep(Duration::from_millis(700)).await;
        scheduler.debounce("bus-new", &options, recorder(start, &fires, 100));
        assert_eq!(scheduler.tracked_keys(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_forgets_key_outside_its_window() {
        let scheduler = InteractionScheduler::new();
        let fires: Fires = Arc::default();
        let start = Instant::now();

        scheduler.debounce("a", &DebounceOptions::new(Duration::from_millis(300)), recorder(start, &fires, 1));
        assert!(scheduler.cancel("a"));
        assert_eq!(scheduler.tracked_keys(), 0);

        // A leading fire keeps the key until its window ends
        let throttle = ThrottleOptions::new(Duration::from_millis(1000));
        assert!(scheduler.throttle("t", &throttle, recorder(start, &fires, 2)));
        assert!(!scheduler.cancel("t"));
        assert_eq!(scheduler.tracked_keys(), 1);
        assert!(!scheduler.throttle("t", &throttle.trailing(false), recorder(start, &fires, 3)));

        tokio::time::sleep(Duration::from_millis(1000)).await;
        scheduler.cancel_all();
        assert_eq!(scheduler.tracked_keys(), 0);
        assert_eq!(*fires.lock().unwrap(), vec![(0, 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let scheduler = InteractionScheduler::new();
        let fires: Fires = Arc::default();
        let start = Instant::now();
        let options = DebounceOptions::new(Duration::from_millis(300));

        scheduler.debounce("bus-1", &options, recorder(start, &fires, 1));
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.debounce("bus-2", &options, recorder(start, &fires, 2));
        tokio::time::sleep(Duration::from_millis(1000)).await;

        assert_eq!(*fires.lock().unwrap(), vec![(300, 1), (500, 2)]);
    }
}
