//! Reconnect Backoff
//!
//! Exponential backoff shared by every transport. Attempt numbers are
//! 1-based: the first retry waits `base`, the second `2 * base`, and so on.

use std::time::Duration;

/// Exponential backoff policy with an optional ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound on any single delay (`None` = uncapped)
    pub cap: Option<Duration>,
}

impl Backoff {
    /// Pooled-connection policy: 1s, 2s, 4s ... capped at 30s
    pub const fn pooled() -> Self {
        Self {
            base: Duration::from_millis(1000),
            cap: Some(Duration::from_millis(30_000)),
        }
    }

    /// SSE policy: 1s, 2s, 4s ... uncapped (bounded by the attempt limit)
    pub const fn sse() -> Self {
        Self {
            base: Duration::from_millis(1000),
            cap: None,
        }
    }

    pub fn new(base: Duration, cap: Option<Duration>) -> Self {
        Self { base, cap }
    }

    /// Delay before retry number `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u64 << exponent;
        let millis = (self.base.as_millis() as u64).saturating_mul(factor);
        let delay = Duration::from_millis(millis);

        match self.cap {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::pooled()
    }
}
