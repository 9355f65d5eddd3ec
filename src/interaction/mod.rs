//! Interaction Scheduling
//!
//! Keyed debounce and throttle used to rate-limit noisy inputs such as
//! location ticks and UI events.
//!
//! ## Semantics
//!
//! - **Debounce**: fire once the key has been quiet for `delay`
//!   (trailing), optionally at the start of a burst (leading), with an
//!   optional `max_wait` ceiling so continuous input still fires.
//! - **Throttle**: fire at most once per `delay` window, either at the
//!   window start (leading) or at the window end (trailing).
//!
//! Cancelled calls are dropped, never flushed.

mod scheduler;

pub use scheduler::{DebounceOptions, InteractionScheduler, ThrottleOptions};
