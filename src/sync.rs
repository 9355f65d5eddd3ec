//! Lock helpers
//!
//! State in this crate sits behind short `std::sync::Mutex` sections that are
//! never held across an `.await` or while user callbacks run. A panicking
//! callback therefore cannot poison a lock mid-update, so a poisoned guard is
//! still consistent and is recovered instead of propagated.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run a user callback, converting a panic into its message.
pub(crate) fn isolate<F: FnOnce()>(f: F) -> Result<(), String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolate_reports_panic_message() {
        assert!(isolate(|| {}).is_ok());
        let err = isolate(|| panic!("listener exploded")).unwrap_err();
        assert_eq!(err, "listener exploded");
    }

    #[test]
    fn test_lock_recovers_poisoned_mutex() {
        let mutex = std::sync::Arc::new(Mutex::new(5));
        let clone = std::sync::Arc::clone(&mutex);
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison");
        })
        .join();
        assert!(mutex.is_poisoned());
        assert_eq!(*lock(&mutex), 5);
    }
}
