//! Wait/notify primitive used by promise waiters.
//!
//! A [`WaitSignal`] does not carry the condition itself. Waiters pass a
//! readiness predicate that is re-checked under the signal's mutex, and the
//! notifier flips its own state *before* calling [`WaitSignal::notify_all`].
//! This makes one signal shareable by several promises: a caller can block
//! until any of them finalizes.
//!
//! ```
//! use prometheus_promise::core::WaitSignal;
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::sync::Arc;
//! use std::thread;
//! use std::time::Duration;
//!
//! let signal = Arc::new(WaitSignal::new());
//! let done = Arc::new(AtomicBool::new(false));
//!
//! let (s, d) = (Arc::clone(&signal), Arc::clone(&done));
//! thread::spawn(move || {
//!     d.store(true, Ordering::Release);
//!     s.notify_all();
//! });
//!
//! assert!(signal.wait_until(Some(Duration::from_secs(5)), || done.load(Ordering::Acquire)));
//! ```

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Condition-variable based wake-up signal.
#[derive(Debug, Default)]
pub struct WaitSignal {
    notifications: Mutex<u64>,
    condvar: Condvar,
}

impl WaitSignal {
    /// Create a new signal.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            notifications: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    /// Wake every thread blocked in [`wait_until`](Self::wait_until).
    pub fn notify_all(&self) {
        let mut count = self.notifications.lock();
        *count = count.wrapping_add(1);
        self.condvar.notify_all();
    }

    /// Number of notifications delivered so far.
    #[must_use]
    pub fn notifications(&self) -> u64 {
        *self.notifications.lock()
    }

    /// Block until `ready` returns true, or until `timeout` elapses.
    ///
    /// `None` waits without a deadline. Returns the final value of `ready`.
    pub fn wait_until<F>(&self, timeout: Option<Duration>, mut ready: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.notifications.lock();
        loop {
            if ready() {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if self.condvar.wait_until(&mut guard, deadline).timed_out() {
                        return ready();
                    }
                }
                None => self.condvar.wait(&mut guard),
            }
        }
    }
}
