// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wait/wake runtime primitives.
//!
//! [`WakeNotifier`] is the single-slot flag the pulse-driven event loop
//! (`assembly`) uses to wake a caller blocked between pulses on [`stop`](
//! crate::assembly::Peer::stop).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A single flag a producer thread can raise to wake a waiting consumer,
/// with a fast atomic-only path when the consumer is already awake and
/// checking, and a `Condvar` fallback when it is genuinely blocked.
pub struct WakeNotifier {
    flag: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl WakeNotifier {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    /// Raise the flag and wake anyone blocked in [`Self::wait`].
    pub fn notify(&self) {
        self.flag.store(true, Ordering::Release);
        let _guard = self.mutex.lock().unwrap_or_else(|p| p.into_inner());
        self.condvar.notify_all();
    }

    /// Clear the flag without waiting.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }

    /// Block until notified or `timeout` elapses, then clear the flag.
    /// Returns `true` if notified, `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.flag.swap(false, Ordering::AcqRel) {
            return true;
        }
        let guard = self.mutex.lock().unwrap_or_else(|p| p.into_inner());
        let (_guard, result) = self
            .condvar
            .wait_timeout(guard, timeout)
            .unwrap_or_else(|p| p.into_inner());
        let woken = !result.timed_out();
        self.flag.store(false, Ordering::Release);
        woken
    }
}

impl Default for WakeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn notify_before_wait_is_not_lost() {
        let notifier = WakeNotifier::new();
        notifier.notify();
        assert!(notifier.wait(Duration::from_millis(10)));
    }

    #[test]
    fn wait_times_out_without_notify() {
        let notifier = WakeNotifier::new();
        assert!(!notifier.wait(Duration::from_millis(5)));
    }

    #[test]
    fn notify_wakes_blocked_waiter() {
        let notifier = Arc::new(WakeNotifier::new());
        let waiter = notifier.clone();
        let handle = thread::spawn(move || waiter.wait(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        notifier.notify();
        assert!(handle.join().unwrap());
    }
}
