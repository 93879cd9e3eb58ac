// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-key log rate limiting.
//!
//! spec.md §4.1 requires version-mismatch logging to be "rate-limited (at
//! most one log line per second per peer)". [`RateLimiter`] generalizes that
//! to any hashable key so it can also gate malformed-packet and
//! checksum-mismatch diagnostics without flooding the log on a lossy link.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Suppresses repeated log lines for the same key within a time window.
pub struct RateLimiter<K> {
    window: Duration,
    last_logged: Mutex<HashMap<K, Instant>>,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    /// Create a limiter that allows at most one log line per `window` per key.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_logged: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if a log line for `key` should be emitted now, and
    /// records that it was. Subsequent calls for the same key within the
    /// window return `false`.
    pub fn should_log(&self, key: K) -> bool {
        let now = Instant::now();
        let mut table = self.last_logged.lock();
        match table.get_mut(&key) {
            Some(last) if now.duration_since(*last) < self.window => false,
            Some(last) => {
                *last = now;
                true
            }
            None => {
                table.insert(key, now);
                true
            }
        }
    }
}

impl<K: Eq + Hash + Clone> Default for RateLimiter<K> {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
