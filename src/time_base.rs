// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Monotonic local clock plus a shared network-time offset (spec.md §4.6).
//!
//! The offset is a single atomic `i64` of microseconds: the heartbeat thread
//! is the sole writer, updated whenever its round-trip-time averager to the
//! current senior produces a fresh sample; every other thread only reads it.
//! `network_now()` is therefore lock-free but not guaranteed monotonic — it
//! can step on senior change or a large RTT swing, per spec.md §4.6.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared, cheaply-cloned handle to a peer's time base.
#[derive(Clone)]
pub struct TimeBase {
    epoch: Instant,
    offset_micros: Arc<AtomicI64>,
}

impl TimeBase {
    /// Create a fresh time base with a zero network-time offset (as if
    /// senior, per spec.md §4.6: "Senior peer: `offset_micros = 0` by
    /// definition").
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset_micros: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Microseconds elapsed since this `TimeBase` was created, from the OS
    /// monotonic clock.
    pub fn local_now_micros(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// `local_now + offset`, i.e. this peer's estimate of the senior's clock.
    /// Not guaranteed monotonic; see module docs.
    pub fn network_now_micros(&self) -> u64 {
        let local = self.local_now_micros() as i64;
        let offset = self.offset_micros.load(Ordering::Acquire);
        (local + offset).max(0) as u64
    }

    /// Current network-time offset in microseconds.
    pub fn offset_micros(&self) -> i64 {
        self.offset_micros.load(Ordering::Acquire)
    }

    /// Single writer (the heartbeat thread) updates the offset here.
    pub fn set_offset_micros(&self, offset: i64) {
        self.offset_micros.store(offset, Ordering::Release);
    }

    /// Reset to senior semantics: offset zero.
    pub fn reset_offset(&self) {
        self.set_offset_micros(0);
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn zero_offset_tracks_local() {
        let tb = TimeBase::new();
        thread::sleep(Duration::from_millis(5));
        let local = tb.local_now_micros();
        let network = tb.network_now_micros();
        assert!(network >= local);
        assert!(network - local < 2_000);
    }

    #[test]
    fn offset_is_shared_across_clones() {
        let tb = TimeBase::new();
        let clone = tb.clone();
        clone.set_offset_micros(500_000);
        assert_eq!(tb.offset_micros(), 500_000);
    }

    #[test]
    fn network_now_never_underflows_on_large_negative_offset() {
        let tb = TimeBase::new();
        tb.set_offset_micros(i64::MIN);
        assert_eq!(tb.network_now_micros(), 0);
    }
}
