// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `HeartbeatEngine` (spec.md §4.1): cadence/receive/RTT-averaging logic.
//!
//! The socket I/O and thread itself live in [`crate::transport`]; this
//! module is the pure state machine — source bookkeeping, the per-source
//! time averager, and source expiry — so it can be driven and unit-tested
//! without a network.

use crate::peer_id::PeerId;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Bounded ring of the last N round-trip samples to one source, with
/// outlier rejection (spec.md §4.1 "Time averager").
pub struct TimeAverager {
    samples: VecDeque<i64>,
    capacity: usize,
    max_plausible_rtt_micros: i64,
}

impl TimeAverager {
    pub fn new(capacity: usize, max_plausible_rtt_micros: i64) -> Self {
        TimeAverager { samples: VecDeque::with_capacity(capacity), capacity, max_plausible_rtt_micros }
    }

    /// Feed one RTT sample in microseconds. Negative samples (a clock that
    /// jumped backwards, spec.md §9) and samples above the configured
    /// ceiling are discarded rather than skewing the average.
    pub fn add_sample(&mut self, rtt_micros: i64) {
        if rtt_micros < 0 || rtt_micros > self.max_plausible_rtt_micros {
            return;
        }
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt_micros);
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Mean over samples within one standard deviation of the overall mean.
    pub fn average_ignoring_outliers(&self) -> Option<i64> {
        if self.samples.is_empty() {
            return None;
        }
        let n = self.samples.len() as f64;
        let mean: f64 = self.samples.iter().map(|&s| s as f64).sum::<f64>() / n;
        let variance: f64 = self.samples.iter().map(|&s| (s as f64 - mean).powi(2)).sum::<f64>() / n;
        let stddev = variance.sqrt();

        let filtered: Vec<f64> = self.samples.iter().map(|&s| s as f64).filter(|&s| (s - mean).abs() <= stddev).collect();
        if filtered.is_empty() {
            return Some(mean.round() as i64);
        }
        Some((filtered.iter().sum::<f64>() / filtered.len() as f64).round() as i64)
    }

    pub fn min(&self) -> Option<i64> {
        self.samples.iter().copied().min()
    }

    pub fn max(&self) -> Option<i64> {
        self.samples.iter().copied().max()
    }
}

/// A `(remote-endpoint, PeerId)` pair — the unit of liveness (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeartbeatSourceKey {
    pub endpoint: SocketAddr,
    pub peer_id: PeerId,
}

/// Per-source bookkeeping the heartbeat thread maintains.
pub struct HeartbeatSource {
    pub last_seen: Instant,
    pub averager: TimeAverager,
    pub fully_attached: bool,
    pub ordered_peers: Vec<PeerId>,
    pub uptime_seconds: u32,
    /// TCP accept port the source advertised in its last heartbeat
    /// (spec.md §3), used by [`crate::assembly`] to dial unicast repair
    /// sessions — distinct from the multicast data port.
    pub tcp_accept_port: u16,
    /// Peer type (`FullPeer`/`JuniorOnly`) the source advertised in its last
    /// heartbeat (spec.md §3, §6), used by `MembershipView` to decide
    /// senior eligibility — junior-only peers never become senior.
    pub peer_type: crate::config::PeerType,
    /// Opaque attributes blob the source advertised in its last heartbeat
    /// (spec.md §3), zlib-decompressed. Used by `MembershipView` to detect
    /// attribute-only changes (spec.md §4.2 `peer_online`).
    pub attributes: Vec<u8>,
}

impl HeartbeatSource {
    pub fn new(now: Instant, averager_window: usize, max_plausible_rtt_micros: i64) -> Self {
        HeartbeatSource {
            last_seen: now,
            averager: TimeAverager::new(averager_window, max_plausible_rtt_micros),
            fully_attached: false,
            ordered_peers: Vec::new(),
            uptime_seconds: 0,
            tcp_accept_port: 0,
            peer_type: crate::config::PeerType::FullPeer,
            attributes: Vec::new(),
        }
    }

    pub fn is_expired(&self, now: Instant, max_missing_heartbeats: u32, heartbeats_per_second: u32) -> bool {
        let threshold = Duration::from_secs_f64(max_missing_heartbeats as f64 / heartbeats_per_second.max(1) as f64);
        now.duration_since(self.last_seen) > threshold
    }
}

/// Bounded FIFO of recently-sent packet ids (spec.md §4.1 "Receive"),
/// letting a returned round-trip be matched back to its local send time.
pub struct SendHistory {
    entries: VecDeque<(u32, Instant)>,
    capacity: usize,
}

impl SendHistory {
    pub fn new(capacity: usize) -> Self {
        SendHistory { entries: VecDeque::with_capacity(capacity), capacity }
    }

    pub fn record_send(&mut self, packet_id: u32, sent_at: Instant) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((packet_id, sent_at));
    }

    /// Look up and consume a remembered send time for `packet_id`, if still
    /// in the window.
    pub fn take_send_time(&mut self, packet_id: u32) -> Option<Instant> {
        let pos = self.entries.iter().position(|(id, _)| *id == packet_id)?;
        Some(self.entries.remove(pos).unwrap().1)
    }
}

/// Compute `rtt = receive_time - (send_time + dwell_time)` (spec.md §4.1).
pub fn compute_rtt_micros(send_time: Instant, dwell_micros: u32, receive_time: Instant) -> i64 {
    let elapsed = receive_time.saturating_duration_since(send_time).as_micros() as i64;
    elapsed - dwell_micros as i64
}

/// "Attachment phases" (spec.md §4.1): the engine listens silently for the
/// first half of the warm-up, reports an ordered list but stays half-attached
/// for the second half, then is fully attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentPhase {
    Listening,
    HalfAttached,
    FullyAttached,
}

pub fn attachment_phase(intervals_elapsed: u32, heartbeats_before_fully_attached: u32) -> AttachmentPhase {
    let half = heartbeats_before_fully_attached / 2;
    if intervals_elapsed < half {
        AttachmentPhase::Listening
    } else if intervals_elapsed < heartbeats_before_fully_attached {
        AttachmentPhase::HalfAttached
    } else {
        AttachmentPhase::FullyAttached
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averager_discards_negative_and_over_ceiling_samples() {
        let mut avg = TimeAverager::new(20, 2_000_000);
        avg.add_sample(-5);
        avg.add_sample(5_000_000);
        assert_eq!(avg.sample_count(), 0);
        avg.add_sample(1000);
        assert_eq!(avg.sample_count(), 1);
    }

    #[test]
    fn averager_output_within_min_max_of_samples() {
        let mut avg = TimeAverager::new(20, 2_000_000);
        for s in [100, 110, 105, 95, 10_000] {
            avg.add_sample(s);
        }
        let result = avg.average_ignoring_outliers().unwrap();
        assert!(result >= *avg.samples.iter().min().unwrap());
        assert!(result <= *avg.samples.iter().max().unwrap());
    }

    #[test]
    fn averager_ring_evicts_oldest() {
        let mut avg = TimeAverager::new(2, 2_000_000);
        avg.add_sample(1);
        avg.add_sample(2);
        avg.add_sample(3);
        assert_eq!(avg.sample_count(), 2);
    }

    #[test]
    fn send_history_matches_and_consumes_entries() {
        let mut history = SendHistory::new(4);
        let t0 = Instant::now();
        history.record_send(7, t0);
        assert!(history.take_send_time(7).is_some());
        assert!(history.take_send_time(7).is_none());
    }

    #[test]
    fn attachment_phase_progresses() {
        assert_eq!(attachment_phase(0, 4), AttachmentPhase::Listening);
        assert_eq!(attachment_phase(2, 4), AttachmentPhase::HalfAttached);
        assert_eq!(attachment_phase(4, 4), AttachmentPhase::FullyAttached);
    }

    #[test]
    fn source_expires_after_missing_heartbeats() {
        let now = Instant::now();
        let source = HeartbeatSource::new(now - Duration::from_secs(2), 20, 2_000_000);
        assert!(source.is_expired(now, 4, 6));
        let fresh = HeartbeatSource::new(now, 20, 2_000_000);
        assert!(!fresh.is_expired(now, 4, 6));
    }
}
