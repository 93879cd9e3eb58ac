// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end replication scenarios (spec.md §8), driven over real loopback
//! multicast/TCP sockets with an in-process multi-peer harness: several
//! [`Peer`]s, each on `system_is_localhost_only`, pulsed in round-robin until
//! a condition is met or a deadline passes.
//!
//! These sandboxes do not all carry IPv6 multicast support (some container
//! environments refuse `join_multicast_v6` outright); [`multicast_capable`]
//! probes for that once and every scenario skips rather than fails when it's
//! unavailable, mirroring `net::multicast::tests::loopback_multicast_round_trips`.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use zg::transport::{CorruptNth, DropFirstN};
use zg::{ApplyContext, DatabaseObject, MembershipEvent, Peer, PeerSettings, PeerType, Result};

/// A single `u64` counter, replicated. `apply_senior` only accepts `b"inc"`.
struct CounterObject {
    value: u64,
}

impl CounterObject {
    fn new() -> Self {
        CounterObject { value: 0 }
    }
}

impl DatabaseObject for CounterObject {
    fn reset_to_default(&mut self) {
        self.value = 0;
    }
    fn set_from_archive(&mut self, bytes: &[u8]) -> Result<()> {
        self.value = u64::from_le_bytes(bytes.try_into().map_err(|_| zg::Error::Codec("bad archive len".into()))?);
        Ok(())
    }
    fn save_to_archive(&self) -> Vec<u8> {
        self.value.to_le_bytes().to_vec()
    }
    fn running_checksum(&self) -> u32 {
        self.value as u32
    }
    fn recalculate_checksum(&self) -> u32 {
        self.value as u32
    }
    fn apply_senior(&mut self, _ctx: ApplyContext, request_payload: &[u8]) -> Option<Vec<u8>> {
        if request_payload == b"inc" {
            self.value += 1;
            Some(self.value.to_le_bytes().to_vec())
        } else {
            None
        }
    }
    fn apply_junior(&mut self, _ctx: ApplyContext, reply_payload: &[u8]) {
        if let Ok(bytes) = reply_payload.try_into() {
            self.value = u64::from_le_bytes(bytes);
        }
    }
    fn describe(&self) -> String {
        format!("counter={}", self.value)
    }
}

/// Probes whether this sandbox actually supports joining an IPv6 multicast
/// group on loopback; some container runtimes return `NetworkUnreachable`.
fn multicast_capable() -> bool {
    static CAP: OnceLock<bool> = OnceLock::new();
    *CAP.get_or_init(|| {
        // `Peer::start` swallows multicast join failures (it only logs a
        // warning), and `is_fully_attached` is purely time-based, so neither
        // is a reliable probe. The only honest test is behavioral: start two
        // peers of the same system and see whether either ever notices the
        // other over multicast.
        let port_base = next_port_base();
        let settings = full_peer_settings("zg-mc-probe", port_base);
        let (Ok(mut a), Ok(mut b)) = (
            Peer::start(settings.clone(), vec![Box::new(CounterObject::new())]),
            Peer::start(settings, vec![Box::new(CounterObject::new())]),
        ) else {
            return false;
        };
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut saw_each_other = false;
        while Instant::now() < deadline {
            let events_a = a.pulse();
            let events_b = b.pulse();
            if !events_a.is_empty() || !events_b.is_empty() {
                saw_each_other = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        a.stop();
        b.stop();
        saw_each_other
    })
}

/// Hands out non-overlapping `port_base` values so parallel test threads
/// never collide on the same multicast group / port.
fn next_port_base() -> u16 {
    static NEXT: AtomicU16 = AtomicU16::new(42_000);
    NEXT.fetch_add(8, Ordering::Relaxed)
}

fn full_peer_settings(system: &str, port_base: u16) -> PeerSettings {
    PeerSettings::builder("zg-replication-test-v1", system, 1)
        .system_is_localhost_only(true)
        .port_base(port_base)
        .heartbeats_per_second(20)
        .heartbeats_before_fully_attached(4)
        .max_missing_heartbeats(6)
        .beacons_per_second(10)
        .build()
        .unwrap()
}

/// Pulses every peer in round-robin until `done` returns true or `timeout`
/// elapses, returning whether `done` was satisfied.
fn run_until(peers: &mut [Peer], timeout: Duration, mut done: impl FnMut(&mut [Peer]) -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        for peer in peers.iter_mut() {
            peer.pulse();
        }
        if done(peers) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn all_fully_attached(peers: &mut [Peer]) -> bool {
    peers.iter().all(|p| p.is_fully_attached())
}

macro_rules! require_multicast {
    () => {
        if !multicast_capable() {
            eprintln!("skipping: this sandbox has no working IPv6 multicast loopback");
            return;
        }
    };
}

#[test]
fn single_peer_self_apply() {
    require_multicast!();
    let settings = full_peer_settings("single-peer-self-apply", next_port_base());
    let mut peer = Peer::start(settings, vec![Box::new(CounterObject::new())]).unwrap();

    let attached = run_until(std::slice::from_mut(&mut peer), Duration::from_secs(3), |p| p[0].is_fully_attached());
    assert!(attached, "peer never reported fully-attached");

    peer.database(0).unwrap().request_update(b"inc").unwrap();
    peer.pulse();

    let db = peer.database(0).unwrap();
    assert_eq!(db.current_state_id(), 1);
    assert_eq!(db.checksum(), 1);
    assert_eq!(db.checksum(), db.object().recalculate_checksum());
    peer.stop();
}

#[test]
fn two_peer_in_order_replication() {
    require_multicast!();
    let port_base = next_port_base();
    let system = "two-peer-replication";
    let senior = Peer::start(full_peer_settings(system, port_base), vec![Box::new(CounterObject::new())]).unwrap();
    let junior = Peer::start(full_peer_settings(system, port_base), vec![Box::new(CounterObject::new())]).unwrap();

    let mut peers = vec![senior, junior];
    assert!(run_until(&mut peers, Duration::from_secs(5), all_fully_attached), "peers never mutually attached");
    assert!(
        run_until(&mut peers, Duration::from_secs(5), |p| p.iter().all(|x| x.membership().current_senior().is_some())),
        "no senior elected"
    );

    let senior_id = peers[0].membership().current_senior().unwrap();
    let senior_idx = peers.iter().position(|p| p.self_id() == senior_id).unwrap();

    for _ in 0..5 {
        peers[senior_idx].database(0).unwrap().request_update(b"inc").unwrap();
        peers[senior_idx].pulse();
    }

    let junior_idx = 1 - senior_idx;
    assert!(
        run_until(&mut peers, Duration::from_secs(5), |p| p[junior_idx].database(0).unwrap().current_state_id() == 5),
        "junior never caught up to senior's 5 updates"
    );
    let junior_checksum = peers[junior_idx].database(0).unwrap().checksum();
    let senior_checksum = peers[senior_idx].database(0).unwrap().checksum();
    assert_eq!(junior_checksum, senior_checksum);
    assert_eq!(junior_checksum, 5);

    for peer in peers.iter_mut() {
        peer.stop();
    }
}

#[test]
fn back_order_repair_after_dropped_multicast() {
    require_multicast!();
    let port_base = next_port_base();
    let system = "back-order-repair";
    let mut senior = Peer::start(full_peer_settings(system, port_base), vec![Box::new(CounterObject::new())]).unwrap();
    let junior = Peer::start(full_peer_settings(system, port_base), vec![Box::new(CounterObject::new())]).unwrap();

    // Drop the senior's first 3 multicast sends so the junior must recover
    // the missing updates via unicast back-order (spec.md §8 scenario 3).
    senior.set_drop_filter(Arc::new(DropFirstN::new(3)));

    let mut peers = vec![senior, junior];
    assert!(run_until(&mut peers, Duration::from_secs(5), all_fully_attached), "peers never mutually attached");
    assert!(
        run_until(&mut peers, Duration::from_secs(5), |p| p.iter().all(|x| x.membership().current_senior().is_some())),
        "no senior elected"
    );
    let senior_id = peers[0].membership().current_senior().unwrap();
    let senior_idx = peers.iter().position(|p| p.self_id() == senior_id).unwrap();
    let junior_idx = 1 - senior_idx;

    for _ in 0..6 {
        peers[senior_idx].database(0).unwrap().request_update(b"inc").unwrap();
        peers[senior_idx].pulse();
    }

    assert!(
        run_until(&mut peers, Duration::from_secs(8), |p| p[junior_idx].database(0).unwrap().current_state_id() == 6),
        "junior never repaired the dropped records via back-order"
    );
    assert_eq!(peers[junior_idx].database(0).unwrap().checksum(), peers[senior_idx].database(0).unwrap().checksum());

    for peer in peers.iter_mut() {
        peer.stop();
    }
}

#[test]
fn full_resend_fallback_when_log_trimmed_past_gap() {
    require_multicast!();
    let port_base = next_port_base();
    let system = "full-resend-fallback";
    // A tiny per-database log budget means the senior trims aggressively,
    // so once the junior falls behind the missing record is gone from the
    // log entirely and only a full-state resend can close the gap.
    let senior_settings = PeerSettings::builder("zg-replication-test-v1", system, 1)
        .system_is_localhost_only(true)
        .port_base(port_base)
        .heartbeats_per_second(20)
        .heartbeats_before_fully_attached(4)
        .max_missing_heartbeats(6)
        .beacons_per_second(10)
        .max_update_log_bytes_per_db(1)
        .build()
        .unwrap();
    let mut senior = Peer::start(senior_settings, vec![Box::new(CounterObject::new())]).unwrap();
    let junior = Peer::start(full_peer_settings(system, port_base), vec![Box::new(CounterObject::new())]).unwrap();

    // Drop every multicast update from the senior so the junior never sees
    // any of them directly and falls behind the trimmed window.
    senior.set_drop_filter(Arc::new(DropFirstN::new(u64::MAX)));

    let mut peers = vec![senior, junior];
    assert!(run_until(&mut peers, Duration::from_secs(5), all_fully_attached), "peers never mutually attached");
    assert!(
        run_until(&mut peers, Duration::from_secs(5), |p| p.iter().all(|x| x.membership().current_senior().is_some())),
        "no senior elected"
    );
    let senior_id = peers[0].membership().current_senior().unwrap();
    let senior_idx = peers.iter().position(|p| p.self_id() == senior_id).unwrap();
    let junior_idx = 1 - senior_idx;

    for _ in 0..10 {
        peers[senior_idx].database(0).unwrap().request_update(b"inc").unwrap();
        peers[senior_idx].pulse();
    }

    assert!(
        run_until(&mut peers, Duration::from_secs(8), |p| p[junior_idx].database(0).unwrap().current_state_id() == 10),
        "junior never recovered via full resend"
    );
    assert_eq!(peers[junior_idx].database(0).unwrap().checksum(), peers[senior_idx].database(0).unwrap().checksum());

    for peer in peers.iter_mut() {
        peer.stop();
    }
}

#[test]
fn senior_failover_promotes_surviving_peer() {
    require_multicast!();
    let port_base = next_port_base();
    let system = "senior-failover";
    let a = Peer::start(full_peer_settings(system, port_base), vec![Box::new(CounterObject::new())]).unwrap();
    let b = Peer::start(full_peer_settings(system, port_base), vec![Box::new(CounterObject::new())]).unwrap();

    let mut peers = vec![a, b];
    assert!(run_until(&mut peers, Duration::from_secs(5), all_fully_attached), "peers never mutually attached");
    assert!(
        run_until(&mut peers, Duration::from_secs(5), |p| p.iter().all(|x| x.membership().current_senior().is_some())),
        "no senior elected"
    );
    let first_senior = peers[0].membership().current_senior().unwrap();
    let dying_idx = peers.iter().position(|p| p.self_id() == first_senior).unwrap();
    let survivor_idx = 1 - dying_idx;

    peers[dying_idx].database(0).unwrap().request_update(b"inc").unwrap();
    peers[dying_idx].pulse();
    assert!(run_until(&mut peers, Duration::from_secs(5), |p| p[survivor_idx].database(0).unwrap().current_state_id() == 1));

    peers[dying_idx].stop();
    let dying = peers.remove(dying_idx);
    drop(dying);

    let mut remaining = vec![peers.remove(0)];
    let survivor_id = remaining[0].self_id();
    assert!(
        run_until(
            &mut remaining,
            Duration::from_secs(8),
            |p| matches!(p[0].membership().current_senior(), Some(id) if id == survivor_id)
        ),
        "surviving peer never became senior after the previous senior stopped"
    );

    remaining[0].database(0).unwrap().request_update(b"inc").unwrap();
    remaining[0].pulse();
    assert_eq!(remaining[0].database(0).unwrap().current_state_id(), 2);
    remaining[0].stop();
}

#[test]
fn checksum_mismatch_triggers_full_resend_recovery() {
    require_multicast!();
    let port_base = next_port_base();
    let system = "checksum-mismatch-recovery";
    let senior = Peer::start(full_peer_settings(system, port_base), vec![Box::new(CounterObject::new())]).unwrap();
    let junior = Peer::start(full_peer_settings(system, port_base), vec![Box::new(CounterObject::new())]).unwrap();

    let mut peers = vec![senior, junior];
    assert!(run_until(&mut peers, Duration::from_secs(5), all_fully_attached), "peers never mutually attached");
    assert!(
        run_until(&mut peers, Duration::from_secs(5), |p| p.iter().all(|x| x.membership().current_senior().is_some())),
        "no senior elected"
    );
    let senior_id = peers[0].membership().current_senior().unwrap();
    let senior_idx = peers.iter().position(|p| p.self_id() == senior_id).unwrap();
    let junior_idx = 1 - senior_idx;

    // Flip one bit of the 2nd record on the wire (spec.md §8 scenario 6):
    // the junior's post-apply checksum check fails and it must fall back to
    // requesting a full-state resend rather than silently diverging.
    peers[senior_idx].set_drop_filter(Arc::new(CorruptNth::new(1)));

    for _ in 0..4 {
        peers[senior_idx].database(0).unwrap().request_update(b"inc").unwrap();
        peers[senior_idx].pulse();
    }

    assert!(
        run_until(&mut peers, Duration::from_secs(8), |p| p[junior_idx].database(0).unwrap().current_state_id() == 4),
        "junior never recovered from the corrupted record"
    );
    assert_eq!(peers[junior_idx].database(0).unwrap().checksum(), peers[senior_idx].database(0).unwrap().checksum());
    assert_eq!(peers[junior_idx].database(0).unwrap().checksum(), peers[junior_idx].database(0).unwrap().object().recalculate_checksum());

    for peer in peers.iter_mut() {
        peer.stop();
    }
}

#[test]
fn junior_only_peer_never_becomes_senior() {
    require_multicast!();
    let port_base = next_port_base();
    let system = "junior-only-peer-type";
    let junior_only_settings = PeerSettings::builder("zg-replication-test-v1", system, 1)
        .system_is_localhost_only(true)
        .port_base(port_base)
        .heartbeats_per_second(20)
        .heartbeats_before_fully_attached(4)
        .max_missing_heartbeats(6)
        .beacons_per_second(10)
        .peer_type(PeerType::JuniorOnly)
        .build()
        .unwrap();
    let junior_only = Peer::start(junior_only_settings, vec![Box::new(CounterObject::new())]).unwrap();
    let full = Peer::start(full_peer_settings(system, port_base), vec![Box::new(CounterObject::new())]).unwrap();
    let full_id = full.self_id();

    let mut peers = vec![junior_only, full];
    assert!(run_until(&mut peers, Duration::from_secs(5), all_fully_attached), "peers never mutually attached");
    assert!(
        run_until(&mut peers, Duration::from_secs(5), |p| p.iter().all(|x| x.membership().current_senior().is_some())),
        "no senior elected"
    );

    for peer in &peers {
        assert_eq!(peer.membership().current_senior(), Some(full_id), "a junior-only peer was elected senior");
    }

    for peer in peers.iter_mut() {
        peer.stop();
    }
}

#[test]
fn peer_online_event_carries_advertised_attributes() {
    require_multicast!();
    let port_base = next_port_base();
    let system = "peer-attributes";
    let attributed_settings = PeerSettings::builder("zg-replication-test-v1", system, 1)
        .system_is_localhost_only(true)
        .port_base(port_base)
        .heartbeats_per_second(20)
        .heartbeats_before_fully_attached(4)
        .max_missing_heartbeats(6)
        .beacons_per_second(10)
        .peer_attributes(b"role=worker".to_vec())
        .build()
        .unwrap();
    let attributed = Peer::start(attributed_settings, vec![Box::new(CounterObject::new())]).unwrap();
    let attributed_id = attributed.self_id();
    let plain = Peer::start(full_peer_settings(system, port_base), vec![Box::new(CounterObject::new())]).unwrap();

    let mut peers = [attributed, plain];
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut seen_attributes = None;
    while Instant::now() < deadline && seen_attributes.is_none() {
        for peer in peers.iter_mut() {
            let events = peer.pulse();
            if peer.self_id() != attributed_id {
                for e in &events {
                    if let MembershipEvent::PeerOnline(id, attrs) = e {
                        if *id == attributed_id {
                            seen_attributes = Some(attrs.clone());
                        }
                    }
                }
            }
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(seen_attributes, Some(b"role=worker".to_vec()));

    for peer in peers.iter_mut() {
        peer.stop();
    }
}

#[test]
fn membership_events_report_peer_online_and_offline() {
    require_multicast!();
    let port_base = next_port_base();
    let system = "membership-events";
    let a = Peer::start(full_peer_settings(system, port_base), vec![Box::new(CounterObject::new())]).unwrap();
    let b = Peer::start(full_peer_settings(system, port_base), vec![Box::new(CounterObject::new())]).unwrap();

    let b_id = b.self_id();
    let mut peers = vec![a, b];
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut saw_b_online = false;
    while Instant::now() < deadline && !saw_b_online {
        for peer in peers.iter_mut() {
            let events = peer.pulse();
            if peer.self_id() != b_id && events.iter().any(|e| matches!(e, MembershipEvent::PeerOnline(id, _) if *id == b_id)) {
                saw_b_online = true;
            }
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(saw_b_online, "peer A never observed peer B coming online");

    peers.remove(1).stop();
    let mut a = peers.remove(0);

    let deadline = Instant::now() + Duration::from_secs(8);
    let mut saw_b_offline = false;
    while Instant::now() < deadline && !saw_b_offline {
        let events = a.pulse();
        if events.iter().any(|e| matches!(e, MembershipEvent::PeerOffline(id, _) if *id == b_id)) {
            saw_b_offline = true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(saw_b_offline, "peer A never observed peer B going offline");
    a.stop();
}
