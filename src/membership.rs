// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `MembershipView` (spec.md §4.2): single-threaded diff of heartbeat
//! snapshots into online/offline/senior-changed events, plus the
//! ordered-peer-list convergence ("kingmaker") algorithm from §4.1 that
//! produces the snapshots in the first place.

use crate::config::PeerType;
use crate::peer_id::PeerId;
use std::collections::HashMap;
use std::net::SocketAddr;

/// One currently-visible peer, as reported by the heartbeat engine.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSnapshot {
    pub peer_id: PeerId,
    pub peer_type: PeerType,
    pub tcp_accept_port: u16,
    pub uptime_seconds: u32,
    pub system_key: u64,
    pub attributes: Vec<u8>,
    pub sources: Vec<SocketAddr>,
}

/// Event emitted by [`MembershipView::update`].
#[derive(Debug, Clone, PartialEq)]
pub enum MembershipEvent {
    PeerOnline(PeerId, Vec<u8>),
    PeerOffline(PeerId, Vec<u8>),
    SeniorChanged(Option<PeerId>, Option<PeerId>),
}

/// Sorts the visible peer set into the deterministic ordering spec.md §4.1
/// defines: full-peer types precede junior-only; within a type, longer
/// uptime precedes shorter; ties broken by descending PeerId.
pub fn local_sort_order(peers: &[PeerSnapshot]) -> Vec<PeerId> {
    let mut sorted: Vec<&PeerSnapshot> = peers.iter().collect();
    sorted.sort_by(|a, b| {
        let a_full = a.peer_type == PeerType::FullPeer;
        let b_full = b.peer_type == PeerType::FullPeer;
        b_full
            .cmp(&a_full)
            .then(b.uptime_seconds.cmp(&a.uptime_seconds))
            .then(b.peer_id.cmp(&a.peer_id))
    });
    sorted.into_iter().map(|p| p.peer_id).collect()
}

/// The "kingmaker" rule: if some advertised list covers exactly our visible
/// peer set (as a set, order ignored) and its advertiser has the lowest
/// PeerId among such advertisers, adopt that ordering verbatim. Otherwise
/// fall back to [`local_sort_order`].
pub fn converge_ordering(
    visible: &[PeerSnapshot],
    advertised: &HashMap<PeerId, Vec<PeerId>>,
) -> Vec<PeerId> {
    use std::collections::HashSet;
    let visible_set: HashSet<PeerId> = visible.iter().map(|p| p.peer_id).collect();

    let mut kingmaker: Option<PeerId> = None;
    for (&advertiser, list) in advertised {
        let advertised_set: HashSet<PeerId> = list.iter().copied().collect();
        if advertised_set == visible_set && kingmaker.is_none_or(|k| advertiser < k) {
            kingmaker = Some(advertiser);
        }
    }

    if let Some(king) = kingmaker {
        if let Some(list) = advertised.get(&king) {
            return list.clone();
        }
    }
    local_sort_order(visible)
}

/// The peer in `ordering` that is a full-peer and earliest in the list, if
/// any (spec.md §3: "Senior is the peer in the ordered-peer list whose
/// peer-type is full-peer and whose position in the list is earliest").
pub fn senior_of(ordering: &[PeerId], peers: &HashMap<PeerId, PeerSnapshot>) -> Option<PeerId> {
    ordering
        .iter()
        .find(|id| peers.get(id).map(|p| p.peer_type == PeerType::FullPeer).unwrap_or(false))
        .copied()
}

/// Diffs successive heartbeat snapshots into membership events (spec.md
/// §4.2). Lives entirely on the main thread.
pub struct MembershipView {
    peers: HashMap<PeerId, PeerSnapshot>,
    senior: Option<PeerId>,
}

impl MembershipView {
    pub fn new() -> Self {
        MembershipView { peers: HashMap::new(), senior: None }
    }

    pub fn current_senior(&self) -> Option<PeerId> {
        self.senior
    }

    pub fn peer(&self, id: PeerId) -> Option<&PeerSnapshot> {
        self.peers.get(&id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerSnapshot> {
        self.peers.values()
    }

    /// Apply a fresh snapshot of all currently-online peers and an
    /// ordering over them, returning the events in the guaranteed delivery
    /// order: offline events, then online events, then `SeniorChanged`.
    pub fn update(&mut self, new_peers: Vec<PeerSnapshot>, ordering: &[PeerId]) -> Vec<MembershipEvent> {
        let mut events = Vec::new();
        let new_map: HashMap<PeerId, PeerSnapshot> = new_peers.into_iter().map(|p| (p.peer_id, p)).collect();

        let mut offline = Vec::new();
        for (id, old) in &self.peers {
            match new_map.get(id) {
                None => offline.push((*id, old.attributes.clone())),
                Some(new) if content_changed(old, new) => offline.push((*id, old.attributes.clone())),
                Some(_) => {}
            }
        }
        for (id, attrs) in &offline {
            events.push(MembershipEvent::PeerOffline(*id, attrs.clone()));
        }

        let offline_ids: std::collections::HashSet<PeerId> = offline.iter().map(|(id, _)| *id).collect();
        for (id, new) in &new_map {
            let appeared = !self.peers.contains_key(id) || offline_ids.contains(id);
            if appeared {
                events.push(MembershipEvent::PeerOnline(*id, new.attributes.clone()));
            }
        }

        self.peers = new_map;

        let new_senior = senior_of(ordering, &self.peers);
        if new_senior != self.senior {
            events.push(MembershipEvent::SeniorChanged(self.senior, new_senior));
            self.senior = new_senior;
        }

        events
    }
}

impl Default for MembershipView {
    fn default() -> Self {
        Self::new()
    }
}

fn content_changed(old: &PeerSnapshot, new: &PeerSnapshot) -> bool {
    old.system_key != new.system_key
        || old.peer_type != new.peer_type
        || old.tcp_accept_port != new.tcp_accept_port
        || old.attributes != new.attributes
}
