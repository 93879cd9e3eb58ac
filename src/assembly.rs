// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Peer assembly: the three-thread event loop of spec.md §5, wiring
//! [`crate::heartbeat`], [`crate::transport`] and [`crate::database`]
//! together around real sockets.
//!
//! Shutdown ordering follows spec.md §5: transport first (so outstanding
//! replies are not held), heartbeat next, membership view last.

use crate::config::{PeerSettings, HEARTBEAT_SEND_HISTORY, MULTICAST_DEDUP_LRU_SIZE, RTT_AVERAGER_WINDOW};
use crate::core::rt::WakeNotifier;
use crate::database::{DatabaseAction, DatabaseObject, ReplicatedDatabase};
use crate::error::Result;
use crate::heartbeat::{compute_rtt_micros, HeartbeatSource, HeartbeatSourceKey, SendHistory};
use crate::interfaces::{select_interfaces, InterfaceEndpoint};
use crate::membership::{converge_ordering, local_sort_order, MembershipEvent, MembershipView, PeerSnapshot};
use crate::net::multicast::{interface_scope_id, MulticastSocket};
use crate::net::tcp;
use crate::peer_id::PeerId;
use crate::time_base::TimeBase;
use crate::transport::{DropFilter, MulticastDedup, MulticastTag, NoopFilter, OutgoingCounter, TcpFrame};
use crate::wire::{BeaconRecord, DatabaseStateInfo, HeartbeatBody, HeartbeatWrapper, UpdateRecord, WirePeerType};
use crate::{zg_debug, zg_warn};
use std::collections::HashMap;
use std::net::{IpAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn wire_peer_type(settings: &PeerSettings) -> WirePeerType {
    match settings.peer_type() {
        crate::config::PeerType::FullPeer => WirePeerType::FullPeer,
        crate::config::PeerType::JuniorOnly => WirePeerType::JuniorOnly,
    }
}

fn config_peer_type(wire: WirePeerType) -> crate::config::PeerType {
    match wire {
        WirePeerType::FullPeer => crate::config::PeerType::FullPeer,
        WirePeerType::JuniorOnly => crate::config::PeerType::JuniorOnly,
    }
}

/// A running peer: owns membership, the replicated databases, and the
/// sockets. Construct with [`Peer::start`], drive with [`Peer::pulse`] from
/// an application event loop, tear down with [`Peer::stop`].
pub struct Peer {
    self_id: PeerId,
    settings: PeerSettings,
    time_base: TimeBase,
    membership: MembershipView,
    databases: Vec<ReplicatedDatabase>,

    heartbeat_sockets: Vec<(InterfaceEndpoint, MulticastSocket)>,
    data_sockets: Vec<(InterfaceEndpoint, MulticastSocket)>,
    tcp_listener: Option<TcpListener>,
    /// Port actually bound for `tcp_listener`, advertised in heartbeats.
    /// Bound ephemerally (spec.md §4.5 "per-peer accept port advertised in
    /// heartbeats") rather than derived from `port_base`, so multiple peers
    /// of the same system can run on one host without colliding.
    tcp_accept_port: u16,
    tcp_sessions: HashMap<PeerId, TcpStream>,
    /// Accepted connections whose announce frame hasn't arrived yet.
    pending_sessions: Vec<TcpStream>,

    sources: HashMap<HeartbeatSourceKey, HeartbeatSource>,
    /// Host address and advertised TCP accept port last heard from each peer.
    peer_tcp_addr: HashMap<PeerId, (IpAddr, u16)>,
    send_history: SendHistory,
    dedup: MulticastDedup,
    outgoing_counter: OutgoingCounter,
    next_heartbeat_packet_id: u32,
    started_at: Instant,
    last_heartbeat_send: Instant,
    last_beacon_send: Instant,
    intervals_elapsed: u32,

    drop_filter: Arc<dyn DropFilter>,
    wake: WakeNotifier,
    stopping: AtomicBool,
}

impl Peer {
    /// Allocate sockets and join the system's multicast groups, per spec.md
    /// §4.1's `start(settings)` and §4.7's interface selection.
    pub fn start(settings: PeerSettings, databases: Vec<Box<dyn DatabaseObject>>) -> Result<Self> {
        let self_id = PeerId::generate();
        let raw_names = enumerate_interface_names(&settings);
        let endpoints = select_interfaces(&settings, &raw_names);

        let mut heartbeat_sockets = Vec::new();
        let mut data_sockets = Vec::new();
        for endpoint in &endpoints {
            let scope = interface_scope_id(&endpoint.name).unwrap_or(0);
            match MulticastSocket::join(endpoint.multicast_group, endpoint.heartbeat_port, scope) {
                Ok(sock) => heartbeat_sockets.push((endpoint.clone(), sock)),
                Err(e) => log::warn!("heartbeat multicast join failed on {}: {e}", endpoint.name),
            }
            match MulticastSocket::join(endpoint.multicast_group, endpoint.data_port, scope) {
                Ok(sock) => data_sockets.push((endpoint.clone(), sock)),
                Err(e) => log::warn!("data multicast join failed on {}: {e}", endpoint.name),
            }
        }

        let (tcp_listener, tcp_accept_port) = match tcp::bind_listener(0) {
            Ok(listener) => {
                let port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
                (Some(listener), port)
            }
            Err(e) => {
                log::warn!("tcp listener bind failed: {e}");
                (None, 0)
            }
        };

        let replicated: Vec<ReplicatedDatabase> = databases
            .into_iter()
            .enumerate()
            .map(|(idx, object)| ReplicatedDatabase::new(idx as u16, settings.max_update_log_bytes_per_db(), self_id, object))
            .collect();

        let now = Instant::now();
        Ok(Peer {
            self_id,
            settings,
            time_base: TimeBase::new(),
            membership: MembershipView::new(),
            databases: replicated,
            heartbeat_sockets,
            data_sockets,
            tcp_listener,
            tcp_accept_port,
            tcp_sessions: HashMap::new(),
            pending_sessions: Vec::new(),
            sources: HashMap::new(),
            peer_tcp_addr: HashMap::new(),
            send_history: SendHistory::new(HEARTBEAT_SEND_HISTORY),
            dedup: MulticastDedup::new(MULTICAST_DEDUP_LRU_SIZE),
            outgoing_counter: OutgoingCounter::new(),
            next_heartbeat_packet_id: 1,
            started_at: now,
            last_heartbeat_send: now - Duration::from_secs(3600),
            last_beacon_send: now - Duration::from_secs(3600),
            intervals_elapsed: 0,
            drop_filter: Arc::new(NoopFilter),
            wake: WakeNotifier::new(),
            stopping: AtomicBool::new(false),
        })
    }

    /// Install a test-injection hook for simulating dropped multicast
    /// messages (spec.md §8 scenarios 3 and 6).
    pub fn set_drop_filter(&mut self, filter: Arc<dyn DropFilter>) {
        self.drop_filter = filter;
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    pub fn time_base(&self) -> &TimeBase {
        &self.time_base
    }

    pub fn membership(&self) -> &MembershipView {
        &self.membership
    }

    pub fn database(&mut self, index: usize) -> Option<&mut ReplicatedDatabase> {
        self.databases.get_mut(index)
    }

    pub fn is_fully_attached(&self) -> bool {
        use crate::heartbeat::{attachment_phase, AttachmentPhase};
        attachment_phase(self.intervals_elapsed, self.settings.heartbeats_before_fully_attached()) == AttachmentPhase::FullyAttached
    }

    /// One iteration of the pulse-driven loop (spec.md §9 "Coroutine-like
    /// pulse scheduling"). Drains sockets, feeds membership and replication
    /// state machines, and emits wire traffic. Returns the membership events
    /// observed this pulse.
    pub fn pulse(&mut self) -> Vec<MembershipEvent> {
        self.send_heartbeats_if_due();
        self.receive_heartbeats();
        self.expire_stale_sources();

        let events = self.update_membership();
        for event in &events {
            if let MembershipEvent::SeniorChanged(_, new_senior) = event {
                for db in &mut self.databases {
                    db.set_senior(*new_senior);
                }
            }
            if let MembershipEvent::PeerOffline(id, _) = event {
                self.tcp_sessions.remove(id);
                for db in &mut self.databases {
                    db.abandon_back_orders_for(*id);
                }
            }
        }

        self.receive_data_messages();
        self.accept_tcp_connections();
        self.drain_tcp_sessions();
        self.drive_replication();
        self.send_beacon_if_due();

        events
    }

    /// Upper bound on how long the caller may sleep before calling
    /// [`Peer::pulse`] again without missing a scheduled send.
    pub fn next_pulse_in(&self) -> Duration {
        let hb_period = Duration::from_secs_f64(1.0 / self.settings.heartbeats_per_second().max(1) as f64);
        let beacon_period = Duration::from_secs_f64(1.0 / self.settings.beacons_per_second().max(1) as f64);
        hb_period.min(beacon_period).min(Duration::from_millis(50))
    }

    pub fn stop(&mut self) {
        self.stopping.store(true, Ordering::Release);
        self.wake.notify();
        self.tcp_sessions.clear();
    }

    fn send_heartbeats_if_due(&mut self) {
        let period = Duration::from_secs_f64(1.0 / self.settings.heartbeats_per_second().max(1) as f64);
        let now = Instant::now();
        if now.duration_since(self.last_heartbeat_send) < period {
            return;
        }
        self.last_heartbeat_send = now;
        self.intervals_elapsed += 1;

        let ordering = local_sort_order(&self.membership.peers().cloned().collect::<Vec<_>>());
        let packet_id = self.next_heartbeat_packet_id;
        self.next_heartbeat_packet_id = self.next_heartbeat_packet_id.wrapping_add(1);
        self.send_history.record_send(packet_id, now);

        let body = HeartbeatBody {
            packet_id,
            compat_version: self.settings.compat_version_word(),
            system_key: self.settings.system_key(),
            tcp_accept_port: self.tcp_accept_port,
            uptime_seconds: self.started_at.elapsed().as_secs() as u32,
            peer_id: self.self_id,
            fully_attached: self.is_fully_attached(),
            peer_type: wire_peer_type(&self.settings),
            ordered_peers: ordering
                .into_iter()
                .map(|peer_id| crate::wire::OrderedPeerEntry { peer_id, timings: Vec::new() })
                .collect(),
            attributes: self.settings.peer_attributes().to_vec(),
        };
        let compressed_body = body.encode_compressed();

        for (endpoint, socket) in &self.heartbeat_sockets {
            let wrapper = HeartbeatWrapper {
                source_tag: endpoint.source_tag,
                network_time_at_send: self.time_base.network_now_micros(),
                compressed_body: compressed_body.clone(),
            };
            if let Err(e) = socket.send(&wrapper.encode()) {
                log::warn!("heartbeat send failed on {}: {e}", endpoint.name);
            }
        }
    }

    fn receive_heartbeats(&mut self) {
        let mut buf = vec![0u8; 65536];
        let now = Instant::now();
        let max_rtt = self.settings.max_plausible_rtt_micros();

        for (_endpoint, socket) in &self.heartbeat_sockets {
            loop {
                let received = match socket.try_recv(&mut buf) {
                    Ok(Some(v)) => v,
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("heartbeat recv error: {e}");
                        break;
                    }
                };
                let (n, from) = received;
                let wrapper = match HeartbeatWrapper::decode(&buf[..n]) {
                    Ok(w) => w,
                    Err(e) => {
                        zg_debug!("dropping malformed heartbeat from {from}: {e}");
                        continue;
                    }
                };
                let body = match HeartbeatBody::decode_compressed(&wrapper.compressed_body) {
                    Ok(b) => b,
                    Err(e) => {
                        zg_debug!("dropping malformed heartbeat body from {from}: {e}");
                        continue;
                    }
                };
                if body.peer_id == self.self_id {
                    continue;
                }
                if body.compat_version >> 16 != self.settings.compat_version_word() >> 16 {
                    zg_warn!("dropping heartbeat with incompatible version from {from}");
                    continue;
                }
                if body.system_key != self.settings.system_key() {
                    continue;
                }

                if let Some(send_time) = self.send_history.take_send_time(body.packet_id) {
                    let rtt = compute_rtt_micros(send_time, 0, now);
                    let key = HeartbeatSourceKey { endpoint: from, peer_id: body.peer_id };
                    let source = self.sources.entry(key).or_insert_with(|| {
                        HeartbeatSource::new(now, RTT_AVERAGER_WINDOW, max_rtt)
                    });
                    source.averager.add_sample(rtt);
                    if let Some(avg) = source.averager.average_ignoring_outliers() {
                        if self.membership.current_senior() == Some(body.peer_id) {
                            let offset = wrapper.network_time_at_send as i64 - (now.duration_since(send_time).as_micros() as i64 - avg / 2);
                            self.time_base.set_offset_micros(offset);
                        }
                    }
                }

                let key = HeartbeatSourceKey { endpoint: from, peer_id: body.peer_id };
                let source = self.sources.entry(key).or_insert_with(|| HeartbeatSource::new(now, RTT_AVERAGER_WINDOW, max_rtt));
                source.last_seen = now;
                source.fully_attached = body.fully_attached;
                source.ordered_peers = body.ordered_peers.iter().map(|p| p.peer_id).collect();
                source.uptime_seconds = body.uptime_seconds;
                source.tcp_accept_port = body.tcp_accept_port;
                source.peer_type = config_peer_type(body.peer_type);
                source.attributes = body.attributes;
            }
        }
    }

    fn expire_stale_sources(&mut self) {
        let now = Instant::now();
        let max_missing = self.settings.max_missing_heartbeats();
        let hbps = self.settings.heartbeats_per_second();
        self.sources.retain(|_key, source| !source.is_expired(now, max_missing, hbps));
    }

    fn update_membership(&mut self) -> Vec<MembershipEvent> {
        let mut by_peer: HashMap<PeerId, Vec<&HeartbeatSource>> = HashMap::new();
        let mut endpoints_by_peer: HashMap<PeerId, Vec<std::net::SocketAddr>> = HashMap::new();
        for (key, source) in &self.sources {
            by_peer.entry(key.peer_id).or_default().push(source);
            endpoints_by_peer.entry(key.peer_id).or_default().push(key.endpoint);
        }

        let snapshots: Vec<PeerSnapshot> = by_peer
            .iter()
            .map(|(&peer_id, sources)| {
                let source = sources[0];
                PeerSnapshot {
                    peer_id,
                    peer_type: source.peer_type,
                    tcp_accept_port: source.tcp_accept_port,
                    uptime_seconds: source.uptime_seconds,
                    system_key: self.settings.system_key(),
                    attributes: source.attributes.clone(),
                    sources: endpoints_by_peer.remove(&peer_id).unwrap_or_default(),
                }
            })
            .collect();

        let advertised: HashMap<PeerId, Vec<PeerId>> = by_peer
            .iter()
            .map(|(&peer_id, sources)| (peer_id, sources[0].ordered_peers.clone()))
            .collect();
        let ordering = converge_ordering(&snapshots, &advertised);

        self.membership.update(snapshots, &ordering)
    }

    fn receive_data_messages(&mut self) {
        let mut buf = vec![0u8; 65536];
        for (_endpoint, socket) in &self.data_sockets {
            loop {
                let received = match socket.try_recv(&mut buf) {
                    Ok(Some(v)) => v,
                    Ok(None) => break,
                    Err(_) => break,
                };
                let (n, _from) = received;
                if n < 16 {
                    continue;
                }
                let sender = PeerId::new(
                    u64::from_le_bytes(buf[0..8].try_into().unwrap()),
                    u64::from_le_bytes(buf[8..16].try_into().unwrap()),
                );
                let counter = u64::from_le_bytes(match buf[16..24].try_into() {
                    Ok(b) => b,
                    Err(_) => continue,
                });
                let payload = &buf[24..n];

                if !self.settings.multicast_self_echo() && sender == self.self_id {
                    continue;
                }

                let is_beacon = BeaconRecord::decode(payload).is_ok();
                let tag = MulticastTag { sender, counter };
                if !is_beacon && !self.dedup.observe(tag) {
                    continue;
                }

                if let Ok(beacon) = BeaconRecord::decode(payload) {
                    for (idx, entry) in beacon.entries.iter().enumerate() {
                        if let Some(db) = self.databases.get_mut(idx) {
                            db.on_beacon(beacon.sender, entry.current_state_id, entry.oldest_retained_id);
                        }
                    }
                } else if let Ok(record) = UpdateRecord::decode(payload) {
                    if let Some(db) = self.databases.get_mut(record.database_index as usize) {
                        db.on_multicast_update(record);
                    }
                } else {
                    zg_debug!("dropping unrecognized data-channel message from {sender}");
                }
            }
        }
    }

    /// Accepts new incoming TCP connections (spec.md §4.5: "Incoming
    /// connections are accepted into anonymous sessions that are
    /// re-registered under the remote's `PeerId` once their announce frame
    /// arrives") and promotes any pending session whose announce frame has
    /// arrived.
    fn accept_tcp_connections(&mut self) {
        if let Some(listener) = &self.tcp_listener {
            loop {
                match listener.accept() {
                    Ok((stream, _addr)) => {
                        if stream.set_nonblocking(true).is_ok() {
                            self.pending_sessions.push(stream);
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        log::warn!("tcp accept failed: {e}");
                        break;
                    }
                }
            }
        }

        let mut still_pending = Vec::new();
        for mut stream in self.pending_sessions.drain(..) {
            match tcp::read_frame(&mut stream) {
                Ok(TcpFrame::AnnouncePeerId { peer_id }) => {
                    if let Ok(addr) = stream.peer_addr() {
                        self.peer_tcp_addr.insert(peer_id, (addr.ip(), addr.port()));
                    }
                    self.tcp_sessions.insert(peer_id, stream);
                }
                Ok(other) => {
                    zg_debug!("dropping unexpected first frame on anonymous session: {other:?}");
                }
                Err(crate::error::Error::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    still_pending.push(stream);
                }
                Err(_) => {}
            }
        }
        self.pending_sessions = still_pending;
    }

    fn drain_tcp_sessions(&mut self) {
        let peers: Vec<PeerId> = self.tcp_sessions.keys().copied().collect();
        for peer in peers {
            let Some(stream) = self.tcp_sessions.get_mut(&peer) else { continue };
            stream.set_nonblocking(true).ok();
            match tcp::read_frame(stream) {
                Ok(frame) => self.handle_tcp_frame(peer, frame),
                Err(crate::error::Error::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => {
                    self.tcp_sessions.remove(&peer);
                    for db in &mut self.databases {
                        db.abandon_back_orders_for(peer);
                    }
                }
            }
        }
    }

    fn handle_tcp_frame(&mut self, from: PeerId, frame: TcpFrame) {
        match frame {
            TcpFrame::AnnouncePeerId { .. } => {}
            TcpFrame::RequestBackOrder { database_index, update_id } => {
                if let Some(db) = self.databases.get(database_index as usize) {
                    let action = db.service_back_order(from, update_id);
                    self.perform_action(action);
                }
            }
            TcpFrame::ReplyBackOrder { database_index, update_id, record } => {
                if let Some(db) = self.databases.get_mut(database_index as usize) {
                    db.on_back_order_reply(from, update_id, record);
                }
            }
        }
    }

    fn drive_replication(&mut self) {
        for idx in 0..self.databases.len() {
            let actions = self.databases[idx].rescan();
            for action in actions {
                self.perform_action(action);
            }
        }
    }

    fn perform_action(&mut self, action: DatabaseAction) {
        match action {
            DatabaseAction::MulticastUpdate(record) => self.multicast_update(&record),
            DatabaseAction::RequestBackOrder { target, database_index, update_id } => {
                self.send_tcp(target, TcpFrame::RequestBackOrder { database_index: database_index as u32, update_id });
            }
            DatabaseAction::ReplyBackOrder { target, database_index, update_id, record } => {
                let record = record.map(|r| (*r).clone());
                self.send_tcp(target, TcpFrame::ReplyBackOrder { database_index: database_index as u32, update_id, record });
            }
        }
    }

    fn multicast_update(&mut self, record: &UpdateRecord) {
        let counter = self.outgoing_counter.next_counter();
        let tag = MulticastTag { sender: self.self_id, counter };
        if self.drop_filter.should_drop_multicast(tag) {
            return;
        }
        let mut encoded_record = record.encode();
        if self.drop_filter.should_corrupt_multicast(tag) {
            if let Some(byte) = encoded_record.last_mut() {
                *byte ^= 0x01;
            }
        }
        let mut payload = Vec::new();
        payload.extend_from_slice(&self.self_id.high().to_le_bytes());
        payload.extend_from_slice(&self.self_id.low().to_le_bytes());
        payload.extend_from_slice(&counter.to_le_bytes());
        payload.extend_from_slice(&encoded_record);
        for (_endpoint, socket) in &self.data_sockets {
            let _ = socket.send(&payload);
        }
    }

    fn send_beacon_if_due(&mut self) {
        let period = Duration::from_secs_f64(1.0 / self.settings.beacons_per_second().max(1) as f64);
        let now = Instant::now();
        if now.duration_since(self.last_beacon_send) < period {
            return;
        }
        if self.membership.current_senior() != Some(self.self_id) {
            return;
        }
        self.last_beacon_send = now;

        let entries: Vec<DatabaseStateInfo> = self
            .databases
            .iter()
            .map(|db| {
                let (current, oldest, checksum) = db.beacon_info();
                DatabaseStateInfo { current_state_id: current, oldest_retained_id: oldest, running_checksum: checksum }
            })
            .collect();
        let beacon = BeaconRecord { sender: self.self_id, entries };

        let counter = self.outgoing_counter.next_counter();
        let mut payload = Vec::new();
        payload.extend_from_slice(&self.self_id.high().to_le_bytes());
        payload.extend_from_slice(&self.self_id.low().to_le_bytes());
        payload.extend_from_slice(&counter.to_le_bytes());
        payload.extend_from_slice(&beacon.encode());
        for (_endpoint, socket) in &self.data_sockets {
            let _ = socket.send(&payload);
        }
    }

    fn send_tcp(&mut self, target: PeerId, frame: TcpFrame) {
        if !self.tcp_sessions.contains_key(&target) {
            let Some(peer_info) = self.membership.peer(target) else {
                log::warn!("cannot reach peer {target}: not in membership view");
                return;
            };
            let Some(&endpoint_host) = peer_info.sources.first() else {
                return;
            };
            let mut addr = endpoint_host;
            addr.set_port(peer_info.tcp_accept_port);
            match tcp::connect_and_announce(addr, self.self_id) {
                Ok(stream) => {
                    self.tcp_sessions.insert(target, stream);
                }
                Err(e) => {
                    log::warn!("connect to {target} failed: {e}");
                    return;
                }
            }
        }
        if let Some(stream) = self.tcp_sessions.get_mut(&target) {
            if let Err(e) = tcp::write_frame(stream, &frame) {
                log::warn!("write to {target} failed: {e}");
                self.tcp_sessions.remove(&target);
            }
        }
    }
}

/// Wraps `local_ip_address::list_afinet_netifas` into the plain interface
/// name list [`select_interfaces`] expects.
fn enumerate_interface_names(settings: &PeerSettings) -> Vec<String> {
    if settings.system_is_localhost_only() {
        return vec!["lo".to_string()];
    }
    match local_ip_address::list_afinet_netifas() {
        Ok(ifaces) => {
            let mut names: Vec<String> = ifaces.into_iter().map(|(name, _addr)| name).collect();
            names.sort();
            names.dedup();
            names
        }
        Err(e) => {
            log::warn!("interface enumeration failed, falling back to loopback: {e}");
            vec!["lo".to_string()]
        }
    }
}
