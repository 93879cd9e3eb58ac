// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Global configuration — Single Source of Truth for ZG's wire constants and
//! per-peer settings.
//!
//! Mirrors the teacher's `config.rs` split into "Level 1 (static)" protocol
//! constants and "Level 2 (dynamic)" runtime configuration, just scoped to
//! spec.md §6 instead of RTPS.

use crate::peer_id::PeerId;
use crate::Error;

// =======================================================================
// Wire constants (spec.md §3, §6)
// =======================================================================

/// `HeartbeatRecord` type tag, ASCII "zghb".
pub const HEARTBEAT_TYPE_TAG: u32 = 0x7A67_6862;
/// `BeaconRecord` wrapper type tag, ASCII "zgbd".
pub const BEACON_TYPE_TAG: u32 = 0x7A67_6264;
/// Outer heartbeat-wrapper magic.
pub const HEARTBEAT_WRAPPER_MAGIC: u16 = 0x6512;
/// TCP unicast frame `what` code for announce-my-peer-id, ASCII "unic".
pub const TCP_ANNOUNCE_PEER_ID: u32 = 0x756E_6963;
/// TCP unicast frame `what` code for a back-order request.
pub const TCP_REQUEST_BACK_ORDER: u32 = 0x756E_6964;
/// TCP unicast frame `what` code for a back-order reply.
pub const TCP_REPLY_BACK_ORDER: u32 = 0x756E_6965;

/// Sentinel `update_id` meaning "request a full-database resend" (spec.md §3).
pub const FULL_RESEND_SENTINEL: u64 = u64::MAX;

/// Default per-system UDP port base (heartbeat = base+1, data = base+2, per
/// spec.md §4.7).
pub const DEFAULT_PORT_BASE: u16 = 41880;

/// Default bound on a single database's resident log payload bytes.
pub const DEFAULT_MAX_LOG_BYTES: u64 = 2 * 1024 * 1024;

/// Default heartbeat send/expect rate.
pub const DEFAULT_HEARTBEATS_PER_SECOND: u32 = 6;

/// Default warm-up interval count before a peer is considered fully attached.
pub const DEFAULT_HEARTBEATS_BEFORE_FULLY_ATTACHED: u32 = 4;

/// Default number of consecutive missed heartbeats before a source expires.
pub const DEFAULT_MAX_MISSING_HEARTBEATS: u32 = 4;

/// Default senior beacon emission rate.
pub const DEFAULT_BEACONS_PER_SECOND: u32 = 4;

/// Bounded ring size for the heartbeat thread's sent-packet-id → send-time table.
pub const HEARTBEAT_SEND_HISTORY: usize = 100;

/// Number of RTT samples retained per `(source, destination)` time averager.
pub const RTT_AVERAGER_WINDOW: usize = 20;

/// Bounded LRU size for multicast-data de-duplication tags.
pub const MULTICAST_DEDUP_LRU_SIZE: usize = 1000;

/// Maximum plausible RTT sample (spec.md §9 Open Question #3); larger or
/// negative samples are discarded rather than skewing the average.
pub const DEFAULT_MAX_PLAUSIBLE_RTT_MICROS: i64 = 2_000_000;

/// Connect timeout for a new unicast TCP session.
pub const TCP_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Peer-attributes buffer must compress to at most this many bytes (u16 length field).
pub const MAX_PEER_ATTRIBUTES_COMPRESSED_LEN: usize = 65535;

/// Which kind of peer a process is: full peers may become senior, junior-only never can.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerType {
    FullPeer,
    JuniorOnly,
}

/// Per-interface transport choice (spec.md §4.5, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MulticastBehavior {
    Auto,
    StandardOnly,
    SimulatedOnly,
}

/// Immutable, builder-constructed per-peer configuration (spec.md §6).
#[derive(Debug, Clone)]
pub struct PeerSettings {
    signature: String,
    system_name: String,
    num_databases: u8,
    system_is_localhost_only: bool,
    peer_type: PeerType,
    heartbeats_per_second: u32,
    heartbeats_before_fully_attached: u32,
    max_missing_heartbeats: u32,
    beacons_per_second: u32,
    multicast_behavior: MulticastBehavior,
    max_update_log_bytes_per_db: u64,
    application_compatibility_version: u16,
    peer_attributes: Vec<u8>,
    port_base: u16,
    multicast_loopback: bool,
    multicast_self_echo: bool,
    max_plausible_rtt_micros: i64,
}

impl PeerSettings {
    /// Start building settings for a system named `system_name` under the
    /// schema `signature`, with `num_databases` `DatabaseObject`s.
    pub fn builder(signature: impl Into<String>, system_name: impl Into<String>, num_databases: u8) -> PeerSettingsBuilder {
        PeerSettingsBuilder {
            signature: signature.into(),
            system_name: system_name.into(),
            num_databases,
            system_is_localhost_only: false,
            peer_type: PeerType::FullPeer,
            heartbeats_per_second: DEFAULT_HEARTBEATS_PER_SECOND,
            heartbeats_before_fully_attached: DEFAULT_HEARTBEATS_BEFORE_FULLY_ATTACHED,
            max_missing_heartbeats: DEFAULT_MAX_MISSING_HEARTBEATS,
            beacons_per_second: DEFAULT_BEACONS_PER_SECOND,
            multicast_behavior: MulticastBehavior::Auto,
            max_update_log_bytes_per_db: DEFAULT_MAX_LOG_BYTES,
            application_compatibility_version: 0,
            peer_attributes: Vec::new(),
            port_base: DEFAULT_PORT_BASE,
            multicast_loopback: false,
            multicast_self_echo: true,
            max_plausible_rtt_micros: DEFAULT_MAX_PLAUSIBLE_RTT_MICROS,
        }
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn system_name(&self) -> &str {
        &self.system_name
    }

    pub fn num_databases(&self) -> u8 {
        self.num_databases
    }

    pub fn system_is_localhost_only(&self) -> bool {
        self.system_is_localhost_only
    }

    pub fn peer_type(&self) -> PeerType {
        self.peer_type
    }

    pub fn heartbeats_per_second(&self) -> u32 {
        self.heartbeats_per_second
    }

    pub fn heartbeats_before_fully_attached(&self) -> u32 {
        self.heartbeats_before_fully_attached
    }

    pub fn max_missing_heartbeats(&self) -> u32 {
        self.max_missing_heartbeats
    }

    pub fn beacons_per_second(&self) -> u32 {
        self.beacons_per_second
    }

    pub fn multicast_behavior(&self) -> MulticastBehavior {
        self.multicast_behavior
    }

    pub fn max_update_log_bytes_per_db(&self) -> u64 {
        self.max_update_log_bytes_per_db
    }

    pub fn application_compatibility_version(&self) -> u16 {
        self.application_compatibility_version
    }

    pub fn peer_attributes(&self) -> &[u8] {
        &self.peer_attributes
    }

    pub fn port_base(&self) -> u16 {
        self.port_base
    }

    pub fn heartbeat_port(&self) -> u16 {
        self.port_base + 1
    }

    pub fn data_port(&self) -> u16 {
        self.port_base + 2
    }

    /// Nominal TCP accept port for unicast sessions (spec.md §4.7), offered
    /// as a documented default alongside the heartbeat and data multicast
    /// ports. `Peer` itself binds its listener ephemerally and advertises
    /// the actual bound port in heartbeats, so peers sharing a `port_base`
    /// on one host never collide over this port.
    pub fn tcp_port(&self) -> u16 {
        self.port_base + 3
    }

    pub fn multicast_loopback(&self) -> bool {
        self.multicast_loopback
    }

    /// Whether a sender processes its own multicast data messages (spec.md
    /// §9 Open Question #2).
    pub fn multicast_self_echo(&self) -> bool {
        self.multicast_self_echo
    }

    pub fn max_plausible_rtt_micros(&self) -> i64 {
        self.max_plausible_rtt_micros
    }

    /// 32-bit heartbeat compatibility-version code: upper 16 bits are this
    /// library's compat version, lower 16 are the application's.
    pub fn compat_version_word(&self) -> u32 {
        (LIBRARY_COMPAT_VERSION as u32) << 16 | self.application_compatibility_version as u32
    }

    /// 64-bit system-key: a hash of signature + system name (spec.md §3).
    pub fn system_key(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.signature.hash(&mut hasher);
        self.system_name.hash(&mut hasher);
        hasher.finish()
    }
}

/// This library's own compatibility version, placed in the upper 16 bits of
/// every heartbeat's compat-version word.
pub const LIBRARY_COMPAT_VERSION: u16 = 1;

/// Builder for [`PeerSettings`].
pub struct PeerSettingsBuilder {
    signature: String,
    system_name: String,
    num_databases: u8,
    system_is_localhost_only: bool,
    peer_type: PeerType,
    heartbeats_per_second: u32,
    heartbeats_before_fully_attached: u32,
    max_missing_heartbeats: u32,
    beacons_per_second: u32,
    multicast_behavior: MulticastBehavior,
    max_update_log_bytes_per_db: u64,
    application_compatibility_version: u16,
    peer_attributes: Vec<u8>,
    port_base: u16,
    multicast_loopback: bool,
    multicast_self_echo: bool,
    max_plausible_rtt_micros: i64,
}

macro_rules! setter {
    ($name:ident, $ty:ty) => {
        pub fn $name(mut self, value: $ty) -> Self {
            self.$name = value;
            self
        }
    };
}

impl PeerSettingsBuilder {
    setter!(system_is_localhost_only, bool);
    setter!(peer_type, PeerType);
    setter!(heartbeats_per_second, u32);
    setter!(heartbeats_before_fully_attached, u32);
    setter!(max_missing_heartbeats, u32);
    setter!(beacons_per_second, u32);
    setter!(multicast_behavior, MulticastBehavior);
    setter!(max_update_log_bytes_per_db, u64);
    setter!(application_compatibility_version, u16);
    setter!(port_base, u16);
    setter!(multicast_loopback, bool);
    setter!(multicast_self_echo, bool);
    setter!(max_plausible_rtt_micros, i64);

    pub fn peer_attributes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.peer_attributes = bytes.into();
        self
    }

    /// Validate and finish building.
    pub fn build(self) -> Result<PeerSettings, Error> {
        if self.heartbeats_per_second == 0 {
            return Err(Error::Config("heartbeats_per_second must be > 0".into()));
        }
        if self.num_databases == 0 {
            return Err(Error::Config("num_databases must be > 0".into()));
        }
        Ok(PeerSettings {
            signature: self.signature,
            system_name: self.system_name,
            num_databases: self.num_databases,
            system_is_localhost_only: self.system_is_localhost_only,
            peer_type: self.peer_type,
            heartbeats_per_second: self.heartbeats_per_second,
            heartbeats_before_fully_attached: self.heartbeats_before_fully_attached,
            max_missing_heartbeats: self.max_missing_heartbeats,
            beacons_per_second: self.beacons_per_second,
            multicast_behavior: self.multicast_behavior,
            max_update_log_bytes_per_db: self.max_update_log_bytes_per_db,
            application_compatibility_version: self.application_compatibility_version,
            peer_attributes: self.peer_attributes,
            port_base: self.port_base,
            multicast_loopback: self.multicast_loopback,
            multicast_self_echo: self.multicast_self_echo,
            max_plausible_rtt_micros: self.max_plausible_rtt_micros,
        })
    }
}

/// Text form of a [`PeerId`], matching spec.md §6: `HHHH...H:LLLL...L`.
pub fn peer_id_text(id: &PeerId) -> String {
    id.to_string()
}
