// SPDX-License-Identifier: Apache-2.0 OR MIT

//! # ZG — replicated key/value databases over LAN multicast
//!
//! A set of cooperating processes on a LAN join a named "system", discover
//! each other via link-local multicast heartbeats, elect a senior peer by
//! deterministic seniority rules, and keep one or more replicated databases
//! bit-for-bit identical across every peer. Clients mutate their local
//! peer's copy; mutations are forwarded to the senior, applied there to
//! produce an authoritative update record, and fanned out over multicast
//! (with unicast repair for anything missed) so every junior can replay it.
//!
//! ## Quick start
//!
//! ```no_run
//! use zg::{DatabaseObject, ApplyContext, Peer, PeerSettings};
//!
//! struct Counter(u64);
//!
//! impl DatabaseObject for Counter {
//!     fn reset_to_default(&mut self) { self.0 = 0; }
//!     fn set_from_archive(&mut self, bytes: &[u8]) -> zg::Result<()> {
//!         self.0 = u64::from_le_bytes(bytes.try_into().map_err(|_| zg::Error::Codec("bad archive".into()))?);
//!         Ok(())
//!     }
//!     fn save_to_archive(&self) -> Vec<u8> { self.0.to_le_bytes().to_vec() }
//!     fn running_checksum(&self) -> u32 { self.0 as u32 }
//!     fn recalculate_checksum(&self) -> u32 { self.0 as u32 }
//!     fn apply_senior(&mut self, _ctx: ApplyContext, request: &[u8]) -> Option<Vec<u8>> {
//!         if request == b"inc" { self.0 += 1; }
//!         Some(self.0.to_le_bytes().to_vec())
//!     }
//!     fn apply_junior(&mut self, _ctx: ApplyContext, reply: &[u8]) {
//!         self.0 = u64::from_le_bytes(reply.try_into().unwrap_or_default());
//!     }
//!     fn describe(&self) -> String { format!("Counter({})", self.0) }
//! }
//!
//! fn main() -> zg::Result<()> {
//!     let settings = PeerSettings::builder("my-app-v1", "my-system", 1).build()?;
//!     let mut peer = Peer::start(settings, vec![Box::new(Counter(0))])?;
//!     peer.pulse();
//!     peer.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +-----------------------------------------------------------------+
//! |                       Application Layer                         |
//! |   DatabaseObject impls, driving Peer::pulse() from an event loop |
//! +-----------------------------------------------------------------+
//! |                      ReplicatedDatabase                         |
//! |   per-db update log, senior/junior apply, beacons, back-orders  |
//! +-----------------------------------------------------------------+
//! |           HeartbeatEngine           |       MembershipView      |
//! |   RTT averaging, network time,      |   online/offline/senior-  |
//! |   ordered-peer convergence          |   changed transitions     |
//! +-----------------------------------------------------------------+
//! |                        PacketTransport                          |
//! |   multicast dedup/tunnel | unicast TCP back-order framing       |
//! +-----------------------------------------------------------------+
//! |                     wire codec | interface selection             |
//! +-----------------------------------------------------------------+
//! ```
//!
//! ## Key types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Peer`] | Entry point: owns membership, databases and sockets for one process |
//! | [`PeerSettings`] | Immutable per-peer configuration, built with [`config::PeerSettingsBuilder`] |
//! | [`DatabaseObject`] | Trait the application implements per replicated database |
//! | [`PeerId`] | 128-bit identifier assigned once at process start |
//! | [`Error`] / [`Result`] | Crate-wide error type |
//!
//! ## Modules overview
//!
//! - [`assembly`] - the three-"thread-role" pulse-driven event loop ([`Peer`])
//! - [`database`] - [`DatabaseObject`] contract and the `ReplicatedDatabase` state machine
//! - [`heartbeat`] - heartbeat cadence, RTT averaging, attachment phases
//! - [`membership`] - online/offline/senior-changed diffing and ordered-peer convergence
//! - [`transport`] - multicast dedup tag and TCP back-order framing
//! - [`wire`] - fixed-layout little-endian codecs and checksums
//! - [`time_base`] - monotonic clock plus shared network-time offset
//! - [`interfaces`] - network interface enumeration and multicast endpoint derivation
//! - [`config`] - [`PeerSettings`] and protocol constants
//! - [`error`] - crate-wide [`Error`]/[`Result`]
//! - [`logging`] - compile-time-gated logging facade

// Clippy: No blanket suppressions. Fix issues properly or use inline #[allow] with justification.

/// Peer assembly: the pulse-driven event loop wiring heartbeat, transport
/// and database state machines around real sockets.
pub mod assembly;
/// Global configuration: wire constants and [`PeerSettings`].
pub mod config;
/// Internal runtime helpers (wake notification) shared across modules.
pub mod core;
/// The `DatabaseObject` contract and the `ReplicatedDatabase` state machine.
pub mod database;
/// Crate-wide error type.
pub mod error;
/// `HeartbeatEngine` logic: cadence, receive, RTT averaging, seniority ordering.
pub mod heartbeat;
/// `NetworkInterfaceSelector`: usable-interface enumeration and endpoint derivation.
pub mod interfaces;
/// Compile-time-gated logging facade (zero-cost when the `logging` feature is off).
pub mod logging;
/// `MembershipView`: online/offline/senior-changed diffing and kingmaker ordering.
pub mod membership;
/// Socket-level building blocks (multicast join/send/recv, TCP listener helpers).
pub mod net;
/// [`PeerId`], the 128-bit identifier assigned once at process start.
pub mod peer_id;
/// Monotonic local clock plus the shared network-time offset.
pub mod time_base;
/// `PacketTransport`: multicast dedup tag and TCP back-order framing.
pub mod transport;
/// Wire formats: fixed-layout little-endian codecs, zlib helpers, checksums.
pub mod wire;

pub use assembly::Peer;
pub use config::{MulticastBehavior, PeerSettings, PeerType};
pub use database::{ApplyContext, DatabaseObject};
pub use error::{Error, Result};
pub use membership::MembershipEvent;
pub use peer_id::PeerId;

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
