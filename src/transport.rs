// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `PacketTransport` (spec.md §4.5, §6): the multicast data channel's
//! message tag and de-duplication, plus the TCP unicast framing used for
//! announce / back-order request / back-order reply.
//!
//! Socket ownership (the dedicated I/O thread, per-interface sockets, TCP
//! session table) lives in [`crate::assembly`]; this module is the pure
//! wire-level and bookkeeping logic so it can be unit-tested without a
//! network, the same split applied to [`crate::heartbeat`].

use crate::config::{TCP_ANNOUNCE_PEER_ID, TCP_REPLY_BACK_ORDER, TCP_REQUEST_BACK_ORDER};
use crate::error::{Error, Result};
use crate::peer_id::PeerId;
use crate::wire::UpdateRecord;
use lru::LruCache;
use std::num::NonZeroUsize;

/// `(sender_peer_id, per-sender-monotonic-counter)` (spec.md §4.5). Beacons
/// are exempted from de-duplication because their counter is not monotonic
/// per message; callers check [`is_beacon`] before consulting the dedup set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MulticastTag {
    pub sender: PeerId,
    pub counter: u64,
}

/// Bounded LRU of recently-seen multicast tags (spec.md §4.5: "a bounded LRU
/// of the last ~1000 tags").
pub struct MulticastDedup {
    seen: LruCache<MulticastTag, ()>,
}

impl MulticastDedup {
    pub fn new(capacity: usize) -> Self {
        MulticastDedup { seen: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap()) }
    }

    /// Returns `true` if `tag` has not been seen before (and records it as
    /// seen); `false` for a re-delivery, which the caller should treat as a
    /// no-op (spec.md §8 round-trip law: "Re-delivering a multicast datagram
    /// already seen (same tag) is a no-op").
    pub fn observe(&mut self, tag: MulticastTag) -> bool {
        if self.seen.contains(&tag) {
            false
        } else {
            self.seen.put(tag, ());
            true
        }
    }
}

/// Per-sender monotonic counter allocator for outgoing multicast messages.
pub struct OutgoingCounter {
    next: u64,
}

impl OutgoingCounter {
    pub fn new() -> Self {
        OutgoingCounter { next: 1 }
    }

    pub fn next_counter(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }
}

impl Default for OutgoingCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// One TCP unicast frame body (spec.md §6). Framing on the wire is
/// `length: u32 (LE)` followed by `length` bytes of this encoded body.
#[derive(Debug, Clone, PartialEq)]
pub enum TcpFrame {
    AnnouncePeerId { peer_id: PeerId },
    RequestBackOrder { database_index: u32, update_id: u64 },
    ReplyBackOrder { database_index: u32, update_id: u64, record: Option<UpdateRecord> },
}

impl TcpFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            TcpFrame::AnnouncePeerId { peer_id } => {
                body.extend_from_slice(&TCP_ANNOUNCE_PEER_ID.to_le_bytes());
                body.extend_from_slice(&peer_id.high().to_le_bytes());
                body.extend_from_slice(&peer_id.low().to_le_bytes());
            }
            TcpFrame::RequestBackOrder { database_index, update_id } => {
                body.extend_from_slice(&TCP_REQUEST_BACK_ORDER.to_le_bytes());
                body.extend_from_slice(&database_index.to_le_bytes());
                body.extend_from_slice(&update_id.to_le_bytes());
            }
            TcpFrame::ReplyBackOrder { database_index, update_id, record } => {
                body.extend_from_slice(&TCP_REPLY_BACK_ORDER.to_le_bytes());
                body.extend_from_slice(&database_index.to_le_bytes());
                body.extend_from_slice(&update_id.to_le_bytes());
                match record {
                    None => body.push(0),
                    Some(r) => {
                        body.push(1);
                        let encoded = r.encode();
                        body.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
                        body.extend_from_slice(&encoded);
                    }
                }
            }
        }

        let mut framed = Vec::with_capacity(4 + body.len());
        framed.extend_from_slice(&(body.len() as u32).to_le_bytes());
        framed.extend_from_slice(&body);
        framed
    }

    /// Decode one frame body (without the length prefix, which the byte
    /// stream reader strips before handing bytes here).
    pub fn decode_body(body: &[u8]) -> Result<Self> {
        if body.len() < 4 {
            return Err(Error::MalformedPacket("frame too short for what-tag".into()));
        }
        let what = u32::from_le_bytes(body[0..4].try_into().unwrap());
        let rest = &body[4..];
        match what {
            TCP_ANNOUNCE_PEER_ID => {
                if rest.len() != 16 {
                    return Err(Error::MalformedPacket("bad announce frame length".into()));
                }
                let high = u64::from_le_bytes(rest[0..8].try_into().unwrap());
                let low = u64::from_le_bytes(rest[8..16].try_into().unwrap());
                Ok(TcpFrame::AnnouncePeerId { peer_id: PeerId::new(high, low) })
            }
            TCP_REQUEST_BACK_ORDER => {
                if rest.len() != 12 {
                    return Err(Error::MalformedPacket("bad request-back-order frame length".into()));
                }
                let database_index = u32::from_le_bytes(rest[0..4].try_into().unwrap());
                let update_id = u64::from_le_bytes(rest[4..12].try_into().unwrap());
                Ok(TcpFrame::RequestBackOrder { database_index, update_id })
            }
            TCP_REPLY_BACK_ORDER => {
                if rest.len() < 13 {
                    return Err(Error::MalformedPacket("bad reply-back-order frame length".into()));
                }
                let database_index = u32::from_le_bytes(rest[0..4].try_into().unwrap());
                let update_id = u64::from_le_bytes(rest[4..12].try_into().unwrap());
                let present = rest[12];
                let record = if present == 0 {
                    None
                } else {
                    if rest.len() < 17 {
                        return Err(Error::MalformedPacket("truncated reply-back-order record".into()));
                    }
                    let record_len = u32::from_le_bytes(rest[13..17].try_into().unwrap()) as usize;
                    let record_bytes = rest.get(17..17 + record_len).ok_or_else(|| Error::MalformedPacket("truncated reply-back-order record body".into()))?;
                    Some(UpdateRecord::decode(record_bytes)?)
                };
                Ok(TcpFrame::ReplyBackOrder { database_index, update_id, record })
            }
            other => Err(Error::MalformedPacket(format!("unknown frame what-tag {other:#010x}"))),
        }
    }
}

/// Test-injection hook for simulating lossy links, grounded on the same
/// pattern a transport-level packet filter serves in the teacher's stack:
/// decide per-packet whether to deliver it, without touching real sockets.
/// Used by the back-order-repair and checksum-mismatch-recovery test
/// scenarios (spec.md §8 #3, #6).
pub trait DropFilter: Send + Sync {
    /// Return `true` to drop (not deliver) this outgoing multicast message.
    fn should_drop_multicast(&self, tag: MulticastTag) -> bool;

    /// Return `true` to flip a bit in this outgoing `UpdateRecord`'s payload
    /// before it's sent, simulating wire corruption (spec.md §8 scenario 6).
    /// Default: never corrupt.
    fn should_corrupt_multicast(&self, _tag: MulticastTag) -> bool {
        false
    }
}

/// A filter that never drops or corrupts anything.
pub struct NoopFilter;

impl DropFilter for NoopFilter {
    fn should_drop_multicast(&self, _tag: MulticastTag) -> bool {
        false
    }
}

/// Flips the low bit of the first byte of the `count`-th `UpdateRecord`
/// payload that passes through (spec.md §8 scenario 6: "inject a one-bit
/// flip into a single `UpdateRecord` on the wire").
pub struct CorruptNth {
    remaining_until_target: std::sync::atomic::AtomicI64,
}

impl CorruptNth {
    /// `skip` records pass through untouched; the next one is corrupted.
    pub fn new(skip: u64) -> Self {
        CorruptNth { remaining_until_target: std::sync::atomic::AtomicI64::new(skip as i64) }
    }
}

impl DropFilter for CorruptNth {
    fn should_drop_multicast(&self, _tag: MulticastTag) -> bool {
        false
    }

    fn should_corrupt_multicast(&self, _tag: MulticastTag) -> bool {
        use std::sync::atomic::Ordering;
        self.remaining_until_target.fetch_sub(1, Ordering::Relaxed) == 0
    }
}

/// Drops the first `count` multicast messages from a given sender, then
/// passes everything through — used to simulate "10 consecutive dropped
/// packets" (spec.md §8 scenario 3).
pub struct DropFirstN {
    remaining: std::sync::atomic::AtomicU64,
}

impl DropFirstN {
    pub fn new(count: u64) -> Self {
        DropFirstN { remaining: std::sync::atomic::AtomicU64::new(count) }
    }
}

impl DropFilter for DropFirstN {
    fn should_drop_multicast(&self, _tag: MulticastTag) -> bool {
        use std::sync::atomic::Ordering;
        let mut current = self.remaining.load(Ordering::Relaxed);
        while current > 0 {
            match self.remaining.compare_exchange_weak(current, current - 1, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }
}
