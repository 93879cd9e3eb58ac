// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Wire formats (spec.md §3, §6): fixed-layout little-endian flattening for
//! `HeartbeatRecord`, `BeaconRecord` and `UpdateRecord`, plus the zlib
//! (de)compression and checksum helpers the heartbeat and transport layers
//! build on.

use crate::config::{BEACON_TYPE_TAG, HEARTBEAT_TYPE_TAG, HEARTBEAT_WRAPPER_MAGIC};
use crate::error::{Error, Result};
use crate::peer_id::PeerId;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// CRC-32 running checksum (IEEE polynomial), used for both database state
/// checksums and wire-body checksums.
pub fn crc32(bytes: &[u8]) -> u32 {
    const POLY: u32 = 0xEDB8_8320;
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in bytes {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (POLY & mask);
        }
    }
    !crc
}

pub fn zlib_compress(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    // Writing to an in-memory Vec cannot fail.
    encoder.write_all(bytes).expect("in-memory zlib write");
    encoder.finish().expect("in-memory zlib finish")
}

pub fn zlib_decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| Error::Codec(format!("zlib inflate failed: {e}")))?;
    Ok(out)
}

/// One `(source-tag, packet-id, dwell-micros)` timing triple within an
/// ordered-peers entry (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingTriple {
    pub source_tag: u16,
    pub packet_id: u32,
    pub dwell_micros: u32,
}

/// One entry of a heartbeat's reported ordered-peer list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedPeerEntry {
    pub peer_id: PeerId,
    pub timings: Vec<TimingTriple>,
}

/// High bit of the peer-type-and-flags word.
const FULLY_ATTACHED_FLAG: u16 = 0x8000;

/// Peer-type enum encoded in the low bits of the flags word (spec.md §3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WirePeerType {
    FullPeer = 0,
    JuniorOnly = 1,
}

impl WirePeerType {
    fn from_bits(bits: u16) -> Result<Self> {
        match bits {
            0 => Ok(WirePeerType::FullPeer),
            1 => Ok(WirePeerType::JuniorOnly),
            other => Err(Error::MalformedPacket(format!("unknown peer type {other}"))),
        }
    }
}

/// Decompressed body of a `HeartbeatRecord` (spec.md §3).
#[derive(Debug, Clone)]
pub struct HeartbeatBody {
    pub packet_id: u32,
    pub compat_version: u32,
    pub system_key: u64,
    pub tcp_accept_port: u16,
    pub uptime_seconds: u32,
    pub peer_id: PeerId,
    pub fully_attached: bool,
    pub peer_type: WirePeerType,
    pub ordered_peers: Vec<OrderedPeerEntry>,
    pub attributes: Vec<u8>,
}

impl HeartbeatBody {
    /// Flatten and zlib-compress into the record body (everything the outer
    /// wrapper's checksum covers).
    pub fn encode_compressed(&self) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&HEARTBEAT_TYPE_TAG.to_le_bytes());
        raw.extend_from_slice(&self.packet_id.to_le_bytes());
        raw.extend_from_slice(&self.compat_version.to_le_bytes());
        raw.extend_from_slice(&self.system_key.to_le_bytes());
        raw.extend_from_slice(&self.tcp_accept_port.to_le_bytes());
        raw.extend_from_slice(&self.uptime_seconds.to_le_bytes());
        raw.extend_from_slice(&self.peer_id.high().to_le_bytes());
        raw.extend_from_slice(&self.peer_id.low().to_le_bytes());

        let flags = (if self.fully_attached { FULLY_ATTACHED_FLAG } else { 0 }) | (self.peer_type as u16);
        raw.extend_from_slice(&flags.to_le_bytes());
        raw.extend_from_slice(&(self.ordered_peers.len() as u16).to_le_bytes());

        let attrs_compressed = zlib_compress(&self.attributes);
        raw.extend_from_slice(&(attrs_compressed.len() as u16).to_le_bytes());
        raw.extend_from_slice(&0u16.to_le_bytes()); // reserved

        for entry in &self.ordered_peers {
            raw.extend_from_slice(&entry.peer_id.high().to_le_bytes());
            raw.extend_from_slice(&entry.peer_id.low().to_le_bytes());
            raw.extend_from_slice(&(entry.timings.len() as u16).to_le_bytes());
            for t in &entry.timings {
                raw.extend_from_slice(&t.source_tag.to_le_bytes());
                raw.extend_from_slice(&t.packet_id.to_le_bytes());
                raw.extend_from_slice(&t.dwell_micros.to_le_bytes());
            }
        }
        raw.extend_from_slice(&attrs_compressed);

        zlib_compress(&raw)
    }

    pub fn decode_compressed(compressed: &[u8]) -> Result<Self> {
        let raw = zlib_decompress(compressed)?;
        let mut r = Reader::new(&raw);

        let type_tag = r.u32()?;
        if type_tag != HEARTBEAT_TYPE_TAG {
            return Err(Error::MalformedPacket(format!("bad heartbeat type tag {type_tag:#010x}")));
        }
        let packet_id = r.u32()?;
        let compat_version = r.u32()?;
        let system_key = r.u64()?;
        let tcp_accept_port = r.u16()?;
        let uptime_seconds = r.u32()?;
        let peer_id = PeerId::new(r.u64()?, r.u64()?);
        let flags = r.u16()?;
        let fully_attached = flags & FULLY_ATTACHED_FLAG != 0;
        let peer_type = WirePeerType::from_bits(flags & 0x7FFF)?;
        let peer_count = r.u16()? as usize;
        let attrs_len = r.u16()? as usize;
        let _reserved = r.u16()?;

        let mut ordered_peers = Vec::with_capacity(peer_count);
        for _ in 0..peer_count {
            let peer_id = PeerId::new(r.u64()?, r.u64()?);
            let timing_count = r.u16()? as usize;
            let mut timings = Vec::with_capacity(timing_count);
            for _ in 0..timing_count {
                timings.push(TimingTriple {
                    source_tag: r.u16()?,
                    packet_id: r.u32()?,
                    dwell_micros: r.u32()?,
                });
            }
            ordered_peers.push(OrderedPeerEntry { peer_id, timings });
        }

        let attrs_compressed = r.bytes(attrs_len)?;
        let attributes = zlib_decompress(attrs_compressed)?;

        Ok(HeartbeatBody {
            packet_id,
            compat_version,
            system_key,
            tcp_accept_port,
            uptime_seconds,
            peer_id,
            fully_attached,
            peer_type,
            ordered_peers,
            attributes,
        })
    }
}

/// The outer wrapper around a compressed [`HeartbeatBody`] (spec.md §3): a
/// magic, per-destination source tag, network-time-at-send (kept outside the
/// compressed body for timing accuracy), and a checksum over the compressed
/// body.
#[derive(Debug, Clone)]
pub struct HeartbeatWrapper {
    pub source_tag: u16,
    pub network_time_at_send: u64,
    pub compressed_body: Vec<u8>,
}

impl HeartbeatWrapper {
    pub fn encode(&self) -> Vec<u8> {
        let checksum = crc32(&self.compressed_body);
        let mut out = Vec::with_capacity(2 + 2 + 8 + 4 + self.compressed_body.len());
        out.extend_from_slice(&HEARTBEAT_WRAPPER_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.source_tag.to_le_bytes());
        out.extend_from_slice(&self.network_time_at_send.to_le_bytes());
        out.extend_from_slice(&checksum.to_le_bytes());
        out.extend_from_slice(&self.compressed_body);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let magic = r.u16()?;
        if magic != HEARTBEAT_WRAPPER_MAGIC {
            return Err(Error::MalformedPacket(format!("bad wrapper magic {magic:#06x}")));
        }
        let source_tag = r.u16()?;
        let network_time_at_send = r.u64()?;
        let checksum = r.u32()?;
        let compressed_body = r.remaining().to_vec();
        let actual = crc32(&compressed_body);
        if actual != checksum {
            return Err(Error::ChecksumMismatch { expected: checksum, actual });
        }
        Ok(HeartbeatWrapper { source_tag, network_time_at_send, compressed_body })
    }
}

/// One `DatabaseStateInfo` entry of a [`BeaconRecord`] (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseStateInfo {
    pub current_state_id: u64,
    pub oldest_retained_id: u64,
    pub running_checksum: u32,
}

/// Senior-only reconciliation broadcast (spec.md §3).
#[derive(Debug, Clone)]
pub struct BeaconRecord {
    pub sender: PeerId,
    pub entries: Vec<DatabaseStateInfo>,
}

impl BeaconRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&BEACON_TYPE_TAG.to_le_bytes());
        raw.extend_from_slice(&self.sender.high().to_le_bytes());
        raw.extend_from_slice(&self.sender.low().to_le_bytes());
        raw.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for e in &self.entries {
            raw.extend_from_slice(&e.current_state_id.to_le_bytes());
            raw.extend_from_slice(&e.oldest_retained_id.to_le_bytes());
            raw.extend_from_slice(&e.running_checksum.to_le_bytes());
        }
        raw
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let tag = r.u32()?;
        if tag != BEACON_TYPE_TAG {
            return Err(Error::MalformedPacket(format!("bad beacon type tag {tag:#010x}")));
        }
        let sender = PeerId::new(r.u64()?, r.u64()?);
        let count = r.u32()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(DatabaseStateInfo {
                current_state_id: r.u64()?,
                oldest_retained_id: r.u64()?,
                running_checksum: r.u32()?,
            });
        }
        Ok(BeaconRecord { sender, entries })
    }
}

/// Kind of a logged [`UpdateRecord`] (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Noop = 0,
    Reset = 1,
    Replace = 2,
    Update = 3,
}

impl UpdateKind {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            0 => Ok(UpdateKind::Noop),
            1 => Ok(UpdateKind::Reset),
            2 => Ok(UpdateKind::Replace),
            3 => Ok(UpdateKind::Update),
            other => Err(Error::MalformedPacket(format!("unknown update kind {other}"))),
        }
    }
}

/// One replicated log entry (spec.md §3).
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRecord {
    pub kind: UpdateKind,
    pub database_index: u16,
    pub senior_elapsed_millis: u16,
    pub senior_start_network_time: u64,
    pub source: PeerId,
    pub update_id: u64,
    pub pre_update_checksum: u32,
    pub post_update_checksum: u32,
    pub self_checksum: u32,
    pub payload: Vec<u8>,
}

impl UpdateRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(48 + self.payload.len());
        raw.push(self.kind as u8);
        raw.extend_from_slice(&self.database_index.to_le_bytes());
        raw.extend_from_slice(&self.senior_elapsed_millis.to_le_bytes());
        raw.extend_from_slice(&self.senior_start_network_time.to_le_bytes());
        raw.extend_from_slice(&self.source.high().to_le_bytes());
        raw.extend_from_slice(&self.source.low().to_le_bytes());
        raw.extend_from_slice(&self.update_id.to_le_bytes());
        raw.extend_from_slice(&self.pre_update_checksum.to_le_bytes());
        raw.extend_from_slice(&self.post_update_checksum.to_le_bytes());
        raw.extend_from_slice(&self.self_checksum.to_le_bytes());
        raw.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        raw.extend_from_slice(&self.payload);
        raw
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let kind = UpdateKind::from_u8(r.u8()?)?;
        let database_index = r.u16()?;
        let senior_elapsed_millis = r.u16()?;
        let senior_start_network_time = r.u64()?;
        let source = PeerId::new(r.u64()?, r.u64()?);
        let update_id = r.u64()?;
        let pre_update_checksum = r.u32()?;
        let post_update_checksum = r.u32()?;
        let self_checksum = r.u32()?;
        let payload_len = r.u32()? as usize;
        let payload = r.bytes(payload_len)?.to_vec();
        Ok(UpdateRecord {
            kind,
            database_index,
            senior_elapsed_millis,
            senior_start_network_time,
            source,
            update_id,
            pre_update_checksum,
            post_update_checksum,
            self_checksum,
            payload,
        })
    }
}

/// Minimal cursor over a byte slice used by the decoders above.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(Error::MalformedPacket("truncated record".into()));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    fn remaining(&self) -> &'a [u8] {
        &self.bytes[self.pos..]
    }
}
