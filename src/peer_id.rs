// SPDX-License-Identifier: Apache-2.0 OR MIT

//! [`PeerId`] — the 128-bit identifier every peer is assigned once at
//! startup (spec.md §3).

use std::fmt;
use std::process;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Immutable 128-bit opaque peer identifier.
///
/// Ordered unsigned-lexicographically by `(high, low)`; the all-zero value
/// means "invalid/absent" (see [`PeerId::is_valid`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId {
    high: u64,
    low: u64,
}

impl PeerId {
    /// The invalid/absent peer id (all-zero).
    pub const INVALID: PeerId = PeerId { high: 0, low: 0 };

    /// Construct a `PeerId` from explicit high/low 64-bit halves.
    pub const fn new(high: u64, low: u64) -> Self {
        PeerId { high, low }
    }

    /// `true` unless this is [`PeerId::INVALID`].
    pub const fn is_valid(&self) -> bool {
        self.high != 0 || self.low != 0
    }

    pub const fn high(&self) -> u64 {
        self.high
    }

    pub const fn low(&self) -> u64 {
        self.low
    }

    /// Generate a process-unique `PeerId`, mixing a MAC-derived seed, the OS
    /// process id, and a per-process monotonic counter, as spec.md §3
    /// recommends.
    pub fn generate() -> Self {
        static COUNTER: AtomicU32 = AtomicU32::new(0);

        let mac_seed = mac_address_seed();
        let pid = process::id() as u64;
        let seq = COUNTER.fetch_add(1, Ordering::Relaxed) as u64;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);

        let high = mac_seed ^ nanos.rotate_left(17);
        let low = (pid << 32) | seq | (nanos & 0xFFFF_0000);
        let candidate = PeerId { high, low };
        if candidate.is_valid() {
            candidate
        } else {
            // astronomically unlikely; nudge off the invalid sentinel.
            PeerId { high: 1, low }
        }
    }
}

/// Best-effort seed derived from the machine's primary network address,
/// falling back to 0 if none can be determined (the invalid-collision risk
/// is covered by mixing in pid and a timestamp in [`PeerId::generate`]).
/// The original `ZGPeerID` construction mixes in a MAC address for the same
/// reason; a local IP is the portable equivalent available to this crate's
/// dependency stack.
fn mac_address_seed() -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    match local_ip_address::local_ip() {
        Ok(ip) => ip.hash(&mut hasher),
        Err(_) => "no-local-ip".hash(&mut hasher),
    }
    hasher.finish()
}

impl PartialOrd for PeerId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.high, self.low).cmp(&(other.high, other.low))
    }
}

impl Default for PeerId {
    fn default() -> Self {
        PeerId::INVALID
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}:{:016X}", self.high, self.low)
    }
}

/// Error returned when parsing a [`PeerId`] text form fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsePeerIdError;

impl fmt::Display for ParsePeerIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid peer id text form, expected HHHHHHHHHHHHHHHH:LLLLLLLLLLLLLLLL")
    }
}

impl std::error::Error for ParsePeerIdError {}

impl FromStr for PeerId {
    type Err = ParsePeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (high_str, low_str) = s.split_once(':').ok_or(ParsePeerIdError)?;
        if high_str.len() != 16 || low_str.len() != 16 {
            return Err(ParsePeerIdError);
        }
        let high = u64::from_str_radix(high_str, 16).map_err(|_| ParsePeerIdError)?;
        let low = u64::from_str_radix(low_str, 16).map_err(|_| ParsePeerIdError)?;
        Ok(PeerId { high, low })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_is_all_zero() {
        assert!(!PeerId::INVALID.is_valid());
        assert!(PeerId::new(1, 0).is_valid());
    }

    #[test]
    fn ordering_is_high_then_low() {
        let a = PeerId::new(1, 5);
        let b = PeerId::new(1, 9);
        let c = PeerId::new(2, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn text_round_trips() {
        let id = PeerId::new(0x0123_4567_89AB_CDEF, 0xFEDC_BA98_7654_3210);
        let text = id.to_string();
        assert_eq!(text, "0123456789ABCDEF:FEDCBA9876543210");
        assert_eq!(text.parse::<PeerId>().unwrap(), id);
    }

    #[test]
    fn generated_ids_are_distinct_and_valid() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert!(a.is_valid());
        assert!(b.is_valid());
        assert_ne!(a, b);
    }
}
