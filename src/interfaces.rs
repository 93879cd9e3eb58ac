// SPDX-License-Identifier: Apache-2.0 OR MIT

//! `NetworkInterfaceSelector` (spec.md §4.7): enumerates usable local
//! interfaces and derives the per-system link-local multicast endpoints.

use crate::config::PeerSettings;
use std::net::Ipv6Addr;

/// Whether an interface should use a real multicast socket or the
/// Wi-Fi-accommodating simulated-multicast building block (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Standard,
    Simulated,
}

/// One usable local interface and the endpoints derived for it.
#[derive(Debug, Clone)]
pub struct InterfaceEndpoint {
    pub name: String,
    pub source_tag: u16,
    pub is_wifi: bool,
    pub mode: TransportMode,
    pub multicast_group: Ipv6Addr,
    pub heartbeat_port: u16,
    pub data_port: u16,
}

/// Derives the `ff02::<system-hash-salted>` link-local multicast group for
/// this system, mixing the signature hash, system-name hash, and UDP port so
/// distinct ZG systems on one LAN do not collide (spec.md §4.7).
pub fn derive_multicast_group(settings: &PeerSettings, port: u16) -> Ipv6Addr {
    let key = settings.system_key() ^ ((port as u64) << 48);
    let low64 = key.to_be_bytes();
    Ipv6Addr::new(
        0xff02,
        0,
        0,
        0,
        u16::from_be_bytes([low64[0], low64[1]]),
        u16::from_be_bytes([low64[2], low64[3]]),
        u16::from_be_bytes([low64[4], low64[5]]),
        u16::from_be_bytes([low64[6], low64[7]]).max(1),
    )
}

/// Best-effort classification of whether an interface name looks like a
/// Wi-Fi adapter, used to pick a transport mode default under `Auto`.
pub fn looks_like_wifi(interface_name: &str) -> bool {
    let lower = interface_name.to_ascii_lowercase();
    lower.starts_with("wl") || lower.contains("wifi") || lower.contains("wlan") || lower.contains("airport")
}

/// Pick the transport mode for one interface under the configured
/// `multicast_behavior` (spec.md §4.5, §6).
pub fn choose_mode(behavior: crate::config::MulticastBehavior, is_wifi: bool) -> TransportMode {
    use crate::config::MulticastBehavior::*;
    match behavior {
        StandardOnly => TransportMode::Standard,
        SimulatedOnly => TransportMode::Simulated,
        Auto if is_wifi => TransportMode::Simulated,
        Auto => TransportMode::Standard,
    }
}

/// Enumerate usable local interfaces, sorted by name for reproducibility,
/// and build the endpoints for each. `system_is_localhost_only` restricts
/// discovery to the loopback interface only.
pub fn select_interfaces(settings: &PeerSettings, raw_names: &[String]) -> Vec<InterfaceEndpoint> {
    let mut names: Vec<&String> = if settings.system_is_localhost_only() {
        raw_names.iter().filter(|n| n.as_str() == "lo" || n.as_str() == "lo0").collect()
    } else {
        raw_names.iter().collect()
    };
    names.sort();

    names
        .into_iter()
        .enumerate()
        .map(|(idx, name)| {
            let is_wifi = looks_like_wifi(name);
            InterfaceEndpoint {
                name: name.clone(),
                source_tag: idx as u16,
                is_wifi,
                mode: choose_mode(settings.multicast_behavior(), is_wifi),
                multicast_group: derive_multicast_group(settings, settings.heartbeat_port()),
                heartbeat_port: settings.heartbeat_port(),
                data_port: settings.data_port(),
            }
        })
        .collect()
}
