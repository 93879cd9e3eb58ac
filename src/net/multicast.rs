// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Real multicast UDP sockets backing the heartbeat and data channels
//! (spec.md §4.5, §4.7): one socket per usable interface, joined to the
//! system's derived `ff02::` group, with loopback enabled so a
//! `system_is_localhost_only` configuration and single-host test scenarios
//! both work without a physical network.

use crate::error::{Error, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6, UdpSocket};

/// A joined multicast UDP socket bound to one local interface.
pub struct MulticastSocket {
    socket: UdpSocket,
    group: Ipv6Addr,
    port: u16,
    scope_id: u32,
}

impl MulticastSocket {
    /// Create and join `group` on `port`, scoped to interface `scope_id`
    /// (0 means "default route", used for the loopback-only / single-host
    /// case).
    pub fn join(group: Ipv6Addr, port: u16, scope_id: u32) -> Result<Self> {
        crate::zg_trace!("MulticastSocket::join");
        let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).map_err(Error::Io)?;
        socket.set_reuse_address(true).map_err(Error::Io)?;
        #[cfg(unix)]
        socket.set_reuse_port(true).map_err(Error::Io)?;
        socket.set_only_v6(true).map_err(Error::Io)?;
        socket.set_multicast_loop_v6(true).map_err(Error::Io)?;

        let bind_addr: SocketAddr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, scope_id).into();
        socket.bind(&bind_addr.into()).map_err(Error::Io)?;
        socket.join_multicast_v6(&group, scope_id).map_err(Error::Io)?;

        let socket: UdpSocket = socket.into();
        socket.set_nonblocking(true).map_err(Error::Io)?;

        Ok(MulticastSocket { socket, group, port, scope_id })
    }

    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        let dest: SocketAddr = SocketAddrV6::new(self.group, self.port, 0, self.scope_id).into();
        self.socket.send_to(bytes, dest).map_err(Error::Io)?;
        Ok(())
    }

    /// Non-blocking receive; `Ok(None)` means "nothing available right now".
    pub fn try_recv(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        match self.socket.recv_from(buf) {
            Ok((n, from)) => Ok(Some((n, from))),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Underlying fd/handle for registering with a poll/waitset driver.
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }
}

/// Resolve an interface name to its OS scope id, used to join a link-local
/// multicast group on a specific interface.
#[cfg(unix)]
pub fn interface_scope_id(name: &str) -> Option<u32> {
    let c_name = std::ffi::CString::new(name).ok()?;
    // SAFETY: c_name is a valid NUL-terminated string for the lifetime of this call.
    let idx = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if idx == 0 {
        None
    } else {
        Some(idx)
    }
}

#[cfg(not(unix))]
pub fn interface_scope_id(_name: &str) -> Option<u32> {
    None
}
