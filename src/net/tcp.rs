// SPDX-License-Identifier: Apache-2.0 OR MIT

//! TCP unicast sessions (spec.md §4.5, §6): one long-lived framed duplex
//! stream per remote peer, used for announce-my-peer-id and back-order
//! repair. Framing is `length: u32 (LE)` + body.

use crate::error::{Error, Result};
use crate::transport::TcpFrame;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use crate::config::TCP_CONNECT_TIMEOUT_MS;

/// Read exactly one length-prefixed frame from `stream`, blocking until it
/// arrives or the stream closes.
pub fn read_frame(stream: &mut TcpStream) -> Result<TcpFrame> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::TransportClosed
        } else {
            Error::Io(e)
        }
    })?;
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).map_err(Error::Io)?;
    TcpFrame::decode_body(&body)
}

/// Write one frame, length-prefixed, to `stream`.
pub fn write_frame(stream: &mut TcpStream, frame: &TcpFrame) -> Result<()> {
    let encoded = frame.encode();
    stream.write_all(&encoded).map_err(Error::Io)?;
    Ok(())
}

/// Connect to a peer's advertised TCP accept port with the 5-second timeout
/// spec.md §4.5 specifies, then immediately announce our PeerId.
pub fn connect_and_announce(addr: std::net::SocketAddr, self_id: crate::peer_id::PeerId) -> Result<TcpStream> {
    crate::zg_trace!("connect_and_announce");
    let mut stream = TcpStream::connect_timeout(&addr, Duration::from_millis(TCP_CONNECT_TIMEOUT_MS)).map_err(Error::Io)?;
    stream.set_nodelay(true).map_err(Error::Io)?;
    write_frame(&mut stream, &TcpFrame::AnnouncePeerId { peer_id: self_id })?;
    Ok(stream)
}

/// Bind the listener peers use to accept incoming unicast sessions.
pub fn bind_listener(port: u16) -> Result<TcpListener> {
    crate::zg_trace!("bind_listener");
    let listener = TcpListener::bind(("::", port)).or_else(|_| TcpListener::bind(("0.0.0.0", port))).map_err(Error::Io)?;
    listener.set_nonblocking(true).map_err(Error::Io)?;
    Ok(listener)
}
