// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Crate-wide error type.
//!
//! One flat enum rather than per-module error types, matching the pattern of
//! the `dds::Error` this crate is descended from: manual `Display` +
//! `std::error::Error` impls, no `thiserror` dependency. Most of the
//! variants below name the failure kinds spec.md §7 enumerates; the
//! `Io`/`Config`/`Codec`/`ChannelClosed` variants cover the infrastructure
//! failures a real crate has to surface that the protocol-level spec doesn't
//! name.

use std::fmt;

/// Errors produced by this crate's public API.
#[derive(Debug)]
pub enum Error {
    /// A received packet failed magic/checksum/structural validation.
    MalformedPacket(String),
    /// A running checksum did not match the expected pre/post value.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// Peer's compatibility version does not match ours.
    VersionMismatch { ours: u32, theirs: u32 },
    /// A gap was found in a database's update log.
    LogGap { expected: u64, found: u64 },
    /// A request was made with no known senior peer.
    UnknownSenior,
    /// The application's `DatabaseObject` refused to apply a request.
    DatabaseRefused,
    /// The transport session to a peer was closed.
    TransportClosed,
    /// A resource budget (log bytes, back-order table, etc.) was exhausted.
    OutOfMemory,
    /// A configured network interface is no longer usable.
    InterfaceUnavailable(String),
    /// Invalid configuration value.
    Config(String),
    /// Zlib/deflate compression or inflate failure, or malformed flattened record.
    Codec(String),
    /// An inter-thread channel was disconnected.
    ChannelClosed,
    /// Underlying I/O failure.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MalformedPacket(msg) => write!(f, "malformed packet: {msg}"),
            Error::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected:#010x}, got {actual:#010x}")
            }
            Error::VersionMismatch { ours, theirs } => {
                write!(f, "compatibility version mismatch: ours={ours:#010x} theirs={theirs:#010x}")
            }
            Error::LogGap { expected, found } => {
                write!(f, "log gap: expected update id {expected}, found {found}")
            }
            Error::UnknownSenior => write!(f, "no senior peer is currently known"),
            Error::DatabaseRefused => write!(f, "database object refused the request"),
            Error::TransportClosed => write!(f, "transport session closed"),
            Error::OutOfMemory => write!(f, "resource budget exhausted"),
            Error::InterfaceUnavailable(name) => write!(f, "network interface unavailable: {name}"),
            Error::Config(msg) => write!(f, "invalid configuration: {msg}"),
            Error::Codec(msg) => write!(f, "codec error: {msg}"),
            Error::ChannelClosed => write!(f, "internal channel closed"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type used throughout the crate's public API.
pub type Result<T> = core::result::Result<T, Error>;
