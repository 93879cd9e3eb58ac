// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Socket-owning layer: real multicast UDP and unicast TCP backing the
//! protocol logic in [`crate::heartbeat`], [`crate::transport`] and
//! [`crate::database`].

pub mod multicast;
pub mod tcp;
