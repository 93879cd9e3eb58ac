// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Low-level primitives shared across the replication stack: the
//! pulse-driven wait/wake mechanism ([`rt`]).

pub mod rt;
