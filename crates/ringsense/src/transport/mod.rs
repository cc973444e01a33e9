// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringsense contributors

//! Point-to-point transport for ring messages.
//!
//! The protocol only assumes best-effort delivery: datagrams may be dropped,
//! reordered or delayed, and timeouts are the sole failure detector. The
//! production implementation is [`UdpTransport`]; [`MemHub`] provides an
//! in-process mesh with scriptable faults for integration tests.

use crate::node::Result;
use crate::protocol::Message;
use std::net::SocketAddr;

mod mem;
mod udp;

pub use mem::{MemHub, MemTransport};
pub use udp::{spawn_udp_receiver, UdpTransport};

/// Best-effort message delivery to a ring peer.
///
/// `send` returning `Ok` means the datagram left this node, not that it
/// arrived. A deterministic `Err` (unreachable socket, refused port) is worth
/// reporting to the membership manager without waiting for a lease timeout.
pub trait Transport: Send + Sync {
    /// Send one message to `to`. Fire-and-forget.
    fn send(&self, to: SocketAddr, msg: &Message) -> Result<()>;

    /// Address remote peers reach this node at.
    fn local_addr(&self) -> SocketAddr;
}
