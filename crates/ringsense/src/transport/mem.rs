// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringsense contributors

//! In-process transport mesh with scriptable faults.
//!
//! Integration tests use this to run whole rings inside one process and to
//! script crashes (`kill`: silent drop, UDP-like) and deterministic send
//! failures (`refuse`: `send` returns an error).

use super::Transport;
use crate::node::{Error, NodeEvent, Result};
use crate::protocol::Message;
use crossbeam::channel::Sender;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

struct HubInner {
    peers: DashMap<SocketAddr, Sender<NodeEvent>>,
    /// Crashed addresses: traffic to and from them vanishes silently.
    dead: Mutex<HashSet<SocketAddr>>,
    /// Refusing addresses: sends to them fail deterministically.
    refusing: Mutex<HashSet<SocketAddr>>,
}

/// Registry wiring [`MemTransport`] endpoints together.
#[derive(Clone)]
pub struct MemHub {
    inner: Arc<HubInner>,
}

impl MemHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                peers: DashMap::new(),
                dead: Mutex::new(HashSet::new()),
                refusing: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Attach an endpoint: messages sent to `addr` land on `events`.
    pub fn attach(&self, addr: SocketAddr, events: Sender<NodeEvent>) -> MemTransport {
        self.register(addr, events);
        self.transport_for(addr)
    }

    /// Send-only endpoint; pair with [`MemHub::register`] once the receiving
    /// channel exists (a node's event channel is created by its builder).
    pub fn transport_for(&self, addr: SocketAddr) -> MemTransport {
        MemTransport {
            hub: Arc::clone(&self.inner),
            local: addr,
        }
    }

    /// Route messages addressed to `addr` into `events`.
    pub fn register(&self, addr: SocketAddr, events: Sender<NodeEvent>) {
        self.inner.peers.insert(addr, events);
    }

    /// Simulate a crash: all traffic to and from `addr` is dropped silently.
    pub fn kill(&self, addr: SocketAddr) {
        self.inner.dead.lock().insert(addr);
    }

    /// Undo [`MemHub::kill`].
    pub fn revive(&self, addr: SocketAddr) {
        self.inner.dead.lock().remove(&addr);
    }

    /// Make sends to `addr` fail with a deterministic error.
    pub fn refuse(&self, addr: SocketAddr) {
        self.inner.refusing.lock().insert(addr);
    }

    /// Undo [`MemHub::refuse`].
    pub fn allow(&self, addr: SocketAddr) {
        self.inner.refusing.lock().remove(&addr);
    }
}

impl Default for MemHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint of a [`MemHub`] mesh.
pub struct MemTransport {
    hub: Arc<HubInner>,
    local: SocketAddr,
}

impl Transport for MemTransport {
    fn send(&self, to: SocketAddr, msg: &Message) -> Result<()> {
        if self.hub.refusing.lock().contains(&to) {
            return Err(Error::SendFailed(format!("{}: refused (scripted)", to)));
        }
        let dead = self.hub.dead.lock();
        if dead.contains(&to) || dead.contains(&self.local) {
            // Best-effort semantics: a crashed peer looks like a black hole.
            return Ok(());
        }
        drop(dead);

        // Run the real codec so tests exercise the wire layout end to end.
        let bytes = msg.encode()?;
        let decoded = Message::decode(&bytes)?;

        if let Some(target) = self.hub.peers.get(&to) {
            // Receiver gone == dropped datagram.
            let _ = target.send(NodeEvent::Inbound(decoded, self.local));
        }
        Ok(())
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NodeId;
    use crossbeam::channel::unbounded;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().expect("valid address")
    }

    #[test]
    fn test_delivery_between_endpoints() {
        let hub = MemHub::new();
        let (tx_b, rx_b) = unbounded();
        let a = hub.attach(addr(1), unbounded().0);
        let _b = hub.attach(addr(2), tx_b);

        let msg = Message::Probe { from: NodeId(1) };
        a.send(addr(2), &msg).expect("send should succeed");

        match rx_b.try_recv().expect("message should be delivered") {
            NodeEvent::Inbound(received, from) => {
                assert_eq!(received, msg);
                assert_eq!(from, addr(1));
            }
            other => unreachable!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_kill_drops_silently() {
        let hub = MemHub::new();
        let (tx_b, rx_b) = unbounded();
        let a = hub.attach(addr(1), unbounded().0);
        let _b = hub.attach(addr(2), tx_b);

        hub.kill(addr(2));
        a.send(addr(2), &Message::Probe { from: NodeId(1) })
            .expect("send to crashed peer still succeeds locally");
        assert!(rx_b.try_recv().is_err());

        hub.revive(addr(2));
        a.send(addr(2), &Message::Probe { from: NodeId(1) })
            .expect("send should succeed");
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_refuse_fails_deterministically() {
        let hub = MemHub::new();
        let a = hub.attach(addr(1), unbounded().0);
        hub.refuse(addr(2));
        assert!(a.send(addr(2), &Message::Probe { from: NodeId(1) }).is_err());
    }
}
