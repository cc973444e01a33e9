// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringsense contributors

//! UDP transport for ring unicast send/receive.

use super::Transport;
use crate::config::{MAX_DATAGRAM_SIZE, RECV_POLL_INTERVAL_MS};
use crate::node::{Error, NodeEvent, Result};
use crate::protocol::Message;
use crossbeam::channel::Sender;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// UDP transport bound to this node's ring address.
///
/// A single socket is shared between the send path (any thread) and the
/// receive loop. The read timeout keeps the receive loop responsive to the
/// shutdown flag.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
}

impl UdpTransport {
    /// Bind the ring socket with `SO_REUSEADDR` for fast restart.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket2 = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| Error::BindFailed(format!("{}: {}", addr, e)))?;
        socket2
            .set_reuse_address(true)
            .map_err(|e| Error::BindFailed(format!("{}: {}", addr, e)))?;
        socket2
            .bind(&addr.into())
            .map_err(|e| Error::BindFailed(format!("{}: {}", addr, e)))?;

        let socket: UdpSocket = socket2.into();
        socket
            .set_read_timeout(Some(Duration::from_millis(RECV_POLL_INTERVAL_MS)))
            .map_err(Error::Io)?;
        let local = socket.local_addr().map_err(Error::Io)?;
        log::debug!("[udp] transport bound addr={}", local);

        Ok(Self {
            socket: Arc::new(socket),
            local,
        })
    }

    /// Shared socket handle for the receive loop.
    #[must_use]
    pub fn socket(&self) -> Arc<UdpSocket> {
        Arc::clone(&self.socket)
    }
}

impl Transport for UdpTransport {
    fn send(&self, to: SocketAddr, msg: &Message) -> Result<()> {
        let bytes = msg.encode()?;
        match self.socket.send_to(&bytes, to) {
            Ok(sent) => {
                log::debug!(
                    "[udp] send kind={} -> {} len={}",
                    msg.kind_str(),
                    to,
                    sent
                );
                Ok(())
            }
            Err(err) => {
                log::debug!("[udp] send kind={} -> {} error={}", msg.kind_str(), to, err);
                Err(Error::SendFailed(format!("{}: {}", to, err)))
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

/// Spawn the datagram receive loop.
///
/// Decoded messages are pushed into the node's event channel; malformed
/// datagrams are logged and dropped (a hostile or confused sender must not
/// take the dispatch loop down). The loop exits when `shutdown` is set or
/// the event channel closes.
pub fn spawn_udp_receiver(
    socket: Arc<UdpSocket>,
    events: Sender<NodeEvent>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            if shutdown.load(Ordering::Relaxed) {
                log::debug!("[udp] receive loop stopping");
                break;
            }
            let (len, from) = match socket.recv_from(&mut buf) {
                Ok(ok) => ok,
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(err) => {
                    log::debug!("[udp] recv error={}", err);
                    continue;
                }
            };

            match Message::decode(&buf[..len]) {
                Ok(msg) => {
                    if events.send(NodeEvent::Inbound(msg, from)).is_err() {
                        // Dispatch loop is gone; nothing left to deliver to.
                        break;
                    }
                }
                Err(err) => {
                    log::debug!("[udp] dropping malformed datagram from {} err={}", from, err);
                }
            }
        }
    })
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NodeId;
    use crossbeam::channel::unbounded;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().expect("valid address")
    }

    #[test]
    fn test_bind_ephemeral() {
        let transport = UdpTransport::bind(loopback()).expect("bind should succeed");
        assert_ne!(transport.local_addr().port(), 0);
    }

    #[test]
    fn test_send_and_receive_roundtrip() {
        let a = UdpTransport::bind(loopback()).expect("bind a");
        let b = UdpTransport::bind(loopback()).expect("bind b");

        let (tx, rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = spawn_udp_receiver(b.socket(), tx, Arc::clone(&shutdown));

        let msg = Message::Token {
            epoch: 3,
            origin: NodeId(1),
        };
        a.send(b.local_addr(), &msg).expect("send should succeed");

        let event = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("message should arrive");
        match event {
            NodeEvent::Inbound(received, _) => assert_eq!(received, msg),
            other => unreachable!("unexpected event: {:?}", other),
        }

        shutdown.store(true, Ordering::Relaxed);
        handle.join().expect("receiver thread should stop");
    }

    #[test]
    fn test_malformed_datagram_is_dropped() {
        let a = UdpTransport::bind(loopback()).expect("bind a");
        let b = UdpTransport::bind(loopback()).expect("bind b");

        let (tx, rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = spawn_udp_receiver(b.socket(), tx, Arc::clone(&shutdown));

        a.socket()
            .send_to(b"garbage", b.local_addr())
            .expect("raw send");
        // Follow with a valid message; only it should surface.
        let msg = Message::Heartbeat { from: NodeId(4) };
        a.send(b.local_addr(), &msg).expect("send should succeed");

        let event = rx
            .recv_timeout(Duration::from_secs(2))
            .expect("valid message should arrive");
        match event {
            NodeEvent::Inbound(received, _) => assert_eq!(received, msg),
            other => unreachable!("unexpected event: {:?}", other),
        }
        assert!(rx.try_recv().is_err(), "garbage must not surface");

        shutdown.store(true, Ordering::Relaxed);
        handle.join().expect("receiver thread should stop");
    }
}
