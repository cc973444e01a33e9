// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringsense contributors

//! Ring wire protocol: message types and the little-endian codec.
//!
//! Every datagram starts with a fixed 6-byte header (4-byte magic, protocol
//! version, message kind) followed by a fixed-layout little-endian payload.
//! The decoder validates the header strictly and never panics on malformed
//! input.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

/// Wire magic, first four bytes of every ring datagram.
pub const MAGIC: [u8; 4] = *b"RSNP";

/// Wire protocol version. Bumped on any layout change.
pub const VERSION: u8 = 0x01;

/// Join rejected: the candidate id collides with a live member.
pub const REJECT_DUPLICATE_ID: u8 = 0x01;
/// Join rejected: the contacted node is not yet part of a stable ring.
pub const REJECT_NOT_READY: u8 = 0x02;

// Message kind codes (header byte 5).
const KIND_TOKEN: u8 = 0x01;
const KIND_HEARTBEAT: u8 = 0x02;
const KIND_JOIN_REQUEST: u8 = 0x03;
const KIND_JOIN_ACCEPT: u8 = 0x04;
const KIND_JOIN_REJECT: u8 = 0x05;
const KIND_SET_SUCCESSOR: u8 = 0x06;
const KIND_SET_PREDECESSOR: u8 = 0x07;
const KIND_RELINK_ACK: u8 = 0x08;
const KIND_PROBE: u8 = 0x09;
const KIND_PROBE_ACK: u8 = 0x0A;
const KIND_LEAVE: u8 = 0x0B;

/// Stable per-node identifier, assigned at provisioning.
///
/// Ordering matters: the regeneration tie-break elects the lowest id among
/// reachable nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A ring member endpoint: identity plus transport address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl Peer {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

/// Errors produced by the wire codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// First four bytes did not match [`MAGIC`].
    BadMagic([u8; 4]),
    /// Header version byte is not [`VERSION`].
    UnsupportedVersion(u8),
    /// Unknown message kind code.
    UnknownKind(u8),
    /// Buffer ended before the fixed payload layout was complete.
    Truncated,
    /// Only IPv4 endpoints are representable on the wire.
    UnsupportedAddress,
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::BadMagic(m) => write!(f, "bad magic {:02x?}", m),
            WireError::UnsupportedVersion(v) => write!(f, "unsupported protocol version {}", v),
            WireError::UnknownKind(k) => write!(f, "unknown message kind {:#04x}", k),
            WireError::Truncated => write!(f, "truncated payload"),
            WireError::UnsupportedAddress => write!(f, "only IPv4 addresses are encodable"),
        }
    }
}

impl std::error::Error for WireError {}

/// Ring protocol messages.
///
/// `Token` is the circulation message; everything else is membership
/// metatraffic (heartbeats, the two-phase join/relink handshake, the
/// regeneration probe round, and graceful departure).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Circulating permission to poll and transmit for one cycle.
    Token { epoch: u64, origin: NodeId },
    /// Periodic neighbor liveness beacon.
    Heartbeat { from: NodeId },
    /// Ask a member to insert us into the ring.
    JoinRequest { candidate: Peer },
    /// Insertion point granted: relink against these two members.
    JoinAccept { pred: Peer, succ: Peer },
    /// Insertion refused (see the `REJECT_*` reason codes).
    JoinReject { reason: u8 },
    /// Receiver must set its successor pointer to `from`.
    SetSuccessor { from: Peer },
    /// Receiver must set its predecessor pointer to `from`.
    SetPredecessor { from: Peer },
    /// Acknowledges a `SetSuccessor`/`SetPredecessor` relink.
    RelinkAck { from: NodeId },
    /// Liveness probe preceding token regeneration.
    Probe { from: NodeId },
    /// Probe answer: the sender is alive and reachable.
    ProbeAck { from: NodeId },
    /// Graceful departure notice; receiver starts repair immediately.
    Leave { from: NodeId },
}

impl Message {
    /// Short tag for log lines.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Message::Token { .. } => "TOKEN",
            Message::Heartbeat { .. } => "HB",
            Message::JoinRequest { .. } => "JOIN_REQ",
            Message::JoinAccept { .. } => "JOIN_ACC",
            Message::JoinReject { .. } => "JOIN_REJ",
            Message::SetSuccessor { .. } => "SET_SUCC",
            Message::SetPredecessor { .. } => "SET_PRED",
            Message::RelinkAck { .. } => "RELINK_ACK",
            Message::Probe { .. } => "PROBE",
            Message::ProbeAck { .. } => "PROBE_ACK",
            Message::Leave { .. } => "LEAVE",
        }
    }

    /// Encode into a standalone datagram.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut w = WireWriter::new();
        w.put_bytes(&MAGIC);
        w.put_u8(VERSION);

        match self {
            Message::Token { epoch, origin } => {
                w.put_u8(KIND_TOKEN);
                w.put_u64(*epoch);
                w.put_u32(origin.0);
            }
            Message::Heartbeat { from } => {
                w.put_u8(KIND_HEARTBEAT);
                w.put_u32(from.0);
            }
            Message::JoinRequest { candidate } => {
                w.put_u8(KIND_JOIN_REQUEST);
                w.put_peer(candidate)?;
            }
            Message::JoinAccept { pred, succ } => {
                w.put_u8(KIND_JOIN_ACCEPT);
                w.put_peer(pred)?;
                w.put_peer(succ)?;
            }
            Message::JoinReject { reason } => {
                w.put_u8(KIND_JOIN_REJECT);
                w.put_u8(*reason);
            }
            Message::SetSuccessor { from } => {
                w.put_u8(KIND_SET_SUCCESSOR);
                w.put_peer(from)?;
            }
            Message::SetPredecessor { from } => {
                w.put_u8(KIND_SET_PREDECESSOR);
                w.put_peer(from)?;
            }
            Message::RelinkAck { from } => {
                w.put_u8(KIND_RELINK_ACK);
                w.put_u32(from.0);
            }
            Message::Probe { from } => {
                w.put_u8(KIND_PROBE);
                w.put_u32(from.0);
            }
            Message::ProbeAck { from } => {
                w.put_u8(KIND_PROBE_ACK);
                w.put_u32(from.0);
            }
            Message::Leave { from } => {
                w.put_u8(KIND_LEAVE);
                w.put_u32(from.0);
            }
        }

        Ok(w.into_bytes())
    }

    /// Decode a datagram. Strictly validates magic, version and kind.
    pub fn decode(buf: &[u8]) -> Result<Message, WireError> {
        let mut r = WireReader::new(buf);

        let magic = r.get_bytes::<4>()?;
        if magic != MAGIC {
            return Err(WireError::BadMagic(magic));
        }
        let version = r.get_u8()?;
        if version != VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }

        let kind = r.get_u8()?;
        match kind {
            KIND_TOKEN => {
                let epoch = r.get_u64()?;
                let origin = NodeId(r.get_u32()?);
                Ok(Message::Token { epoch, origin })
            }
            KIND_HEARTBEAT => Ok(Message::Heartbeat {
                from: NodeId(r.get_u32()?),
            }),
            KIND_JOIN_REQUEST => Ok(Message::JoinRequest {
                candidate: r.get_peer()?,
            }),
            KIND_JOIN_ACCEPT => Ok(Message::JoinAccept {
                pred: r.get_peer()?,
                succ: r.get_peer()?,
            }),
            KIND_JOIN_REJECT => Ok(Message::JoinReject {
                reason: r.get_u8()?,
            }),
            KIND_SET_SUCCESSOR => Ok(Message::SetSuccessor {
                from: r.get_peer()?,
            }),
            KIND_SET_PREDECESSOR => Ok(Message::SetPredecessor {
                from: r.get_peer()?,
            }),
            KIND_RELINK_ACK => Ok(Message::RelinkAck {
                from: NodeId(r.get_u32()?),
            }),
            KIND_PROBE => Ok(Message::Probe {
                from: NodeId(r.get_u32()?),
            }),
            KIND_PROBE_ACK => Ok(Message::ProbeAck {
                from: NodeId(r.get_u32()?),
            }),
            KIND_LEAVE => Ok(Message::Leave {
                from: NodeId(r.get_u32()?),
            }),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

// ===== Writer / reader primitives =====

struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    fn new() -> Self {
        Self {
            buf: Vec::with_capacity(32),
        }
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Peer layout: id u32, IPv4 octets, port u16 (10 bytes).
    fn put_peer(&mut self, peer: &Peer) -> Result<(), WireError> {
        let v4 = match peer.addr {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => return Err(WireError::UnsupportedAddress),
        };
        self.put_u32(peer.id.0);
        self.put_bytes(&v4.ip().octets());
        self.put_u16(v4.port());
        Ok(())
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

struct WireReader<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    fn get_bytes<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let end = self.off.checked_add(N).ok_or(WireError::Truncated)?;
        let slice = self.buf.get(self.off..end).ok_or(WireError::Truncated)?;
        self.off = end;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn get_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.get_bytes::<1>()?[0])
    }

    fn get_u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_le_bytes(self.get_bytes::<2>()?))
    }

    fn get_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.get_bytes::<4>()?))
    }

    fn get_u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.get_bytes::<8>()?))
    }

    fn get_peer(&mut self) -> Result<Peer, WireError> {
        let id = NodeId(self.get_u32()?);
        let octets = self.get_bytes::<4>()?;
        let port = self.get_u16()?;
        let ip = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
        Ok(Peer::new(id, SocketAddr::V4(SocketAddrV4::new(ip, port))))
    }
}

// ===== Tests =====
