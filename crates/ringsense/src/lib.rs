// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringsense contributors

//! # ringsense - token-ring coordination for environmental sensor fleets
//!
//! A coordination layer that lets a small fleet of co-located embedded nodes
//! take turns polling their local sensors (temperature, humidity, soil
//! moisture, soil temperature, wind speed) and forwarding timestamped
//! readings to a central store - without collisions, and tolerating node
//! join/leave/crash and transmission failure.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ringsense::{MemorySink, Node, NodeConfig, NodeId, SimulatedSensors, UdpTransport};
//! use std::sync::Arc;
//!
//! fn main() -> ringsense::Result<()> {
//!     let mut config = NodeConfig::new(NodeId(1), "192.168.1.10:5500".parse().unwrap());
//!     config.seed = true; // first node up mints epoch 0
//!
//!     let transport = Arc::new(UdpTransport::bind(config.bind_addr)?);
//!     let node = Node::builder(config)
//!         .transport(transport.clone())
//!         .sensors(Box::new(SimulatedSensors::new()))
//!         .storage(Arc::new(MemorySink::new()))
//!         .build()?;
//!
//!     let _rx = ringsense::transport::spawn_udp_receiver(
//!         transport.socket(),
//!         node.event_sender(),
//!         node.shutdown_flag(),
//!     );
//!     node.run()
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                            Node wiring                             |
//! |     dispatch loop | heartbeat announcer | uplink forwarder         |
//! +--------------------------------------------------------------------+
//! |                        Coordination Layer                          |
//! |   Token Coordinator (epochs, regeneration) | Ring Membership       |
//! +--------------------------------------------------------------------+
//! |                          Data Plane                                |
//! |   SensorSource -> ReadingBuffer (drop-oldest) -> StorageSink       |
//! +--------------------------------------------------------------------+
//! |                          Transport                                 |
//! |   UDP unicast (best-effort) | in-process mesh (test rigs)          |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Node`] | One ring member, fully wired; entry point |
//! | [`NodeConfig`] | Validated per-node configuration |
//! | [`TokenCoordinator`] | Holds, uses, forwards and regenerates the token |
//! | [`MembershipManager`] | Predecessor/successor pointers, join and repair |
//! | [`ReadingBuffer`] | Bounded FIFO between polling and uplink |
//! | [`StorageSink`] | Ingestion seam of the storage collaborator |
//!
//! ## Correctness model
//!
//! The token carries a monotonically increasing epoch. Duplicate tokens can
//! transiently exist after a regeneration race, but the highest epoch wins:
//! lower-epoch holders abandon their token upon witnessing a higher one, so
//! the ring converges to exactly one live token within a round trip.

/// Bounded reading buffer and per-node sequence numbering.
pub mod buffer;
/// Global constants and per-node configuration (single source of truth).
pub mod config;
/// Console backend for the `log` facade (used by binaries).
pub mod logging;
/// Ring membership: join handshake, heartbeats, leases, repair.
pub mod membership;
/// Crate errors, node builder and the dispatch loop.
pub mod node;
/// Wire protocol messages and the little-endian codec.
pub mod protocol;
/// Sensor capability interface and the simulated fleet.
pub mod sensor;
/// Token coordinator state machine (epochs, regeneration).
pub mod token;
/// Best-effort transports (UDP, in-process test mesh).
pub mod transport;
/// Uplink forwarder, storage seam and the reference sink.
pub mod uplink;

pub use buffer::{Reading, ReadingBuffer, ReadingValue, SeqCounter};
pub use config::NodeConfig;
pub use membership::{MembershipManager, RingView};
pub use node::{Error, Node, NodeBuilder, NodeEvent, NodeHandle, Result};
pub use protocol::{Message, NodeId, Peer, WireError};
pub use sensor::{ChannelId, SensorFailure, SensorSource, SimulatedSensors};
pub use token::{Token, TokenCoordinator, TokenState};
pub use transport::{MemHub, MemTransport, Transport, UdpTransport};
pub use uplink::{MemorySink, StorageError, StorageSink, SubmitAck};

/// ringsense version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
