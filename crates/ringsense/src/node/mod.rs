// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringsense contributors

//! Node wiring: crate errors, the builder, and the dispatch loop.
//!
//! A running node owns three schedulable units: the protocol dispatch loop
//! (this module - processes inbound messages and timer ticks, so membership
//! and token state are touched by exactly one thread), the heartbeat
//! announcer, and the uplink forwarder. The reading buffer and the published
//! ring view are the only state shared across them.

use crate::buffer::ReadingBuffer;
use crate::config::{NodeConfig, UPLINK_IDLE_WAIT_MS};
use crate::membership::{HeartbeatAnnouncer, MembershipManager, RingView};
use crate::protocol::{Message, NodeId, WireError};
use crate::sensor::SensorSource;
use crate::token::TokenCoordinator;
use crate::transport::Transport;
use crate::uplink::{DrainWake, StorageSink, UplinkConfig, UplinkForwarder};
use arc_swap::ArcSwap;
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Errors returned by ringsense operations.
///
/// Only configuration errors are fatal at startup; everything else is
/// handled locally by the owning component (bounded retries, repair,
/// backoff) per the acquisition core's error taxonomy.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Configuration (fail fast, before joining the ring)
    // ========================================================================
    /// Invalid configuration value or combination.
    Config(String),
    /// Configuration file not found or unreadable.
    ConfigFileNotFound(String),

    // ========================================================================
    // Transport
    // ========================================================================
    /// I/O error with underlying cause.
    Io(std::io::Error),
    /// Failed to bind the ring socket.
    BindFailed(String),
    /// Send operation failed (deterministic transport error).
    SendFailed(String),
    /// Wire codec rejected a message.
    Wire(WireError),

    // ========================================================================
    // State
    // ========================================================================
    /// Operation invalid in the node's current state.
    InvalidState(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "configuration error: {}", msg),
            Error::ConfigFileNotFound(path) => write!(f, "config file not found: {}", path),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::BindFailed(msg) => write!(f, "bind failed: {}", msg),
            Error::SendFailed(msg) => write!(f, "send failed: {}", msg),
            Error::Wire(e) => write!(f, "wire error: {}", e),
            Error::InvalidState(msg) => write!(f, "invalid state: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Wire(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        Error::Wire(e)
    }
}

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Events consumed by the dispatch loop.
#[derive(Debug)]
pub enum NodeEvent {
    /// Decoded message from the transport receive loop.
    Inbound(Message, SocketAddr),
    /// Periodic timer tick driving every timeout.
    Tick,
    /// Graceful shutdown: announce departure, flush, stop.
    Shutdown,
    /// Immediate stop without departure notice (crash semantics, test rigs).
    Halt,
}

/// Cloneable handle for observing and stopping a running node.
#[derive(Clone)]
pub struct NodeHandle {
    events: Sender<NodeEvent>,
    ring: Arc<ArcSwap<RingView>>,
    epoch: Arc<AtomicI64>,
    buffer: Arc<ReadingBuffer>,
}

impl NodeHandle {
    /// Request a graceful shutdown (sends `Leave` to both neighbors).
    pub fn shutdown(&self) {
        let _ = self.events.send(NodeEvent::Shutdown);
    }

    /// Stop immediately without telling anyone - simulates a crash.
    pub fn halt(&self) {
        let _ = self.events.send(NodeEvent::Halt);
    }

    /// Current published ring view.
    pub fn ring_view(&self) -> Arc<RingView> {
        self.ring.load_full()
    }

    /// Highest token epoch this node has acted on, if any.
    pub fn last_epoch(&self) -> Option<u64> {
        let raw = self.epoch.load(Ordering::Relaxed);
        u64::try_from(raw).ok()
    }

    /// Readings currently awaiting uplink.
    pub fn buffered_readings(&self) -> usize {
        self.buffer.len()
    }
}

/// Builder for [`Node`]. Validates the configuration fail-fast and requires
/// the three collaborator seams (transport, sensors, storage) to be wired.
pub struct NodeBuilder {
    config: NodeConfig,
    transport: Option<Arc<dyn Transport>>,
    sensors: Option<Box<dyn SensorSource>>,
    storage: Option<Arc<dyn StorageSink>>,
}

impl NodeBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn sensors(mut self, sensors: Box<dyn SensorSource>) -> Self {
        self.sensors = Some(sensors);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn StorageSink>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Validate and assemble the node.
    ///
    /// # Errors
    ///
    /// `Error::Config` on invalid configuration or a missing collaborator.
    pub fn build(self) -> Result<Node> {
        self.config.validate()?;
        let transport = self
            .transport
            .ok_or_else(|| Error::Config("transport not set".into()))?;
        let sensors = self
            .sensors
            .ok_or_else(|| Error::Config("sensor source not set".into()))?;
        let storage = self
            .storage
            .ok_or_else(|| Error::Config("storage sink not set".into()))?;

        let (events_tx, events_rx) = unbounded();
        let membership = MembershipManager::new(&self.config, Arc::clone(&transport));
        let ring = membership.ring_handle();
        let buffer = Arc::new(ReadingBuffer::new(self.config.buffer_capacity));
        let wake = Arc::new(DrainWake::new());
        let epoch_cell = Arc::new(AtomicI64::new(-1));
        let coordinator = TokenCoordinator::new(
            &self.config,
            Arc::clone(&transport),
            Arc::clone(&ring),
            Arc::clone(&buffer),
            Arc::clone(&wake),
            sensors,
            Arc::clone(&epoch_cell),
        );

        Ok(Node {
            config: self.config,
            events_tx,
            events_rx,
            transport,
            membership,
            coordinator,
            buffer,
            storage,
            wake,
            ring,
            epoch_cell,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// One ring node, fully wired. Call [`Node::run`] on a dedicated thread.
pub struct Node {
    config: NodeConfig,
    events_tx: Sender<NodeEvent>,
    events_rx: Receiver<NodeEvent>,
    transport: Arc<dyn Transport>,
    membership: MembershipManager,
    coordinator: TokenCoordinator,
    buffer: Arc<ReadingBuffer>,
    storage: Arc<dyn StorageSink>,
    wake: Arc<DrainWake>,
    ring: Arc<ArcSwap<RingView>>,
    epoch_cell: Arc<AtomicI64>,
    shutdown: Arc<AtomicBool>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Node {
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder {
            config,
            transport: None,
            sensors: None,
            storage: None,
        }
    }

    /// Sender for the transport receive loop (and anything else injecting
    /// events, e.g. a ctrl-c handler).
    pub fn event_sender(&self) -> Sender<NodeEvent> {
        self.events_tx.clone()
    }

    /// Flag observed by helper threads (receive loop, ticker).
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Observability and shutdown handle; grab it before [`Node::run`].
    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            events: self.events_tx.clone(),
            ring: Arc::clone(&self.ring),
            epoch: Arc::clone(&self.epoch_cell),
            buffer: Arc::clone(&self.buffer),
        }
    }

    /// Run the dispatch loop until shutdown. Blocks the calling thread.
    pub fn run(mut self) -> Result<()> {
        log::info!(
            "[node] node={} starting (bind={}, seed={})",
            self.config.node_id,
            self.transport.local_addr(),
            self.config.seed
        );

        let forwarder = UplinkForwarder::spawn(
            Arc::clone(&self.buffer),
            Arc::clone(&self.storage),
            Arc::clone(&self.wake),
            UplinkConfig {
                batch_max: self.config.drain_batch_max,
                backoff_initial: self.config.backoff_initial,
                backoff_max: self.config.backoff_max,
                idle_wait: Duration::from_millis(UPLINK_IDLE_WAIT_MS),
            },
        );
        let heartbeat = HeartbeatAnnouncer::spawn(
            self.config.node_id,
            Arc::clone(&self.transport),
            Arc::clone(&self.ring),
            self.config.heartbeat_interval,
        );
        let ticker = spawn_ticker(
            self.events_tx.clone(),
            self.config.tick_interval,
            Arc::clone(&self.shutdown),
        );

        self.membership.start();

        let events = self.events_rx.clone();
        let mut graceful = true;
        loop {
            match events.recv() {
                Ok(NodeEvent::Inbound(msg, from)) => self.dispatch(msg, from),
                Ok(NodeEvent::Tick) => self.on_tick(),
                Ok(NodeEvent::Shutdown) => break,
                Ok(NodeEvent::Halt) => {
                    graceful = false;
                    break;
                }
                // All senders gone; nothing can drive us anymore.
                Err(_) => break,
            }
        }

        if graceful {
            self.membership.announce_leave();
        }
        self.shutdown.store(true, Ordering::Relaxed);
        forwarder.shutdown();
        heartbeat.shutdown();
        let _ = ticker.join();
        log::info!(
            "[node] node={} stopped ({} readings buffered, {} dropped)",
            self.config.node_id,
            self.buffer.len(),
            self.buffer.dropped_total()
        );
        Ok(())
    }

    fn dispatch(&mut self, msg: Message, from: SocketAddr) {
        match msg {
            Message::Token { epoch, origin } => {
                // Token passes count as predecessor liveness.
                self.membership.note_token_from(from);
                self.coordinator.on_token(epoch, origin);
            }
            Message::ProbeAck { from: id } => self.coordinator.on_probe_ack(id),
            other => self.membership.handle_message(&other, from),
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        self.membership.on_tick(now);
        let roster = self.membership.peer_addrs();
        if let Some(dead) = self.coordinator.on_tick(now, &roster) {
            // Deterministic forward failure: repair now, not on lease expiry.
            self.membership.force_expire(dead);
        }
    }
}

/// Timer thread injecting `Tick` events until shutdown.
fn spawn_ticker(
    events: Sender<NodeEvent>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        if events.send(NodeEvent::Tick).is_err() {
            break;
        }
        thread::sleep(interval);
    })
}

// ===== Tests =====
