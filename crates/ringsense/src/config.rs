// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringsense contributors

//! Global configuration - single source of truth.
//!
//! This module centralizes every protocol constant and the per-node runtime
//! configuration. **Never hardcode these values elsewhere!**
//!
//! # Architecture
//!
//! - **Level 1 (static)**: compile-time defaults (timing, capacities, wire limits)
//! - **Level 2 (dynamic)**: [`NodeConfig`] built from CLI flags or a YAML file
//!   (`config-loaders` feature)

use crate::node::{Error, Result};
use crate::protocol::{NodeId, Peer};
use std::net::SocketAddr;
use std::time::Duration;

// =======================================================================
// Timing defaults
// =======================================================================

/// Neighbor heartbeat period (milliseconds).
///
/// Each node beacons to its predecessor and successor at this rate.
pub const HEARTBEAT_INTERVAL_MS: u64 = 1_000;

/// Consecutive missed heartbeats before a neighbor is declared dead.
///
/// Lease duration = `HEARTBEAT_INTERVAL_MS * LEASE_MISSES`. Token receipt
/// also refreshes the predecessor's lease, so a busy ring rarely expires one.
pub const LEASE_MISSES: u32 = 3;

/// Token-loss timeout (milliseconds).
///
/// An idle node that has seen a token before but receives none for this long
/// starts the regeneration probe round.
pub const TOKEN_LOSS_TIMEOUT_MS: u64 = 5_000;

/// Startup grace period (milliseconds).
///
/// The configured seed node mints epoch 0 if no token is observed within
/// this window after startup. Non-seed nodes just keep waiting.
pub const STARTUP_GRACE_MS: u64 = 3_000;

/// Liveness probe collection window (milliseconds).
///
/// During regeneration a node probes all configured peers and collects acks
/// for this long before applying the lowest-id tie-break.
pub const PROBE_WINDOW_MS: u64 = 500;

/// Delay between receiving the token and polling (milliseconds).
///
/// Paces the ring so a small fleet does not spin the token at CPU speed;
/// also the effective cycle period of a single-node self-loop ring.
pub const HOLD_DELAY_MS: u64 = 1_000;

/// Wall-clock budget for one sensor channel read (milliseconds).
///
/// Overruns are recorded as a timeout failure reading, never retried inline.
pub const POLL_BUDGET_PER_CHANNEL_MS: u64 = 250;

/// Protocol dispatch timer period (milliseconds).
///
/// Granularity of every timeout above; keep it well below the smallest of
/// them.
pub const TICK_INTERVAL_MS: u64 = 250;

/// Bounded retry attempts for a failed token forward before the successor is
/// reported dead to the membership manager.
pub const SEND_RETRY_ATTEMPTS: u32 = 3;

/// Backoff between token forward retries (milliseconds).
pub const SEND_RETRY_BACKOFF_MS: u64 = 100;

/// Relink acknowledgment timeout during ring repair (milliseconds).
///
/// After this long without a `RelinkAck` the repair escalates to the next
/// peer outward.
pub const RELINK_TIMEOUT_MS: u64 = 1_000;

/// Join handshake retry period (milliseconds).
pub const JOIN_RETRY_MS: u64 = 2_000;

/// Join handshake attempts before startup fails.
pub const JOIN_MAX_ATTEMPTS: u32 = 5;

// =======================================================================
// Buffering & uplink defaults
// =======================================================================

/// Reading buffer capacity (readings).
///
/// Overflow policy is drop-oldest: the freshest environmental readings win.
pub const BUFFER_CAPACITY: usize = 1_024;

/// Maximum readings per uplink submit batch.
pub const DRAIN_BATCH_MAX: usize = 64;

/// Initial uplink backoff after a failed submit (milliseconds).
pub const UPLINK_BACKOFF_INITIAL_MS: u64 = 500;

/// Uplink backoff ceiling (milliseconds).
pub const UPLINK_BACKOFF_MAX_MS: u64 = 30_000;

/// Forwarder idle wait when the buffer is empty (milliseconds).
///
/// A token cycle wakes the forwarder early, so this is only a safety net.
pub const UPLINK_IDLE_WAIT_MS: u64 = 2_000;

// =======================================================================
// Wire limits
// =======================================================================

/// Maximum ring datagram size (bytes).
///
/// Every protocol message is fixed-layout and far smaller; anything larger
/// is discarded by the receive loop.
pub const MAX_DATAGRAM_SIZE: usize = 512;

/// Receive loop poll interval (milliseconds).
///
/// Socket read timeout so the loop can observe the shutdown flag.
pub const RECV_POLL_INTERVAL_MS: u64 = 100;

// =======================================================================
// NodeConfig
// =======================================================================

/// Per-node runtime configuration.
///
/// Construct with [`NodeConfig::new`] (defaults from the constants above),
/// adjust fields, then let [`NodeConfig::validate`] fail fast before any
/// socket is opened.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's stable identity.
    pub node_id: NodeId,
    /// Local bind address for the ring transport.
    pub bind_addr: SocketAddr,
    /// Bootstrap contact for the join handshake; `None` starts a fresh
    /// self-loop ring.
    pub bootstrap: Option<SocketAddr>,
    /// Whether this node seeds epoch 0 on a fresh ring.
    pub seed: bool,
    /// Known fleet roster (used for repair escalation and probe rounds).
    pub peers: Vec<Peer>,

    pub heartbeat_interval: Duration,
    pub lease_misses: u32,
    pub token_loss_timeout: Duration,
    pub startup_grace: Duration,
    pub probe_window: Duration,
    pub hold_delay: Duration,
    pub poll_budget: Duration,
    pub tick_interval: Duration,
    pub send_retry_attempts: u32,
    pub send_retry_backoff: Duration,
    pub relink_timeout: Duration,

    pub buffer_capacity: usize,
    pub drain_batch_max: usize,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl NodeConfig {
    /// Config with library defaults for the given identity and bind address.
    pub fn new(node_id: NodeId, bind_addr: SocketAddr) -> Self {
        Self {
            node_id,
            bind_addr,
            bootstrap: None,
            seed: false,
            peers: Vec::new(),
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
            lease_misses: LEASE_MISSES,
            token_loss_timeout: Duration::from_millis(TOKEN_LOSS_TIMEOUT_MS),
            startup_grace: Duration::from_millis(STARTUP_GRACE_MS),
            probe_window: Duration::from_millis(PROBE_WINDOW_MS),
            hold_delay: Duration::from_millis(HOLD_DELAY_MS),
            poll_budget: Duration::from_millis(POLL_BUDGET_PER_CHANNEL_MS),
            tick_interval: Duration::from_millis(TICK_INTERVAL_MS),
            send_retry_attempts: SEND_RETRY_ATTEMPTS,
            send_retry_backoff: Duration::from_millis(SEND_RETRY_BACKOFF_MS),
            relink_timeout: Duration::from_millis(RELINK_TIMEOUT_MS),
            buffer_capacity: BUFFER_CAPACITY,
            drain_batch_max: DRAIN_BATCH_MAX,
            backoff_initial: Duration::from_millis(UPLINK_BACKOFF_INITIAL_MS),
            backoff_max: Duration::from_millis(UPLINK_BACKOFF_MAX_MS),
        }
    }

    /// Neighbor lease duration derived from the heartbeat settings.
    pub fn lease_duration(&self) -> Duration {
        self.heartbeat_interval * self.lease_misses
    }

    /// Fail-fast validation, run before the node opens any socket.
    ///
    /// # Errors
    ///
    /// `Error::Config` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            return Err(Error::Config("buffer_capacity must be > 0".into()));
        }
        if self.drain_batch_max == 0 {
            return Err(Error::Config("drain_batch_max must be > 0".into()));
        }
        if self.lease_misses == 0 {
            return Err(Error::Config("lease_misses must be >= 1".into()));
        }
        if self.send_retry_attempts == 0 {
            return Err(Error::Config("send_retry_attempts must be >= 1".into()));
        }
        if self.backoff_initial > self.backoff_max {
            return Err(Error::Config(
                "backoff_initial must not exceed backoff_max".into(),
            ));
        }
        if self.heartbeat_interval.is_zero() || self.tick_interval.is_zero() {
            return Err(Error::Config("intervals must be non-zero".into()));
        }
        if self.bootstrap == Some(self.bind_addr) {
            return Err(Error::Config(
                "bootstrap address must not be the local bind address".into(),
            ));
        }
        let mut ids: Vec<NodeId> = self.peers.iter().map(|p| p.id).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != self.peers.len() {
            return Err(Error::Config("duplicate node id in peer roster".into()));
        }
        if self.peers.iter().any(|p| p.id == self.node_id) {
            return Err(Error::Config(
                "peer roster must not contain the local node id".into(),
            ));
        }
        Ok(())
    }
}

// =======================================================================
// YAML loader (config-loaders feature)
// =======================================================================

#[cfg(feature = "config-loaders")]
mod loader {
    use super::*;
    use serde::Deserialize;

    /// On-disk node configuration schema.
    ///
    /// All timing fields are optional milliseconds; omitted fields take the
    /// compiled defaults.
    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct RawConfig {
        node_id: u32,
        bind_addr: String,
        #[serde(default)]
        bootstrap: Option<String>,
        #[serde(default)]
        seed: bool,
        #[serde(default)]
        peers: Vec<RawPeer>,
        #[serde(default)]
        heartbeat_interval_ms: Option<u64>,
        #[serde(default)]
        lease_misses: Option<u32>,
        #[serde(default)]
        token_loss_timeout_ms: Option<u64>,
        #[serde(default)]
        startup_grace_ms: Option<u64>,
        #[serde(default)]
        hold_delay_ms: Option<u64>,
        #[serde(default)]
        poll_budget_ms: Option<u64>,
        #[serde(default)]
        buffer_capacity: Option<usize>,
        #[serde(default)]
        drain_batch_max: Option<usize>,
        #[serde(default)]
        backoff_initial_ms: Option<u64>,
        #[serde(default)]
        backoff_max_ms: Option<u64>,
    }

    #[derive(Debug, Deserialize)]
    struct RawPeer {
        id: u32,
        addr: String,
    }

    fn parse_addr(s: &str, what: &str) -> Result<SocketAddr> {
        s.parse()
            .map_err(|_| Error::Config(format!("malformed {}: {}", what, s)))
    }

    /// Load and validate a node configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// `Error::ConfigFileNotFound` when the path is unreadable,
    /// `Error::Config` on schema or constraint violations.
    pub fn load_config(path: &std::path::Path) -> Result<NodeConfig> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| Error::ConfigFileNotFound(path.display().to_string()))?;
        let raw: RawConfig = serde_yaml::from_str(&text)
            .map_err(|e| Error::Config(format!("invalid config file: {}", e)))?;

        let bind_addr = parse_addr(&raw.bind_addr, "bind_addr")?;
        let mut cfg = NodeConfig::new(NodeId(raw.node_id), bind_addr);
        cfg.seed = raw.seed;
        if let Some(boot) = &raw.bootstrap {
            cfg.bootstrap = Some(parse_addr(boot, "bootstrap address")?);
        }
        for peer in &raw.peers {
            cfg.peers
                .push(Peer::new(NodeId(peer.id), parse_addr(&peer.addr, "peer addr")?));
        }

        if let Some(ms) = raw.heartbeat_interval_ms {
            cfg.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(k) = raw.lease_misses {
            cfg.lease_misses = k;
        }
        if let Some(ms) = raw.token_loss_timeout_ms {
            cfg.token_loss_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.startup_grace_ms {
            cfg.startup_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.hold_delay_ms {
            cfg.hold_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.poll_budget_ms {
            cfg.poll_budget = Duration::from_millis(ms);
        }
        if let Some(n) = raw.buffer_capacity {
            cfg.buffer_capacity = n;
        }
        if let Some(n) = raw.drain_batch_max {
            cfg.drain_batch_max = n;
        }
        if let Some(ms) = raw.backoff_initial_ms {
            cfg.backoff_initial = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.backoff_max_ms {
            cfg.backoff_max = Duration::from_millis(ms);
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(feature = "config-loaders")]
pub use loader::load_config;

// ===== Tests =====
