// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringsense contributors

//! Neighbor liveness leases.
//!
//! Each observed heartbeat (or token pass) refreshes a neighbor's lease.
//! A lease that outlives `duration` without refresh expires exactly once:
//! expiry removes the entry, so a single failure triggers a single repair.

use crate::protocol::NodeId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub struct LeaseTable {
    entries: HashMap<NodeId, Instant>,
    duration: Duration,
}

impl LeaseTable {
    pub fn new(duration: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            duration,
        }
    }

    /// Refresh (or create) the lease for `id`.
    pub fn observe(&mut self, id: NodeId, now: Instant) {
        self.entries.insert(id, now);
    }

    /// Collect and remove every expired lease.
    pub fn expired(&mut self, now: Instant) -> Vec<NodeId> {
        let duration = self.duration;
        let dead: Vec<NodeId> = self
            .entries
            .iter()
            .filter(|(_, &seen)| now.duration_since(seen) >= duration)
            .map(|(&id, _)| id)
            .collect();
        for id in &dead {
            self.entries.remove(id);
        }
        dead
    }

    /// Drop a lease without expiring it (dead/left neighbor).
    pub fn forget(&mut self, id: NodeId) {
        self.entries.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
