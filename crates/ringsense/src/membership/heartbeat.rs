// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringsense contributors

//! Periodic neighbor heartbeat thread.
//!
//! Runs independently of token arrival so a stalled ring still has failure
//! detection. Reads the current ring view from the shared `ArcSwap` on every
//! beat, so repairs take effect without restarting the thread.

use crate::protocol::{Message, NodeId};
use crate::transport::Transport;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::RingView;

/// Background heartbeat announcer.
///
/// Signal shutdown via [`HeartbeatAnnouncer::shutdown`] or drop it; both
/// join the thread.
pub struct HeartbeatAnnouncer {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl HeartbeatAnnouncer {
    #[must_use]
    pub fn spawn(
        node: NodeId,
        transport: Arc<dyn Transport>,
        ring: Arc<ArcSwap<RingView>>,
        interval: Duration,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);

        let handle = thread::spawn(move || {
            announcer_loop(node, transport, ring, interval, shutdown_clone);
        });

        Self {
            handle: Some(handle),
            shutdown,
        }
    }

    /// Stop the announcer and wait for the thread.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HeartbeatAnnouncer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn announcer_loop(
    node: NodeId,
    transport: Arc<dyn Transport>,
    ring: Arc<ArcSwap<RingView>>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) {
    let beat = Message::Heartbeat { from: node };
    loop {
        if shutdown.load(Ordering::Relaxed) {
            log::debug!("[heartbeat] announcer stopping node={}", node);
            break;
        }

        let view = ring.load_full();
        // A self-loop ring has no one to beacon to.
        for neighbor in [view.predecessor, view.successor] {
            if neighbor.id == node {
                continue;
            }
            if let Err(err) = transport.send(neighbor.addr, &beat) {
                log::debug!(
                    "[heartbeat] send to {} ({}) failed: {}",
                    neighbor.id,
                    neighbor.addr,
                    err
                );
            }
        }
        // Predecessor and successor may be the same node (2-ring); one beat
        // per neighbor role is fine, duplicates just refresh the same lease.

        // Chunked sleep for responsive shutdown.
        let sleep_end = std::time::Instant::now() + interval;
        while std::time::Instant::now() < sleep_end {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }
    }
}
