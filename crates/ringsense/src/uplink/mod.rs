// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringsense contributors

//! Uplink forwarder: drains buffered readings to the storage collaborator.
//!
//! Runs on its own thread so a slow or down storage backend can never stall
//! sensor polling or token forwarding. Failed submits back off exponentially
//! up to a ceiling and retry forever; the reading buffer's drop-oldest
//! overflow policy is the pressure-release valve.

use crate::buffer::ReadingBuffer;
use crate::buffer::Reading;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

mod memory;

pub use memory::{MemorySink, StoredReading};

/// Storage accepted a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitAck {
    /// Newly persisted readings.
    pub stored: usize,
    /// Readings that were already present under their `(node, seq)` key.
    pub duplicates: usize,
}

/// Storage refused or could not take a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Transient: backend unreachable or overloaded; retry with backoff.
    Unavailable(String),
    /// Permanent for this batch: backend rejected the payload.
    Rejected(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Unavailable(msg) => write!(f, "storage unavailable: {}", msg),
            StorageError::Rejected(msg) => write!(f, "storage rejected batch: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

/// Ingestion interface of the storage collaborator.
///
/// Implementations must be idempotent on `(NodeId, seq)` so a batch retried
/// after partial failure never duplicates persisted records.
pub trait StorageSink: Send + Sync {
    fn submit(&self, batch: &[Reading]) -> Result<SubmitAck, StorageError>;
}

/// Wake signal from the token cycle to the forwarder thread.
///
/// Atomic fast-path plus condvar: `notify` is cheap from the dispatch thread,
/// the forwarder blocks on the condvar while idle.
pub struct DrainWake {
    pending: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
}

impl DrainWake {
    pub fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Signal that readings are waiting. Never blocks the caller.
    pub fn notify(&self) {
        self.pending.store(true, Ordering::Release);
        self.cv.notify_one();
    }

    /// Wait until notified or `timeout` elapses. Returns true when notified.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.pending.swap(false, Ordering::AcqRel) {
            return true;
        }
        let mut guard = self.lock.lock();
        let _ = self.cv.wait_for(&mut guard, timeout);
        self.pending.swap(false, Ordering::AcqRel)
    }
}

impl Default for DrainWake {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwarder tuning, copied from the node config.
#[derive(Debug, Clone)]
pub struct UplinkConfig {
    pub batch_max: usize,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub idle_wait: Duration,
}

/// One drain attempt: take a batch, submit, confirm on ack.
///
/// The batch stays in the buffer until the sink acks, so a crash between
/// drain and confirm loses nothing. Returns the number of readings confirmed
/// (0 when the buffer was empty).
pub fn attempt_drain(
    buffer: &ReadingBuffer,
    sink: &dyn StorageSink,
    batch_max: usize,
) -> Result<usize, StorageError> {
    let batch = buffer.drain_batch(batch_max);
    let Some(last) = batch.last() else {
        return Ok(0);
    };
    let last_seq = last.seq;

    let ack = sink.submit(&batch)?;
    let confirmed = buffer.confirm(last_seq);
    log::debug!(
        "[uplink] drained {} readings (stored={} duplicates={}) remaining={}",
        confirmed,
        ack.stored,
        ack.duplicates,
        buffer.len()
    );
    Ok(confirmed)
}

/// Background drain thread with exponential backoff.
pub struct UplinkForwarder {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    wake: Arc<DrainWake>,
}

impl UplinkForwarder {
    #[must_use]
    pub fn spawn(
        buffer: Arc<ReadingBuffer>,
        sink: Arc<dyn StorageSink>,
        wake: Arc<DrainWake>,
        cfg: UplinkConfig,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);
        let wake_clone = Arc::clone(&wake);

        let handle = thread::spawn(move || {
            forwarder_loop(&buffer, sink.as_ref(), &wake_clone, &cfg, &shutdown_clone);
        });

        Self {
            handle: Some(handle),
            shutdown,
            wake,
        }
    }

    /// Wake handle for the token coordinator.
    pub fn wake_handle(&self) -> Arc<DrainWake> {
        Arc::clone(&self.wake)
    }

    /// Stop the forwarder and wait for the thread.
    pub fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.wake.notify();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for UplinkForwarder {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.wake.notify();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn forwarder_loop(
    buffer: &ReadingBuffer,
    sink: &dyn StorageSink,
    wake: &DrainWake,
    cfg: &UplinkConfig,
    shutdown: &AtomicBool,
) {
    let mut backoff = cfg.backoff_initial;
    let mut next_attempt: Option<Instant> = None;

    loop {
        if shutdown.load(Ordering::Relaxed) {
            // Best-effort flush so a clean shutdown ships what it can.
            let _ = attempt_drain(buffer, sink, cfg.batch_max);
            log::debug!("[uplink] forwarder stopping, {} readings left", buffer.len());
            break;
        }

        // Honor the backoff window; wakes during it do not short-circuit.
        if let Some(at) = next_attempt {
            let now = Instant::now();
            if now < at {
                let nap = (at - now).min(Duration::from_millis(50));
                thread::sleep(nap);
                continue;
            }
        }

        if buffer.is_empty() {
            wake.wait_timeout(cfg.idle_wait);
            continue;
        }

        match attempt_drain(buffer, sink, cfg.batch_max) {
            Ok(_) => {
                backoff = cfg.backoff_initial;
                next_attempt = None;
                // Keep draining while there is work; loop re-checks shutdown.
            }
            Err(err) => {
                log::warn!(
                    "[uplink] submit failed ({}), backing off {:?} with {} buffered",
                    err,
                    backoff,
                    buffer.len()
                );
                next_attempt = Some(Instant::now() + backoff);
                backoff = (backoff * 2).min(cfg.backoff_max);
            }
        }
    }
}

// ===== Tests =====
