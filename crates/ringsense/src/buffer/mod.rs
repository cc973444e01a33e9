// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringsense contributors

//! Bounded reading buffer between the polling cycle and the uplink.
//!
//! Thread-safe FIFO with drop-oldest eviction: the freshest environmental
//! readings are worth more than stale ones, and the polling cycle must never
//! block on a full buffer. Drained batches stay in place until the forwarder
//! confirms the storage ack, so a forwarder crash loses nothing.

use crate::protocol::NodeId;
use crate::sensor::{ChannelId, SensorFailure};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Captured value or the failure that took its place.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadingValue {
    Value(f64),
    Failed(SensorFailure),
}

impl ReadingValue {
    pub fn is_failure(&self) -> bool {
        matches!(self, ReadingValue::Failed(_))
    }
}

/// One captured sample. Immutable once created.
///
/// `seq` is per-node monotonic and gap-free; failed polls consume a sequence
/// number too, so missed polls stay auditable downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub node: NodeId,
    pub channel: ChannelId,
    pub value: ReadingValue,
    pub timestamp_ms: u64,
    pub seq: u64,
}

/// Per-node monotonic sequence numbers, starting at 1.
///
/// Thread-safe via `AtomicU64`; relaxed ordering is enough since the dedup
/// key at the storage boundary is `(NodeId, seq)`, not cross-node order.
#[derive(Debug)]
pub struct SeqCounter {
    next: AtomicU64,
}

impl SeqCounter {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Claim the next sequence number.
    #[inline]
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Next number that `next()` would return (may be stale immediately).
    #[inline]
    pub fn current(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for SeqCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded FIFO of readings awaiting uplink.
pub struct ReadingBuffer {
    ring: Mutex<VecDeque<Reading>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl ReadingBuffer {
    /// Create a buffer holding at most `capacity` readings.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    fn lock_ring(&self) -> std::sync::MutexGuard<'_, VecDeque<Reading>> {
        match self.ring.lock() {
            Ok(lock) => lock,
            Err(e) => {
                log::debug!("[ReadingBuffer] lock poisoned, recovering");
                e.into_inner()
            }
        }
    }

    /// Append a reading. Never blocks; evicts the oldest unsent reading when
    /// full (never the newest).
    pub fn push(&self, reading: Reading) {
        let mut ring = self.lock_ring();
        while ring.len() >= self.capacity {
            if let Some(evicted) = ring.pop_front() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "[ReadingBuffer] overflow, dropped oldest seq={} channel={}",
                    evicted.seq,
                    evicted.channel
                );
            } else {
                break;
            }
        }
        ring.push_back(reading);
    }

    /// Clone up to `max` of the oldest readings without removing them.
    ///
    /// Entries stay buffered until [`ReadingBuffer::confirm`], so a crash
    /// between drain and ack loses nothing.
    pub fn drain_batch(&self, max: usize) -> Vec<Reading> {
        let ring = self.lock_ring();
        ring.iter().take(max).cloned().collect()
    }

    /// Remove the acknowledged prefix (all readings with seq <= `up_to_seq`).
    ///
    /// Returns the number of readings removed.
    pub fn confirm(&self, up_to_seq: u64) -> usize {
        let mut removed = 0;
        let mut ring = self.lock_ring();
        while let Some(front) = ring.front() {
            if front.seq <= up_to_seq {
                ring.pop_front();
                removed += 1;
            } else {
                break;
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock_ring().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_ring().is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total readings discarded by the overflow policy since startup.
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Oldest buffered sequence number, if any.
    pub fn oldest_seq(&self) -> Option<u64> {
        self.lock_ring().front().map(|r| r.seq)
    }

    /// Newest buffered sequence number, if any.
    pub fn newest_seq(&self) -> Option<u64> {
        self.lock_ring().back().map(|r| r.seq)
    }
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(seq: u64) -> Reading {
        Reading {
            node: NodeId(1),
            channel: ChannelId::Temperature,
            value: ReadingValue::Value(21.5),
            timestamp_ms: 1_700_000_000_000 + seq,
            seq,
        }
    }

    #[test]
    fn test_push_and_len() {
        let buf = ReadingBuffer::new(8);
        assert!(buf.is_empty());
        buf.push(reading(1));
        buf.push(reading(2));
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.oldest_seq(), Some(1));
        assert_eq!(buf.newest_seq(), Some(2));
    }

    #[test]
    fn test_overflow_drops_oldest_never_newest() {
        let buf = ReadingBuffer::new(3);
        for seq in 1..=5 {
            buf.push(reading(seq));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.oldest_seq(), Some(3));
        assert_eq!(buf.newest_seq(), Some(5));
        assert_eq!(buf.dropped_total(), 2);
    }

    #[test]
    fn test_drain_does_not_remove() {
        let buf = ReadingBuffer::new(8);
        for seq in 1..=4 {
            buf.push(reading(seq));
        }
        let batch = buf.drain_batch(2);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].seq, 1);
        assert_eq!(batch[1].seq, 2);
        // Nothing removed until confirm.
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_confirm_removes_acked_prefix() {
        let buf = ReadingBuffer::new(8);
        for seq in 1..=4 {
            buf.push(reading(seq));
        }
        assert_eq!(buf.confirm(2), 2);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf.oldest_seq(), Some(3));
        // Confirming again is a no-op.
        assert_eq!(buf.confirm(2), 0);
    }

    #[test]
    fn test_drain_batch_larger_than_buffer() {
        let buf = ReadingBuffer::new(8);
        buf.push(reading(1));
        let batch = buf.drain_batch(100);
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn test_seq_counter_monotonic_gap_free() {
        let counter = SeqCounter::new();
        let first = counter.next();
        assert_eq!(first, 1);
        for expected in 2..=100 {
            assert_eq!(counter.next(), expected);
        }
        assert_eq!(counter.current(), 101);
    }

    #[test]
    fn test_failure_readings_are_data() {
        let buf = ReadingBuffer::new(4);
        buf.push(Reading {
            node: NodeId(2),
            channel: ChannelId::WindSpeed,
            value: ReadingValue::Failed(SensorFailure::Timeout),
            timestamp_ms: unix_time_ms(),
            seq: 1,
        });
        let batch = buf.drain_batch(1);
        assert!(batch[0].value.is_failure());
    }
}
