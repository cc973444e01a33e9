// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringsense contributors

//! In-memory reference storage sink.
//!
//! Keyed by `(NodeId, seq)` so resubmitted batches are idempotent, which is
//! the contract the real ingestion backend must honor. Tests script outages
//! with a failure countdown.

use super::{StorageError, StorageSink, SubmitAck};
use crate::buffer::{Reading, ReadingValue};
use crate::sensor::ChannelId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

/// What the sink persists per reading.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredReading {
    pub channel: ChannelId,
    /// `None` records a failed poll (the failure marker made it to storage).
    pub value: Option<f64>,
    pub timestamp_ms: u64,
}

/// DashMap-backed sink for tests, rigs and single-host deployments.
pub struct MemorySink {
    records: DashMap<(u32, u64), StoredReading>,
    fail_remaining: AtomicU32,
    submits: AtomicU64,
    failures: AtomicU64,
    attempt_times: Mutex<Vec<Instant>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            fail_remaining: AtomicU32::new(0),
            submits: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            attempt_times: Mutex::new(Vec::new()),
        }
    }

    /// Script an outage: the next `n` submits fail with `Unavailable`.
    pub fn fail_next_submits(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::Relaxed);
    }

    pub fn records_len(&self) -> usize {
        self.records.len()
    }

    pub fn contains(&self, node: u32, seq: u64) -> bool {
        self.records.contains_key(&(node, seq))
    }

    pub fn get(&self, node: u32, seq: u64) -> Option<StoredReading> {
        self.records.get(&(node, seq)).map(|r| r.value().clone())
    }

    /// Sorted sequence numbers stored for one node (gap audits in tests).
    pub fn node_seqs(&self, node: u32) -> Vec<u64> {
        let mut seqs: Vec<u64> = self
            .records
            .iter()
            .filter(|entry| entry.key().0 == node)
            .map(|entry| entry.key().1)
            .collect();
        seqs.sort_unstable();
        seqs
    }

    pub fn submits_total(&self) -> u64 {
        self.submits.load(Ordering::Relaxed)
    }

    pub fn failures_total(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Timestamps of every submit attempt, in order.
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempt_times.lock().clone()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageSink for MemorySink {
    fn submit(&self, batch: &[Reading]) -> Result<SubmitAck, StorageError> {
        self.submits.fetch_add(1, Ordering::Relaxed);
        self.attempt_times.lock().push(Instant::now());

        // Scripted outage window.
        let mut remaining = self.fail_remaining.load(Ordering::Relaxed);
        while remaining > 0 {
            match self.fail_remaining.compare_exchange(
                remaining,
                remaining - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    return Err(StorageError::Unavailable("scripted outage".into()));
                }
                Err(actual) => remaining = actual,
            }
        }

        let mut stored = 0;
        let mut duplicates = 0;
        for reading in batch {
            let key = (reading.node.0, reading.seq);
            let value = match reading.value {
                ReadingValue::Value(v) => Some(v),
                ReadingValue::Failed(_) => None,
            };
            let previous = self.records.insert(
                key,
                StoredReading {
                    channel: reading.channel,
                    value,
                    timestamp_ms: reading.timestamp_ms,
                },
            );
            if previous.is_some() {
                duplicates += 1;
            } else {
                stored += 1;
            }
        }
        Ok(SubmitAck { stored, duplicates })
    }
}

// ===== Tests =====

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NodeId;
    use crate::sensor::SensorFailure;

    fn reading(node: u32, seq: u64, value: ReadingValue) -> Reading {
        Reading {
            node: NodeId(node),
            channel: ChannelId::Humidity,
            value,
            timestamp_ms: 42,
            seq,
        }
    }

    #[test]
    fn test_resubmission_is_idempotent() {
        let sink = MemorySink::new();
        let batch = vec![
            reading(1, 1, ReadingValue::Value(55.0)),
            reading(1, 2, ReadingValue::Value(56.0)),
        ];

        let first = sink.submit(&batch).expect("first submit");
        assert_eq!(first, SubmitAck { stored: 2, duplicates: 0 });

        let second = sink.submit(&batch).expect("resubmit");
        assert_eq!(second, SubmitAck { stored: 0, duplicates: 2 });
        assert_eq!(sink.records_len(), 2, "no duplicate persisted records");
    }

    #[test]
    fn test_same_seq_different_nodes_do_not_collide() {
        let sink = MemorySink::new();
        sink.submit(&[reading(1, 1, ReadingValue::Value(1.0))])
            .expect("submit node 1");
        sink.submit(&[reading(2, 1, ReadingValue::Value(2.0))])
            .expect("submit node 2");
        assert_eq!(sink.records_len(), 2);
        assert!(sink.contains(1, 1));
        assert!(sink.contains(2, 1));
    }

    #[test]
    fn test_failure_markers_are_persisted() {
        let sink = MemorySink::new();
        sink.submit(&[reading(3, 9, ReadingValue::Failed(SensorFailure::Timeout))])
            .expect("submit");
        let stored = sink.get(3, 9).expect("record present");
        assert_eq!(stored.value, None);
    }

    #[test]
    fn test_scripted_outage_countdown() {
        let sink = MemorySink::new();
        sink.fail_next_submits(2);
        let batch = vec![reading(1, 1, ReadingValue::Value(0.0))];

        assert!(sink.submit(&batch).is_err());
        assert!(sink.submit(&batch).is_err());
        assert!(sink.submit(&batch).is_ok());
        assert_eq!(sink.failures_total(), 2);
        assert_eq!(sink.submits_total(), 3);
    }

    #[test]
    fn test_node_seqs_sorted() {
        let sink = MemorySink::new();
        sink.submit(&[
            reading(1, 3, ReadingValue::Value(0.0)),
            reading(1, 1, ReadingValue::Value(0.0)),
            reading(2, 2, ReadingValue::Value(0.0)),
        ])
        .expect("submit");
        assert_eq!(sink.node_seqs(1), vec![1, 3]);
        assert_eq!(sink.node_seqs(2), vec![2]);
    }
}
