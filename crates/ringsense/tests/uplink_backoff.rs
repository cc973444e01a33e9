// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringsense contributors

//! Storage outage scenarios: the token cycle must never notice.

use ringsense::{
    MemHub, MemorySink, Node, NodeConfig, NodeId, SimulatedSensors, StorageSink,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().expect("valid address")
}

fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn test_storage_outage_backs_off_without_stalling_polls() {
    let hub = MemHub::new();
    let sink = Arc::new(MemorySink::new());
    // Three consecutive submit failures before the backend "recovers".
    sink.fail_next_submits(3);

    let mut cfg = NodeConfig::new(NodeId(1), addr(5541));
    cfg.seed = true;
    cfg.tick_interval = Duration::from_millis(10);
    cfg.hold_delay = Duration::from_millis(25);
    cfg.startup_grace = Duration::from_millis(30);
    cfg.heartbeat_interval = Duration::from_millis(50);
    cfg.backoff_initial = Duration::from_millis(40);
    cfg.backoff_max = Duration::from_millis(500);

    let node = Node::builder(cfg)
        .transport(Arc::new(hub.transport_for(addr(5541))))
        .sensors(Box::new(SimulatedSensors::new()))
        .storage(sink.clone() as Arc<dyn StorageSink>)
        .build()
        .expect("node should build");
    hub.register(addr(5541), node.event_sender());
    let handle = node.handle();
    let runner = thread::spawn(move || node.run());

    // While the backend is down, nothing is persisted but polling continues:
    // the buffer keeps accumulating whole cycles.
    assert!(
        wait_until(Duration::from_secs(5), || {
            handle.buffered_readings() >= 10
        }),
        "polling cadence must continue during the outage"
    );

    // After the scripted failures the backlog drains completely.
    assert!(
        wait_until(Duration::from_secs(10), || {
            sink.records_len() >= 15 && handle.buffered_readings() < 10
        }),
        "backlog should drain once storage recovers"
    );
    assert_eq!(sink.failures_total(), 3);

    // Failed attempts were spaced with non-shrinking (exponential) backoff.
    let times = sink.attempt_times();
    assert!(times.len() >= 4, "three failures plus at least one success");
    let gap0 = times[1].duration_since(times[0]);
    let gap1 = times[2].duration_since(times[1]);
    let gap2 = times[3].duration_since(times[2]);
    assert!(gap1 >= gap0, "backoff must not shrink while failing");
    assert!(gap2 >= gap1, "backoff must keep growing while failing");

    // Sequence numbers persisted gap-free despite the outage.
    let seqs = sink.node_seqs(1);
    for (i, seq) in seqs.iter().enumerate() {
        assert_eq!(*seq, i as u64 + 1, "gap-free sequence numbers");
    }

    handle.shutdown();
    runner
        .join()
        .expect("runner thread")
        .expect("run should return Ok");
}

#[test]
fn test_buffer_overflow_is_the_pressure_valve() {
    let hub = MemHub::new();
    let sink = Arc::new(MemorySink::new());
    // Backend down for a long time relative to the tiny buffer.
    sink.fail_next_submits(10_000);

    let mut cfg = NodeConfig::new(NodeId(1), addr(5542));
    cfg.seed = true;
    cfg.tick_interval = Duration::from_millis(10);
    cfg.hold_delay = Duration::from_millis(15);
    cfg.startup_grace = Duration::from_millis(20);
    cfg.buffer_capacity = 20;
    cfg.backoff_initial = Duration::from_millis(20);
    cfg.backoff_max = Duration::from_millis(100);

    let node = Node::builder(cfg)
        .transport(Arc::new(hub.transport_for(addr(5542))))
        .sensors(Box::new(SimulatedSensors::new()))
        .storage(sink.clone() as Arc<dyn StorageSink>)
        .build()
        .expect("node should build");
    hub.register(addr(5542), node.event_sender());
    let handle = node.handle();
    let runner = thread::spawn(move || node.run());

    // The buffer caps at capacity and keeps rolling forward: polling never
    // stops, the oldest readings are sacrificed.
    assert!(
        wait_until(Duration::from_secs(10), || {
            handle.buffered_readings() == 20
        }),
        "buffer should fill to capacity"
    );
    thread::sleep(Duration::from_millis(300));
    assert!(
        handle.buffered_readings() <= 20,
        "buffer never exceeds capacity"
    );
    assert_eq!(sink.records_len(), 0, "backend still down");

    handle.shutdown();
    runner
        .join()
        .expect("runner thread")
        .expect("run should return Ok");
}
