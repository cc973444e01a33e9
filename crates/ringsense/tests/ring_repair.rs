// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringsense contributors

#![allow(clippy::uninlined_format_args)] // Test code readability over pedantic

//! Crash, repair and regeneration scenarios.
//!
//! A node is "crashed" by killing its mesh address (all traffic to and from
//! it silently vanishes, like UDP to a powered-off board) and halting its
//! dispatch loop without a departure notice.

use ringsense::{
    MemHub, MemorySink, Node, NodeConfig, NodeHandle, NodeId, SimulatedSensors, StorageSink,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{}", port).parse().expect("valid address")
}

fn fast_config(id: u32, port: u16) -> NodeConfig {
    let mut cfg = NodeConfig::new(NodeId(id), addr(port));
    cfg.tick_interval = Duration::from_millis(10);
    cfg.hold_delay = Duration::from_millis(30);
    cfg.startup_grace = Duration::from_millis(50);
    cfg.heartbeat_interval = Duration::from_millis(40);
    cfg.token_loss_timeout = Duration::from_millis(300);
    cfg.probe_window = Duration::from_millis(60);
    cfg.relink_timeout = Duration::from_millis(100);
    cfg.backoff_initial = Duration::from_millis(10);
    cfg.backoff_max = Duration::from_millis(40);
    cfg
}

fn start_node(
    hub: &MemHub,
    sink: &Arc<MemorySink>,
    cfg: NodeConfig,
) -> (NodeHandle, thread::JoinHandle<ringsense::Result<()>>) {
    let bind = cfg.bind_addr;
    let node = Node::builder(cfg)
        .transport(Arc::new(hub.transport_for(bind)))
        .sensors(Box::new(SimulatedSensors::new()))
        .storage(Arc::clone(sink) as Arc<dyn StorageSink>)
        .build()
        .expect("node should build");
    hub.register(bind, node.event_sender());
    let handle = node.handle();
    let runner = thread::spawn(move || node.run());
    (handle, runner)
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
fn test_crash_repairs_ring_and_regenerates_epoch() {
    let hub = MemHub::new();
    let sink = Arc::new(MemorySink::new());

    // Build the ring A(1) -> B(2) -> C(3) -> A deterministically: B joins
    // through A, C joins through B (inserted between B and its successor A).
    let mut cfg_a = fast_config(1, 5521);
    cfg_a.seed = true;
    let (a, run_a) = start_node(&hub, &sink, cfg_a);

    let mut cfg_b = fast_config(2, 5522);
    cfg_b.bootstrap = Some(addr(5521));
    let (b, run_b) = start_node(&hub, &sink, cfg_b);
    assert!(
        wait_until(Duration::from_secs(5), || {
            a.ring_view().successor.id == NodeId(2)
                && b.ring_view().successor.id == NodeId(1)
        }),
        "two-node ring should form"
    );

    let mut cfg_c = fast_config(3, 5523);
    cfg_c.bootstrap = Some(addr(5522));
    let (c, run_c) = start_node(&hub, &sink, cfg_c);
    assert!(
        wait_until(Duration::from_secs(5), || {
            b.ring_view().successor.id == NodeId(3)
                && a.ring_view().predecessor.id == NodeId(3)
        }),
        "three-node ring should form"
    );

    // Let every node uplink at least one full cycle at epoch 0.
    assert!(
        wait_until(Duration::from_secs(10), || {
            (1..=3).all(|n| !sink.node_seqs(n).is_empty())
        }),
        "all nodes should produce readings before the crash"
    );
    let a_before = sink.node_seqs(1).len();
    let c_before = sink.node_seqs(3).len();

    // Crash B. The next token pass into B vanishes, so the ring loses the
    // token; A and C detect the dead neighbor by lease expiry and relink.
    hub.kill(addr(5522));
    b.halt();
    run_b
        .join()
        .expect("runner thread")
        .expect("halt still returns Ok");

    assert!(
        wait_until(Duration::from_secs(10), || {
            a.ring_view().successor.id == NodeId(3)
                && c.ring_view().predecessor.id == NodeId(1)
        }),
        "survivors should relink A -> C -> A"
    );

    // The lower live id (A) regenerates: epoch strictly increases.
    assert!(
        wait_until(Duration::from_secs(10), || {
            a.last_epoch().is_some_and(|e| e >= 1)
                && c.last_epoch().is_some_and(|e| e >= 1)
        }),
        "token should be regenerated at a higher epoch"
    );

    // Circulation resumed: both survivors keep producing, and nothing that
    // was already uplinked went missing.
    assert!(
        wait_until(Duration::from_secs(10), || {
            sink.node_seqs(1).len() > a_before && sink.node_seqs(3).len() > c_before
        }),
        "survivors should keep producing after repair"
    );
    assert!(sink.node_seqs(1).len() >= a_before, "no uplinked reading lost");
    assert!(sink.node_seqs(3).len() >= c_before, "no uplinked reading lost");

    a.shutdown();
    c.shutdown();
    for runner in [run_a, run_c] {
        runner
            .join()
            .expect("runner thread")
            .expect("run should return Ok");
    }
}

#[test]
fn test_crashed_seed_leaves_survivor_operational() {
    let hub = MemHub::new();
    let sink = Arc::new(MemorySink::new());

    let mut cfg_a = fast_config(1, 5531);
    cfg_a.seed = true;
    let (a, run_a) = start_node(&hub, &sink, cfg_a);

    let mut cfg_b = fast_config(2, 5532);
    cfg_b.bootstrap = Some(addr(5531));
    let (b, run_b) = start_node(&hub, &sink, cfg_b);
    assert!(
        wait_until(Duration::from_secs(5), || {
            a.ring_view().successor.id == NodeId(2)
        }),
        "two-node ring should form"
    );
    assert!(
        wait_until(Duration::from_secs(5), || !sink.node_seqs(2).is_empty()),
        "joined node should produce readings"
    );

    // Crash the seed. The survivor must self-loop and regenerate the token
    // itself - seeding only matters for a fresh ring, not for recovery.
    hub.kill(addr(5531));
    a.halt();
    run_a
        .join()
        .expect("runner thread")
        .expect("halt still returns Ok");

    assert!(
        wait_until(Duration::from_secs(10), || b.ring_view().is_self_loop()),
        "survivor should self-loop"
    );
    let before = sink.node_seqs(2).len();
    assert!(
        wait_until(Duration::from_secs(10), || {
            sink.node_seqs(2).len() > before
        }),
        "survivor should keep polling alone"
    );
    assert!(
        b.last_epoch().is_some_and(|e| e >= 1),
        "survivor regenerated at a higher epoch"
    );

    b.shutdown();
    run_b
        .join()
        .expect("runner thread")
        .expect("run should return Ok");
}
