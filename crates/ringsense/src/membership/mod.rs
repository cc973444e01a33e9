// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 ringsense contributors

//! Ring membership: local predecessor/successor pointers, join handshake,
//! failure detection and repair.
//!
//! The full ring is never materialized. Each node owns exactly two pointers
//! and publishes them through an `ArcSwap` snapshot for the token coordinator
//! and the heartbeat announcer. Stable rings satisfy
//! `successor(predecessor(n)) == n`; the invariant may be transiently violated
//! while a repair or insertion handshake is in flight.

use crate::config::{NodeConfig, JOIN_MAX_ATTEMPTS, JOIN_RETRY_MS};
use crate::protocol::{
    Message, NodeId, Peer, REJECT_DUPLICATE_ID, REJECT_NOT_READY,
};
use crate::transport::Transport;
use arc_swap::ArcSwap;
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

mod heartbeat;
mod lease;

pub use heartbeat::HeartbeatAnnouncer;
pub use lease::LeaseTable;

/// This node's view of the ring: its own two pointers, nothing more.
///
/// A self-loop (both pointers referring to the owning node) is a valid
/// one-node ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingView {
    pub node: NodeId,
    pub predecessor: Peer,
    pub successor: Peer,
}

impl RingView {
    /// Fresh one-node ring.
    pub fn self_loop(me: Peer) -> Self {
        Self {
            node: me.id,
            predecessor: me,
            successor: me,
        }
    }

    pub fn is_self_loop(&self) -> bool {
        self.successor.id == self.node
    }
}

/// Where this node stands in the insertion handshake.
#[derive(Debug, Clone, Copy)]
enum JoinState {
    /// Stable member (a self-loop counts).
    Member,
    /// `JoinRequest` sent, waiting for the insertion point.
    AwaitingAccept { since: Instant, attempts: u32 },
    /// Insertion point known, waiting for both relink acks.
    Relinking {
        pred: Peer,
        succ: Peer,
        pred_acked: bool,
        succ_acked: bool,
        since: Instant,
        attempts: u32,
    },
}

/// Which neighbor pointer a repair is rebuilding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RepairSide {
    Successor,
    Predecessor,
}

/// One in-flight skip-dead relink.
#[derive(Debug)]
struct Repair {
    dead: NodeId,
    candidates: VecDeque<Peer>,
    awaiting: Option<(Peer, Instant)>,
}

/// Ring membership manager. All methods run on the node's dispatch thread.
pub struct MembershipManager {
    node: NodeId,
    self_peer: Peer,
    transport: Arc<dyn Transport>,
    ring: Arc<ArcSwap<RingView>>,
    view: RingView,
    /// Known fleet roster (id -> address), excluding self. Seeded from config,
    /// refreshed by heartbeats and join requests.
    roster: BTreeMap<NodeId, SocketAddr>,
    lease: LeaseTable,
    join: JoinState,
    repair_succ: Option<Repair>,
    repair_pred: Option<Repair>,
    bootstrap: Option<SocketAddr>,
    join_retry: Duration,
    relink_timeout: Duration,
}

impl MembershipManager {
    pub fn new(cfg: &NodeConfig, transport: Arc<dyn Transport>) -> Self {
        let self_peer = Peer::new(cfg.node_id, transport.local_addr());
        let view = RingView::self_loop(self_peer);
        let ring = Arc::new(ArcSwap::from_pointee(view.clone()));

        let mut roster = BTreeMap::new();
        for peer in &cfg.peers {
            roster.insert(peer.id, peer.addr);
        }

        Self {
            node: cfg.node_id,
            self_peer,
            transport,
            ring,
            view,
            roster,
            lease: LeaseTable::new(cfg.lease_duration()),
            join: JoinState::Member,
            repair_succ: None,
            repair_pred: None,
            bootstrap: cfg.bootstrap,
            join_retry: Duration::from_millis(JOIN_RETRY_MS),
            relink_timeout: cfg.relink_timeout,
        }
    }

    /// Shared ring snapshot handle (coordinator, heartbeat thread, tests).
    pub fn ring_handle(&self) -> Arc<ArcSwap<RingView>> {
        Arc::clone(&self.ring)
    }

    /// Current view (clone of the local state, not the published snapshot).
    pub fn view(&self) -> RingView {
        self.view.clone()
    }

    pub fn is_member(&self) -> bool {
        matches!(self.join, JoinState::Member)
    }

    /// Roster snapshot for the regeneration probe round.
    pub fn peer_addrs(&self) -> Vec<(NodeId, SocketAddr)> {
        self.roster.iter().map(|(&id, &addr)| (id, addr)).collect()
    }

    /// Begin membership: contact the bootstrap or start a fresh self-loop.
    pub fn start(&mut self) {
        match self.bootstrap {
            Some(boot) => {
                log::info!(
                    "[membership] node={} joining via bootstrap {}",
                    self.node,
                    boot
                );
                self.send(
                    boot,
                    &Message::JoinRequest {
                        candidate: self.self_peer,
                    },
                );
                self.join = JoinState::AwaitingAccept {
                    since: Instant::now(),
                    attempts: 1,
                };
            }
            None => {
                log::info!("[membership] node={} starting self-loop ring", self.node);
                self.publish();
            }
        }
    }

    /// Handle one inbound membership message.
    pub fn handle_message(&mut self, msg: &Message, from: SocketAddr) {
        match msg {
            Message::Heartbeat { from: id } => self.on_heartbeat(*id, from),
            Message::JoinRequest { candidate } => self.on_join_request(*candidate),
            Message::JoinAccept { pred, succ } => self.on_join_accept(*pred, *succ),
            Message::JoinReject { reason } => {
                log::warn!(
                    "[membership] node={} join rejected reason={}",
                    self.node,
                    reason
                );
            }
            Message::SetSuccessor { from: peer } => {
                self.apply_successor(*peer);
                self.send(peer.addr, &Message::RelinkAck { from: self.node });
            }
            Message::SetPredecessor { from: peer } => {
                self.apply_predecessor(*peer);
                self.send(peer.addr, &Message::RelinkAck { from: self.node });
            }
            Message::RelinkAck { from: id } => self.on_relink_ack(*id),
            Message::Probe { from: id } => {
                log::debug!("[membership] probe from node={}", id);
                self.send(from, &Message::ProbeAck { from: self.node });
            }
            Message::Leave { from: id } => self.on_leave(*id),
            // Token and ProbeAck are routed to the coordinator by the node.
            Message::Token { .. } | Message::ProbeAck { .. } => {}
        }
    }

    /// Periodic maintenance: join retries, repair timeouts, lease expiry.
    pub fn on_tick(&mut self, now: Instant) {
        self.tick_join(now);
        self.tick_repair(now, RepairSide::Successor);
        self.tick_repair(now, RepairSide::Predecessor);

        for dead in self.lease.expired(now) {
            if dead == self.view.successor.id || dead == self.view.predecessor.id {
                log::warn!(
                    "[membership] node={} neighbor {} lease expired",
                    self.node,
                    dead
                );
                self.start_repair(dead);
            }
        }
    }

    /// A token arrived from `from`; refresh the predecessor's lease if it was
    /// the sender (token passes count as liveness, like heartbeats).
    pub fn note_token_from(&mut self, from: SocketAddr) {
        if from == self.view.predecessor.addr && self.view.predecessor.id != self.node {
            self.lease.observe(self.view.predecessor.id, Instant::now());
        }
    }

    /// The coordinator observed a deterministic send failure toward `dead`:
    /// start repair immediately instead of waiting for the lease path.
    pub fn force_expire(&mut self, dead: NodeId) {
        log::warn!(
            "[membership] node={} forcing repair of {} after send failure",
            self.node,
            dead
        );
        self.lease.forget(dead);
        self.start_repair(dead);
    }

    /// Graceful departure: tell both neighbors to repair around us now.
    pub fn announce_leave(&self) {
        let leave = Message::Leave { from: self.node };
        for neighbor in [self.view.predecessor, self.view.successor] {
            if neighbor.id != self.node {
                self.send(neighbor.addr, &leave);
            }
        }
    }

    // ===== Join handshake =====

    fn on_join_request(&mut self, candidate: Peer) {
        if candidate.id == self.node {
            self.send(
                candidate.addr,
                &Message::JoinReject {
                    reason: REJECT_DUPLICATE_ID,
                },
            );
            return;
        }
        if !matches!(self.join, JoinState::Member) {
            self.send(
                candidate.addr,
                &Message::JoinReject {
                    reason: REJECT_NOT_READY,
                },
            );
            return;
        }
        if candidate.id == self.view.successor.id || candidate.id == self.view.predecessor.id {
            self.send(
                candidate.addr,
                &Message::JoinReject {
                    reason: REJECT_DUPLICATE_ID,
                },
            );
            return;
        }

        // Insertion point: between us and our current successor. The
        // candidate drives the two relinks; we only answer.
        log::info!(
            "[membership] node={} accepting join of {} between {} and {}",
            self.node,
            candidate.id,
            self.node,
            self.view.successor.id
        );
        self.roster.insert(candidate.id, candidate.addr);
        self.send(
            candidate.addr,
            &Message::JoinAccept {
                pred: self.self_peer,
                succ: self.view.successor,
            },
        );
    }

    fn on_join_accept(&mut self, pred: Peer, succ: Peer) {
        if !matches!(self.join, JoinState::AwaitingAccept { .. }) {
            log::debug!("[membership] unexpected JoinAccept ignored");
            return;
        }

        log::info!(
            "[membership] node={} insertion point pred={} succ={}",
            self.node,
            pred.id,
            succ.id
        );
        self.roster.insert(pred.id, pred.addr);
        if succ.id != self.node {
            self.roster.insert(succ.id, succ.addr);
        }

        // Adopt pointers locally; publish only after both acks so observers
        // never see a half-linked insertion.
        self.view.predecessor = pred;
        self.view.successor = succ;
        self.send(pred.addr, &Message::SetSuccessor { from: self.self_peer });
        self.send(
            succ.addr,
            &Message::SetPredecessor {
                from: self.self_peer,
            },
        );
        self.join = JoinState::Relinking {
            pred,
            succ,
            pred_acked: false,
            succ_acked: false,
            since: Instant::now(),
            attempts: 1,
        };
    }

    fn on_relink_ack(&mut self, from: NodeId) {
        // Repairs first: a joining node is never repairing.
        let succ_candidate = self
            .repair_succ
            .as_ref()
            .and_then(|r| r.awaiting)
            .map(|(c, _)| c)
            .filter(|c| c.id == from);
        if let Some(candidate) = succ_candidate {
            self.repair_succ = None;
            self.view.successor = candidate;
            self.lease.observe(candidate.id, Instant::now());
            self.publish();
            log::info!(
                "[membership] node={} ring repaired successor={}",
                self.node,
                candidate.id
            );
            return;
        }
        let pred_candidate = self
            .repair_pred
            .as_ref()
            .and_then(|r| r.awaiting)
            .map(|(c, _)| c)
            .filter(|c| c.id == from);
        if let Some(candidate) = pred_candidate {
            self.repair_pred = None;
            self.view.predecessor = candidate;
            self.lease.observe(candidate.id, Instant::now());
            self.publish();
            log::info!(
                "[membership] node={} ring repaired predecessor={}",
                self.node,
                candidate.id
            );
            return;
        }

        if let JoinState::Relinking {
            pred,
            succ,
            pred_acked,
            succ_acked,
            since,
            attempts,
        } = self.join
        {
            let mut pred_acked = pred_acked;
            let mut succ_acked = succ_acked;
            if !pred_acked && from == pred.id {
                pred_acked = true;
            } else if !succ_acked && from == succ.id {
                succ_acked = true;
            }

            if pred_acked && succ_acked {
                self.join = JoinState::Member;
                self.lease.observe(pred.id, Instant::now());
                self.lease.observe(succ.id, Instant::now());
                self.publish();
                log::info!(
                    "[membership] node={} joined ring pred={} succ={}",
                    self.node,
                    pred.id,
                    succ.id
                );
            } else {
                self.join = JoinState::Relinking {
                    pred,
                    succ,
                    pred_acked,
                    succ_acked,
                    since,
                    attempts,
                };
            }
        }
    }

    fn tick_join(&mut self, now: Instant) {
        match self.join {
            JoinState::AwaitingAccept { since, attempts } => {
                if now.duration_since(since) < self.join_retry {
                    return;
                }
                if attempts >= JOIN_MAX_ATTEMPTS {
                    log::warn!(
                        "[membership] node={} bootstrap unreachable after {} attempts, starting self-loop ring",
                        self.node,
                        attempts
                    );
                    self.join = JoinState::Member;
                    self.publish();
                    return;
                }
                if let Some(boot) = self.bootstrap {
                    log::debug!(
                        "[membership] node={} retrying join attempt={}",
                        self.node,
                        attempts + 1
                    );
                    self.send(
                        boot,
                        &Message::JoinRequest {
                            candidate: self.self_peer,
                        },
                    );
                }
                self.join = JoinState::AwaitingAccept {
                    since: now,
                    attempts: attempts + 1,
                };
            }
            JoinState::Relinking {
                pred,
                succ,
                pred_acked,
                succ_acked,
                since,
                attempts,
            } => {
                if now.duration_since(since) < self.relink_timeout {
                    return;
                }
                if attempts >= JOIN_MAX_ATTEMPTS {
                    log::warn!(
                        "[membership] node={} relink failed, restarting join",
                        self.node
                    );
                    self.view = RingView::self_loop(self.self_peer);
                    self.join = JoinState::Member;
                    self.publish();
                    self.start();
                    return;
                }
                if !pred_acked {
                    self.send(pred.addr, &Message::SetSuccessor { from: self.self_peer });
                }
                if !succ_acked {
                    self.send(
                        succ.addr,
                        &Message::SetPredecessor {
                            from: self.self_peer,
                        },
                    );
                }
                self.join = JoinState::Relinking {
                    pred,
                    succ,
                    pred_acked,
                    succ_acked,
                    since: now,
                    attempts: attempts + 1,
                };
            }
            JoinState::Member => {}
        }
    }

    // ===== Pointer updates =====

    fn apply_successor(&mut self, peer: Peer) {
        log::debug!(
            "[membership] node={} successor {} -> {}",
            self.node,
            self.view.successor.id,
            peer.id
        );
        self.roster.insert(peer.id, peer.addr);
        self.view.successor = peer;
        self.lease.observe(peer.id, Instant::now());
        // An inbound relink supersedes whatever repair was rebuilding this side.
        self.repair_succ = None;
        self.publish();
    }

    fn apply_predecessor(&mut self, peer: Peer) {
        log::debug!(
            "[membership] node={} predecessor {} -> {}",
            self.node,
            self.view.predecessor.id,
            peer.id
        );
        self.roster.insert(peer.id, peer.addr);
        self.view.predecessor = peer;
        self.lease.observe(peer.id, Instant::now());
        self.repair_pred = None;
        self.publish();
    }

    // ===== Failure handling =====

    fn on_heartbeat(&mut self, id: NodeId, from: SocketAddr) {
        self.roster.insert(id, from);
        if id == self.view.predecessor.id || id == self.view.successor.id {
            self.lease.observe(id, Instant::now());
        }
    }

    fn on_leave(&mut self, id: NodeId) {
        log::info!("[membership] node={} peer {} left the ring", self.node, id);
        self.roster.remove(&id);
        self.lease.forget(id);
        if id == self.view.successor.id || id == self.view.predecessor.id {
            self.start_repair(id);
        }
    }

    fn start_repair(&mut self, dead: NodeId) {
        if dead == self.node {
            return;
        }
        let succ_dead = dead == self.view.successor.id;
        let pred_dead = dead == self.view.predecessor.id;
        if !succ_dead && !pred_dead {
            return;
        }
        self.roster.remove(&dead);
        self.lease.forget(dead);

        // Two-node ring losing its other member degenerates to a self-loop.
        if succ_dead && pred_dead {
            log::warn!(
                "[membership] node={} ring degenerated to self-loop",
                self.node
            );
            self.view = RingView::self_loop(self.self_peer);
            self.repair_succ = None;
            self.repair_pred = None;
            self.publish();
            return;
        }

        if succ_dead && self.repair_succ.is_none() {
            self.repair_succ = Some(Repair {
                dead,
                candidates: self.candidates_after(dead),
                awaiting: None,
            });
            self.advance_repair(Instant::now(), RepairSide::Successor);
        }
        if pred_dead && self.repair_pred.is_none() {
            self.repair_pred = Some(Repair {
                dead,
                candidates: self.candidates_before(dead),
                awaiting: None,
            });
            self.advance_repair(Instant::now(), RepairSide::Predecessor);
        }
    }

    /// Roster walk outward from the dead successor: ascending ids after
    /// `dead`, wrapping, self and dead excluded.
    fn candidates_after(&self, dead: NodeId) -> VecDeque<Peer> {
        let mut after: VecDeque<Peer> = VecDeque::new();
        for (&id, &addr) in self.roster.range((
            std::ops::Bound::Excluded(dead),
            std::ops::Bound::Unbounded,
        )) {
            if id != self.node {
                after.push_back(Peer::new(id, addr));
            }
        }
        for (&id, &addr) in self.roster.range(..dead) {
            if id != self.node {
                after.push_back(Peer::new(id, addr));
            }
        }
        after
    }

    /// Mirror walk for a dead predecessor: descending ids before `dead`.
    fn candidates_before(&self, dead: NodeId) -> VecDeque<Peer> {
        let mut before: VecDeque<Peer> = VecDeque::new();
        for (&id, &addr) in self.roster.range(..dead).rev() {
            if id != self.node {
                before.push_back(Peer::new(id, addr));
            }
        }
        for (&id, &addr) in self
            .roster
            .range((std::ops::Bound::Excluded(dead), std::ops::Bound::Unbounded))
            .rev()
        {
            if id != self.node {
                before.push_back(Peer::new(id, addr));
            }
        }
        before
    }

    fn tick_repair(&mut self, now: Instant, side: RepairSide) {
        let timed_out = {
            let repair = match side {
                RepairSide::Successor => self.repair_succ.as_ref(),
                RepairSide::Predecessor => self.repair_pred.as_ref(),
            };
            match repair {
                Some(Repair {
                    awaiting: Some((_, sent_at)),
                    ..
                }) => now.duration_since(*sent_at) >= self.relink_timeout,
                _ => false,
            }
        };
        if timed_out {
            self.advance_repair(now, side);
        }
    }

    /// Try the next relink candidate, or self-loop when the walk is exhausted.
    fn advance_repair(&mut self, now: Instant, side: RepairSide) {
        let step = {
            let repair = match side {
                RepairSide::Successor => self.repair_succ.as_mut(),
                RepairSide::Predecessor => self.repair_pred.as_mut(),
            };
            let Some(repair) = repair else { return };
            match repair.candidates.pop_front() {
                Some(candidate) => {
                    repair.awaiting = Some((candidate, now));
                    Some((repair.dead, candidate))
                }
                None => None,
            }
        };

        match step {
            Some((dead, candidate)) => {
                log::info!(
                    "[membership] node={} relinking {:?} around dead {} via {}",
                    self.node,
                    side,
                    dead,
                    candidate.id
                );
                let msg = match side {
                    // "I am your new predecessor" - the candidate becomes our
                    // successor once it acks.
                    RepairSide::Successor => Message::SetPredecessor {
                        from: self.self_peer,
                    },
                    RepairSide::Predecessor => Message::SetSuccessor {
                        from: self.self_peer,
                    },
                };
                self.send(candidate.addr, &msg);
            }
            None => {
                log::warn!(
                    "[membership] node={} no live peer found, ring degenerates to self-loop",
                    self.node
                );
                self.view = RingView::self_loop(self.self_peer);
                self.repair_succ = None;
                self.repair_pred = None;
                self.publish();
            }
        }
    }

    // ===== Internals =====

    fn publish(&mut self) {
        self.ring.store(Arc::new(self.view.clone()));
        // Seed leases for the (possibly new) neighbors so a neighbor that
        // never speaks still expires.
        let now = Instant::now();
        for neighbor in [self.view.predecessor, self.view.successor] {
            if neighbor.id != self.node {
                self.lease.observe(neighbor.id, now);
            }
        }
    }

    fn send(&self, to: SocketAddr, msg: &Message) {
        if let Err(err) = self.transport.send(to, msg) {
            // Metatraffic is best-effort; timeouts drive recovery.
            log::debug!(
                "[membership] send {} -> {} failed: {}",
                msg.kind_str(),
                to,
                err
            );
        }
    }
}

// ===== Tests =====
