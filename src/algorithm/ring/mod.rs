//! Ring (Chord-family) routing algorithm.
//!
//! Keeps a successor list for correctness and a finger table for
//! logarithmic hop counts. Lookups converge on the target's predecessor;
//! [RingAlgorithm::adjust_root] then corrects the final hop to the owner,
//! which is the first node at or after the target on the ring.
//!
//! Joining is lazy by default: a fresh node learns its contact and lets
//! stabilization converge the tables. With `aggressive_join` enabled the
//! node resolves every finger slot through the overlay at join time and
//! pushes itself into the tables of the nodes that should point at it.
//! Aggressive join assumes one node joins at a time.

mod finger_table;
mod successor_list;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::common::{Distance, Id, NodeReference, Tag};
use crate::config::Config;
use crate::proto::{Ack, FingerUpdate, PingRequest, SuccessorReply, SuccessorRequest};
use crate::transport::{adaptive_timeout, Handler, Transport};
use crate::{Error, Result};

use finger_table::FingerTable;
use successor_list::SuccessorList;

use super::{RouteResolver, RoutingAlgorithm, RoutingContext};

/// Every how many stabilization rounds the predecessor gets pinged.
const PREDECESSOR_PING_INTERVAL: u64 = 3;

struct RingState {
    successors: SuccessorList,
    fingers: FingerTable,
    /// Closest known node preceding self on the ring; self when unknown.
    predecessor: NodeReference,
}

struct Shared {
    self_ref: NodeReference,
    self_id: Id,
    learn_from_all_traffic: bool,
    request_timeout: Duration,
    state: RwLock<RingState>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    suspended: AtomicBool,
    stopped: AtomicBool,
    rounds: AtomicU64,
}

pub struct RingAlgorithm {
    shared: Arc<Shared>,
    aggressive_join: bool,
    root_candidates_len: usize,
}

impl RingAlgorithm {
    pub fn new(self_ref: NodeReference, config: &Config) -> Result<RingAlgorithm> {
        let self_ref = match self_ref.id() {
            Some(_) => self_ref,
            None => self_ref.with_hashed_id(config.id_size),
        };
        let self_id = self_ref
            .id()
            .cloned()
            .ok_or(Error::JoinFailed("node reference has neither id nor address"))?;
        if self_id.size() != config.id_size {
            return Err(Error::InvalidIdSize {
                expected: config.id_size,
                got: self_id.size(),
            });
        }

        let state = RingState {
            successors: SuccessorList::new(self_ref.clone(), config.successor_list_len),
            fingers: FingerTable::new(self_ref.clone(), self_id.clone()),
            predecessor: self_ref.clone(),
        };

        Ok(RingAlgorithm {
            shared: Arc::new(Shared {
                self_ref,
                self_id,
                learn_from_all_traffic: config.learn_from_all_traffic,
                request_timeout: config.request_timeout,
                state: RwLock::new(state),
                transport: RwLock::new(None),
                suspended: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                rounds: AtomicU64::new(0),
            }),
            aggressive_join: config.aggressive_join,
            root_candidates_len: config.join_root_candidates.max(1),
        })
    }

    // === Getters (used by tests and by the owning node) ===

    pub fn successor(&self) -> NodeReference {
        self.shared.read_state().successors.first().clone()
    }

    pub fn predecessor(&self) -> NodeReference {
        self.shared.read_state().predecessor.clone()
    }

    pub fn successor_list(&self) -> Vec<NodeReference> {
        self.shared.read_state().successors.nodes()
    }
}

impl Shared {
    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, RingState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, RingState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Record a live node in both routing structures, regardless of the
    /// `learn_from_all_traffic` gate. Control-protocol paths call this
    /// directly; passive observation goes through `touch`.
    fn learn(&self, node: &NodeReference) -> bool {
        let Some(id) = node.id() else {
            return false;
        };
        if id == &self.self_id {
            return false;
        }
        // Ids from a different identifier space cannot be placed on this ring.
        if id.size() != self.self_id.size() {
            trace!(node = ?node, "node from a foreign identifier space ignored");
            return false;
        }

        let mut state = self.write_state();
        let added = state.successors.add(node);
        let improved = state.fingers.update(node);
        let tightened = Shared::adopt_predecessor(&mut state, &self.self_id, node);

        if added || improved || tightened {
            trace!(node = ?node, added, improved, tightened, "learned node");
        }
        added || improved || tightened
    }

    /// Adopt `node` as predecessor when it precedes self more closely than
    /// the current predecessor does.
    fn adopt_predecessor(state: &mut RingState, self_id: &Id, node: &NodeReference) -> bool {
        let Some(id) = node.id() else {
            return false;
        };
        if id == self_id {
            return false;
        }

        let candidate = self_id.distance(id);
        let current = match state.predecessor.id() {
            Some(cur) if cur != self_id => self_id.distance(cur),
            _ => Distance::full(self_id.size()),
        };

        if candidate < current {
            debug!(predecessor = ?node, "predecessor tightened");
            state.predecessor = node.clone();
            return true;
        }
        false
    }

    fn forget(&self, node: &NodeReference) {
        let mut state = self.write_state();
        let removed = state.successors.remove(node);
        let reset = state.fingers.forget(node);
        if state.predecessor == *node {
            state.predecessor = self.self_ref.clone();
        }
        if removed || reset {
            debug!(node = ?node, "forgot dead node");
        }
    }
}

impl RoutingAlgorithm for RingAlgorithm {
    fn closest_to(
        &self,
        target: &Id,
        max_num: usize,
        _ctx: &RoutingContext,
    ) -> Vec<NodeReference> {
        let shared = &self.shared;
        let bound = target.distance(&shared.self_id);
        let state = shared.read_state();

        // Fingers whose span stays inside the arc from self to the target
        // cannot overshoot it; scan them highest-span first.
        let mut candidates: Vec<NodeReference> = state
            .fingers
            .populated()
            .filter(|(exp, _)| Distance::pow2(*exp, shared.self_id.size()) <= bound)
            .map(|(_, node)| node.clone())
            .collect();
        candidates.extend(state.successors.nodes());
        drop(state);

        candidates.retain(|n| n.id().is_some());
        candidates.sort_by_key(|n| {
            n.id()
                .map(|id| target.distance(id))
                .unwrap_or_else(|| Distance::full(target.size()))
        });
        candidates.dedup_by(|a, b| a.id() == b.id());
        candidates.truncate(max_num);
        candidates
    }

    fn root_candidates(&self, target: &Id, max_num: usize) -> Vec<NodeReference> {
        let state = self.shared.read_state();

        let mut candidates = state.successors.nodes();
        candidates.push(state.predecessor.clone());
        drop(state);

        candidates.retain(|n| n.id().is_some());
        // The owner is the first node at or after the target, so sort by
        // how far each candidate sits past it.
        candidates.sort_by_key(|n| {
            n.id()
                .map(|id| id.distance(target))
                .unwrap_or_else(|| Distance::full(target.size()))
        });
        candidates.dedup_by(|a, b| a.id() == b.id());
        candidates.truncate(max_num);
        candidates
    }

    fn adjust_root(&self, target: &Id) -> Option<Vec<NodeReference>> {
        let roots = self.root_candidates(target, self.root_candidates_len);
        match roots.first() {
            Some(first) if first.id() == Some(&self.shared.self_id) => None,
            _ => Some(roots),
        }
    }

    fn initial_context(&self, _target: &Id) -> RoutingContext {
        RoutingContext::None
    }

    fn advance_context(&self, ctx: &RoutingContext, _hop: &NodeReference) -> RoutingContext {
        ctx.clone()
    }

    fn distance(&self, target: &Id, node: &NodeReference) -> Option<Distance> {
        node.id().map(|id| target.distance(id))
    }

    fn join(&self, neighbors: &[NodeReference]) {
        for node in neighbors {
            self.shared.learn(node);
        }
    }

    fn join_via(&self, resolver: &dyn RouteResolver) -> Result<()> {
        if !self.aggressive_join {
            return Ok(());
        }

        let shared = &self.shared;
        let bits = shared.self_id.bits();

        // Resolve the owner of every finger target in one multi-target
        // lookup and pin the slots.
        let finger_targets: Vec<Id> = (0..bits).map(|exp| shared.self_id.add_pow2(exp)).collect();
        let resolved = resolver.route_to_root(&finger_targets, 1)?;
        {
            let mut state = shared.write_state();
            for (exp, result) in resolved.iter().enumerate() {
                let Some(root) = result.as_ref().and_then(|r| r.root()) else {
                    debug!(exp, "finger target unresolved at join, left to stabilization");
                    continue;
                };
                if root.id() == Some(&shared.self_id) {
                    continue;
                }
                state.fingers.set(exp, root.clone());
                state.successors.add(root);
                Shared::adopt_predecessor(&mut state, &shared.self_id, root);
            }
        }

        // Tell the nodes whose finger slot `exp` should now point at us:
        // those are the owners of `self − 2^exp`.
        let transport = shared.transport().ok_or(Error::NotRunning)?;
        let update_targets: Vec<Id> = (0..bits).map(|exp| shared.self_id.sub_pow2(exp)).collect();
        let owners = resolver.route_to_root(&update_targets, 1)?;
        for (exp, result) in owners.iter().enumerate() {
            let Some(addr) = result
                .as_ref()
                .and_then(|r| r.root())
                .filter(|root| root.id() != Some(&shared.self_id))
                .and_then(|root| root.addr())
            else {
                continue;
            };

            let update = FingerUpdate {
                node: shared.self_ref.clone(),
                index: exp as u32,
            };
            let timeout = adaptive_timeout(transport.as_ref(), addr, shared.request_timeout);
            match transport.send_and_receive(
                addr,
                update.to_envelope(shared.self_ref.clone()),
                timeout,
            ) {
                Ok(reply) if reply.tag == Tag::AckFingerTable => {}
                Ok(reply) => warn!(?addr, got = ?reply.tag, "unexpected finger update reply"),
                Err(error) => debug!(?addr, %error, "finger update not delivered"),
            }
        }

        Ok(())
    }

    fn notify_join(
        &self,
        joining: &NodeReference,
        last_hop: Option<&NodeReference>,
        is_root: bool,
    ) {
        self.shared.learn(joining);
        if let Some(hop) = last_hop {
            self.shared.learn(hop);
        }
        if is_root {
            let shared = &self.shared;
            let mut state = shared.write_state();
            Shared::adopt_predecessor(&mut state, &shared.self_id, joining);
        }
    }

    fn touch(&self, node: &NodeReference) {
        if self.shared.learn_from_all_traffic {
            self.shared.learn(node);
        }
    }

    fn forget(&self, node: &NodeReference) {
        self.shared.forget(node);
    }

    fn to_replace(&self, existing: &NodeReference, candidate: &NodeReference) -> bool {
        match (existing.id(), candidate.id()) {
            (Some(old), Some(new)) => {
                new.distance(&self.shared.self_id) < old.distance(&self.shared.self_id)
            }
            (None, Some(_)) => true,
            _ => false,
        }
    }

    fn attach(&self, transport: &Arc<dyn Transport>) {
        *self
            .shared
            .transport
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(transport.clone());

        transport.register_handler(
            Tag::ReqSuccessor,
            Arc::new(SuccessorHandler {
                shared: self.shared.clone(),
            }),
        );
        transport.register_handler(
            Tag::UpdateFingerTable,
            Arc::new(FingerUpdateHandler {
                shared: self.shared.clone(),
            }),
        );
    }

    fn stabilize_once(&self, timeout: Duration) -> bool {
        let shared = &self.shared;
        if shared.stopped.load(Ordering::SeqCst) || shared.suspended.load(Ordering::SeqCst) {
            return false;
        }
        let Some(transport) = shared.transport() else {
            return false;
        };

        let mut changed = false;

        // Ask the closest live successor for its successor list and its
        // predecessor; dead successors are dropped and the next one tried.
        loop {
            let successor = shared.read_state().successors.first().clone();
            if successor.id() == Some(&shared.self_id) {
                break;
            }
            let Some(addr) = successor.addr() else {
                shared.forget(&successor);
                changed = true;
                continue;
            };

            let request = SuccessorRequest.to_envelope(shared.self_ref.clone());
            let effective = adaptive_timeout(transport.as_ref(), addr, timeout);
            match transport
                .send_and_receive(addr, request, effective)
                .and_then(|reply| SuccessorReply::from_envelope(&reply))
            {
                Ok(reply) => {
                    for node in &reply.successors {
                        changed |= shared.learn(node);
                    }
                    // The successor's predecessor may sit between us and it.
                    changed |= shared.learn(&reply.predecessor);
                    break;
                }
                Err(error) => {
                    debug!(successor = ?successor, %error, "successor unresponsive");
                    shared.forget(&successor);
                    changed = true;
                }
            }
        }

        // Ping the predecessor at a reduced cadence; drop it when dead so
        // adjust-last-hop never redirects to a corpse.
        let round = shared.rounds.fetch_add(1, Ordering::SeqCst);
        if round % PREDECESSOR_PING_INTERVAL == 0 {
            let predecessor = shared.read_state().predecessor.clone();
            if predecessor.id() != Some(&shared.self_id) {
                if let Some(addr) = predecessor.addr() {
                    let ping = PingRequest.to_envelope(shared.self_ref.clone());
                    let effective = adaptive_timeout(transport.as_ref(), addr, timeout);
                    match transport.send_and_receive(addr, ping, effective) {
                        Ok(reply) if reply.tag == Tag::Ack => {}
                        _ => {
                            shared.forget(&predecessor);
                            changed = true;
                        }
                    }
                }
            }
        }

        changed
    }

    // === Lifecycle ===

    fn reset(&self) {
        let mut state = self.shared.write_state();
        state.successors.clear();
        state.fingers.clear();
        state.predecessor = self.shared.self_ref.clone();
    }

    fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
    }

    fn suspend(&self) {
        self.shared.suspended.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.shared.suspended.store(false, Ordering::SeqCst);
    }
}

/// Replies with our successor list and predecessor; the requester is by
/// definition alive and a predecessor candidate.
struct SuccessorHandler {
    shared: Arc<Shared>,
}

impl Handler for SuccessorHandler {
    fn handle(&self, _from: std::net::SocketAddr, envelope: crate::common::Envelope) -> Option<crate::common::Envelope> {
        if SuccessorRequest::from_envelope(&envelope).is_err() {
            return None;
        }
        self.shared.learn(&envelope.source);

        let state = self.shared.read_state();
        let reply = SuccessorReply {
            successors: state.successors.nodes(),
            predecessor: state.predecessor.clone(),
        };
        drop(state);

        Some(reply.to_envelope(self.shared.self_ref.clone()))
    }
}

/// Accepts a candidate pushed at a named finger slot and propagates the
/// update to our predecessor when that slot improved, walking it
/// counter-clockwise around the ring.
struct FingerUpdateHandler {
    shared: Arc<Shared>,
}

impl Handler for FingerUpdateHandler {
    fn handle(&self, _from: std::net::SocketAddr, envelope: crate::common::Envelope) -> Option<crate::common::Envelope> {
        let update = match FingerUpdate::from_envelope(&envelope) {
            Ok(update) => update,
            Err(error) => {
                debug!(%error, "malformed finger update");
                return None;
            }
        };

        let slot = update.index as usize;
        let improved = {
            let mut state = self.shared.write_state();
            if slot >= state.fingers.len() {
                debug!(slot, "finger update names a slot outside the identifier space");
                return None;
            }
            state.fingers.update_slot(slot, &update.node)
        };
        // The node may still improve other slots and the successor list.
        self.shared.learn(&update.node);

        if improved {
            let predecessor = self.shared.read_state().predecessor.clone();
            let skip = predecessor.id() == Some(&self.shared.self_id)
                || predecessor.id() == update.node.id();
            if !skip {
                if let (Some(addr), Some(transport)) =
                    (predecessor.addr(), self.shared.transport())
                {
                    let forward = update.to_envelope(self.shared.self_ref.clone());
                    if let Err(error) = transport.send(addr, forward) {
                        trace!(%error, "finger update propagation stopped");
                    }
                }
            }
        }

        Some(Ack.to_envelope(self.shared.self_ref.clone(), Tag::AckFingerTable))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn node(id: u128) -> NodeReference {
        NodeReference::new(
            Id::from_uint(id, 2),
            std::net::SocketAddr::from(([127, 0, 0, 1], id as u16 + 1)),
        )
    }

    fn ring_at(id: u128) -> RingAlgorithm {
        let config = Config {
            id_size: 2,
            ..Config::default()
        };
        RingAlgorithm::new(node(id), &config).unwrap()
    }

    #[test]
    fn rejects_mismatched_id_size() {
        let config = Config {
            id_size: 4,
            ..Config::default()
        };
        assert!(matches!(
            RingAlgorithm::new(node(7), &config),
            Err(Error::InvalidIdSize { expected: 4, got: 2 })
        ));
    }

    #[test]
    fn closest_to_prefers_nodes_before_the_target() {
        let ring = ring_at(0);
        ring.join(&[node(100), node(500), node(40_000)]);

        let hops = ring.closest_to(&Id::from_uint(600, 2), 3, &RoutingContext::None);

        // 500 sits just before 600; 100 is next; 40_000 overshoots and
        // sorts behind even self.
        assert_eq!(hops[0], node(500));
        assert_eq!(hops[1], node(100));
    }

    #[test]
    fn root_candidates_pick_the_first_node_at_or_after_target() {
        let ring = ring_at(0);
        ring.join(&[node(100), node(500)]);

        let roots = ring.root_candidates(&Id::from_uint(50, 2), 3);
        assert_eq!(roots[0], node(100));

        // A target exactly on a node belongs to that node's successor.
        let roots = ring.root_candidates(&Id::from_uint(100, 2), 3);
        assert_eq!(roots[0], node(500));
    }

    #[test]
    fn adjust_root_redirects_unless_self_owns() {
        let ring = ring_at(100);
        ring.join(&[node(200)]);

        // Targets in (previous node, 100] are ours once 100 is the first
        // node at or after them; with only {100, 200} known, anything in
        // (200, 100] maps to us.
        assert!(ring.adjust_root(&Id::from_uint(50, 2)).is_none());

        // Targets in (100, 200] belong to 200.
        let corrected = ring.adjust_root(&Id::from_uint(150, 2)).unwrap();
        assert_eq!(corrected[0], node(200));
    }

    #[test]
    fn forget_drops_node_everywhere() {
        let ring = ring_at(0);
        ring.join(&[node(100)]);
        assert_eq!(ring.successor(), node(100));
        assert_eq!(ring.predecessor(), node(100));

        ring.forget(&node(100));
        assert_eq!(ring.successor(), node(0));
        assert_eq!(ring.predecessor(), node(0));
        assert_eq!(
            ring.closest_to(&Id::from_uint(600, 2), 3, &RoutingContext::None),
            vec![node(0)]
        );
    }

    #[test]
    fn touch_is_gated_by_learn_from_all_traffic() {
        let config = Config {
            id_size: 2,
            learn_from_all_traffic: false,
            ..Config::default()
        };
        let ring = RingAlgorithm::new(node(0), &config).unwrap();

        ring.touch(&node(100));
        assert_eq!(ring.successor(), node(0));

        // Explicit join paths still learn.
        ring.join(&[node(100)]);
        assert_eq!(ring.successor(), node(100));
    }

    #[test]
    fn foreign_id_sizes_never_enter_the_tables() {
        let ring = ring_at(0);
        ring.join(&[NodeReference::new(
            Id::from_uint(100, 4),
            std::net::SocketAddr::from(([127, 0, 0, 1], 9_999)),
        )]);

        assert_eq!(ring.successor(), node(0));
        assert_eq!(ring.predecessor(), node(0));
        assert_eq!(
            ring.closest_to(&Id::from_uint(600, 2), 3, &RoutingContext::None),
            vec![node(0)]
        );
    }

    #[test]
    fn finger_updates_pin_the_named_slot() {
        let ring = ring_at(0);
        let handler = FingerUpdateHandler {
            shared: ring.shared.clone(),
        };
        let from = std::net::SocketAddr::from(([127, 0, 0, 1], 900));

        let update = FingerUpdate {
            node: node(0x0100),
            index: 3,
        };
        let reply = handler.handle(from, update.to_envelope(node(0x0100)));
        assert_eq!(reply.map(|r| r.tag), Some(Tag::AckFingerTable));

        let state = ring.shared.read_state();
        assert_eq!(state.fingers.slot(3), &node(0x0100));
        drop(state);
        assert_eq!(ring.successor(), node(0x0100));

        // A slot index outside the identifier space is refused outright.
        let bogus = FingerUpdate {
            node: node(0x0100),
            index: 400,
        };
        assert!(handler.handle(from, bogus.to_envelope(node(0x0100))).is_none());
    }

    #[test]
    fn to_replace_prefers_closer_successors() {
        let ring = ring_at(0);
        assert!(ring.to_replace(&node(500), &node(100)));
        assert!(!ring.to_replace(&node(100), &node(500)));
    }
}
