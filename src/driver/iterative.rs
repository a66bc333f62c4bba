//! Iterative routing driver.
//!
//! The initiator stays in charge of the whole lookup: it repeatedly asks
//! the best known candidates for closer nodes, merges what comes back,
//! and once converged runs the adjust-last-hop exchange against the
//! convergence point to land on the true owner. Targets whose current
//! best next hop coincides are batched into one request; distinct next
//! hops fork through the worker pool.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::algorithm::{RoutingAlgorithm, RoutingContext};
use crate::common::{Distance, Envelope, Id, NodeReference, RoutingHop, RoutingResult, Tag};
use crate::config::Config;
use crate::proto::{
    check_target_sizes, AdjustReply, AdjustRequest, AdjustVerdict, CallbackSpec, RootsReply,
    RouteReply, RouteRequest, TerminateRequest,
};
use crate::transport::{adaptive_timeout, Handler, Transport};
use crate::Result;

use super::pool::WorkerPool;
use super::{partition_by_hop, Blacklist, CallbackHub, RouteMode};

pub struct IterativeDriver {
    self_ref: NodeReference,
    algorithm: Arc<dyn RoutingAlgorithm>,
    transport: Arc<dyn Transport>,
    pool: Arc<WorkerPool>,
    hub: Arc<CallbackHub>,
    fan_out: usize,
    ttl: u8,
    request_timeout: Duration,
}

struct TargetState {
    target: Id,
    ctx: RoutingContext,
    /// Best-first candidate list, merged from replies.
    candidates: Vec<NodeReference>,
    queried: HashSet<std::net::SocketAddr>,
    hops: Vec<RoutingHop>,
    outputs: Vec<Bytes>,
    resolved: Option<RoutingResult>,
}

enum NextHop {
    Query(NodeReference),
    Converged(NodeReference),
}

impl IterativeDriver {
    pub fn new(
        self_ref: NodeReference,
        algorithm: Arc<dyn RoutingAlgorithm>,
        transport: Arc<dyn Transport>,
        pool: Arc<WorkerPool>,
        hub: Arc<CallbackHub>,
        config: &Config,
    ) -> IterativeDriver {
        IterativeDriver {
            self_ref,
            algorithm,
            transport,
            pool,
            hub,
            fan_out: config.fan_out.max(1),
            ttl: config.ttl,
            request_timeout: config.request_timeout,
        }
    }

    /// Resolve every target to its owner's root candidates. Targets that
    /// cannot be resolved within the hop budget come back as `None`.
    pub fn route(
        &self,
        targets: &[Id],
        num_roots: usize,
        mode: RouteMode,
        callback: Option<CallbackSpec>,
    ) -> Result<Vec<Option<RoutingResult>>> {
        let blacklist = Blacklist::new(self.algorithm.clone(), self.hub.clone());

        let mut states: Vec<TargetState> = targets
            .iter()
            .map(|target| {
                let ctx = self.algorithm.initial_context(target);
                TargetState {
                    candidates: self.algorithm.closest_to(target, self.fan_out, &ctx),
                    ctx,
                    target: target.clone(),
                    queried: HashSet::new(),
                    hops: vec![RoutingHop::new(self.self_ref.clone())],
                    outputs: Vec::new(),
                    resolved: None,
                }
            })
            .collect();

        // The initiator is the first hop the callback sees.
        if let Some(spec) = &callback {
            if let Some(output) = self.hub.invoke_route(spec, &self.self_ref, targets) {
                for state in states.iter_mut() {
                    state.outputs.push(output.clone());
                }
            }
        }

        let mut budget = self.ttl as usize;
        loop {
            let mut picks = Vec::new();
            let mut converged = Vec::new();
            for (idx, state) in states.iter().enumerate() {
                if state.resolved.is_some() {
                    continue;
                }
                match self.next_hop(state, &blacklist) {
                    NextHop::Query(node) => picks.push((idx, node)),
                    NextHop::Converged(node) => converged.push((idx, node)),
                }
            }

            if picks.is_empty() && converged.is_empty() {
                break;
            }
            if budget == 0 {
                debug!("hop budget exhausted, unresolved targets fail closed");
                break;
            }
            budget -= 1;

            if !converged.is_empty() {
                self.terminate(&mut states, converged, num_roots, mode, &callback, &blacklist);
            }
            if !picks.is_empty() {
                self.round(&mut states, picks, &callback, &blacklist);
            }
        }

        Ok(states.into_iter().map(|state| state.resolved).collect())
    }

    // === Private Methods ===

    /// Where a target goes next: the best unqueried candidate, or the node
    /// the lookup converged on when no such candidate remains.
    fn next_hop(&self, state: &TargetState, blacklist: &Blacklist) -> NextHop {
        let mut best_live = None;
        for candidate in &state.candidates {
            if blacklist.contains(candidate) {
                continue;
            }
            if candidate.id() == self.self_ref.id() {
                // Nothing closer than ourselves is known.
                return match best_live {
                    None => NextHop::Converged(self.self_ref.clone()),
                    Some(node) => NextHop::Converged(node),
                };
            }
            if best_live.is_none() {
                best_live = Some(candidate.clone());
            }
            match candidate.addr() {
                Some(addr) if !state.queried.contains(&addr) => {
                    // The best live candidate decides: if it was already
                    // queried, farther candidates cannot improve on it.
                    if best_live.as_ref() == Some(candidate) {
                        return NextHop::Query(candidate.clone());
                    }
                }
                _ => {}
            }
        }

        NextHop::Converged(best_live.unwrap_or_else(|| self.self_ref.clone()))
    }

    /// One network round: fork a `RouteRequest` per distinct next hop and
    /// merge the replies.
    fn round(
        &self,
        states: &mut [TargetState],
        picks: Vec<(usize, NodeReference)>,
        callback: &Option<CallbackSpec>,
        blacklist: &Blacklist,
    ) {
        let partitions = partition_by_hop(picks);
        let forked = partitions.len() > 1;
        let (tx, rx) = flume::bounded(partitions.len());

        for (node, idxs) in partitions {
            let Some(addr) = node.addr() else {
                blacklist.condemn(&node);
                continue;
            };

            let request = RouteRequest {
                targets: idxs.iter().map(|i| states[*i].target.clone()).collect(),
                contexts: idxs.iter().map(|i| states[*i].ctx.clone()).collect(),
                fan_out: self.fan_out as u32,
                callback: callback.clone(),
            }
            .to_envelope(self.self_ref.clone());

            let timeout = adaptive_timeout(self.transport.as_ref(), addr, self.request_timeout);
            let transport = self.transport.clone();
            let tx = tx.clone();
            let job = move || {
                let outcome = transport.send_and_receive(addr, request, timeout);
                let _ = tx.send((node, idxs, outcome));
            };

            if forked {
                self.pool.execute(job);
            } else {
                job();
            }
        }
        drop(tx);

        for (node, idxs, outcome) in rx.iter() {
            match outcome.and_then(|envelope| RouteReply::from_envelope(&envelope)) {
                Ok(reply) => self.merge_reply(states, &idxs, &node, reply),
                Err(error) => {
                    debug!(node = ?node, %error, "route request failed");
                    blacklist.condemn(&node);
                }
            }
        }
    }

    fn merge_reply(
        &self,
        states: &mut [TargetState],
        idxs: &[usize],
        node: &NodeReference,
        reply: RouteReply,
    ) {
        self.algorithm.touch(node);
        let addr = node.addr();

        for (slot, idx) in idxs.iter().enumerate() {
            let state = &mut states[*idx];
            if let Some(addr) = addr {
                state.queried.insert(addr);
            }
            state.hops.push(RoutingHop::new(node.clone()));
            state.outputs.extend(reply.callback_outputs.iter().cloned());

            let (Some(closer), Some(ctx)) = (reply.closer.get(slot), reply.contexts.get(slot))
            else {
                trace!(node = ?node, "short route reply");
                continue;
            };
            state.ctx = ctx.clone();

            if self.algorithm.supports_sorting() {
                let target = state.target.clone();
                state.candidates.extend(closer.iter().cloned());
                state.candidates.sort_by_key(|n| {
                    self.algorithm
                        .distance(&target, n)
                        .unwrap_or_else(|| Distance::full(target.size()))
                });
                state.candidates.dedup_by(|a, b| a.id() == b.id());
                state.candidates.truncate(self.fan_out);
            } else {
                state.candidates = closer.clone();
            }
        }
    }

    /// Adjust-last-hop exchange for targets whose lookup converged.
    fn terminate(
        &self,
        states: &mut [TargetState],
        converged: Vec<(usize, NodeReference)>,
        num_roots: usize,
        mode: RouteMode,
        callback: &Option<CallbackSpec>,
        blacklist: &Blacklist,
    ) {
        if mode == RouteMode::Closest {
            // The convergence point is the answer; no correction round.
            for (idx, node) in converged {
                Self::finalize(&mut states[idx], &node, vec![node.clone()], Vec::new());
            }
            return;
        }

        for (node, idxs) in partition_by_hop(converged) {
            if node.id() == self.self_ref.id() {
                self.terminate_at_self(states, &idxs, num_roots, callback, blacklist);
                continue;
            }

            let Some(addr) = node.addr() else {
                blacklist.condemn(&node);
                continue;
            };

            let request = AdjustRequest {
                targets: idxs.iter().map(|i| states[*i].target.clone()).collect(),
                num_roots: num_roots as u32,
            }
            .to_envelope(self.self_ref.clone());
            let timeout = adaptive_timeout(self.transport.as_ref(), addr, self.request_timeout);

            let reply = self
                .transport
                .send_and_receive(addr, request, timeout)
                .and_then(|envelope| AdjustReply::from_envelope(&envelope));
            let reply = match reply {
                Ok(reply) => reply,
                Err(error) => {
                    debug!(node = ?node, %error, "adjust-last-hop failed");
                    blacklist.condemn(&node);
                    continue;
                }
            };
            self.algorithm.touch(&node);

            for (slot, idx) in idxs.iter().enumerate() {
                match reply.verdicts.get(slot) {
                    Some(AdjustVerdict::Owner(roots)) => {
                        // The convergence point owns the target; a terminal
                        // round trip is only needed to run its callback.
                        let outputs = match callback {
                            Some(_) => self
                                .send_terminate(&node, &[states[*idx].target.clone()], num_roots, callback)
                                .map(|reply| reply.callback_outputs)
                                .unwrap_or_default(),
                            None => Vec::new(),
                        };
                        Self::finalize(&mut states[*idx], &node, roots.clone(), outputs);
                    }
                    Some(AdjustVerdict::Redirect(corrected)) => {
                        self.redirect(&mut states[*idx], corrected, num_roots, callback, blacklist);
                    }
                    None => trace!(node = ?node, "short adjust reply"),
                }
            }
        }
    }

    /// The lookup converged on ourselves; adjust locally.
    fn terminate_at_self(
        &self,
        states: &mut [TargetState],
        idxs: &[usize],
        num_roots: usize,
        callback: &Option<CallbackSpec>,
        blacklist: &Blacklist,
    ) {
        for idx in idxs {
            let target = states[*idx].target.clone();
            match self.algorithm.adjust_root(&target) {
                None => {
                    let roots = self.algorithm.root_candidates(&target, num_roots);
                    let owner = self.self_ref.clone();
                    Self::finalize(&mut states[*idx], &owner, roots, Vec::new());
                }
                Some(corrected) => {
                    self.redirect(&mut states[*idx], &corrected, num_roots, callback, blacklist);
                }
            }
        }
    }

    /// Walk a correction list, condemning dead entries, until one answers
    /// the terminal request. Falls back to the local owner view when the
    /// whole list is dead.
    fn redirect(
        &self,
        state: &mut TargetState,
        corrected: &[NodeReference],
        num_roots: usize,
        callback: &Option<CallbackSpec>,
        blacklist: &Blacklist,
    ) {
        for owner in corrected {
            if blacklist.contains(owner) {
                continue;
            }
            if owner.id() == self.self_ref.id() {
                let roots = self.algorithm.root_candidates(&state.target, num_roots);
                let owner = owner.clone();
                Self::finalize(state, &owner, roots, Vec::new());
                return;
            }

            match self.send_terminate(owner, &[state.target.clone()], num_roots, callback) {
                Ok(mut reply) => {
                    self.algorithm.touch(owner);
                    let roots = reply.roots.pop().unwrap_or_default();
                    Self::finalize(state, owner, roots, reply.callback_outputs);
                    return;
                }
                Err(error) => {
                    debug!(owner = ?owner, %error, "terminal request failed");
                    blacklist.condemn(owner);
                }
            }
        }

        // Every corrected owner is dead; answer from the local view.
        let mut roots = self.algorithm.root_candidates(&state.target, num_roots);
        roots.retain(|n| !blacklist.contains(n));
        let owner = roots.first().cloned().unwrap_or_else(|| self.self_ref.clone());
        Self::finalize(state, &owner, roots, Vec::new());
    }

    fn send_terminate(
        &self,
        owner: &NodeReference,
        targets: &[Id],
        num_roots: usize,
        callback: &Option<CallbackSpec>,
    ) -> Result<RootsReply> {
        let addr = owner.addr().ok_or(crate::Error::NoRoute)?;
        let request = TerminateRequest {
            targets: targets.to_vec(),
            num_roots: num_roots as u32,
            callback: callback.clone(),
        }
        .to_envelope(self.self_ref.clone());
        let timeout = adaptive_timeout(self.transport.as_ref(), addr, self.request_timeout);

        self.transport
            .send_and_receive(addr, request, timeout)
            .and_then(|envelope| RootsReply::from_envelope(&envelope))
    }

    fn finalize(
        state: &mut TargetState,
        owner: &NodeReference,
        roots: Vec<NodeReference>,
        outputs: Vec<Bytes>,
    ) {
        if state.hops.last().map(|hop| &hop.node) != Some(owner) {
            state.hops.push(RoutingHop::new(owner.clone()));
        }
        state.outputs.extend(outputs);
        state.resolved = Some(RoutingResult {
            hops: state.hops.clone(),
            roots,
            callback_outputs: state.outputs.clone(),
        });
    }
}

/// Server side of the iterative protocol; registered for the route,
/// adjust-last-hop and terminate tags.
pub struct IterativeServer {
    self_ref: NodeReference,
    algorithm: Arc<dyn RoutingAlgorithm>,
    hub: Arc<CallbackHub>,
}

impl IterativeServer {
    pub fn new(
        self_ref: NodeReference,
        algorithm: Arc<dyn RoutingAlgorithm>,
        hub: Arc<CallbackHub>,
    ) -> IterativeServer {
        IterativeServer {
            self_ref,
            algorithm,
            hub,
        }
    }

    /// Targets from the wire must match our identifier space before they
    /// reach the algorithm.
    fn check_targets(&self, targets: &[Id]) -> Result<()> {
        match self.self_ref.id() {
            Some(id) => check_target_sizes(targets, id.size()),
            None => Ok(()),
        }
    }

    fn handle_route(&self, envelope: &Envelope) -> Result<Envelope> {
        let request = RouteRequest::from_envelope(envelope)?;
        self.check_targets(&request.targets)?;
        self.algorithm.touch(&envelope.source);

        let callback_outputs = request
            .callback
            .as_ref()
            .and_then(|spec| self.hub.invoke_route(spec, &envelope.source, &request.targets))
            .into_iter()
            .collect();

        let mut closer = Vec::with_capacity(request.targets.len());
        let mut contexts = Vec::with_capacity(request.targets.len());
        for (target, ctx) in request.targets.iter().zip(&request.contexts) {
            let ctx = self.algorithm.advance_context(ctx, &self.self_ref);
            closer.push(
                self.algorithm
                    .closest_to(target, request.fan_out.max(1) as usize, &ctx),
            );
            contexts.push(ctx);
        }

        Ok(RouteReply {
            targets: request.targets,
            closer,
            contexts,
            callback_outputs,
        }
        .to_envelope(self.self_ref.clone()))
    }

    fn handle_adjust(&self, envelope: &Envelope) -> Result<Envelope> {
        let request = AdjustRequest::from_envelope(envelope)?;
        self.check_targets(&request.targets)?;
        self.algorithm.touch(&envelope.source);

        let verdicts = request
            .targets
            .iter()
            .map(|target| match self.algorithm.adjust_root(target) {
                None => AdjustVerdict::Owner(
                    self.algorithm
                        .root_candidates(target, request.num_roots.max(1) as usize),
                ),
                Some(corrected) => AdjustVerdict::Redirect(corrected),
            })
            .collect();

        Ok(AdjustReply {
            targets: request.targets,
            verdicts,
        }
        .to_envelope(self.self_ref.clone()))
    }

    fn handle_terminate(&self, envelope: &Envelope) -> Result<Envelope> {
        let request = TerminateRequest::from_envelope(envelope)?;
        self.check_targets(&request.targets)?;
        self.algorithm.touch(&envelope.source);

        let callback_outputs = request
            .callback
            .as_ref()
            .and_then(|spec| self.hub.invoke_route(spec, &envelope.source, &request.targets))
            .into_iter()
            .collect();

        let roots = request
            .targets
            .iter()
            .map(|target| {
                self.algorithm
                    .root_candidates(target, request.num_roots.max(1) as usize)
            })
            .collect();

        Ok(RootsReply {
            targets: request.targets,
            roots,
            callback_outputs,
        }
        .to_envelope(self.self_ref.clone()))
    }
}

impl Handler for IterativeServer {
    fn handle(&self, _from: std::net::SocketAddr, envelope: Envelope) -> Option<Envelope> {
        let outcome = match envelope.tag {
            Tag::RouteIterative => self.handle_route(&envelope),
            Tag::AdjustLastHopIterative => self.handle_adjust(&envelope),
            Tag::TerminateIterative => self.handle_terminate(&envelope),
            other => {
                trace!(tag = ?other, "iterative server got unrelated tag");
                return None;
            }
        };

        match outcome {
            Ok(reply) => Some(reply),
            Err(error) => {
                debug!(%error, "malformed iterative request dropped");
                None
            }
        }
    }
}
