//! Recursive routing driver.
//!
//! The initiator hands the lookup to its best next hop and waits. Every
//! hop acknowledges receipt synchronously, then advances the lookup on
//! the worker pool: forwarding it onward, forking it when targets part
//! ways, or answering the initiator directly once it owns the targets.
//! Results are correlated back to the blocked initiator through a random
//! operation id; a lookup swallowed by the network (a hop that can reach
//! us while we cannot reach it) surfaces only as a timeout.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, trace};

use crate::algorithm::RoutingAlgorithm;
use crate::common::{Envelope, Id, NodeReference, RoutingHop, RoutingResult, Tag};
use crate::config::Config;
use crate::proto::{check_target_sizes, Ack, CallbackSpec, RecursiveResult, RecursiveRoute};
use crate::transport::{adaptive_timeout, Handler, Transport};
use crate::{Error, Result};

use super::pool::WorkerPool;
use super::{partition_by_hop, Blacklist, CallbackHub, RouteMode};

pub struct RecursiveDriver {
    shared: Arc<RecursiveShared>,
}

struct RecursiveShared {
    self_ref: NodeReference,
    algorithm: Arc<dyn RoutingAlgorithm>,
    transport: Arc<dyn Transport>,
    pool: Arc<WorkerPool>,
    hub: Arc<CallbackHub>,
    fan_out: usize,
    ttl: u8,
    request_timeout: Duration,
    pending: Mutex<HashMap<u64, PendingOp>>,
    signal: Condvar,
}

struct PendingOp {
    expected: HashSet<Id>,
    results: HashMap<Id, Option<RoutingResult>>,
}

impl PendingOp {
    fn done(&self) -> bool {
        self.results.len() >= self.expected.len()
    }
}

impl RecursiveDriver {
    pub fn new(
        self_ref: NodeReference,
        algorithm: Arc<dyn RoutingAlgorithm>,
        transport: Arc<dyn Transport>,
        pool: Arc<WorkerPool>,
        hub: Arc<CallbackHub>,
        config: &Config,
    ) -> RecursiveDriver {
        RecursiveDriver {
            shared: Arc::new(RecursiveShared {
                self_ref,
                algorithm,
                transport,
                pool,
                hub,
                fan_out: config.fan_out.max(1),
                ttl: config.ttl,
                request_timeout: config.request_timeout,
                pending: Mutex::new(HashMap::new()),
                signal: Condvar::new(),
            }),
        }
    }

    /// Server-side handler covering the recursive tags (route, terminate,
    /// result); the driver and its server share the wait table.
    pub fn server(&self) -> Arc<dyn Handler> {
        Arc::new(RecursiveServer {
            shared: self.shared.clone(),
        })
    }

    /// Resolve every target to its owner's root candidates. Unreachable
    /// targets come back as `None` after the operation deadline.
    pub fn route(
        &self,
        targets: &[Id],
        num_roots: usize,
        mode: RouteMode,
        callback: Option<CallbackSpec>,
    ) -> Result<Vec<Option<RoutingResult>>> {
        let shared = &self.shared;
        let op_id = rand::thread_rng().gen::<u64>();

        {
            let mut pending = shared.lock_pending();
            pending.insert(
                op_id,
                PendingOp {
                    expected: targets.iter().cloned().collect(),
                    results: HashMap::new(),
                },
            );
        }

        let mut callback_outputs = Vec::new();
        if let Some(spec) = &callback {
            if let Some(output) = shared.hub.invoke_route(spec, &shared.self_ref, targets) {
                callback_outputs.push(output);
            }
        }

        let message = RecursiveRoute {
            op_id,
            initiator: shared.self_ref.clone(),
            targets: targets.to_vec(),
            contexts: targets
                .iter()
                .map(|t| shared.algorithm.initial_context(t))
                .collect(),
            hops: vec![shared.self_ref.clone()],
            blacklist: Vec::new(),
            ttl: shared.ttl,
            num_roots: num_roots as u32,
            adjust: mode == RouteMode::Owner,
            callback,
            callback_outputs,
        };
        shared.advance(message);

        // One full hop budget of base timeouts bounds the whole operation.
        let deadline =
            Instant::now() + shared.request_timeout * u32::from(shared.ttl.max(1));
        let mut pending = shared.lock_pending();
        loop {
            if pending.get(&op_id).map(PendingOp::done).unwrap_or(true) {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(op_id, "recursive operation deadline elapsed");
                break;
            }
            pending = shared
                .signal
                .wait_timeout(pending, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        let results = pending.remove(&op_id).map(|op| op.results).unwrap_or_default();
        drop(pending);

        if results.is_empty() && !targets.is_empty() {
            return Err(Error::Timeout);
        }
        Ok(targets
            .iter()
            .map(|target| results.get(target).cloned().flatten())
            .collect())
    }
}

enum Step {
    /// This node owns the target (or is the live end of the path).
    Converged,
    Forward(NodeReference),
}

impl RecursiveShared {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingOp>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Targets from the wire must match our identifier space before they
    /// reach the algorithm.
    fn check_targets(&self, targets: &[Id]) -> Result<()> {
        match self.self_ref.id() {
            Some(id) => check_target_sizes(targets, id.size()),
            None => Ok(()),
        }
    }

    /// Advance a lookup from this node: answer the targets we own, forward
    /// the rest, retrying with the next candidate when a hop is dead.
    fn advance(&self, mut message: RecursiveRoute) {
        let blacklist = Blacklist::new(self.algorithm.clone(), self.hub.clone());
        blacklist.import(&message.blacklist);

        if message.ttl == 0 {
            debug!(op_id = message.op_id, "hop budget exhausted, failing closed");
            self.answer_unresolved(&message);
            return;
        }

        let mut work: Vec<usize> = (0..message.targets.len()).collect();
        while !work.is_empty() {
            let mut converged = Vec::new();
            let mut picks = Vec::new();
            for idx in &work {
                match self.step(&message, *idx, &blacklist) {
                    Step::Converged => converged.push(*idx),
                    Step::Forward(node) => picks.push((*idx, node)),
                }
            }

            if !converged.is_empty() {
                self.answer_converged(&message, &converged, &blacklist);
                work.retain(|idx| !converged.contains(idx));
            }
            if picks.is_empty() {
                break;
            }

            message.blacklist = blacklist.nodes();
            let partitions = partition_by_hop(picks);
            let forked = partitions.len() > 1;
            let (tx, rx) = flume::bounded(partitions.len());

            for (node, idxs) in partitions {
                let Some(addr) = node.addr() else {
                    blacklist.condemn(&node);
                    continue;
                };

                let forward = RecursiveRoute {
                    targets: idxs.iter().map(|i| message.targets[*i].clone()).collect(),
                    contexts: idxs.iter().map(|i| message.contexts[*i].clone()).collect(),
                    ..message.clone()
                }
                .to_envelope(self.self_ref.clone(), Tag::RouteRecursive);

                let timeout = adaptive_timeout(self.transport.as_ref(), addr, self.request_timeout);
                let transport = self.transport.clone();
                let tx = tx.clone();
                let job = move || {
                    let outcome = transport.send_and_receive(addr, forward, timeout);
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
                match outcome {
                    Ok(reply) if reply.tag == Tag::AckRecursive => {
                        // The hop owns these targets now.
                        self.algorithm.touch(&node);
                        work.retain(|idx| !idxs.contains(idx));
                    }
                    Ok(reply) => {
                        debug!(node = ?node, got = ?reply.tag, "unexpected forward reply");
                        blacklist.condemn(&node);
                    }
                    Err(error) => {
                        debug!(node = ?node, %error, "recursive forward failed");
                        blacklist.condemn(&node);
                    }
                }
            }
        }
    }

    /// Next step for one target, from the local routing tables.
    fn step(&self, message: &RecursiveRoute, idx: usize, blacklist: &Blacklist) -> Step {
        let target = &message.targets[idx];
        let candidates = self
            .algorithm
            .closest_to(target, self.fan_out, &message.contexts[idx]);

        for candidate in candidates {
            if blacklist.contains(&candidate) {
                continue;
            }
            if candidate.id() == self.self_ref.id() {
                return Step::Converged;
            }
            // A candidate already on the path would loop the lookup.
            if message.hops.contains(&candidate) {
                continue;
            }
            return Step::Forward(candidate);
        }
        Step::Converged
    }

    /// Answer the initiator for targets that converged here, redirecting
    /// the terminal hop when the true owner is a neighbor.
    fn answer_converged(&self, message: &RecursiveRoute, idxs: &[usize], blacklist: &Blacklist) {
        let num_roots = message.num_roots.max(1) as usize;
        let mut owned: Vec<(Id, Vec<NodeReference>)> = Vec::new();
        let mut redirects: Vec<(usize, NodeReference)> = Vec::new();

        for idx in idxs {
            let target = &message.targets[*idx];
            if !message.adjust {
                // Closest-node lookup: the convergence point answers.
                owned.push((target.clone(), vec![self.self_ref.clone()]));
                continue;
            }

            let corrected = self.algorithm.adjust_root(target).and_then(|nodes| {
                nodes
                    .into_iter()
                    .find(|n| !blacklist.contains(n) && n.id() != self.self_ref.id())
            });
            match corrected {
                Some(owner) => redirects.push((*idx, owner)),
                None => owned.push((
                    target.clone(),
                    self.algorithm.root_candidates(target, num_roots),
                )),
            }
        }

        if !owned.is_empty() {
            let (targets, roots) = owned.into_iter().unzip();
            self.deliver_result(
                &message.initiator,
                RecursiveResult {
                    op_id: message.op_id,
                    targets,
                    roots,
                    hops: message.hops.clone(),
                    callback_outputs: message.callback_outputs.clone(),
                },
            );
        }

        for (owner, idxs) in partition_by_hop(redirects) {
            let Some(addr) = owner.addr() else {
                continue;
            };
            let terminal = RecursiveRoute {
                targets: idxs.iter().map(|i| message.targets[*i].clone()).collect(),
                contexts: idxs.iter().map(|i| message.contexts[*i].clone()).collect(),
                blacklist: blacklist.nodes(),
                ..message.clone()
            }
            .to_envelope(self.self_ref.clone(), Tag::TerminateRecursive);

            let timeout = adaptive_timeout(self.transport.as_ref(), addr, self.request_timeout);
            match self.transport.send_and_receive(addr, terminal, timeout) {
                Ok(reply) if reply.tag == Tag::AckRecursive => self.algorithm.touch(&owner),
                _ => {
                    // Dead corrected owner: answer with the local view.
                    blacklist.condemn(&owner);
                    let (targets, roots) = idxs
                        .iter()
                        .map(|i| {
                            let target = message.targets[*i].clone();
                            let mut roots = self.algorithm.root_candidates(&target, num_roots);
                            roots.retain(|n| !blacklist.contains(n));
                            (target, roots)
                        })
                        .unzip();
                    self.deliver_result(
                        &message.initiator,
                        RecursiveResult {
                            op_id: message.op_id,
                            targets,
                            roots,
                            hops: message.hops.clone(),
                            callback_outputs: message.callback_outputs.clone(),
                        },
                    );
                }
            }
        }
    }

    /// Explicit empty answer, so TTL exhaustion fails fast instead of
    /// leaving the initiator to its deadline.
    fn answer_unresolved(&self, message: &RecursiveRoute) {
        self.deliver_result(
            &message.initiator,
            RecursiveResult {
                op_id: message.op_id,
                targets: message.targets.clone(),
                roots: vec![Vec::new(); message.targets.len()],
                hops: message.hops.clone(),
                callback_outputs: message.callback_outputs.clone(),
            },
        );
    }

    fn deliver_result(&self, initiator: &NodeReference, result: RecursiveResult) {
        if initiator.id() == self.self_ref.id()
            || initiator.addr() == Some(self.transport.local_addr())
        {
            self.complete(result);
            return;
        }
        let Some(addr) = initiator.addr() else {
            return;
        };
        let envelope = result.to_envelope(self.self_ref.clone());
        if let Err(error) = self.transport.send(addr, envelope) {
            debug!(%error, "result delivery to initiator failed");
        }
    }

    /// Feed a result into the wait table and wake the blocked initiator.
    fn complete(&self, result: RecursiveResult) {
        let mut pending = self.lock_pending();
        let Some(op) = pending.get_mut(&result.op_id) else {
            trace!(op_id = result.op_id, "result for unknown or finished operation");
            return;
        };

        for (i, target) in result.targets.iter().enumerate() {
            if !op.expected.contains(target) || op.results.contains_key(target) {
                continue;
            }
            let roots = result.roots.get(i).cloned().unwrap_or_default();
            let value = if roots.is_empty() {
                None
            } else {
                Some(RoutingResult {
                    hops: result
                        .hops
                        .iter()
                        .map(|node| RoutingHop::new(node.clone()))
                        .collect(),
                    roots,
                    callback_outputs: result.callback_outputs.clone(),
                })
            };
            op.results.insert(target.clone(), value);
        }
        drop(pending);
        self.signal.notify_all();
    }
}

/// Server side of the recursive protocol.
struct RecursiveServer {
    shared: Arc<RecursiveShared>,
}

impl RecursiveServer {
    fn handle_route(&self, envelope: &Envelope) -> Result<Envelope> {
        let mut message = RecursiveRoute::from_envelope(envelope)?;
        let shared = &self.shared;
        shared.check_targets(&message.targets)?;
        shared.algorithm.touch(&envelope.source);

        if message.ttl == 0 {
            shared.answer_unresolved(&message);
            return Ok(Ack.to_envelope(shared.self_ref.clone(), Tag::AckRecursive));
        }

        message.ttl -= 1;
        message.hops.push(shared.self_ref.clone());
        if let Some(spec) = &message.callback {
            if let Some(output) =
                shared
                    .hub
                    .invoke_route(spec, &envelope.source, &message.targets)
            {
                message.callback_outputs.push(output);
            }
        }

        // Acknowledge first; the actual advance happens off-thread.
        let worker = shared.clone();
        shared.pool.execute(move || worker.advance(message));
        Ok(Ack.to_envelope(shared.self_ref.clone(), Tag::AckRecursive))
    }

    /// Terminal hop after an adjust redirect: answer as owner, no further
    /// routing.
    fn handle_terminate(&self, envelope: &Envelope) -> Result<Envelope> {
        let mut message = RecursiveRoute::from_envelope(envelope)?;
        let shared = &self.shared;
        shared.check_targets(&message.targets)?;
        shared.algorithm.touch(&envelope.source);

        message.hops.push(shared.self_ref.clone());
        if let Some(spec) = &message.callback {
            if let Some(output) =
                shared
                    .hub
                    .invoke_route(spec, &envelope.source, &message.targets)
            {
                message.callback_outputs.push(output);
            }
        }

        let num_roots = message.num_roots.max(1) as usize;
        let (targets, roots) = message
            .targets
            .iter()
            .map(|target| {
                (
                    target.clone(),
                    shared.algorithm.root_candidates(target, num_roots),
                )
            })
            .unzip();
        shared.deliver_result(
            &message.initiator,
            RecursiveResult {
                op_id: message.op_id,
                targets,
                roots,
                hops: message.hops.clone(),
                callback_outputs: message.callback_outputs.clone(),
            },
        );

        Ok(Ack.to_envelope(shared.self_ref.clone(), Tag::AckRecursive))
    }

    fn handle_result(&self, envelope: &Envelope) -> Result<()> {
        let result = RecursiveResult::from_envelope(envelope)?;
        self.shared.algorithm.touch(&envelope.source);
        self.shared.complete(result);
        Ok(())
    }
}

impl Handler for RecursiveServer {
    fn handle(&self, _from: std::net::SocketAddr, envelope: Envelope) -> Option<Envelope> {
        let outcome = match envelope.tag {
            Tag::RouteRecursive => self.handle_route(&envelope).map(Some),
            Tag::TerminateRecursive => self.handle_terminate(&envelope).map(Some),
            Tag::ResultRecursive => self.handle_result(&envelope).map(|_| None),
            other => {
                trace!(tag = ?other, "recursive server got unrelated tag");
                return None;
            }
        };

        match outcome {
            Ok(reply) => reply,
            Err(error) => {
                debug!(%error, "malformed recursive request dropped");
                None
            }
        }
    }
}
