//! The overlay node: the upward-facing API of the routing substrate.
//!
//! An [OverlayNode] binds a routing algorithm and a driver strategy to a
//! transport, registers every protocol handler, and runs background
//! stabilization. Applications resolve identifiers through it and hook
//! into lookups with route and node-failure callbacks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::{debug, info};

use crate::algorithm::{self, RouteResolver, RoutingAlgorithm, Stabilizer};
use crate::common::{Envelope, Id, NodeReference, RoutingResult, Tag};
use crate::config::{Config, RoutingStrategy};
use crate::driver::iterative::{IterativeDriver, IterativeServer};
use crate::driver::pool::WorkerPool;
use crate::driver::recursive::RecursiveDriver;
use crate::driver::{CallbackHub, NodeFailureCallback, RouteCallback, RouteMode};
use crate::proto::{Ack, CallbackSpec, ConnectReply, ConnectRequest, PingRequest};
use crate::transport::{adaptive_timeout, Handler, Transport};
use crate::{Error, Result};

pub struct OverlayNode {
    config: Config,
    self_ref: NodeReference,
    transport: Arc<dyn Transport>,
    algorithm: Arc<dyn RoutingAlgorithm>,
    hub: Arc<CallbackHub>,
    iterative: IterativeDriver,
    recursive: RecursiveDriver,
    stabilizer: Mutex<Option<Stabilizer>>,
    running: AtomicBool,
}

impl OverlayNode {
    /// Build a node on `transport`, register all protocol handlers, and
    /// start background stabilization. The node's identifier is the hash
    /// of its transport address.
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Result<OverlayNode> {
        let self_ref =
            NodeReference::from_addr(transport.local_addr()).with_hashed_id(config.id_size);
        let algorithm = algorithm::create(self_ref.clone(), &config)?;
        let hub = Arc::new(CallbackHub::default());
        let pool = Arc::new(WorkerPool::new(config.worker_threads));

        let iterative = IterativeDriver::new(
            self_ref.clone(),
            algorithm.clone(),
            transport.clone(),
            pool.clone(),
            hub.clone(),
            &config,
        );
        let recursive = RecursiveDriver::new(
            self_ref.clone(),
            algorithm.clone(),
            transport.clone(),
            pool,
            hub.clone(),
            &config,
        );

        transport.register_handler(
            Tag::Ping,
            Arc::new(PingHandler {
                self_ref: self_ref.clone(),
                algorithm: algorithm.clone(),
            }),
        );
        transport.register_handler(
            Tag::ReqConnect,
            Arc::new(ConnectHandler {
                self_ref: self_ref.clone(),
                algorithm: algorithm.clone(),
                id_size: config.id_size,
                num_roots: config.join_root_candidates.max(1),
            }),
        );

        let iterative_server = Arc::new(IterativeServer::new(
            self_ref.clone(),
            algorithm.clone(),
            hub.clone(),
        ));
        for tag in [
            Tag::RouteIterative,
            Tag::AdjustLastHopIterative,
            Tag::TerminateIterative,
        ] {
            transport.register_handler(tag, iterative_server.clone());
        }

        let recursive_server = recursive.server();
        for tag in [
            Tag::RouteRecursive,
            Tag::TerminateRecursive,
            Tag::ResultRecursive,
        ] {
            transport.register_handler(tag, recursive_server.clone());
        }

        algorithm.attach(&transport);
        let stabilizer = Stabilizer::start(algorithm.clone(), &config);

        info!(node = ?self_ref, "overlay node started");
        Ok(OverlayNode {
            config,
            self_ref,
            transport,
            algorithm,
            hub,
            iterative,
            recursive,
            stabilizer: Mutex::new(Some(stabilizer)),
            running: AtomicBool::new(true),
        })
    }

    // === Getters ===

    pub fn node_reference(&self) -> &NodeReference {
        &self.self_ref
    }

    pub fn id(&self) -> Option<&Id> {
        self.self_ref.id()
    }

    pub fn algorithm(&self) -> &Arc<dyn RoutingAlgorithm> {
        &self.algorithm
    }

    // === Public Methods ===

    /// Join the overlay through a node reachable at `contact`.
    ///
    /// Announces ourselves, seeds the routing tables from the reply, then
    /// routes our own identifier so the nodes around our ring position
    /// learn about us. With aggressive join configured the algorithm also
    /// resolves its full routing table before this returns.
    pub fn join(&self, contact: SocketAddr) -> Result<RoutingResult> {
        self.ensure_running()?;
        let self_id = self.self_ref.id().ok_or(Error::JoinFailed("node has no id"))?;

        let request = ConnectRequest {
            joining: self.self_ref.clone(),
        }
        .to_envelope(self.self_ref.clone());
        let timeout =
            adaptive_timeout(self.transport.as_ref(), contact, self.config.request_timeout);
        let reply = self
            .transport
            .send_and_receive(contact, request, timeout)
            .map_err(|_| Error::Unreachable(contact))?;
        let connect = ConnectReply::from_envelope(&reply)?;

        self.algorithm.join(&[reply.source.clone()]);
        self.algorithm.join(&connect.roots);

        // Locate our own ring position through the network.
        let mut results = self.drive(
            std::slice::from_ref(self_id),
            self.config.join_root_candidates.max(1),
            RouteMode::Owner,
            None,
        )?;
        let result = results
            .pop()
            .flatten()
            .ok_or(Error::JoinFailed("own identifier did not resolve"))?;

        self.algorithm.join_via(self)?;
        debug!(root = ?result.root(), "joined overlay");
        Ok(result)
    }

    /// Resolve each target to the node(s) responsible for it.
    pub fn route_to_root_node(
        &self,
        targets: &[Id],
        num_roots: usize,
    ) -> Result<Vec<Option<RoutingResult>>> {
        self.drive(targets, num_roots.max(1), RouteMode::Owner, None)
    }

    /// Resolve each target to the closest node the lookup converges on,
    /// without the final owner correction.
    pub fn route_to_closest_node(
        &self,
        targets: &[Id],
        num_roots: usize,
    ) -> Result<Vec<Option<RoutingResult>>> {
        self.drive(targets, num_roots.max(1), RouteMode::Closest, None)
    }

    /// Route to each target's owner while invoking the callback registered
    /// under `tag` on every hop; outputs come back in the results.
    pub fn invoke_callbacks_on_route(
        &self,
        targets: &[Id],
        num_roots: usize,
        tag: u8,
        args: Vec<Bytes>,
    ) -> Result<Vec<Option<RoutingResult>>> {
        self.drive(
            targets,
            num_roots.max(1),
            RouteMode::Owner,
            Some(CallbackSpec { tag, args }),
        )
    }

    pub fn add_callback_on_route(&self, tag: u8, callback: Arc<dyn RouteCallback>) {
        self.hub.add_route(tag, callback);
    }

    pub fn add_callback_on_node_failure(&self, callback: Arc<dyn NodeFailureCallback>) {
        self.hub.add_failure(callback);
    }

    /// Leave the overlay: stop maintenance and drop all routing state.
    /// The node keeps answering protocol traffic from its empty state and
    /// can re-[join](Self::join).
    pub fn leave(&self) {
        if let Some(mut stabilizer) = self.take_stabilizer() {
            stabilizer.stop();
        }
        self.algorithm.reset();
        info!(node = ?self.self_ref, "left overlay");
    }

    /// Shut the node down; subsequent routing calls fail.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(mut stabilizer) = self.take_stabilizer() {
            stabilizer.stop();
        }
        self.algorithm.stop();
    }

    pub fn suspend(&self) {
        if let Some(stabilizer) = self.stabilizer.lock().unwrap_or_else(|e| e.into_inner()).as_ref()
        {
            stabilizer.suspend();
        }
        self.algorithm.suspend();
    }

    pub fn resume(&self) {
        if let Some(stabilizer) = self.stabilizer.lock().unwrap_or_else(|e| e.into_inner()).as_ref()
        {
            stabilizer.resume();
        }
        self.algorithm.resume();
    }

    /// One synchronous maintenance round, for deterministic convergence in
    /// tests and embedders that schedule maintenance themselves.
    pub fn stabilize_once(&self) -> bool {
        self.algorithm.stabilize_once(self.config.request_timeout)
    }

    // === Private Methods ===

    fn take_stabilizer(&self) -> Option<Stabilizer> {
        self.stabilizer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotRunning)
        }
    }

    fn drive(
        &self,
        targets: &[Id],
        num_roots: usize,
        mode: RouteMode,
        callback: Option<CallbackSpec>,
    ) -> Result<Vec<Option<RoutingResult>>> {
        self.ensure_running()?;
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(bad) = targets.iter().find(|t| t.size() != self.config.id_size) {
            return Err(Error::InvalidIdSize {
                expected: self.config.id_size,
                got: bad.size(),
            });
        }

        match self.config.strategy {
            RoutingStrategy::Iterative => self.iterative.route(targets, num_roots, mode, callback),
            RoutingStrategy::Recursive => self.recursive.route(targets, num_roots, mode, callback),
        }
    }
}

impl RouteResolver for OverlayNode {
    fn route_to_root(&self, targets: &[Id], num: usize) -> Result<Vec<Option<RoutingResult>>> {
        self.drive(targets, num.max(1), RouteMode::Owner, None)
    }
}

impl Drop for OverlayNode {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Liveness probe: acknowledge and note the sender is alive.
struct PingHandler {
    self_ref: NodeReference,
    algorithm: Arc<dyn RoutingAlgorithm>,
}

impl Handler for PingHandler {
    fn handle(&self, _from: SocketAddr, envelope: Envelope) -> Option<Envelope> {
        if PingRequest::from_envelope(&envelope).is_err() {
            return None;
        }
        self.algorithm.touch(&envelope.source);
        Some(Ack.to_envelope(self.self_ref.clone(), Tag::Ack))
    }
}

/// First contact of a joining node: answer with the root candidates for
/// its identifier and feed it into the routing tables.
struct ConnectHandler {
    self_ref: NodeReference,
    algorithm: Arc<dyn RoutingAlgorithm>,
    id_size: usize,
    num_roots: usize,
}

impl Handler for ConnectHandler {
    fn handle(&self, _from: SocketAddr, envelope: Envelope) -> Option<Envelope> {
        let request = match ConnectRequest::from_envelope(&envelope) {
            Ok(request) => request,
            Err(error) => {
                debug!(%error, "malformed connect request dropped");
                return None;
            }
        };

        let joining = request.joining.with_hashed_id(self.id_size);
        let joining_id = joining.id()?.clone();
        if joining_id.size() != self.id_size {
            debug!(got = joining_id.size(), "connect request from a foreign identifier space dropped");
            return None;
        }

        let is_root = self.algorithm.adjust_root(&joining_id).is_none();
        self.algorithm
            .notify_join(&joining, Some(&envelope.source), is_root);

        let roots = self.algorithm.root_candidates(&joining_id, self.num_roots);
        Some(
            ConnectReply { roots }
                .to_envelope(self.self_ref.clone()),
        )
    }
}
