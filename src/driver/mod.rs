//! Routing drivers: the machinery that moves a lookup across the network.
//!
//! Two strategies share this module's plumbing. The [iterative] driver
//! keeps the initiator in charge of every hop; the [recursive] driver
//! hands the lookup off and waits for the owner to answer directly. Both
//! fork sub-operations through the bounded [pool::WorkerPool], blame
//! failures through the per-operation [Blacklist], and surface
//! application hooks through the [CallbackHub].

pub mod iterative;
pub mod pool;
pub mod recursive;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::debug;

use crate::algorithm::RoutingAlgorithm;
use crate::common::{Id, NodeReference};
use crate::proto::CallbackSpec;

/// What a lookup resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteMode {
    /// Converge, then correct the final hop to the target's true owner.
    Owner,
    /// Stop at the convergence point: the closest node the lookup reached.
    Closest,
}

/// Application hook invoked on every node a lookup passes through.
///
/// The returned bytes, if any, are accumulated hop-by-hop into the
/// operation's [crate::common::RoutingResult].
pub trait RouteCallback: Send + Sync {
    fn invoke(&self, from: &NodeReference, targets: &[Id], args: &[Bytes]) -> Option<Bytes>;
}

/// Notified once per operation for every node confirmed dead during it.
pub trait NodeFailureCallback: Send + Sync {
    fn on_failure(&self, node: &NodeReference);
}

/// Registry of application callbacks, shared by both drivers and the
/// server-side handlers.
#[derive(Default)]
pub struct CallbackHub {
    route: Mutex<HashMap<u8, Arc<dyn RouteCallback>>>,
    failure: Mutex<Vec<Arc<dyn NodeFailureCallback>>>,
}

impl CallbackHub {
    pub fn add_route(&self, tag: u8, callback: Arc<dyn RouteCallback>) {
        self.route
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tag, callback);
    }

    pub fn add_failure(&self, callback: Arc<dyn NodeFailureCallback>) {
        self.failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }

    /// Run the locally registered callback for `spec`, if any.
    pub fn invoke_route(
        &self,
        spec: &CallbackSpec,
        from: &NodeReference,
        targets: &[Id],
    ) -> Option<Bytes> {
        let callback = self
            .route
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&spec.tag)
            .cloned()?;
        callback.invoke(from, targets, &spec.args)
    }

    pub fn notify_failure(&self, node: &NodeReference) {
        let callbacks: Vec<_> = self
            .failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for callback in callbacks {
            callback.on_failure(node);
        }
    }
}

/// Per-operation record of condemned nodes.
///
/// `forget` and the failure callbacks fire exactly once per node per
/// operation, no matter how many of the operation's forks blame it.
pub struct Blacklist {
    algorithm: Arc<dyn RoutingAlgorithm>,
    hub: Arc<CallbackHub>,
    condemned: Mutex<HashSet<NodeKey>>,
}

#[derive(PartialEq, Eq, Hash)]
enum NodeKey {
    Addr(SocketAddr),
    Id(Id),
}

impl Blacklist {
    pub fn new(algorithm: Arc<dyn RoutingAlgorithm>, hub: Arc<CallbackHub>) -> Blacklist {
        Blacklist {
            algorithm,
            hub,
            condemned: Mutex::new(HashSet::new()),
        }
    }

    fn key(node: &NodeReference) -> Option<NodeKey> {
        node.addr()
            .map(NodeKey::Addr)
            .or_else(|| node.id().cloned().map(NodeKey::Id))
    }

    /// Blame a node for a failed request. Returns `true` on first blame.
    pub fn condemn(&self, node: &NodeReference) -> bool {
        let Some(key) = Blacklist::key(node) else {
            return false;
        };

        let fresh = self
            .condemned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key);
        if fresh {
            debug!(node = ?node, "node condemned during routing");
            self.algorithm.forget(node);
            self.hub.notify_failure(node);
        }
        fresh
    }

    pub fn contains(&self, node: &NodeReference) -> bool {
        match Blacklist::key(node) {
            Some(key) => self
                .condemned
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(&key),
            None => false,
        }
    }

    /// Seed the list with nodes condemned earlier in a multi-hop operation.
    pub fn import(&self, nodes: &[NodeReference]) {
        let mut condemned = self.condemned.lock().unwrap_or_else(|e| e.into_inner());
        for node in nodes {
            if let Some(key) = Blacklist::key(node) {
                condemned.insert(key);
            }
        }
    }

    pub fn nodes(&self) -> Vec<NodeReference> {
        // Reconstructed references carry whichever identity we keyed on.
        self.condemned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|key| match key {
                NodeKey::Addr(addr) => NodeReference::from_addr(*addr),
                NodeKey::Id(id) => NodeReference::from_id(id.clone()),
            })
            .collect()
    }
}

/// Group target indices by the address of their chosen next hop, so one
/// request per distinct hop serves every target heading there.
pub(crate) fn partition_by_hop(
    picks: impl IntoIterator<Item = (usize, NodeReference)>,
) -> Vec<(NodeReference, Vec<usize>)> {
    let mut order: Vec<(NodeReference, Vec<usize>)> = Vec::new();
    for (idx, node) in picks {
        match order.iter_mut().find(|(n, _)| n.addr() == node.addr()) {
            Some((_, idxs)) => idxs.push(idx),
            None => order.push((node, vec![idx])),
        }
    }
    order
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::algorithm::ring::RingAlgorithm;
    use crate::config::Config;

    fn node(id: u128) -> NodeReference {
        NodeReference::new(
            Id::from_uint(id, 2),
            SocketAddr::from(([127, 0, 0, 1], id as u16 + 1)),
        )
    }

    struct CountFailures(Mutex<usize>);

    impl NodeFailureCallback for CountFailures {
        fn on_failure(&self, _node: &NodeReference) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn condemn_fires_once_per_node() {
        let config = Config {
            id_size: 2,
            ..Config::default()
        };
        let algorithm: Arc<dyn RoutingAlgorithm> =
            Arc::new(RingAlgorithm::new(node(0), &config).unwrap());
        let hub = Arc::new(CallbackHub::default());
        let counter = Arc::new(CountFailures(Mutex::new(0)));
        hub.add_failure(counter.clone());

        let blacklist = Blacklist::new(algorithm, hub);

        assert!(blacklist.condemn(&node(5)));
        assert!(!blacklist.condemn(&node(5)));
        assert!(blacklist.contains(&node(5)));
        assert!(!blacklist.contains(&node(6)));
        assert_eq!(*counter.0.lock().unwrap(), 1);
    }

    #[test]
    fn partition_groups_by_next_hop() {
        let partitions = partition_by_hop(vec![
            (0, node(10)),
            (1, node(20)),
            (2, node(10)),
        ]);

        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0], (node(10), vec![0, 2]));
        assert_eq!(partitions[1], (node(20), vec![1]));
    }
}
