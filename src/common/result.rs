//! The caller-visible outcome of routing one target.

use std::time::SystemTime;

use bytes::Bytes;

use crate::common::NodeReference;

/// One node a lookup passed through, with the time it was reached.
///
/// Recorded for diagnostics and for adjust-last-hop comparisons.
#[derive(Debug, Clone)]
pub struct RoutingHop {
    pub node: NodeReference,
    pub at: SystemTime,
}

impl RoutingHop {
    pub fn new(node: NodeReference) -> RoutingHop {
        RoutingHop {
            node,
            at: SystemTime::now(),
        }
    }
}

/// The realized hop sequence and root candidates for one resolved target.
#[derive(Debug, Clone, Default)]
pub struct RoutingResult {
    /// Hops in the order the lookup progressed.
    pub hops: Vec<RoutingHop>,
    /// Owners/replicas for the target, best-first, self-inclusive at the root.
    pub roots: Vec<NodeReference>,
    /// Outputs of callbacks invoked along the route, in hop order.
    pub callback_outputs: Vec<Bytes>,
}

impl RoutingResult {
    /// The node the lookup finally converged on.
    pub fn root(&self) -> Option<&NodeReference> {
        self.roots.first()
    }
}
