//! The pluggable routing-algorithm contract.
//!
//! A routing driver never depends on a concrete algorithm: it asks the
//! [RoutingAlgorithm] trait object for locally-known candidates, feeds
//! liveness observations back through `touch`/`forget`, and threads an
//! opaque [RoutingContext] alongside every in-flight target.

pub mod ring;
mod stabilize;

pub use stabilize::Stabilizer;

use std::sync::Arc;
use std::time::Duration;

use crate::common::{Distance, Id, NodeReference, RoutingResult};
use crate::config::Config;
use crate::transport::Transport;
use crate::{Error, Result};

/// Opaque per-target state created at the start of one routing operation
/// and carried hop-to-hop.
///
/// A closed set of variant payloads: ring algorithms carry nothing,
/// de-Bruijn-style algorithms evolve a virtual successor pointer. Drivers
/// never assume it is absent.
#[derive(Debug, Clone, PartialEq)]
pub enum RoutingContext {
    None,
    VirtualPointer(Id),
}

/// Resolves identifiers through the overlay on behalf of an algorithm.
///
/// Breaks the cycle between algorithms and drivers: aggressive join needs
/// full lookups, which only the node's driver can perform.
pub trait RouteResolver {
    fn route_to_root(&self, targets: &[Id], num: usize) -> Result<Vec<Option<RoutingResult>>>;
}

/// The local "who is closer" decision procedure behind every lookup.
///
/// One instance per node owns that node's routing tables; all methods take
/// `&self` and must be safe under concurrent invocation from multiple
/// in-flight lookups and the background stabilizer.
pub trait RoutingAlgorithm: Send + Sync {
    /// Best-known next hops toward `target`, best-first, at most `max_num`,
    /// possibly including self.
    fn closest_to(&self, target: &Id, max_num: usize, ctx: &RoutingContext)
        -> Vec<NodeReference>;

    /// Nodes that should own/replicate `target`, self-inclusive, best-first.
    fn root_candidates(&self, target: &Id, max_num: usize) -> Vec<NodeReference>;

    /// Correction list, invoked on the node a lookup converged to. `None`
    /// means this node is the owner; `Some` redirects to the true owner(s)
    /// for algorithms where the convergence point is a predecessor of the
    /// owner.
    fn adjust_root(&self, target: &Id) -> Option<Vec<NodeReference>>;

    fn initial_context(&self, target: &Id) -> RoutingContext;

    /// Per-hop context transform.
    fn advance_context(&self, ctx: &RoutingContext, hop: &NodeReference) -> RoutingContext;

    /// Algorithm-defined distance used to order candidate lists, when the
    /// algorithm supports a global order (see [Self::supports_sorting]).
    fn distance(&self, target: &Id, node: &NodeReference) -> Option<Distance>;

    /// Whether candidate lists can be merged under a global distance order;
    /// drivers fall back to replace-on-reply otherwise.
    fn supports_sorting(&self) -> bool {
        true
    }

    /// Bootstrap insert of a known-alive neighbor set.
    fn join(&self, neighbors: &[NodeReference]);

    /// Full join against the overlay; aggressive algorithms resolve their
    /// routing table through `resolver` before returning.
    fn join_via(&self, resolver: &dyn RouteResolver) -> Result<()>;

    /// Per-hop join notification: `joining` passed through this node on its
    /// way in, `is_root` when this node is a root candidate for it.
    fn notify_join(&self, joining: &NodeReference, last_hop: Option<&NodeReference>, is_root: bool);

    /// Candidate seen alive.
    fn touch(&self, node: &NodeReference);

    /// Candidate confirmed dead.
    fn forget(&self, node: &NodeReference);

    /// Tie-break policy when a routing-table slot is full.
    fn to_replace(&self, existing: &NodeReference, candidate: &NodeReference) -> bool;

    /// Register this algorithm's control-protocol handlers on the transport.
    fn attach(&self, transport: &Arc<dyn Transport>);

    /// One round of background maintenance. Returns `true` when the
    /// neighbor set changed, which resets the caller's backoff.
    fn stabilize_once(&self, timeout: Duration) -> bool;

    // === Lifecycle ===

    fn reset(&self);
    fn stop(&self);
    fn suspend(&self);
    fn resume(&self);
}

/// Instantiate the algorithm named by the configuration string.
///
/// A fixed match, not a runtime registry: the set of algorithms is closed
/// at compile time.
pub fn create(self_ref: NodeReference, config: &Config) -> Result<Arc<dyn RoutingAlgorithm>> {
    match config.algorithm.as_str() {
        "ring" | "chord" => Ok(Arc::new(ring::RingAlgorithm::new(self_ref, config)?)),
        other => Err(Error::UnknownAlgorithm(other.to_string())),
    }
}
