#![allow(dead_code)]

use std::time::Duration;

use ringroute::{Config, Id, MemNetwork, OverlayNode, RoutingStrategy};

/// Small identifiers and short timeouts keep the in-process overlays fast;
/// background stabilization is pushed out of the way so tests drive
/// maintenance rounds deterministically.
pub fn test_config(strategy: RoutingStrategy) -> Config {
    Config {
        id_size: 2,
        strategy,
        ttl: 16,
        request_timeout: Duration::from_millis(200),
        stabilize_min: Duration::from_secs(300),
        stabilize_max: Duration::from_secs(600),
        ..Config::default()
    }
}

pub struct Cluster {
    pub net: MemNetwork,
    pub nodes: Vec<OverlayNode>,
}

/// Build an overlay of `n` nodes joining sequentially through the first,
/// with maintenance rounds in between so the ring settles.
pub fn cluster(n: usize, config: Config) -> Cluster {
    let net = MemNetwork::new(config.signature.clone());
    let mut nodes: Vec<OverlayNode> = Vec::with_capacity(n);

    for i in 0..n {
        let node = OverlayNode::new(config.clone(), net.endpoint()).unwrap();
        if i > 0 {
            let contact = nodes[0].node_reference().addr().unwrap();
            node.join(contact).unwrap();
        }
        nodes.push(node);
        settle(&nodes);
    }
    settle(&nodes);

    Cluster { net, nodes }
}

/// A few synchronous stabilization rounds across the whole overlay.
pub fn settle(nodes: &[OverlayNode]) {
    for _ in 0..6 {
        for node in nodes {
            node.stabilize_once();
        }
    }
}

/// The node that should own `target`: the first node at or after it on
/// the ring (a node whose identifier equals the target exactly does not
/// count as being after it).
pub fn expected_owner<'a>(nodes: &'a [OverlayNode], target: &Id) -> &'a OverlayNode {
    nodes
        .iter()
        .min_by_key(|node| node.id().unwrap().distance(target))
        .unwrap()
}

/// The node a lookup converges on: the closest node at or before `target`.
pub fn expected_closest<'a>(nodes: &'a [OverlayNode], target: &Id) -> &'a OverlayNode {
    nodes
        .iter()
        .min_by_key(|node| target.distance(node.id().unwrap()))
        .unwrap()
}

pub fn id_as_u128(id: &Id) -> u128 {
    id.as_bytes()
        .iter()
        .fold(0u128, |acc, byte| (acc << 8) | u128::from(*byte))
}
