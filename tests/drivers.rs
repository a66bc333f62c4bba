//! Lookup behavior of both routing drivers over the in-process network.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{cluster, expected_closest, expected_owner, id_as_u128, test_config};
use ringroute::algorithm::RoutingContext;
use ringroute::proto::RouteRequest;
use ringroute::{
    Bytes, Error, Id, NodeFailureCallback, NodeReference, OverlayNode, RouteCallback,
    RoutingStrategy, Transport,
};

fn resolved_root(node: &OverlayNode, target: &Id) -> Option<Id> {
    let results = node
        .route_to_root_node(std::slice::from_ref(target), 1)
        .unwrap();
    results[0]
        .as_ref()
        .and_then(|r| r.root())
        .and_then(|n| n.id().cloned())
}

#[test]
fn recursive_lookups_agree_with_ownership() {
    let overlay = cluster(6, test_config(RoutingStrategy::Recursive));

    for _ in 0..100 {
        let target = Id::random(2);
        let owner = expected_owner(&overlay.nodes, &target).id().unwrap().clone();

        for node in overlay.nodes.iter().step_by(2) {
            assert_eq!(
                resolved_root(node, &target),
                Some(owner.clone()),
                "target {target}"
            );
        }
    }
}

#[test]
fn multi_target_lookups_fork_and_resolve() {
    for strategy in [RoutingStrategy::Iterative, RoutingStrategy::Recursive] {
        let overlay = cluster(6, test_config(strategy));
        let node = &overlay.nodes[3];

        let targets: Vec<Id> = (0..4).map(|_| Id::random(2)).collect();
        let results = node.route_to_root_node(&targets, 1).unwrap();
        assert_eq!(results.len(), targets.len());

        for (target, result) in targets.iter().zip(&results) {
            let owner = expected_owner(&overlay.nodes, target).id().unwrap().clone();
            let root = result
                .as_ref()
                .and_then(|r| r.root())
                .and_then(|n| n.id().cloned());
            assert_eq!(root, Some(owner), "target {target}");
        }
    }
}

#[test]
fn closest_node_skips_the_owner_correction() {
    for strategy in [RoutingStrategy::Iterative, RoutingStrategy::Recursive] {
        let overlay = cluster(6, test_config(strategy));
        let node = &overlay.nodes[1];

        for _ in 0..50 {
            let target = Id::random(2);
            let closest = expected_closest(&overlay.nodes, &target)
                .id()
                .unwrap()
                .clone();

            let results = node
                .route_to_closest_node(std::slice::from_ref(&target), 1)
                .unwrap();
            let root = results[0]
                .as_ref()
                .and_then(|r| r.root())
                .and_then(|n| n.id().cloned());
            assert_eq!(root, Some(closest), "target {target}");
        }
    }
}

struct CaptureTargets(Mutex<Vec<Vec<Id>>>);

impl RouteCallback for CaptureTargets {
    fn invoke(&self, _from: &NodeReference, targets: &[Id], _args: &[Bytes]) -> Option<Bytes> {
        self.0.lock().unwrap().push(targets.to_vec());
        None
    }
}

#[test]
fn targets_sharing_a_next_hop_ride_one_request() {
    const TAG: u8 = 9;

    for strategy in [RoutingStrategy::Iterative, RoutingStrategy::Recursive] {
        let overlay = cluster(5, test_config(strategy));
        let initiator = &overlay.nodes[0];
        let me = id_as_u128(initiator.id().unwrap());

        let captures: Vec<Arc<CaptureTargets>> = overlay
            .nodes
            .iter()
            .map(|node| {
                let capture = Arc::new(CaptureTargets(Mutex::new(Vec::new())));
                node.add_callback_on_route(TAG, capture.clone());
                capture
            })
            .collect();

        // Two targets squeezed just past the same node converge on it
        // together, so every step up to the owner correction batches them.
        let mut ids: Vec<u128> = overlay
            .nodes
            .iter()
            .map(|n| id_as_u128(n.id().unwrap()))
            .collect();
        ids.sort_unstable();
        let (m, _) = (0..ids.len())
            .map(|k| (ids[k], ids[(k + 1) % ids.len()]))
            .find(|(m, o)| *m != me && (o.wrapping_sub(*m) & 0xffff) >= 3)
            .unwrap();
        let targets = vec![
            Id::from_uint((m + 1) & 0xffff, 2),
            Id::from_uint((m + 2) & 0xffff, 2),
        ];

        let results = initiator
            .invoke_callbacks_on_route(&targets, 1, TAG, vec![])
            .unwrap();

        // Hop paths agree hop-for-hop over their shared prefix.
        let paths: Vec<Vec<NodeReference>> = results
            .iter()
            .map(|result| {
                result
                    .as_ref()
                    .unwrap()
                    .hops
                    .iter()
                    .map(|hop| hop.node.clone())
                    .collect()
            })
            .collect();
        let shared = paths[0].len().min(paths[1].len());
        assert!(shared >= 2, "{strategy:?}");
        assert_eq!(&paths[0][..shared], &paths[1][..shared], "{strategy:?}");

        // The convergence point saw both targets in one request.
        let at_hop = overlay
            .nodes
            .iter()
            .position(|n| id_as_u128(n.id().unwrap()) == m)
            .unwrap();
        let batches = captures[at_hop].0.lock().unwrap();
        assert!(
            batches.iter().any(|batch| batch.len() == 2),
            "{strategy:?}: {batches:?}"
        );
    }
}

#[test]
fn oversized_wire_target_is_rejected_not_fatal() {
    let overlay = cluster(2, test_config(RoutingStrategy::Iterative));
    let served = overlay.nodes[1].node_reference().addr().unwrap();

    // A rogue peer pushes a lookup whose target comes from a wider
    // identifier space than the overlay's.
    let rogue = overlay.net.endpoint();
    let request = RouteRequest {
        targets: vec![Id::random(4)],
        contexts: vec![RoutingContext::None],
        fan_out: 3,
        callback: None,
    }
    .to_envelope(NodeReference::new(Id::random(2), rogue.local_addr()));
    assert!(rogue
        .send_and_receive(served, request, Duration::from_millis(20))
        .is_err());

    // The receiver dropped the request and keeps serving.
    let target = Id::random(2);
    let owner = expected_owner(&overlay.nodes, &target).id().unwrap().clone();
    assert_eq!(resolved_root(&overlay.nodes[0], &target), Some(owner));

    // The caller-side API refuses mismatched targets outright.
    assert!(matches!(
        overlay.nodes[0].route_to_root_node(&[Id::random(4)], 1),
        Err(Error::InvalidIdSize { expected: 2, got: 4 })
    ));
}

struct IdEcho(Id);

impl RouteCallback for IdEcho {
    fn invoke(&self, _from: &NodeReference, _targets: &[Id], _args: &[Bytes]) -> Option<Bytes> {
        Some(Bytes::copy_from_slice(self.0.as_bytes()))
    }
}

#[test]
fn route_callbacks_fire_on_every_hop() {
    const TAG: u8 = 7;

    for strategy in [RoutingStrategy::Iterative, RoutingStrategy::Recursive] {
        let overlay = cluster(5, test_config(strategy));
        for node in &overlay.nodes {
            node.add_callback_on_route(TAG, Arc::new(IdEcho(node.id().unwrap().clone())));
        }

        let initiator = &overlay.nodes[2];
        // A target someone else owns, so the lookup must leave the
        // initiator.
        let target = loop {
            let target = Id::random(2);
            if expected_owner(&overlay.nodes, &target).id() != initiator.id()
                && expected_closest(&overlay.nodes, &target).id() != initiator.id()
            {
                break target;
            }
        };

        let results = initiator
            .invoke_callbacks_on_route(
                std::slice::from_ref(&target),
                1,
                TAG,
                vec![Bytes::from_static(b"payload")],
            )
            .unwrap();
        let result = results[0].as_ref().unwrap();

        // The initiator's own output plus at least one remote hop.
        assert!(result.callback_outputs.len() >= 2, "{strategy:?}");
        assert_eq!(
            result.callback_outputs[0].as_ref(),
            initiator.id().unwrap().as_bytes()
        );
        assert!(result.hops.len() >= 2);
    }
}

#[test]
fn zero_ttl_fails_closed_without_blocking() {
    for strategy in [RoutingStrategy::Iterative, RoutingStrategy::Recursive] {
        let overlay = cluster(3, test_config(strategy));

        let mut config = test_config(strategy);
        config.ttl = 0;
        let node = OverlayNode::new(config, overlay.net.endpoint()).unwrap();
        // Seed knowledge directly; joining needs a hop budget.
        node.algorithm().join(&[overlay.nodes[0].node_reference().clone()]);

        let started = Instant::now();
        let results = node.route_to_root_node(&[Id::random(2)], 1).unwrap();

        assert!(results[0].is_none(), "{strategy:?}");
        assert!(
            started.elapsed() < std::time::Duration::from_millis(150),
            "{strategy:?}"
        );
    }
}

struct CountFailures(AtomicUsize);

impl NodeFailureCallback for CountFailures {
    fn on_failure(&self, _node: &NodeReference) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn dead_hop_is_blamed_once_and_routed_around() {
    let overlay = cluster(6, test_config(RoutingStrategy::Iterative));

    let initiator = &overlay.nodes[1];
    let victim = &overlay.nodes[4];
    let victim_id = victim.id().unwrap().clone();

    let counter = Arc::new(CountFailures(AtomicUsize::new(0)));
    initiator.add_callback_on_node_failure(counter.clone());

    // A target just past the victim converges on it, so the lookup is
    // forced to notice the corpse.
    let target = victim_id.add_pow2(0);
    overlay.net.take_down(victim.node_reference().addr().unwrap());

    let root = resolved_root(initiator, &target).unwrap();

    let survivors: Vec<_> = overlay
        .nodes
        .iter()
        .filter(|n| n.id() != Some(&victim_id))
        .collect();
    let expected = survivors
        .iter()
        .min_by_key(|n| n.id().unwrap().distance(&target))
        .unwrap()
        .id()
        .unwrap()
        .clone();

    assert_eq!(root, expected);
    assert_eq!(counter.0.load(Ordering::SeqCst), 1);
}

#[test]
fn recursive_lookup_swallowed_by_a_partition_times_out() {
    let mut config = test_config(RoutingStrategy::Recursive);
    config.ttl = 5;
    let overlay = cluster(6, config);

    let initiator = &overlay.nodes[1];
    let initiator_id = initiator.id().unwrap().clone();

    // Find two ring-consecutive nodes, neither of them the initiator,
    // with room between them: the lookup will run initiator -> m -> o,
    // and o answers the initiator directly.
    let mut ids: Vec<u128> = overlay
        .nodes
        .iter()
        .map(|n| id_as_u128(n.id().unwrap()))
        .collect();
    ids.sort_unstable();
    let me = id_as_u128(&initiator_id);
    let (m, o) = (0..ids.len())
        .map(|k| (ids[k], ids[(k + 1) % ids.len()]))
        .find(|(m, o)| {
            *m != me && *o != me && (o.wrapping_sub(*m) & 0xffff) >= 2
        })
        .unwrap();
    let target = Id::from_uint((m + 1) & 0xffff, 2);
    assert_ne!((m + 1) & 0xffff, o);

    // The owner can hear the overlay but cannot reach the initiator, so
    // its direct answer is lost and the initiator waits out the deadline.
    let owner_addr = overlay
        .nodes
        .iter()
        .find(|n| id_as_u128(n.id().unwrap()) == o)
        .unwrap()
        .node_reference()
        .addr()
        .unwrap();
    overlay
        .net
        .cut_link(owner_addr, initiator.node_reference().addr().unwrap());

    let outcome = initiator.route_to_root_node(std::slice::from_ref(&target), 1);
    assert!(matches!(outcome, Err(Error::Timeout)));
}
