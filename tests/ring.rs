//! Ring formation and maintenance over the in-process network.

mod common;

use common::{cluster, expected_owner, settle, test_config};
use ringroute::{Id, RoutingStrategy};

#[test]
fn join_resolves_own_ring_position() {
    let config = test_config(RoutingStrategy::Iterative);
    let overlay = cluster(2, config);

    // Joining returned a result for the joiner's own identifier, so both
    // sides know each other now.
    let joiner = &overlay.nodes[1];
    let contact = &overlay.nodes[0];

    let results = joiner
        .route_to_root_node(std::slice::from_ref(contact.id().unwrap()), 1)
        .unwrap();
    assert!(results[0].is_some());
}

#[test]
fn overlay_converges_on_ownership() {
    let overlay = cluster(8, test_config(RoutingStrategy::Iterative));

    for round in 0..200 {
        let target = Id::random(2);
        let owner = expected_owner(&overlay.nodes, &target).id().unwrap().clone();

        // Every third node gets to resolve it; all must agree.
        for node in overlay.nodes.iter().step_by(3) {
            let results = node
                .route_to_root_node(std::slice::from_ref(&target), 1)
                .unwrap();
            let root = results[0]
                .as_ref()
                .and_then(|r| r.root())
                .and_then(|n| n.id().cloned())
                .unwrap();
            assert_eq!(root, owner, "target {target} in round {round}");
        }
    }
}

#[test]
fn aggressive_join_resolves_fingers_up_front() {
    let mut config = test_config(RoutingStrategy::Iterative);
    config.aggressive_join = true;
    let overlay = cluster(4, config);

    for _ in 0..100 {
        let target = Id::random(2);
        let owner = expected_owner(&overlay.nodes, &target).id().unwrap().clone();

        for node in &overlay.nodes {
            let results = node
                .route_to_root_node(std::slice::from_ref(&target), 1)
                .unwrap();
            let root = results[0]
                .as_ref()
                .and_then(|r| r.root())
                .and_then(|n| n.id().cloned())
                .unwrap();
            assert_eq!(root, owner, "target {target}");
        }
    }
}

#[test]
fn stabilization_routes_around_a_dead_successor() {
    let overlay = cluster(5, test_config(RoutingStrategy::Iterative));

    // Kill one non-contact node, then let the survivors' maintenance
    // notice.
    let victim_addr = overlay.nodes[2].node_reference().addr().unwrap();
    let victim_id = overlay.nodes[2].id().unwrap().clone();
    overlay.net.take_down(victim_addr);

    let survivors: Vec<_> = overlay
        .nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != 2)
        .map(|(_, n)| n)
        .collect();
    for _ in 0..6 {
        for node in &survivors {
            node.stabilize_once();
        }
    }

    // A target the victim used to own now belongs to its successor.
    let target = victim_id.sub_pow2(0);

    let results = survivors[0]
        .route_to_root_node(std::slice::from_ref(&target), 1)
        .unwrap();
    let root = results[0]
        .as_ref()
        .and_then(|r| r.root())
        .and_then(|n| n.id().cloned())
        .unwrap();

    assert_ne!(root, victim_id);
    let expected = survivors
        .iter()
        .min_by_key(|n| n.id().unwrap().distance(&target))
        .unwrap()
        .id()
        .unwrap()
        .clone();
    assert_eq!(root, expected);
}

#[test]
fn leave_drops_state_and_rejoin_works() {
    let overlay = cluster(3, test_config(RoutingStrategy::Iterative));
    let node = &overlay.nodes[2];

    node.leave();

    // The node still answers and can rejoin through the old contact.
    let contact = overlay.nodes[0].node_reference().addr().unwrap();
    assert!(node.join(contact).is_ok());
    settle(&overlay.nodes);

    let target = Id::random(2);
    let results = node
        .route_to_root_node(std::slice::from_ref(&target), 1)
        .unwrap();
    assert!(results[0].is_some());
}

#[test]
fn stopped_node_refuses_to_route() {
    let overlay = cluster(2, test_config(RoutingStrategy::Iterative));
    let node = &overlay.nodes[1];

    node.stop();
    assert!(node.route_to_root_node(&[Id::random(2)], 1).is_err());
}
