mod common;

use std::time::Duration;

use common::Network;
use graviti::{config::Config, NodeEvent, NodeId};

fn no_pns() -> Config {
    Config {
        use_pns: false,
        ..Default::default()
    }
}

#[test]
fn lone_node_starts_a_ring() {
    let mut network = Network::new();
    let a = network.add_and_join(NodeId::rand(), Config::default(), "");

    assert!(network.node(a).is_ready());
    assert!(!network.node(a).is_bootstrapping());
    assert!(network.node(a).leafset().is_empty());
    assert_eq!(network.take_events(a), vec![NodeEvent::BootstrapCompleted]);
}

#[test]
fn second_node_joins() {
    let mut network = Network::new();
    let a = network.add_and_join(NodeId::rand(), Config::default(), "");
    let b = network.add_and_join(NodeId::rand(), Config::default(), &a.to_string());

    let (a_id, b_id) = (network.id(a), network.id(b));

    assert!(network.node(b).is_ready());
    assert!(!network.node(b).is_bootstrapping());
    assert!(network.node(b).leafset().contains(&a_id));
    assert!(network.node(a).leafset().contains(&b_id));
    assert!(network.node(b).routing_table().peer(&a_id).is_some());

    let b_events = network.take_events(b);
    assert!(b_events.contains(&NodeEvent::BootstrapCompleted));
    assert!(b_events.contains(&NodeEvent::PeerArrived { id: a_id, addr: a }));
    assert!(network
        .take_events(a)
        .contains(&NodeEvent::PeerArrived { id: b_id, addr: b }));
}

#[test]
fn join_without_proximity_search() {
    let mut network = Network::new();
    let a = network.add_and_join(NodeId::rand(), no_pns(), "");
    let b = network.add_and_join(NodeId::rand(), no_pns(), &a.to_string());

    assert!(network.node(b).is_ready());
    assert!(network.node(a).leafset().contains(&network.id(b)));
}

#[test]
fn ring_converges() {
    let mut network = Network::new();
    let first = network.add_and_join(NodeId::rand(), Config::default(), "");
    for _ in 0..9 {
        network.add_and_join(NodeId::rand(), Config::default(), &first.to_string());
    }

    network.run_for(Duration::from_secs(60), Duration::from_millis(500));

    let addrs = network.addrs();
    for &addr in &addrs {
        let node = network.node(addr);
        assert!(node.is_ready());
        assert_eq!(node.leafset().len(), addrs.len() - 1);

        for &other in addrs.iter().filter(|&&other| other != addr) {
            let other_id = network.id(other);
            assert!(node.leafset().contains(&other_id));
            // The slot is taken, by this peer or by one with the same prefix.
            assert!(node.routing_table().slot_for(&other_id).is_some());
        }
    }
}

#[test]
fn joins_through_a_later_nearest_node() {
    let mut network = Network::new();
    let a = network.add_and_join(
        NodeId::from_hex("1000000000000000000000000000000000000000").unwrap(),
        no_pns(),
        "",
    );
    let b = network.add_and_join(
        NodeId::from_hex("8000000000000000000000000000000000000000").unwrap(),
        no_pns(),
        &a.to_string(),
    );

    // The request goes through `a`, but `b` is the node nearest to the joining id and answers.
    let c = network.add_and_join(
        NodeId::from_hex("8100000000000000000000000000000000000000").unwrap(),
        no_pns(),
        &a.to_string(),
    );

    let c_id = network.id(c);
    assert!(network.node(c).is_ready());
    assert!(network.node(c).leafset().contains(&network.id(a)));
    assert!(network.node(c).leafset().contains(&network.id(b)));
    assert!(network.node(a).leafset().contains(&c_id));
    assert!(network.node(b).leafset().contains(&c_id));
}

#[test]
fn unreachable_endpoint_is_retried() {
    let mut network = Network::new();
    let a = network.add_and_join(NodeId::rand(), Config::default(), "");
    network.kill(a);

    let b = network.add_and_join(NodeId::rand(), Config::default(), &a.to_string());
    assert!(network.node(b).is_bootstrapping());

    // The proximity search times out and the fallback join request is lost as well.
    network.run_for(Duration::from_secs(25), Duration::from_millis(500));
    assert!(network.node(b).is_bootstrapping());
    assert!(!network.node(b).is_ready());

    network.revive(a);
    network.run_for(Duration::from_secs(10), Duration::from_millis(500));
    assert!(network.node(b).is_ready());
    assert!(network.node(a).leafset().contains(&network.id(b)));
}
