//! End-to-end tests for membership over the real cluster bus.

use std::time::Duration;

use crate::helpers::{poll_until, NodeOptions, TestNode};

const CONVERGE: Duration = Duration::from_secs(10);

/// Known nodes all confirmed: `want` lines, none still in handshake.
fn converged(response: &str, want: usize) -> bool {
    response.lines().count() == want && !response.contains("handshake")
}

#[tokio::test]
async fn meet_joins_two_nodes() {
    let a = TestNode::start();
    let b = TestNode::start();
    let mut ca = a.connect().await;
    let mut cb = b.connect().await;

    ca.ok(&format!("CLUSTER MEET 127.0.0.1 {} {}", b.port, b.bus_port))
        .await;

    let nodes_a = poll_until(&mut ca, "CLUSTER NODES", CONVERGE, |r| converged(r, 2)).await;
    poll_until(&mut cb, "CLUSTER NODES", CONVERGE, |r| converged(r, 2)).await;

    // both ends see each other under their real ids
    let id_b = cb.cmd("CLUSTER MYID").await;
    assert!(nodes_a.contains(&id_b), "got: {nodes_a}");
    let info = ca.cmd("CLUSTER INFO").await;
    assert!(info.contains("cluster_known_nodes:2"), "got: {info}");
}

#[tokio::test]
async fn gossip_spreads_membership() {
    let a = TestNode::start();
    let b = TestNode::start();
    let c = TestNode::start();
    let mut ca = a.connect().await;
    let mut cb = b.connect().await;
    let mut cc = c.connect().await;

    // only a is told about the others; b and c must find each other
    // through gossip
    ca.ok(&format!("CLUSTER MEET 127.0.0.1 {} {}", b.port, b.bus_port))
        .await;
    ca.ok(&format!("CLUSTER MEET 127.0.0.1 {} {}", c.port, c.bus_port))
        .await;

    poll_until(&mut ca, "CLUSTER NODES", CONVERGE, |r| converged(r, 3)).await;
    poll_until(&mut cb, "CLUSTER NODES", CONVERGE, |r| converged(r, 3)).await;
    poll_until(&mut cc, "CLUSTER NODES", CONVERGE, |r| converged(r, 3)).await;
}

#[tokio::test]
async fn slot_claims_travel_over_the_bus() {
    let a = TestNode::start();
    let b = TestNode::start();
    let mut ca = a.connect().await;
    let mut cb = b.connect().await;

    ca.ok("CLUSTER ADDSLOTS 0-99").await;
    ca.ok(&format!("CLUSTER MEET 127.0.0.1 {} {}", b.port, b.bus_port))
        .await;

    let id_a = ca.cmd("CLUSTER MYID").await;
    let nodes_b = poll_until(&mut cb, "CLUSTER NODES", CONVERGE, |r| {
        r.contains(" 0-99")
    })
    .await;
    assert!(nodes_b.contains(&id_a), "got: {nodes_b}");
}

#[tokio::test]
async fn killed_peer_is_suspected() {
    let opts = || NodeOptions {
        node_timeout_ms: Some(1_000),
        ..Default::default()
    };
    let a = TestNode::start_with(opts());
    let mut b = TestNode::start_with(opts());
    let mut ca = a.connect().await;

    ca.ok(&format!("CLUSTER MEET 127.0.0.1 {} {}", b.port, b.bus_port))
        .await;
    poll_until(&mut ca, "CLUSTER NODES", CONVERGE, |r| converged(r, 2)).await;

    b.stop();

    // no pong within the node timeout: b becomes fail? (PFAIL). With no
    // other slot owners there is no quorum to promote it to FAIL.
    let nodes = poll_until(&mut ca, "CLUSTER NODES", Duration::from_secs(15), |r| {
        r.contains("fail?")
    })
    .await;
    assert!(!nodes.contains("fail?,fail"), "suspicion must not self-promote: {nodes}");
}

#[tokio::test]
async fn forget_removes_and_blacklists_a_peer() {
    let a = TestNode::start();
    let b = TestNode::start();
    let mut ca = a.connect().await;
    let mut cb = b.connect().await;

    ca.ok(&format!("CLUSTER MEET 127.0.0.1 {} {}", b.port, b.bus_port))
        .await;
    poll_until(&mut ca, "CLUSTER NODES", CONVERGE, |r| converged(r, 2)).await;

    let id_b = cb.cmd("CLUSTER MYID").await;
    ca.ok(&format!("CLUSTER FORGET {id_b}")).await;

    let nodes = ca.cmd("CLUSTER NODES").await;
    assert_eq!(nodes.lines().count(), 1, "got: {nodes}");

    // b still knows a and keeps pinging; the blacklist stops a from
    // re-learning b
    tokio::time::sleep(Duration::from_millis(700)).await;
    let nodes = ca.cmd("CLUSTER NODES").await;
    assert_eq!(nodes.lines().count(), 1, "got: {nodes}");
}
