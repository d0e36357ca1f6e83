//! End-to-end tests for the admin command surface on a single node.

use std::time::Duration;

use crate::helpers::{poll_until, TestNode};

#[tokio::test]
async fn myid_is_stable_hex() {
    let node = TestNode::start();
    let mut c = node.connect().await;

    let id = c.cmd("CLUSTER MYID").await;
    assert_eq!(id.len(), 40, "got: {id}");
    assert!(id.chars().all(|ch| ch.is_ascii_hexdigit()));
    assert_eq!(c.cmd("CLUSTER MYID").await, id);
}

#[tokio::test]
async fn fresh_node_reports_fail_state() {
    let node = TestNode::start();
    let mut c = node.connect().await;

    let info = c.cmd("CLUSTER INFO").await;
    assert!(info.contains("cluster_state:fail"), "got: {info}");
    assert!(info.contains("cluster_slots_assigned:0"), "got: {info}");
    assert!(info.contains("cluster_known_nodes:1"), "got: {info}");
}

#[tokio::test]
async fn full_slot_coverage_brings_state_ok() {
    let node = TestNode::start();
    let mut c = node.connect().await;

    c.ok("CLUSTER ADDSLOTS 0-16383").await;
    // The ok transition waits out the post-boot grace window.
    let info = poll_until(&mut c, "CLUSTER INFO", Duration::from_secs(10), |r| {
        r.contains("cluster_state:ok")
    })
    .await;
    assert!(info.contains("cluster_slots_assigned:16384"), "got: {info}");

    let nodes = c.cmd("CLUSTER NODES").await;
    assert_eq!(nodes.lines().count(), 1, "got: {nodes}");
    assert!(nodes.contains("myself,master"), "got: {nodes}");
    assert!(nodes.contains(" 0-16383"), "got: {nodes}");
}

#[tokio::test]
async fn addslots_is_all_or_nothing() {
    let node = TestNode::start();
    let mut c = node.connect().await;

    c.ok("CLUSTER ADDSLOTS 5").await;
    let err = c.err("CLUSTER ADDSLOTS 5 6").await;
    assert!(err.contains("already assigned"), "got: {err}");

    // the rejected batch must not have claimed slot 6
    let info = c.cmd("CLUSTER INFO").await;
    assert!(info.contains("cluster_slots_assigned:1"), "got: {info}");
}

#[tokio::test]
async fn delslots_splits_a_range() {
    let node = TestNode::start();
    let mut c = node.connect().await;

    c.ok("CLUSTER ADDSLOTS 10-12").await;
    c.ok("CLUSTER DELSLOTS 11").await;

    let nodes = c.cmd("CLUSTER NODES").await;
    assert!(nodes.contains(" 10 12"), "got: {nodes}");

    let err = c.err("CLUSTER DELSLOTS 11").await;
    assert!(err.contains("not assigned"), "got: {err}");
}

#[tokio::test]
async fn bumpepoch_then_still() {
    let node = TestNode::start();
    let mut c = node.connect().await;

    assert_eq!(c.cmd("CLUSTER BUMPEPOCH").await, "BUMPED 1");
    assert_eq!(c.cmd("CLUSTER BUMPEPOCH").await, "STILL 1");

    let info = c.cmd("CLUSTER INFO").await;
    assert!(info.contains("cluster_current_epoch:1"), "got: {info}");
    assert!(info.contains("cluster_my_epoch:1"), "got: {info}");
}

#[tokio::test]
async fn reset_hard_assumes_new_identity() {
    let node = TestNode::start();
    let mut c = node.connect().await;

    let id = c.cmd("CLUSTER MYID").await;
    c.ok("CLUSTER ADDSLOTS 0-99").await;
    c.ok("CLUSTER RESET HARD").await;

    assert_ne!(c.cmd("CLUSTER MYID").await, id);
    let info = c.cmd("CLUSTER INFO").await;
    assert!(info.contains("cluster_slots_assigned:0"), "got: {info}");
    assert!(info.contains("cluster_current_epoch:0"), "got: {info}");
}

#[tokio::test]
async fn reset_soft_keeps_identity() {
    let node = TestNode::start();
    let mut c = node.connect().await;

    let id = c.cmd("CLUSTER MYID").await;
    c.ok("CLUSTER ADDSLOTS 0-99").await;
    c.ok("CLUSTER RESET").await;

    assert_eq!(c.cmd("CLUSTER MYID").await, id);
    let info = c.cmd("CLUSTER INFO").await;
    assert!(info.contains("cluster_slots_assigned:0"), "got: {info}");
}

#[tokio::test]
async fn malformed_commands_are_rejected() {
    let node = TestNode::start();
    let mut c = node.connect().await;

    c.err("PING").await;
    c.err("CLUSTER SHRUG").await;
    c.err("CLUSTER ADDSLOTS").await;
    c.err("CLUSTER ADDSLOTS 16384").await;
    c.err("CLUSTER MEET 127.0.0.1 notaport").await;
    c.err("CLUSTER FORGET deadbeef").await;

    // the connection stays usable after errors
    assert_eq!(c.cmd("CLUSTER MYID").await.len(), 40);
}

#[tokio::test]
async fn forget_unknown_node_errors() {
    let node = TestNode::start();
    let mut c = node.connect().await;

    let err = c
        .err("CLUSTER FORGET 0123456789abcdef0123456789abcdef01234567")
        .await;
    assert!(err.contains("not found"), "got: {err}");
}
