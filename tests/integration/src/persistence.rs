//! End-to-end tests for nodes.conf persistence across restarts.

use std::time::Duration;

use crate::helpers::{poll_until, NodeOptions, TestNode};

/// Waits until nodes.conf exists and its contents satisfy `predicate`.
fn wait_for_conf(dir: &std::path::Path, predicate: impl Fn(&str) -> bool) -> String {
    let path = dir.join("nodes.conf");
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(text) = std::fs::read_to_string(&path) {
            if predicate(&text) {
                return text;
            }
        }
        if std::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", path.display());
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[tokio::test]
async fn identity_and_slots_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut node = TestNode::start_with(NodeOptions {
        data_dir_path: Some(dir.path().to_path_buf()),
        ..Default::default()
    });
    let ports = (node.port, node.bus_port);

    let mut c = node.connect().await;
    let id = c.cmd("CLUSTER MYID").await;
    c.ok("CLUSTER ADDSLOTS 0-99").await;
    c.ok("CLUSTER BUMPEPOCH").await;

    // the config save is asynchronous; wait for it to land on disk
    wait_for_conf(dir.path(), |text| text.contains("0-99"));
    drop(c);
    node.stop();

    let restarted = TestNode::start_with(NodeOptions {
        data_dir_path: Some(dir.path().to_path_buf()),
        ports: Some(ports),
        ..Default::default()
    });
    let mut c = restarted.connect().await;

    assert_eq!(c.cmd("CLUSTER MYID").await, id);
    let nodes = c.cmd("CLUSTER NODES").await;
    assert!(nodes.contains(" 0-99"), "got: {nodes}");
    let info = c.cmd("CLUSTER INFO").await;
    assert!(info.contains("cluster_slots_assigned:100"), "got: {info}");
    assert!(info.contains("cluster_current_epoch:1"), "got: {info}");
}

#[tokio::test]
async fn peers_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut a = TestNode::start_with(NodeOptions {
        data_dir_path: Some(dir.path().to_path_buf()),
        ..Default::default()
    });
    let a_ports = (a.port, a.bus_port);
    let b = TestNode::start();

    let mut ca = a.connect().await;
    ca.ok(&format!("CLUSTER MEET 127.0.0.1 {} {}", b.port, b.bus_port))
        .await;
    poll_until(&mut ca, "CLUSTER NODES", Duration::from_secs(10), |r| {
        r.lines().count() == 2 && !r.contains("handshake")
    })
    .await;
    let id_b = b.connect().await.cmd("CLUSTER MYID").await;

    wait_for_conf(dir.path(), |text| text.contains(&id_b));
    drop(ca);
    a.stop();

    let restarted = TestNode::start_with(NodeOptions {
        data_dir_path: Some(dir.path().to_path_buf()),
        ports: Some(a_ports),
        ..Default::default()
    });
    let mut ca = restarted.connect().await;

    // b is remembered from nodes.conf and reconnected to
    let nodes = poll_until(&mut ca, "CLUSTER NODES", Duration::from_secs(10), |r| {
        r.lines()
            .any(|l| l.contains(&id_b) && !l.contains("disconnected"))
    })
    .await;
    assert_eq!(nodes.lines().count(), 2, "got: {nodes}");
}
