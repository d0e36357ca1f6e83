//! Tests for command-line handling of the server binary.

use std::process::Command;

use crate::helpers::server_binary;

#[test]
fn config_template_prints_defaults() {
    let output = Command::new(server_binary())
        .arg("--config-template")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("port = 7000"), "got: {stdout}");
    assert!(stdout.contains("cluster-port-offset = 10000"), "got: {stdout}");
    assert!(stdout.contains("node-timeout-ms = 15000"), "got: {stdout}");
}

#[test]
fn malformed_config_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grapevine.toml");
    std::fs::write(&path, "port = \"not a number\"\n").unwrap();

    let output = Command::new(server_binary())
        .arg("--config")
        .arg(&path)
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to parse config file"), "got: {stderr}");
}

#[test]
fn bus_port_overflow_is_fatal() {
    let output = Command::new(server_binary())
        .args(["--port", "60000", "--cluster-port-offset", "10000"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("exceeds u16 range"), "got: {stderr}");
}
