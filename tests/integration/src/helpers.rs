//! Test helpers for spawning grapevine-server processes and talking the
//! admin line protocol.

use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// A grapevine-server subprocess managed by the test harness.
pub struct TestNode {
    child: Child,
    pub port: u16,
    pub bus_port: u16,
    _data_dir: Option<tempfile::TempDir>,
}

/// Options for starting a test node.
#[derive(Default)]
pub struct NodeOptions {
    pub node_timeout_ms: Option<u64>,
    /// Owned temp directory (cleaned up when the node drops).
    pub data_dir: Option<tempfile::TempDir>,
    /// Use an existing path without taking ownership.
    /// If both `data_dir` and `data_dir_path` are set, `data_dir_path` wins.
    pub data_dir_path: Option<PathBuf>,
    /// Reuse a fixed (admin, bus) port pair, for restart tests.
    pub ports: Option<(u16, u16)>,
}

impl TestNode {
    /// Starts a new grapevine-server on a random port pair.
    ///
    /// Blocks until the admin port is accepting connections (up to 5
    /// seconds).
    pub fn start() -> Self {
        Self::start_with(NodeOptions::default())
    }

    /// Starts a new grapevine-server with custom options.
    pub fn start_with(opts: NodeOptions) -> Self {
        let (port, bus_port) = opts.ports.unwrap_or_else(find_free_port_pair);

        let binary = server_binary();

        let mut cmd = Command::new(&binary);
        cmd.arg("--bind").arg("127.0.0.1");
        cmd.arg("--port").arg(port.to_string());
        cmd.arg("--cluster-port-offset")
            .arg((bus_port - port).to_string());
        // suppress tracing output in tests
        cmd.env("RUST_LOG", "error");

        if let Some(timeout) = opts.node_timeout_ms {
            cmd.arg("--node-timeout").arg(timeout.to_string());
        }

        let data_dir = if let Some(ref path) = opts.data_dir_path {
            cmd.arg("--data-dir").arg(path);
            None // caller manages the directory lifetime
        } else {
            let dir = opts
                .data_dir
                .unwrap_or_else(|| tempfile::tempdir().unwrap());
            cmd.arg("--data-dir").arg(dir.path());
            Some(dir)
        };

        let child = cmd
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .unwrap_or_else(|e| {
                panic!("failed to spawn grapevine-server at {}: {e}", binary.display())
            });

        // wait for the admin listener to come up
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if Instant::now() > deadline {
                panic!("grapevine-server failed to start within 5 seconds on port {port}");
            }
            if std::net::TcpStream::connect(format!("127.0.0.1:{port}")).is_ok() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        Self {
            child,
            port,
            bus_port,
            _data_dir: data_dir,
        }
    }

    /// Connects an admin client to this node.
    pub async fn connect(&self) -> AdminClient {
        AdminClient::connect(self.port).await
    }

    /// Kills the subprocess, releasing its ports.
    pub fn stop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A client for the admin line protocol: one command per line, responses
/// terminated by an empty line.
pub struct AdminClient {
    write: OwnedWriteHalf,
    lines: Lines<BufReader<OwnedReadHalf>>,
}

impl AdminClient {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(format!("127.0.0.1:{port}"))
            .await
            .unwrap_or_else(|e| panic!("failed to connect to 127.0.0.1:{port}: {e}"));
        let (read, write) = stream.into_split();
        Self {
            write,
            lines: BufReader::new(read).lines(),
        }
    }

    /// Sends a command line and returns the response body (without the
    /// terminating empty line).
    pub async fn cmd(&mut self, line: &str) -> String {
        self.write
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
        let mut body = Vec::new();
        loop {
            match self.lines.next_line().await.unwrap() {
                Some(l) if l.is_empty() => break,
                Some(l) => body.push(l),
                None => panic!("server closed connection while waiting for response"),
            }
        }
        body.join("\n")
    }

    /// Sends a command and expects an `OK` response.
    pub async fn ok(&mut self, line: &str) {
        let response = self.cmd(line).await;
        assert_eq!(response, "OK", "command '{line}' failed: {response}");
    }

    /// Sends a command and expects an `ERR` response. Returns the message.
    pub async fn err(&mut self, line: &str) -> String {
        let response = self.cmd(line).await;
        assert!(
            response.starts_with("ERR "),
            "expected error for '{line}', got: {response}"
        );
        response
    }
}

/// Re-sends `command` until `predicate` accepts the response or `timeout`
/// elapses. Returns the accepted response.
pub async fn poll_until(
    client: &mut AdminClient,
    command: &str,
    timeout: Duration,
    predicate: impl Fn(&str) -> bool,
) -> String {
    let deadline = Instant::now() + timeout;
    loop {
        let response = client.cmd(command).await;
        if predicate(&response) {
            return response;
        }
        if Instant::now() > deadline {
            panic!("timed out polling '{command}'; last response:\n{response}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Finds two consecutive free TCP ports (admin, bus).
fn find_free_port_pair() -> (u16, u16) {
    loop {
        let first = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = first.local_addr().unwrap().port();
        let Some(next) = port.checked_add(1) else {
            continue;
        };
        if TcpListener::bind(("127.0.0.1", next)).is_ok() {
            return (port, next);
        }
    }
}

/// Locates the grapevine-server binary in the cargo target directory.
pub fn server_binary() -> PathBuf {
    // test binary is in target/debug/deps/ — go up to target/debug/
    let mut path = std::env::current_exe().unwrap();
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push("grapevine-server");
    if !path.exists() {
        panic!(
            "grapevine-server binary not found. run `cargo build` first.\nlooked at: {}",
            path.display()
        );
    }
    path
}
