mod admin;
mod config;
mod runtime;
mod transport;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use grapevine_cluster::{ConfigSnapshot, Engine};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::config::GrapevineConfig;
use crate::runtime::{now_ms, Runtime};
use crate::transport::LinkIds;

#[derive(Parser)]
#[command(name = "grapevine-server", about = "grapevine cluster node")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "GRAPEVINE_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// address to bind to
    #[arg(long, env = "GRAPEVINE_BIND")]
    bind: Option<String>,

    /// client (admin) port; the cluster bus listens on port + offset
    #[arg(short, long, env = "GRAPEVINE_PORT")]
    port: Option<u16>,

    /// port offset for the cluster bus (port + offset)
    #[arg(long, env = "GRAPEVINE_CLUSTER_PORT_OFFSET")]
    cluster_port_offset: Option<u16>,

    /// directory for the saved cluster configuration (nodes.conf)
    #[arg(long, env = "GRAPEVINE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// node timeout in milliseconds for failure detection
    #[arg(long, env = "GRAPEVINE_NODE_TIMEOUT")]
    node_timeout: Option<u64>,

    /// minimum slaves a master keeps before donating one to an orphan
    #[arg(long, env = "GRAPEVINE_MIGRATION_BARRIER")]
    migration_barrier: Option<usize>,

    /// keep serving when some slots are uncovered
    #[arg(long, env = "GRAPEVINE_NO_FULL_COVERAGE")]
    no_full_coverage: bool,

    /// IP announced to peers instead of the bind address (NAT setups)
    #[arg(long, env = "GRAPEVINE_ANNOUNCE_IP")]
    announce_ip: Option<String>,

    /// client port announced to peers
    #[arg(long, env = "GRAPEVINE_ANNOUNCE_PORT")]
    announce_port: Option<u16>,

    /// bus port announced to peers
    #[arg(long, env = "GRAPEVINE_ANNOUNCE_BUS_PORT")]
    announce_bus_port: Option<u16>,
}

/// Applies CLI overrides to a `GrapevineConfig`. Only `Some` values take
/// effect — this preserves the resolution order:
/// defaults → TOML file → env vars → CLI flags.
fn apply_args(cfg: &mut GrapevineConfig, args: &Args) {
    if let Some(ref bind) = args.bind {
        cfg.bind = bind.clone();
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(offset) = args.cluster_port_offset {
        cfg.cluster_port_offset = offset;
    }
    if let Some(ref dir) = args.data_dir {
        cfg.data_dir = dir.to_string_lossy().into_owned();
    }
    if let Some(timeout) = args.node_timeout {
        cfg.node_timeout_ms = timeout;
    }
    if let Some(barrier) = args.migration_barrier {
        cfg.migration_barrier = barrier;
    }
    if args.no_full_coverage {
        cfg.require_full_coverage = false;
    }
    if let Some(ref ip) = args.announce_ip {
        cfg.announce_ip = Some(ip.clone());
    }
    if let Some(port) = args.announce_port {
        cfg.announce_port = Some(port);
    }
    if let Some(port) = args.announce_bus_port {
        cfg.announce_bus_port = Some(port);
    }
}

/// Prints `msg` to stderr and exits with code 1.
fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

/// Parses a `host:port` pair into a `SocketAddr`. Exits with a message on
/// failure.
fn parse_bind_addr(host: &str, port: u16, label: &str) -> SocketAddr {
    match format!("{host}:{port}").parse() {
        Ok(addr) => addr,
        Err(e) => exit_err(format!("invalid {label} bind address '{host}:{port}': {e}")),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "grapevine=info".into()),
        )
        .init();

    let args = Args::parse();

    // --config-template: dump defaults and exit
    if args.config_template {
        match GrapevineConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    // build GrapevineConfig: defaults → TOML file → CLI/env overrides
    let mut cfg = match &args.config {
        Some(path) => GrapevineConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => GrapevineConfig::default(),
    };
    apply_args(&mut cfg, &args);

    let Some(bus_port) = cfg.bus_port() else {
        exit_err(format!(
            "error: port {} + cluster-port-offset {} exceeds u16 range",
            cfg.port, cfg.cluster_port_offset
        ));
    };

    let admin_addr = parse_bind_addr(&cfg.bind, cfg.port, "admin");
    let bus_addr = parse_bind_addr(&cfg.bind, bus_port, "bus");

    if let Err(e) = std::fs::create_dir_all(&cfg.data_dir) {
        exit_err(format!("failed to create data-dir '{}': {e}", cfg.data_dir));
    }

    let (events_tx, events_rx) = mpsc::channel(1024);
    let conf_path = cfg.nodes_conf_path();
    let engine = if conf_path.exists() {
        let text = std::fs::read_to_string(&conf_path)
            .unwrap_or_else(|e| exit_err(format!("failed to read nodes.conf: {e}")));
        let snapshot = ConfigSnapshot::parse(&text)
            .unwrap_or_else(|e| exit_err(format!("failed to parse nodes.conf: {e}")));
        Engine::from_snapshot(
            cfg.cluster_config(),
            &snapshot,
            events_tx,
            cfg.bind.clone(),
            cfg.port,
            bus_port,
            now_ms(),
        )
        .unwrap_or_else(|e| exit_err(format!("failed to restore cluster state: {e}")))
    } else {
        Engine::new(
            cfg.cluster_config(),
            events_tx,
            cfg.bind.clone(),
            cfg.port,
            bus_port,
            now_ms(),
        )
    };

    let bus_listener = TcpListener::bind(bus_addr)
        .await
        .unwrap_or_else(|e| exit_err(format!("failed to bind bus listener on {bus_addr}: {e}")));
    let admin_listener = TcpListener::bind(admin_addr).await.unwrap_or_else(|e| {
        exit_err(format!("failed to bind admin listener on {admin_addr}: {e}"))
    });

    info!(
        admin = %admin_addr,
        bus = %bus_addr,
        node = %engine.my_id().short(),
        "grapevine node starting"
    );

    let ids = Arc::new(LinkIds::default());
    let (transport_tx, transport_rx) = mpsc::channel(1024);
    let (admin_tx, admin_rx) = mpsc::channel(64);
    let (persist_tx, persist_rx) = watch::channel(None);

    transport::spawn_listener(bus_listener, ids.clone(), transport_tx.clone());
    admin::spawn_listener(admin_listener, admin_tx);
    runtime::spawn_persister(conf_path, persist_rx);
    runtime::spawn_event_logger(events_rx);

    let driver = Runtime::new(
        engine,
        cfg.cluster_port_offset,
        ids,
        transport_tx,
        transport_rx,
        admin_rx,
        persist_tx,
    );

    tokio::select! {
        _ = driver.run() => {}
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
}
