//! The driver loop: wires the engine to the transport, the admin surface
//! and the nodes.conf persister.
//!
//! The engine is synchronous and single-owner; everything funnels through
//! one `select!` loop so no locking is needed. Engine actions are applied
//! as they come back: dials become background connect tasks, sends go to
//! the per-link writer channels, snapshots go to a coalescing persister
//! task so a burst of config changes costs one disk write.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use grapevine_cluster::{Action, ClusterEvent, ConfigSnapshot, Engine, LinkId, NodeId};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::transport::{self, LinkIds, TransportEvent};

/// Engine cron cadence.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A parsed admin operation, executed on the driver loop.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminCommand {
    Meet {
        ip: String,
        port: u16,
        /// Bus port; defaults to `port` + the configured offset.
        cport: Option<u16>,
    },
    Forget {
        node: NodeId,
    },
    AddSlots {
        slots: Vec<u16>,
    },
    DelSlots {
        slots: Vec<u16>,
    },
    BumpEpoch,
    Reset {
        hard: bool,
    },
    Info,
    Nodes,
    MyId,
}

/// An admin command plus the channel its response goes back on.
pub struct AdminRequest {
    pub command: AdminCommand,
    pub reply: oneshot::Sender<Result<String, String>>,
}

pub struct Runtime {
    engine: Engine,
    bus_port_offset: u16,
    ids: Arc<LinkIds>,
    writers: HashMap<LinkId, mpsc::Sender<Bytes>>,
    transport_tx: mpsc::Sender<TransportEvent>,
    transport_rx: mpsc::Receiver<TransportEvent>,
    admin_rx: mpsc::Receiver<AdminRequest>,
    persist_tx: watch::Sender<Option<ConfigSnapshot>>,
}

impl Runtime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Engine,
        bus_port_offset: u16,
        ids: Arc<LinkIds>,
        transport_tx: mpsc::Sender<TransportEvent>,
        transport_rx: mpsc::Receiver<TransportEvent>,
        admin_rx: mpsc::Receiver<AdminRequest>,
        persist_tx: watch::Sender<Option<ConfigSnapshot>>,
    ) -> Self {
        Self {
            engine,
            bus_port_offset,
            ids,
            writers: HashMap::new(),
            transport_tx,
            transport_rx,
            admin_rx,
            persist_tx,
        }
    }

    /// Drives the engine until the process shuts down.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.on_tick(),
                Some(event) = self.transport_rx.recv() => self.on_transport(event),
                Some(request) = self.admin_rx.recv() => self.on_admin(request),
            }
        }
    }

    fn on_tick(&mut self) {
        let now = now_ms();
        // A panic in the cron must not take the listeners down with it.
        let result =
            std::panic::catch_unwind(AssertUnwindSafe(|| self.engine.tick(now)));
        match result {
            Ok(actions) => self.apply(actions),
            Err(_) => error!("cluster cron panicked, skipping this tick"),
        }
    }

    fn on_transport(&mut self, event: TransportEvent) {
        let now = now_ms();
        match event {
            TransportEvent::InboundLink {
                link,
                peer_ip,
                writer,
            } => {
                self.writers.insert(link, writer);
                self.engine.inbound_link(link, peer_ip, now);
            }
            TransportEvent::ConnectFinished { link, node, writer } => {
                self.writers.insert(link, writer);
                let actions = self.engine.connect_finished(link, node, now);
                self.apply(actions);
            }
            TransportEvent::ConnectFailed { node } => {
                self.engine.connect_failed(node, now);
            }
            TransportEvent::Message { link, message } => {
                let actions = self.engine.handle_message(link, message, now);
                self.apply(actions);
            }
            TransportEvent::LinkClosed { link } => {
                self.writers.remove(&link);
                self.engine.link_closed(link, now);
            }
        }
    }

    fn on_admin(&mut self, request: AdminRequest) {
        let response = self.execute(request.command, now_ms());
        // The client may have hung up; nothing to do about it.
        let _ = request.reply.send(response);
    }

    /// Executes one admin command against the engine and renders the reply.
    fn execute(&mut self, command: AdminCommand, now: u64) -> Result<String, String> {
        match command {
            AdminCommand::Meet { ip, port, cport } => {
                let cport = match cport {
                    Some(c) => c,
                    None => port
                        .checked_add(self.bus_port_offset)
                        .ok_or_else(|| format!("bus port for {port} exceeds 65535"))?,
                };
                let actions = self.engine.meet(&ip, port, cport, now);
                self.apply(actions);
                Ok("OK".to_string())
            }
            AdminCommand::Forget { node } => {
                let actions = self.engine.forget(node, now).map_err(|e| e.to_string())?;
                self.apply(actions);
                Ok("OK".to_string())
            }
            AdminCommand::AddSlots { slots } => {
                let actions = self
                    .engine
                    .add_slots(&slots, now)
                    .map_err(|e| e.to_string())?;
                self.apply(actions);
                Ok("OK".to_string())
            }
            AdminCommand::DelSlots { slots } => {
                let actions = self
                    .engine
                    .del_slots(&slots, now)
                    .map_err(|e| e.to_string())?;
                self.apply(actions);
                Ok("OK".to_string())
            }
            AdminCommand::BumpEpoch => {
                let (bumped, epoch, actions) = self.engine.bump_epoch(now);
                self.apply(actions);
                if bumped {
                    Ok(format!("BUMPED {epoch}"))
                } else {
                    Ok(format!("STILL {epoch}"))
                }
            }
            AdminCommand::Reset { hard } => {
                let actions = self.engine.reset(hard, now);
                self.apply(actions);
                Ok("OK".to_string())
            }
            AdminCommand::Info => Ok(self.engine.info()),
            AdminCommand::Nodes => Ok(self.engine.nodes()),
            AdminCommand::MyId => Ok(self.engine.my_id().to_string()),
        }
    }

    fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Connect { node, ip, cport } => {
                    transport::spawn_connect(
                        node,
                        ip,
                        cport,
                        self.ids.clone(),
                        self.transport_tx.clone(),
                    );
                }
                Action::Send { link, message } => {
                    let Some(writer) = self.writers.get(&link) else {
                        debug!(link = link.0, "dropping send to unknown link");
                        continue;
                    };
                    if writer.try_send(message.encode()).is_err() {
                        debug!(link = link.0, "link write queue full, dropping message");
                    }
                }
                Action::Close { link } => {
                    // Dropping the writer ends the writer task and closes
                    // the socket; the reader reports LinkClosed on its own.
                    self.writers.remove(&link);
                }
                Action::SaveConfig { snapshot } => {
                    self.persist_tx.send_replace(Some(snapshot));
                }
            }
        }
    }
}

/// Logs cluster events as they happen. Replication wiring is surfaced here
/// for an outer data layer to pick up.
pub fn spawn_event_logger(mut events: mpsc::Receiver<ClusterEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ClusterEvent::NodeAdded { node } => {
                    info!(node = %node.short(), "node added to the cluster");
                }
                ClusterEvent::NodeRemoved { node } => {
                    info!(node = %node.short(), "node removed from the cluster");
                }
                ClusterEvent::FailureMarked { node } => {
                    warn!(node = %node.short(), "node marked as failing");
                }
                ClusterEvent::FailureCleared { node } => {
                    info!(node = %node.short(), "node failure state cleared");
                }
                ClusterEvent::HealthChanged { ok } => {
                    if ok {
                        info!("cluster state changed: ok");
                    } else {
                        warn!("cluster state changed: fail");
                    }
                }
                ClusterEvent::ElectionWon { epoch } => {
                    info!(epoch, "won failover election, promoted to master");
                }
                ClusterEvent::Published { channel, message } => {
                    debug!(
                        channel_len = channel.len(),
                        message_len = message.len(),
                        "pub/sub message received over the bus"
                    );
                }
                ClusterEvent::ReplicateFrom { master, ip, port } => {
                    info!(master = %master.short(), %ip, port, "replication target changed");
                }
            }
        }
    });
}

/// Writes the latest snapshot to nodes.conf, coalescing bursts.
pub fn spawn_persister(path: PathBuf, mut snapshots: watch::Receiver<Option<ConfigSnapshot>>) {
    tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            let Some(snapshot) = snapshot else { continue };
            if let Err(err) = write_config(&path, &snapshot).await {
                warn!(path = %path.display(), error = %err, "failed to save cluster config");
            }
        }
    });
}

/// Write-then-rename so a crash never leaves a truncated nodes.conf.
async fn write_config(path: &Path, snapshot: &ConfigSnapshot) -> std::io::Result<()> {
    let tmp = path.with_extension("conf.tmp");
    tokio::fs::write(&tmp, snapshot.to_config_string()).await?;
    tokio::fs::rename(&tmp, path).await
}
