//! The gossip protocol engine.
//!
//! [`Engine`] owns the cluster view and implements the whole protocol, but
//! performs no IO: the driver feeds it decoded messages, link lifecycle
//! notifications, admin commands and time, and executes the [`Action`]s it
//! returns. State-change notifications additionally flow out on an event
//! channel as best-effort [`ClusterEvent`]s.
//!
//! All timestamps are wall-clock unix milliseconds supplied by the caller,
//! so tests drive a synthetic clock.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use rand::seq::IndexedRandom;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::error::ClusterError;
use crate::failover::Election;
use crate::message::{
    ClusterMessage, GossipEntry, MessageKind, Payload, PROTOCOL_VERSION,
};
use crate::node::{ClusterNode, Link, LinkId, NodeFlags, NodeId, NodeRole};
use crate::slots::SlotBitmap;
use crate::snapshot::ConfigSnapshot;
use crate::state::{ClusterHealth, ClusterState};

/// IO the driver must perform on the engine's behalf.
#[derive(Debug, Clone)]
pub enum Action {
    /// Dial the node's cluster bus address. The driver reports the outcome
    /// via `connect_finished` / `connect_failed`.
    Connect {
        node: NodeId,
        ip: String,
        cport: u16,
    },
    /// Write one message to a live link.
    Send {
        link: LinkId,
        message: ClusterMessage,
    },
    /// Tear a link down.
    Close { link: LinkId },
    /// Persist the cluster configuration.
    SaveConfig { snapshot: ConfigSnapshot },
}

/// Best-effort notifications about cluster state changes.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    NodeAdded { node: NodeId },
    NodeRemoved { node: NodeId },
    FailureMarked { node: NodeId },
    FailureCleared { node: NodeId },
    HealthChanged { ok: bool },
    /// This node won a failover election and promoted itself.
    ElectionWon { epoch: u64 },
    /// A cluster-wide publish relayed by a peer.
    Published { channel: Bytes, message: Bytes },
    /// This node should (re)establish replication from `master`.
    ReplicateFrom {
        master: NodeId,
        ip: String,
        port: u16,
    },
}

/// Milliseconds of clock skew tolerated when adopting a gossiped pong time.
const PONG_ADOPT_SLACK_MS: u64 = 500;

/// The sans-IO cluster protocol engine.
pub struct Engine {
    config: ClusterConfig,
    state: ClusterState,
    links: HashMap<LinkId, Link>,
    /// Nodes with a dial in flight, so one slow connect does not trigger a
    /// new attempt every tick.
    pending_connects: HashSet<NodeId>,
    events: mpsc::Sender<ClusterEvent>,
    last_snapshot: Option<ConfigSnapshot>,
    election: Option<Election>,
    /// When the next election attempt may start. `None` while the local
    /// master is healthy.
    election_schedule: Option<u64>,
    /// Master this node currently replicates from (as announced via
    /// `ClusterEvent::ReplicateFrom`).
    replication_target: Option<NodeId>,
    tick_count: u64,
    local_ip: String,
    local_port: u16,
    local_cport: u16,
}

impl Engine {
    /// Creates a fresh engine with a brand-new identity.
    pub fn new(
        config: ClusterConfig,
        events: mpsc::Sender<ClusterEvent>,
        ip: String,
        port: u16,
        cport: u16,
        now: u64,
    ) -> Self {
        let state = ClusterState::new(now);
        info!("No cluster configuration found, I'm {}", state.myself);
        let mut engine = Self::with_state(config, state, events, ip, port, cport);
        engine.adopt_local_address();
        engine
    }

    /// Restores an engine from a saved configuration.
    pub fn from_snapshot(
        config: ClusterConfig,
        snapshot: &ConfigSnapshot,
        events: mpsc::Sender<ClusterEvent>,
        ip: String,
        port: u16,
        cport: u16,
        now: u64,
    ) -> Result<Self, ClusterError> {
        let state = ClusterState::from_snapshot(snapshot, now)?;
        info!("Node configuration loaded, I'm {}", state.myself);
        let mut engine = Self::with_state(config, state, events, ip, port, cport);
        engine.adopt_local_address();
        Ok(engine)
    }

    fn with_state(
        config: ClusterConfig,
        state: ClusterState,
        events: mpsc::Sender<ClusterEvent>,
        ip: String,
        port: u16,
        cport: u16,
    ) -> Self {
        Self {
            config,
            state,
            links: HashMap::new(),
            pending_connects: HashSet::new(),
            events,
            last_snapshot: None,
            election: None,
            election_schedule: None,
            replication_target: None,
            tick_count: 0,
            local_ip: ip,
            local_port: port,
            local_cport: cport,
        }
    }

    pub fn my_id(&self) -> NodeId {
        self.state.myself
    }

    pub fn state(&self) -> &ClusterState {
        &self.state
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    // --- link lifecycle ---

    /// Registers a connection accepted by the transport.
    pub fn inbound_link(&mut self, link: LinkId, peer_ip: String, now: u64) {
        self.links.insert(
            link,
            Link {
                node: None,
                ctime: now,
                inbound: true,
                peer_ip,
            },
        );
    }

    /// A dial issued via [`Action::Connect`] succeeded: bind the link and
    /// greet the peer. The first contact after a MEET request uses MEET;
    /// everything else pings. A ping already outstanding keeps its original
    /// send time so the failure detector is not reset by reconnects.
    pub fn connect_finished(&mut self, link: LinkId, node: NodeId, now: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        self.pending_connects.remove(&node);
        let Some(target) = self.state.node_mut(&node) else {
            actions.push(Action::Close { link });
            return actions;
        };
        let peer_ip = target.ip.clone();
        target.link = Some(link);
        let meet = target.flags.meet;
        target.flags.meet = false;
        self.links.insert(
            link,
            Link {
                node: Some(node),
                ctime: now,
                inbound: false,
                peer_ip,
            },
        );
        let kind = if meet { MessageKind::Meet } else { MessageKind::Ping };
        self.send_probe(node, kind, now, &mut actions);
        actions
    }

    /// A dial failed. The node keeps (or gains) an outstanding ping time so
    /// the PFAIL machinery still applies to unreachable peers.
    pub fn connect_failed(&mut self, node: NodeId, now: u64) {
        self.pending_connects.remove(&node);
        if let Some(target) = self.state.node_mut(&node) {
            if target.ping_sent.is_none() {
                target.ping_sent = Some(now);
            }
        }
    }

    /// The transport lost a link. Idempotent.
    pub fn link_closed(&mut self, link: LinkId, _now: u64) {
        if let Some(info) = self.links.remove(&link) {
            if let Some(node) = info.node {
                if let Some(target) = self.state.node_mut(&node) {
                    if target.link == Some(link) {
                        target.link = None;
                    }
                }
            }
        }
    }

    fn free_link(&mut self, link: LinkId, actions: &mut Vec<Action>) {
        if let Some(info) = self.links.remove(&link) {
            if let Some(node) = info.node {
                if let Some(target) = self.state.node_mut(&node) {
                    if target.link == Some(link) {
                        target.link = None;
                    }
                }
            }
            actions.push(Action::Close { link });
        }
    }

    // --- message dispatch ---

    pub fn handle_message(
        &mut self,
        link: LinkId,
        msg: ClusterMessage,
        now: u64,
    ) -> Vec<Action> {
        let mut actions = Vec::new();
        self.state.note_received(msg.kind());

        if msg.version != PROTOCOL_VERSION {
            debug!(version = msg.version, "dropping message with wrong protocol version");
            return actions;
        }

        // Epochs ratchet up from any message of a confirmed peer.
        let sender_confirmed = self
            .state
            .node(&msg.sender)
            .map(|n| !n.in_handshake())
            .unwrap_or(false);
        if sender_confirmed {
            if msg.current_epoch > self.state.current_epoch {
                self.state.current_epoch = msg.current_epoch;
            }
            if let Some(sender) = self.state.node_mut(&msg.sender) {
                if msg.config_epoch > sender.config_epoch {
                    sender.config_epoch = msg.config_epoch;
                }
            }
        }

        let keep_link = match &msg.payload {
            Payload::Ping { .. } => self.handle_ping(link, &msg, false, now, &mut actions),
            Payload::Meet { .. } => self.handle_ping(link, &msg, true, now, &mut actions),
            Payload::Pong { .. } => self.handle_pong(link, &msg, now, &mut actions),
            Payload::Fail { .. } => self.handle_fail(&msg, now, &mut actions),
            Payload::Publish { .. } => self.handle_publish(&msg),
            Payload::Update { .. } => self.handle_update(&msg, now, &mut actions),
            Payload::FailoverAuthRequest { .. } => {
                self.handle_auth_request(link, &msg, now, &mut actions)
            }
            Payload::FailoverAuthAck => self.handle_auth_ack(&msg, now, &mut actions),
        };
        if !keep_link {
            self.free_link(link, &mut actions);
        }

        self.update_cluster_health(now);
        self.maybe_save(&mut actions);
        actions
    }

    fn handle_ping(
        &mut self,
        link: LinkId,
        msg: &ClusterMessage,
        meet: bool,
        now: u64,
        actions: &mut Vec<Action>,
    ) -> bool {
        let mut sender_known = self.state.contains(&msg.sender);

        // A MEET is an instruction to join: the sender vouches for itself,
        // so its identity can be taken from the header directly.
        if meet && !sender_known && !self.state.blacklist_contains(&msg.sender, now) {
            let mut node = ClusterNode::new(msg.sender, msg.role, NodeFlags::default(), now);
            node.ip = if msg.ip.is_empty() {
                self.links
                    .get(&link)
                    .map(|l| l.peer_ip.clone())
                    .unwrap_or_default()
            } else {
                msg.ip.clone()
            };
            node.port = msg.port;
            node.cport = msg.cport;
            node.pong_received = now;
            info!(node = %msg.sender.short(), ip = %node.ip, "node introduced itself via MEET");
            self.state.add_node(node);
            self.emit(ClusterEvent::NodeAdded { node: msg.sender });
            sender_known = true;
        }

        if sender_known {
            if let Payload::Ping { gossip } | Payload::Meet { gossip } = &msg.payload {
                self.process_gossip(msg.sender, gossip, now, actions);
            }
        }

        let pong = self.build_message(Payload::Pong {
            gossip: self.sample_gossip(),
        });
        self.push_send(link, pong, actions);
        true
    }

    fn handle_pong(
        &mut self,
        link: LinkId,
        msg: &ClusterMessage,
        now: u64,
        actions: &mut Vec<Action>,
    ) -> bool {
        // Resolve what the link is bound to before touching the node table.
        let bound = self.links.get(&link).and_then(|l| l.node);
        if let Some(bound_id) = bound {
            if bound_id != msg.sender {
                let in_handshake = self
                    .state
                    .node(&bound_id)
                    .map(|n| n.in_handshake())
                    .unwrap_or(false);
                if in_handshake {
                    if self.state.contains(&msg.sender) {
                        // The peer turned out to be a node we already know
                        // under its real name. Refresh that node's address
                        // and drop the placeholder.
                        debug!(node = %msg.sender.short(), "handshake found an already known node");
                        if let Some(known) = self.state.node_mut(&msg.sender) {
                            if !msg.ip.is_empty() {
                                known.ip = msg.ip.clone();
                            }
                            known.port = msg.port;
                            known.cport = msg.cport;
                            known.flags.noaddr = false;
                        }
                        self.state.del_node(&bound_id, now);
                        return false;
                    }
                    // Handshake completed: adopt the real identity.
                    self.complete_handshake(bound_id, link, msg, now);
                } else {
                    // The node at this address changed identity. Forget the
                    // address and let gossip re-resolve it.
                    warn!(
                        expected = %bound_id.short(),
                        got = %msg.sender.short(),
                        "sender identity mismatch, marking node as noaddr"
                    );
                    if let Some(node) = self.state.node_mut(&bound_id) {
                        node.flags.noaddr = true;
                        node.ip.clear();
                        node.port = 0;
                        node.cport = 0;
                        node.link = None;
                    }
                    return false;
                }
            }
        }

        if !self.state.contains(&msg.sender) {
            return true;
        }

        // Liveness refresh only counts on the link we dialed ourselves.
        if let Some(node) = self.state.node_mut(&msg.sender) {
            if node.link == Some(link) {
                node.ping_sent = None;
                node.pong_received = now;
                if node.flags.pfail {
                    node.flags.pfail = false;
                    debug!(node = %msg.sender.short(), "clearing PFAIL, node answered");
                }
            }
        }
        self.clear_node_failure_if_needed(msg.sender, now, actions);

        // Role reconciliation from the declared replication target.
        match msg.slaveof {
            None => self.state.set_node_as_master(&msg.sender),
            Some(master_id) => {
                let was_master = self
                    .state
                    .node(&msg.sender)
                    .map(|n| n.is_master())
                    .unwrap_or(false);
                if was_master {
                    // Master turned slave: whatever it owned is up for grabs.
                    self.state.del_node_slots(&msg.sender);
                }
                if self.state.contains(&master_id) {
                    self.state.add_slave(&master_id, &msg.sender);
                } else if let Some(node) = self.state.node_mut(&msg.sender) {
                    // Master not known yet; gossip will introduce it.
                    node.role = NodeRole::Slave;
                    node.slaveof = Some(master_id);
                }
            }
        }

        // Slot reconciliation: a master announcing a bitmap different from
        // what we have recorded for it needs an epoch-gated update, and may
        // itself be stale.
        let sender_is_master = self
            .state
            .node(&msg.sender)
            .map(|n| n.is_master())
            .unwrap_or(false);
        if sender_is_master {
            let dirty = self
                .state
                .node(&msg.sender)
                .map(|n| n.slots != msg.slots)
                .unwrap_or(false);
            if dirty {
                self.update_slots_config_with(msg.sender, msg.config_epoch, &msg.slots, now, actions);

                // If the sender claims slots we know belong to a newer
                // configuration, send the fresher owner's view back.
                let mut correction: Option<NodeId> = None;
                for slot in msg.slots.iter() {
                    if let Some(owner) = self.state.slot_owner(slot) {
                        if owner == msg.sender {
                            continue;
                        }
                        let owner_epoch = self
                            .state
                            .node(&owner)
                            .map(|n| n.config_epoch)
                            .unwrap_or(0);
                        if owner_epoch > msg.config_epoch {
                            correction = Some(owner);
                            break;
                        }
                    }
                }
                if let Some(owner) = correction {
                    let (epoch, slots) = {
                        let node = self.state.node(&owner).expect("owner is in the table");
                        (node.config_epoch, node.slots.clone())
                    };
                    debug!(peer = %msg.sender.short(), owner = %owner.short(), "peer has a stale slot claim, sending UPDATE");
                    let update = self.build_message(Payload::Update {
                        epoch,
                        node: owner,
                        slots,
                    });
                    self.push_send(link, update, actions);
                }
            }

            self.handle_config_epoch_collision(msg.sender);
        }

        if let Payload::Pong { gossip } = &msg.payload {
            self.process_gossip(msg.sender, gossip, now, actions);
        }
        true
    }

    fn complete_handshake(&mut self, placeholder: NodeId, link: LinkId, msg: &ClusterMessage, now: u64) {
        info!(node = %msg.sender.short(), "handshake completed");
        self.state.rename_node(&placeholder, msg.sender);
        if let Some(l) = self.links.get_mut(&link) {
            l.node = Some(msg.sender);
        }
        if let Some(node) = self.state.node_mut(&msg.sender) {
            node.flags.handshake = false;
            node.flags.meet = false;
            if !msg.ip.is_empty() {
                node.ip = msg.ip.clone();
            }
            node.port = msg.port;
            node.cport = msg.cport;
            node.pong_received = now;
        }
        self.emit(ClusterEvent::NodeAdded { node: msg.sender });
    }

    fn handle_fail(&mut self, msg: &ClusterMessage, now: u64, _actions: &mut Vec<Action>) -> bool {
        if !self
            .state
            .node(&msg.sender)
            .map(|n| !n.in_handshake())
            .unwrap_or(false)
        {
            return true;
        }
        let Payload::Fail { node: failed } = &msg.payload else {
            return true;
        };
        let failed = *failed;
        if failed == self.state.myself {
            return true;
        }
        let Some(node) = self.state.node_mut(&failed) else {
            return true;
        };
        if node.flags.fail {
            return true;
        }
        warn!(node = %failed.short(), from = %msg.sender.short(), "FAIL message received, marking node as failing");
        node.flags.fail = true;
        node.flags.pfail = false;
        node.fail_time = now;
        self.emit(ClusterEvent::FailureMarked { node: failed });
        true
    }

    fn handle_publish(&mut self, msg: &ClusterMessage) -> bool {
        if let Payload::Publish { channel, message } = &msg.payload {
            self.emit(ClusterEvent::Published {
                channel: channel.clone(),
                message: message.clone(),
            });
        }
        true
    }

    fn handle_update(&mut self, msg: &ClusterMessage, now: u64, actions: &mut Vec<Action>) -> bool {
        let Payload::Update { epoch, node: target, slots } = &msg.payload else {
            return true;
        };
        // Each node is authoritative about its own slots.
        if *target == self.state.myself {
            return true;
        }
        let Some(node) = self.state.node(target) else {
            return true;
        };
        if node.config_epoch >= *epoch {
            return true;
        }
        if node.is_slave() {
            self.state.set_node_as_master(target);
        }
        if let Some(node) = self.state.node_mut(target) {
            node.config_epoch = *epoch;
        }
        self.update_slots_config_with(*target, *epoch, slots, now, actions);
        true
    }

    fn handle_auth_request(
        &mut self,
        link: LinkId,
        msg: &ClusterMessage,
        now: u64,
        actions: &mut Vec<Action>,
    ) -> bool {
        let Payload::FailoverAuthRequest { force_ack } = &msg.payload else {
            return true;
        };
        let force_ack = *force_ack;
        let requester = msg.sender;

        // Only masters holding slots have a say.
        {
            let me = self.state.myself_node();
            if !me.is_master() || me.numslots == 0 {
                return true;
            }
        }
        if msg.current_epoch < self.state.current_epoch {
            debug!(
                requester = %requester.short(),
                req_epoch = msg.current_epoch,
                cur_epoch = self.state.current_epoch,
                "failover auth denied: stale epoch"
            );
            return true;
        }
        if self.state.last_vote_epoch == self.state.current_epoch {
            debug!(requester = %requester.short(), "failover auth denied: already voted this epoch");
            return true;
        }
        let Some(req_node) = self.state.node(&requester) else {
            return true;
        };
        if req_node.is_master() {
            debug!(requester = %requester.short(), "failover auth denied: requester is a master");
            return true;
        }
        let Some(master_id) = req_node.slaveof else {
            return true;
        };
        let Some(master) = self.state.node(&master_id) else {
            debug!(requester = %requester.short(), "failover auth denied: unknown master");
            return true;
        };
        if !master.flags.fail && !force_ack {
            debug!(requester = %requester.short(), "failover auth denied: master is not failing");
            return true;
        }
        if now.saturating_sub(master.voted_time) < self.config.vote_rate_limit_ms() {
            debug!(requester = %requester.short(), "failover auth denied: voted for this master too recently");
            return true;
        }
        // The request must cover the master's slots at a config epoch at
        // least as fresh as our records.
        for slot in msg.slots.iter() {
            if let Some(owner) = self.state.slot_owner(slot) {
                let owner_epoch = self.state.node(&owner).map(|n| n.config_epoch).unwrap_or(0);
                if owner_epoch > msg.config_epoch {
                    debug!(
                        requester = %requester.short(),
                        slot,
                        "failover auth denied: slot has a fresher owner"
                    );
                    return true;
                }
            }
        }

        self.state.last_vote_epoch = self.state.current_epoch;
        if let Some(master) = self.state.node_mut(&master_id) {
            master.voted_time = now;
        }
        info!(
            requester = %requester.short(),
            epoch = self.state.current_epoch,
            "granting failover vote"
        );
        let ack = self.build_message(Payload::FailoverAuthAck);
        self.push_send(link, ack, actions);
        true
    }

    fn handle_auth_ack(&mut self, msg: &ClusterMessage, now: u64, actions: &mut Vec<Action>) -> bool {
        let eligible = self
            .state
            .node(&msg.sender)
            .map(|n| n.is_master() && n.numslots > 0)
            .unwrap_or(false);
        if !eligible {
            return true;
        }
        let Some(election) = self.election.as_mut() else {
            return true;
        };
        if msg.current_epoch < election.epoch {
            debug!(from = %msg.sender.short(), "ignoring vote from an older epoch");
            return true;
        }
        let won = election.record_vote(msg.sender);
        debug!(from = %msg.sender.short(), votes = election.votes(), "failover vote received");
        if won {
            self.promote_myself(now, actions);
        }
        true
    }

    fn promote_myself(&mut self, now: u64, actions: &mut Vec<Action>) {
        let Some(election) = self.election.take() else {
            return;
        };
        let epoch = election.epoch;
        self.election_schedule = None;
        let old_master = self.state.myself_node().slaveof;

        info!(epoch, "failover election won, promoting myself to master");
        let myself = self.state.myself;
        self.state.set_node_as_master(&myself);
        self.state.current_epoch = self.state.current_epoch.max(epoch);
        if let Some(me) = self.state.node_mut(&myself) {
            me.config_epoch = epoch;
        }

        if let Some(old_id) = old_master {
            let owned: Vec<u16> = self
                .state
                .node(&old_id)
                .map(|n| n.slots.iter().collect())
                .unwrap_or_default();
            for slot in owned {
                self.state.del_slot(slot);
                self.state.add_slot(&myself, slot);
            }
        }

        self.emit(ClusterEvent::ElectionWon { epoch });
        let pong = self.build_message(Payload::Pong {
            gossip: self.sample_gossip(),
        });
        self.broadcast(pong, actions);
        self.update_cluster_health(now);
    }

    // --- gossip ---

    fn process_gossip(
        &mut self,
        sender: NodeId,
        entries: &[GossipEntry],
        now: u64,
        actions: &mut Vec<Action>,
    ) {
        let sender_is_master = self
            .state
            .node(&sender)
            .map(|n| n.is_master())
            .unwrap_or(false);
        let validity = self.config.report_validity_ms();

        for entry in entries {
            if entry.node == self.state.myself {
                continue;
            }
            if self.state.contains(&entry.node) {
                let mut check_fail_quorum = false;
                let mut repair_link: Option<LinkId> = None;
                {
                    let myself = self.state.myself;
                    let node = self.state.node_mut(&entry.node).expect("checked above");
                    if sender_is_master && entry.node != myself {
                        if entry.pfail || entry.fail {
                            if node.add_failure_report(sender, now) {
                                debug!(
                                    node = %entry.node.short(),
                                    reporter = %sender.short(),
                                    "failure report added"
                                );
                            }
                            check_fail_quorum = true;
                        } else if node.del_failure_report(sender) {
                            debug!(
                                node = %entry.node.short(),
                                reporter = %sender.short(),
                                "failure report removed"
                            );
                        }
                    }

                    // Adopt a fresher pong time a peer observed, as long as
                    // nothing disputes this node's liveness and the value is
                    // not from the future.
                    if entry.is_clean()
                        && node.ping_sent.is_none()
                        && node.failure_report_count(validity, now) == 0
                        && entry.pong_received > node.pong_received
                        && entry.pong_received <= now + PONG_ADOPT_SLACK_MS
                    {
                        node.pong_received = entry.pong_received;
                    }

                    // A failing node seen clean at another address probably
                    // restarted there: adopt the address and redial.
                    if (node.flags.pfail || node.flags.fail)
                        && entry.is_clean()
                        && !entry.ip.is_empty()
                        && (node.ip != entry.ip
                            || node.port != entry.port
                            || node.cport != entry.cport)
                    {
                        debug!(node = %entry.node.short(), ip = %entry.ip, "address changed, updating");
                        node.ip = entry.ip.clone();
                        node.port = entry.port;
                        node.cport = entry.cport;
                        node.flags.noaddr = false;
                        repair_link = node.link;
                    }
                }
                if let Some(link) = repair_link {
                    self.free_link(link, actions);
                }
                if check_fail_quorum {
                    self.mark_node_as_failing_if_needed(entry.node, now, actions);
                }
            } else if !entry.noaddr
                && !entry.ip.is_empty()
                && !self.state.blacklist_contains(&entry.node, now)
            {
                // A suspected or failed node is still worth meeting: we need
                // our own link to it to judge its health ourselves.
                // Never start two handshakes to the same address.
                let already = self.state.nodes().any(|n| {
                    n.in_handshake() && n.ip == entry.ip && n.cport == entry.cport
                });
                if already {
                    continue;
                }
                debug!(node = %entry.node.short(), ip = %entry.ip, "starting handshake with gossiped node");
                let name = self.state.generate_node_id();
                let flags = NodeFlags {
                    handshake: true,
                    meet: true,
                    ..Default::default()
                };
                let mut node = ClusterNode::new(name, NodeRole::Master, flags, now);
                node.ip = entry.ip.clone();
                node.port = entry.port;
                node.cport = entry.cport;
                self.state.add_node(node);
            }
        }
    }

    /// Builds the gossip section for an outgoing ping/pong: a random sample
    /// of about a tenth of the cluster, plus every locally suspected node so
    /// failure evidence always travels.
    fn sample_gossip(&self) -> Vec<GossipEntry> {
        let myself = self.state.myself;
        let eligible: Vec<&ClusterNode> = self
            .state
            .nodes()
            .filter(|n| {
                n.name != myself && !n.in_handshake() && !n.flags.noaddr && n.has_addr()
            })
            .collect();
        let wanted = (self.state.len() / 10).max(3).min(eligible.len());

        let mut rng = rand::rng();
        let mut picked: Vec<&ClusterNode> =
            eligible.choose_multiple(&mut rng, wanted).copied().collect();
        for node in &eligible {
            if node.flags.pfail && !picked.iter().any(|p| p.name == node.name) {
                picked.push(node);
            }
        }

        picked
            .into_iter()
            .map(|n| GossipEntry {
                node: n.name,
                ping_sent: n.ping_sent.unwrap_or(0),
                pong_received: n.pong_received,
                ip: n.ip.clone(),
                port: n.port,
                cport: n.cport,
                role: n.role,
                pfail: n.flags.pfail,
                fail: n.flags.fail,
                noaddr: n.flags.noaddr,
            })
            .collect()
    }

    // --- failure detector & epochs ---

    fn mark_node_as_failing_if_needed(&mut self, id: NodeId, now: u64, actions: &mut Vec<Action>) {
        let validity = self.config.report_validity_ms();
        let quorum = self.state.quorum();
        let myself_is_master = self.state.myself_node().is_master();

        let Some(node) = self.state.node_mut(&id) else {
            return;
        };
        if !node.flags.pfail || node.flags.fail {
            return;
        }
        let mut failures = node.failure_report_count(validity, now);
        if myself_is_master {
            failures += 1;
        }
        if failures < quorum {
            return;
        }
        info!(node = %id.short(), failures, quorum, "marking node as FAIL (quorum reached)");
        node.flags.fail = true;
        node.flags.pfail = false;
        node.fail_time = now;
        self.emit(ClusterEvent::FailureMarked { node: id });

        if myself_is_master {
            let fail = self.build_message(Payload::Fail { node: id });
            self.broadcast(fail, actions);
        }
    }

    /// Reachability evidence just arrived for `id`; drop the FAIL flag when
    /// it no longer serves a purpose. Masters that still own slots keep it
    /// for the undo window so a returning master does not yank its slots
    /// back from a promoted replacement.
    fn clear_node_failure_if_needed(&mut self, id: NodeId, now: u64, _actions: &mut [Action]) {
        let undo = self.config.fail_undo_ms();
        let Some(node) = self.state.node_mut(&id) else {
            return;
        };
        if !node.flags.fail {
            return;
        }
        let clear = if node.is_slave() || node.numslots == 0 {
            true
        } else {
            now.saturating_sub(node.fail_time) > undo
        };
        if clear {
            info!(node = %id.short(), "clearing FAIL state, node is reachable again");
            node.flags.fail = false;
            self.emit(ClusterEvent::FailureCleared { node: id });
        }
    }

    /// Applies a slot bitmap a master announced with `epoch`: each claimed
    /// slot moves to the sender unless its current owner has an equal or
    /// newer config epoch. If this strips the local master (or the local
    /// node itself) of its last slot, the local node follows the winner as
    /// a replica.
    fn update_slots_config_with(
        &mut self,
        sender: NodeId,
        epoch: u64,
        slots: &SlotBitmap,
        _now: u64,
        _actions: &mut [Action],
    ) {
        let myself = self.state.myself;
        let cur_master = if self.state.myself_node().is_master() {
            myself
        } else {
            match self.state.myself_node().slaveof {
                Some(m) => m,
                None => myself,
            }
        };

        let mut lost_to_sender = false;
        for slot in slots.iter() {
            match self.state.slot_owner(slot) {
                Some(owner) if owner == sender => {}
                Some(owner) => {
                    let owner_epoch = self.state.node(&owner).map(|n| n.config_epoch).unwrap_or(0);
                    if owner_epoch >= epoch {
                        continue;
                    }
                    if owner == cur_master {
                        lost_to_sender = true;
                    }
                    self.state.del_slot(slot);
                    self.state.add_slot(&sender, slot);
                }
                None => {
                    self.state.add_slot(&sender, slot);
                }
            }
        }

        let master_emptied = self
            .state
            .node(&cur_master)
            .map(|n| n.numslots == 0)
            .unwrap_or(false);
        if lost_to_sender && master_emptied && sender != myself {
            warn!(
                new_master = %sender.short(),
                "configuration change detected, reconfiguring myself as a replica"
            );
            self.state.add_slave(&sender, &myself);
            self.replication_target = Some(sender);
            if let Some(master) = self.state.node(&sender) {
                self.emit(ClusterEvent::ReplicateFrom {
                    master: sender,
                    ip: master.ip.clone(),
                    port: master.port,
                });
            }
        }
    }

    /// Two masters claiming the same config epoch cannot coexist: the one
    /// with the lexicographically smaller name takes a new, greater epoch.
    fn handle_config_epoch_collision(&mut self, sender: NodeId) {
        let myself = self.state.myself;
        let my_epoch = self.state.myself_node().config_epoch;
        let collision = self
            .state
            .node(&sender)
            .map(|n| n.is_master() && n.config_epoch == my_epoch)
            .unwrap_or(false);
        if !collision || !self.state.myself_node().is_master() {
            return;
        }
        if sender <= myself {
            return;
        }
        self.state.current_epoch += 1;
        let new_epoch = self.state.current_epoch;
        if let Some(me) = self.state.node_mut(&myself) {
            me.config_epoch = new_epoch;
        }
        warn!(
            peer = %sender.short(),
            epoch = new_epoch,
            "config epoch collision, adopting a new epoch"
        );
    }

    // --- cluster health ---

    fn update_cluster_health(&mut self, now: u64) {
        if self.state.first_health_check == 0 {
            self.state.first_health_check = now;
        }
        // Boot grace: right after startup, stay FAIL without re-evaluating
        // so a restarting node does not flap before it has heard from peers.
        if self.state.health == ClusterHealth::Fail
            && now.saturating_sub(self.state.first_health_check)
                < ClusterConfig::WRITABLE_DELAY_MS
        {
            return;
        }

        let mut new_health = ClusterHealth::Ok;

        if self.config.require_full_coverage {
            let full = (0..crate::slots::SLOT_COUNT as u16).all(|slot| {
                match self.state.slot_owner(slot) {
                    Some(owner) => self
                        .state
                        .node(&owner)
                        .map(|n| !n.flags.fail)
                        .unwrap_or(false),
                    None => false,
                }
            });
            if !full {
                new_health = ClusterHealth::Fail;
            }
        }

        let size = self.state.masters_with_slots();
        self.state.size = size;
        if size > 0 {
            let reachable = self
                .state
                .nodes()
                .filter(|n| {
                    n.is_master() && n.numslots > 0 && n.flags.is_healthy() && !n.flags.noaddr
                })
                .count();
            let needed = size / 2 + 1;
            if reachable < needed {
                // We are partitioned away from the majority of slot owners.
                new_health = ClusterHealth::Fail;
                self.state.among_minority_since = now;
            }
        }

        if new_health == ClusterHealth::Ok && self.state.health == ClusterHealth::Fail {
            // Returning from a minority partition is deliberately slow, so
            // clients do not write to a node the rest of the cluster may
            // have already failed over.
            let since = self.state.among_minority_since;
            if since != 0 && now.saturating_sub(since) < self.config.rejoin_delay_ms() {
                return;
            }
        }

        if new_health != self.state.health {
            self.state.health = new_health;
            match new_health {
                ClusterHealth::Ok => info!("cluster state changed: ok"),
                ClusterHealth::Fail => warn!("cluster state changed: fail"),
            }
            self.emit(ClusterEvent::HealthChanged {
                ok: new_health == ClusterHealth::Ok,
            });
        }
    }

    // --- cron ---

    /// One 100ms maintenance tick.
    pub fn tick(&mut self, now: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        self.tick_count += 1;

        self.adopt_local_address();

        // Handshake reaping and connection establishment.
        let handshake_timeout = self.config.handshake_timeout_ms();
        for name in self.state.node_names() {
            if name == self.state.myself {
                continue;
            }
            let Some(node) = self.state.node(&name) else {
                continue;
            };
            if node.in_handshake() && now.saturating_sub(node.ctime) > handshake_timeout {
                debug!(node = %name.short(), "handshake timed out, dropping node");
                let link = node.link;
                self.state.del_node(&name, now);
                if let Some(link) = link {
                    self.free_link(link, &mut actions);
                }
                continue;
            }
            let Some(node) = self.state.node(&name) else {
                continue;
            };
            if node.link.is_none() && node.has_addr() && !self.pending_connects.contains(&name) {
                self.pending_connects.insert(name);
                actions.push(Action::Connect {
                    node: name,
                    ip: node.ip.clone(),
                    cport: node.cport,
                });
            }
        }

        // Every second, ping the sampled node we have heard from least
        // recently, to keep pong timestamps flowing even in idle clusters.
        if self.tick_count % 10 == 0 {
            let myself = self.state.myself;
            let candidates: Vec<(NodeId, u64)> = self
                .state
                .nodes()
                .filter(|n| {
                    n.name != myself
                        && !n.in_handshake()
                        && n.link.is_some()
                        && n.ping_sent.is_none()
                })
                .map(|n| (n.name, n.pong_received))
                .collect();
            let mut rng = rand::rng();
            let sampled: Vec<(NodeId, u64)> = candidates
                .choose_multiple(&mut rng, 5)
                .copied()
                .collect();
            if let Some(&(oldest, _)) = sampled.iter().min_by_key(|(_, pong)| *pong) {
                self.send_probe(oldest, MessageKind::Ping, now, &mut actions);
            }
        }

        // Per-node timers: stale links, ping cadence, PFAIL marking, orphan
        // accounting.
        let timeout = self.config.node_timeout_ms();
        let half = self.config.ping_retry_ms();
        let mut flags_changed = false;
        let mut orphans = 0usize;
        let mut max_slaves = 0usize;
        let mut this_slaves = 0usize;
        let my_master = self.state.myself_node().slaveof;

        for name in self.state.node_names() {
            if name == self.state.myself {
                continue;
            }
            let Some(node) = self.state.node(&name) else {
                continue;
            };
            if node.in_handshake() || node.flags.noaddr {
                continue;
            }

            if node.is_master() && node.numslots > 0 {
                let ok_slaves = node
                    .slaves
                    .iter()
                    .filter(|s| {
                        self.state
                            .node(s)
                            .map(|n| n.flags.is_healthy())
                            .unwrap_or(false)
                    })
                    .count();
                if ok_slaves == 0 && node.flags.migrate_to {
                    orphans += 1;
                }
                max_slaves = max_slaves.max(ok_slaves);
                if my_master == Some(name) {
                    this_slaves = ok_slaves;
                }
                let orphaned = ok_slaves == 0;
                if let Some(node) = self.state.node_mut(&name) {
                    if orphaned {
                        if node.orphaned_time == 0 {
                            node.orphaned_time = now;
                        }
                    } else {
                        node.orphaned_time = 0;
                    }
                }
            }

            let Some(node) = self.state.node(&name) else {
                continue;
            };

            // A link that has carried an unanswered ping past half the
            // timeout window gets torn down and redialed; the problem may
            // be the connection rather than the peer.
            if let (Some(link), Some(ping_sent)) = (node.link, node.ping_sent) {
                let link_age = self
                    .links
                    .get(&link)
                    .map(|l| now.saturating_sub(l.ctime))
                    .unwrap_or(0);
                if link_age > timeout && now.saturating_sub(ping_sent) > half {
                    debug!(node = %name.short(), "freeing stale link to retry the connection");
                    self.free_link(link, &mut actions);
                }
            }

            let Some(node) = self.state.node(&name) else {
                continue;
            };
            if node.link.is_some()
                && node.ping_sent.is_none()
                && now.saturating_sub(node.pong_received) > half
            {
                self.send_probe(name, MessageKind::Ping, now, &mut actions);
                continue;
            }

            let Some(node) = self.state.node_mut(&name) else {
                continue;
            };
            if let Some(ping_sent) = node.ping_sent {
                if now.saturating_sub(ping_sent) > timeout
                    && !node.flags.pfail
                    && !node.flags.fail
                {
                    debug!(node = %name.short(), "no pong within node timeout, marking PFAIL");
                    node.flags.pfail = true;
                    flags_changed = true;
                }
            }
        }

        // A slave whose master's address just became usable should be
        // replicating from it.
        if let Some(master_id) = my_master {
            if self.replication_target != Some(master_id) {
                if let Some(master) = self.state.node(&master_id) {
                    if master.has_addr() {
                        self.replication_target = Some(master_id);
                        self.emit(ClusterEvent::ReplicateFrom {
                            master: master_id,
                            ip: master.ip.clone(),
                            port: master.port,
                        });
                    }
                }
            }
        }

        if self.state.health == ClusterHealth::Ok
            && orphans > 0
            && max_slaves >= 2
            && this_slaves == max_slaves
        {
            self.handle_slave_migration(now);
        }

        self.handle_failover(now, &mut actions);

        if flags_changed || self.state.health == ClusterHealth::Fail {
            self.update_cluster_health(now);
        }
        self.maybe_save(&mut actions);
        actions
    }

    fn adopt_local_address(&mut self) {
        let ip = self
            .config
            .announce_ip
            .clone()
            .unwrap_or_else(|| self.local_ip.clone());
        let port = self.config.announce_port.unwrap_or(self.local_port);
        let cport = self.config.announce_bus_port.unwrap_or(self.local_cport);
        let me = self.state.myself_mut();
        if me.ip != ip || me.port != port || me.cport != cport {
            me.ip = ip;
            me.port = port;
            me.cport = cport;
        }
    }

    /// If a master is orphaned and our own master has the most slaves in
    /// the cluster, exactly one of those slaves moves over: the one with
    /// the smallest id, so every node independently picks the same one.
    fn handle_slave_migration(&mut self, now: u64) {
        let myself = self.state.myself;
        let Some(master_id) = self.state.myself_node().slaveof else {
            return;
        };
        let Some(master) = self.state.node(&master_id) else {
            return;
        };
        let healthy: Vec<NodeId> = master
            .slaves
            .iter()
            .filter(|s| {
                self.state
                    .node(s)
                    .map(|n| n.flags.is_healthy())
                    .unwrap_or(false)
            })
            .copied()
            .collect();
        if healthy.len() <= self.config.migration_barrier {
            return;
        }
        let Some(candidate) = healthy.iter().min().copied() else {
            return;
        };
        if candidate != myself {
            return;
        }
        let target = self
            .state
            .nodes()
            .filter(|n| {
                n.is_master()
                    && n.numslots > 0
                    && n.flags.migrate_to
                    && n.orphaned_time != 0
                    && now.saturating_sub(n.orphaned_time) > ClusterConfig::MIGRATION_DELAY_MS
                    && n.slaves.iter().all(|s| {
                        self.state
                            .node(s)
                            .map(|sn| !sn.flags.is_healthy())
                            .unwrap_or(true)
                    })
            })
            .map(|n| n.name)
            .min();
        let Some(target) = target else {
            return;
        };
        info!(master = %target.short(), "migrating to orphaned master");
        self.state.add_slave(&target, &myself);
        self.replication_target = Some(target);
        if let Some(master) = self.state.node(&target) {
            self.emit(ClusterEvent::ReplicateFrom {
                master: target,
                ip: master.ip.clone(),
                port: master.port,
            });
        }
    }

    /// Slave-side failover: once the master is confirmed failed and owned
    /// slots, start a jittered election; expire and retry stale ones.
    fn handle_failover(&mut self, now: u64, actions: &mut Vec<Action>) {
        let me = self.state.myself_node();
        if !me.is_slave() {
            return;
        }
        let Some(master_id) = me.slaveof else {
            return;
        };
        let actionable = self
            .state
            .node(&master_id)
            .map(|m| m.flags.fail && m.numslots > 0)
            .unwrap_or(false);
        if !actionable {
            self.election = None;
            self.election_schedule = None;
            return;
        }

        if let Some(election) = &self.election {
            if election.expired(now, self.config.election_timeout_ms()) {
                debug!(epoch = election.epoch, "failover election expired without quorum");
                self.election = None;
                self.election_schedule = Some(now + self.config.election_retry_ms());
            }
            return;
        }

        match self.election_schedule {
            None => {
                // Jitter avoids sibling slaves flooding the masters at once.
                let delay = 500 + rand::rng().random_range(0..500);
                self.election_schedule = Some(now + delay);
                info!(master = %master_id.short(), delay, "master failed, scheduling failover election");
            }
            Some(at) if now >= at => {
                self.start_election(now, actions);
            }
            Some(_) => {}
        }
    }

    fn start_election(&mut self, now: u64, actions: &mut Vec<Action>) {
        self.state.current_epoch += 1;
        let epoch = self.state.current_epoch;
        let required = self.state.quorum();
        info!(epoch, required, "starting failover election");
        self.election = Some(Election::new(epoch, required, now));
        self.election_schedule = None;
        let request = self.build_message(Payload::FailoverAuthRequest { force_ack: false });
        self.broadcast(request, actions);
    }

    // --- admin operations ---

    /// Starts a handshake with a node at a known address.
    pub fn meet(&mut self, ip: &str, port: u16, cport: u16, now: u64) -> Vec<Action> {
        let duplicate = self
            .state
            .nodes()
            .any(|n| n.ip == ip && n.cport == cport);
        if duplicate {
            return Vec::new();
        }
        info!(ip, port, cport, "starting handshake (MEET)");
        let name = self.state.generate_node_id();
        let flags = NodeFlags {
            handshake: true,
            meet: true,
            ..Default::default()
        };
        let mut node = ClusterNode::new(name, NodeRole::Master, flags, now);
        node.ip = ip.to_string();
        node.port = port;
        node.cport = cport;
        self.state.add_node(node);
        // the next tick dials it
        Vec::new()
    }

    /// Removes a node and blacklists its id so gossip does not resurrect it.
    pub fn forget(&mut self, id: NodeId, now: u64) -> Result<Vec<Action>, ClusterError> {
        if id == self.state.myself {
            return Err(ClusterError::ForgetMyself);
        }
        if self.state.myself_node().slaveof == Some(id) {
            return Err(ClusterError::ForgetMaster);
        }
        let Some(removed) = self.state.del_node(&id, now) else {
            return Err(ClusterError::NodeNotFound(id));
        };
        let mut actions = Vec::new();
        if let Some(link) = removed.link {
            self.free_link(link, &mut actions);
        }
        self.emit(ClusterEvent::NodeRemoved { node: id });
        self.update_cluster_health(now);
        self.maybe_save(&mut actions);
        Ok(actions)
    }

    /// Claims the given slots for the local node. All-or-nothing: fails if
    /// any slot already has an owner.
    pub fn add_slots(&mut self, slots: &[u16], now: u64) -> Result<Vec<Action>, ClusterError> {
        for &slot in slots {
            if slot as usize >= crate::slots::SLOT_COUNT {
                return Err(ClusterError::SlotOutOfRange(slot));
            }
            if self.state.slot_owner(slot).is_some() {
                return Err(ClusterError::SlotBusy(slot));
            }
        }
        let myself = self.state.myself;
        for &slot in slots {
            self.state.add_slot(&myself, slot);
        }
        let mut actions = Vec::new();
        self.update_cluster_health(now);
        self.maybe_save(&mut actions);
        Ok(actions)
    }

    /// Releases the given slots. All-or-nothing: fails if any slot has no
    /// owner.
    pub fn del_slots(&mut self, slots: &[u16], now: u64) -> Result<Vec<Action>, ClusterError> {
        for &slot in slots {
            if slot as usize >= crate::slots::SLOT_COUNT {
                return Err(ClusterError::SlotOutOfRange(slot));
            }
            if self.state.slot_owner(slot).is_none() {
                return Err(ClusterError::SlotNotAssigned(slot));
            }
        }
        for &slot in slots {
            self.state.del_slot(slot);
        }
        let mut actions = Vec::new();
        self.update_cluster_health(now);
        self.maybe_save(&mut actions);
        Ok(actions)
    }

    /// Takes a fresh, cluster-wide-unique config epoch if this node's is
    /// zero or shadowed by another node. Returns `(bumped, epoch, actions)`.
    pub fn bump_epoch(&mut self, now: u64) -> (bool, u64, Vec<Action>) {
        let myself = self.state.myself;
        let my_epoch = self.state.myself_node().config_epoch;
        let shadowed = self
            .state
            .nodes()
            .any(|n| n.name != myself && n.config_epoch >= my_epoch);
        if my_epoch != 0 && !shadowed {
            return (false, my_epoch, Vec::new());
        }
        self.state.current_epoch += 1;
        let epoch = self.state.current_epoch;
        if let Some(me) = self.state.node_mut(&myself) {
            me.config_epoch = epoch;
        }
        info!(epoch, "bumped config epoch");
        let mut actions = Vec::new();
        self.update_cluster_health(now);
        self.maybe_save(&mut actions);
        (true, epoch, actions)
    }

    /// Forgets every peer and releases every slot. A hard reset also zeroes
    /// the epochs and assumes a brand-new identity.
    pub fn reset(&mut self, hard: bool, now: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        let myself = self.state.myself;
        self.state.set_node_as_master(&myself);
        self.state.del_node_slots(&myself);

        for name in self.state.node_names() {
            if name == myself {
                continue;
            }
            if let Some(removed) = self.state.del_node(&name, now) {
                if let Some(link) = removed.link {
                    self.free_link(link, &mut actions);
                }
                self.emit(ClusterEvent::NodeRemoved { node: name });
            }
        }
        let leftover: Vec<LinkId> = self.links.keys().copied().collect();
        for link in leftover {
            self.free_link(link, &mut actions);
        }
        self.pending_connects.clear();
        self.election = None;
        self.election_schedule = None;
        self.replication_target = None;

        if hard {
            self.state.current_epoch = 0;
            self.state.last_vote_epoch = 0;
            let new_id = NodeId::random();
            self.state.rename_node(&myself, new_id);
            self.state.myself = new_id;
            if let Some(me) = self.state.node_mut(&new_id) {
                me.config_epoch = 0;
            }
            info!("hard reset done, I'm now {new_id}");
        } else {
            info!("soft reset done");
        }

        self.update_cluster_health(now);
        self.maybe_save(&mut actions);
        actions
    }

    pub fn info(&self) -> String {
        self.state.cluster_info()
    }

    pub fn nodes(&self) -> String {
        self.state.cluster_nodes()
    }

    // --- outbound plumbing ---

    fn build_message(&self, payload: Payload) -> ClusterMessage {
        let me = self.state.myself_node();
        // A slave speaks for its master's configuration.
        let (slots, config_epoch) = match me.slaveof.and_then(|m| self.state.node(&m)) {
            Some(master) => (master.slots.clone(), master.config_epoch),
            None => (me.slots.clone(), me.config_epoch),
        };
        ClusterMessage {
            version: PROTOCOL_VERSION,
            sender: me.name,
            current_epoch: self.state.current_epoch,
            config_epoch,
            slots,
            slaveof: me.slaveof,
            ip: me.ip.clone(),
            port: me.port,
            cport: me.cport,
            role: me.role,
            pfail: me.flags.pfail,
            fail: me.flags.fail,
            state_ok: self.state.health == ClusterHealth::Ok,
            payload,
        }
    }

    fn push_send(&mut self, link: LinkId, message: ClusterMessage, actions: &mut Vec<Action>) {
        self.state.note_sent(message.kind());
        actions.push(Action::Send { link, message });
    }

    /// Sends a ping-class message to a node over its bound link, stamping
    /// the outstanding-ping time if none is pending.
    fn send_probe(&mut self, node: NodeId, kind: MessageKind, now: u64, actions: &mut Vec<Action>) {
        let Some(link) = self.state.node(&node).and_then(|n| n.link) else {
            return;
        };
        let gossip = self.sample_gossip();
        let payload = match kind {
            MessageKind::Meet => Payload::Meet { gossip },
            _ => Payload::Ping { gossip },
        };
        if let Some(target) = self.state.node_mut(&node) {
            if target.ping_sent.is_none() {
                target.ping_sent = Some(now);
            }
        }
        let message = self.build_message(payload);
        self.push_send(link, message, actions);
    }

    /// Sends a copy of `message` to every peer with a bound link.
    fn broadcast(&mut self, message: ClusterMessage, actions: &mut Vec<Action>) {
        let targets: Vec<LinkId> = self
            .state
            .nodes()
            .filter_map(|n| n.link)
            .collect();
        for link in targets {
            self.push_send(link, message.clone(), actions);
        }
    }

    fn maybe_save(&mut self, actions: &mut Vec<Action>) {
        let snapshot = self.state.snapshot();
        let unchanged = self
            .last_snapshot
            .as_ref()
            .is_some_and(|last| last.same_config(&snapshot));
        if unchanged {
            return;
        }
        self.last_snapshot = Some(snapshot.clone());
        actions.push(Action::SaveConfig { snapshot });
    }

    fn emit(&self, event: ClusterEvent) {
        if let Err(err) = self.events.try_send(event) {
            warn!(error = %err, "event channel unavailable, dropping cluster event");
        }
    }
}
