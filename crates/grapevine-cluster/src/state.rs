//! The cluster's node table and everything derived from it.
//!
//! [`ClusterState`] is the single owned view of the cluster: every known
//! node keyed by id, the local identity, the epoch counters, the global
//! slot table, the forget-blacklist and the per-kind message counters.
//! It is passed around explicitly; there is no ambient singleton.
//!
//! Mutations that touch both a node's slot bitmap and the global slot
//! table go through this module so the two views never diverge.

use std::collections::HashMap;

use tracing::debug;

use crate::config::ClusterConfig;
use crate::error::ClusterError;
use crate::message::MessageKind;
use crate::node::{ClusterNode, NodeFlags, NodeId, NodeRole};
use crate::slots::{SlotBitmap, SlotTable, SLOT_COUNT};
use crate::snapshot::{ConfigSnapshot, NodeRecord};

/// Overall cluster health as seen by the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterHealth {
    Ok,
    Fail,
}

impl std::fmt::Display for ClusterHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterHealth::Ok => write!(f, "ok"),
            ClusterHealth::Fail => write!(f, "fail"),
        }
    }
}

/// The local node's complete view of the cluster.
#[derive(Debug)]
pub struct ClusterState {
    pub myself: NodeId,
    nodes: HashMap<NodeId, ClusterNode>,
    /// Highest epoch ever observed anywhere in the cluster.
    pub current_epoch: u64,
    /// Epoch of the last failover vote this node granted.
    pub last_vote_epoch: u64,
    pub health: ClusterHealth,
    /// Masters owning at least one slot, as of the last health evaluation.
    pub size: usize,
    slot_table: SlotTable,
    /// Recently forgotten node ids, suppressed from gossip rediscovery
    /// until their expiry time.
    blacklist: HashMap<NodeId, u64>,
    stats_sent: HashMap<MessageKind, u64>,
    stats_received: HashMap<MessageKind, u64>,
    /// When this node found itself in a minority partition. Zero while in
    /// the majority.
    pub among_minority_since: u64,
    /// Time of the first health evaluation; used for the boot grace window.
    pub first_health_check: u64,
}

impl ClusterState {
    /// Creates a fresh single-node view with a newly generated identity.
    pub fn new(now: u64) -> Self {
        let name = NodeId::random();
        let flags = NodeFlags {
            myself: true,
            ..Default::default()
        };
        let mut nodes = HashMap::new();
        nodes.insert(name, ClusterNode::new(name, NodeRole::Master, flags, now));
        Self {
            myself: name,
            nodes,
            current_epoch: 0,
            last_vote_epoch: 0,
            health: ClusterHealth::Fail,
            size: 0,
            slot_table: SlotTable::new(),
            blacklist: HashMap::new(),
            stats_sent: HashMap::new(),
            stats_received: HashMap::new(),
            among_minority_since: 0,
            first_health_check: 0,
        }
    }

    /// Rebuilds the view from a saved configuration.
    pub fn from_snapshot(snap: &ConfigSnapshot, now: u64) -> Result<Self, ClusterError> {
        let myself = snap
            .records
            .iter()
            .find(|r| r.myself)
            .ok_or_else(|| ClusterError::BadConfigFile("no myself line".to_string()))?
            .name;

        let mut state = Self {
            myself,
            nodes: HashMap::new(),
            current_epoch: snap.current_epoch,
            last_vote_epoch: snap.last_vote_epoch,
            health: ClusterHealth::Fail,
            size: 0,
            slot_table: SlotTable::new(),
            blacklist: HashMap::new(),
            stats_sent: HashMap::new(),
            stats_received: HashMap::new(),
            among_minority_since: 0,
            first_health_check: 0,
        };

        for record in &snap.records {
            let mut node = ClusterNode::new(record.name, record.role, record.flags(), now);
            node.ip = record.ip.clone();
            node.port = record.port;
            node.cport = record.cport;
            node.config_epoch = record.config_epoch;
            node.slaveof = record.master;
            // liveness timers restart from load time so peers are not
            // instantly suspected
            node.pong_received = now;
            for slot in record.slots.iter() {
                if state.slot_table.owner(slot).is_some() {
                    return Err(ClusterError::BadConfigFile(format!(
                        "slot {slot} claimed twice"
                    )));
                }
                node.slots.set(slot);
                node.numslots += 1;
                state.slot_table.set_owner(slot, record.name);
            }
            state.nodes.insert(record.name, node);
        }

        // relink slaves onto masters that made it into the table
        let relink: Vec<(NodeId, NodeId)> = state
            .nodes
            .values()
            .filter_map(|n| n.slaveof.map(|m| (m, n.name)))
            .collect();
        for (master, slave) in relink {
            if let Some(master_node) = state.nodes.get_mut(&master) {
                if !master_node.slaves.contains(&slave) {
                    master_node.slaves.push(slave);
                }
            }
        }

        // the epoch counter can never trail a config epoch in the file
        let max_config = state.nodes.values().map(|n| n.config_epoch).max().unwrap_or(0);
        state.current_epoch = state.current_epoch.max(max_config);
        Ok(state)
    }

    /// Captures the durable part of the view. Handshake nodes are skipped,
    /// records are sorted by id so equal views serialize identically.
    pub fn snapshot(&self) -> ConfigSnapshot {
        let mut records: Vec<NodeRecord> = self
            .nodes
            .values()
            .filter(|n| !n.in_handshake())
            .map(NodeRecord::from_node)
            .collect();
        records.sort_by_key(|r| r.name);
        ConfigSnapshot {
            records,
            current_epoch: self.current_epoch,
            last_vote_epoch: self.last_vote_epoch,
        }
    }

    // --- node table ---

    /// Generates an id that does not collide with any known node.
    pub fn generate_node_id(&self) -> NodeId {
        loop {
            let id = NodeId::random();
            if !self.nodes.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn contains(&self, name: &NodeId) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn node(&self, name: &NodeId) -> Option<&ClusterNode> {
        self.nodes.get(name)
    }

    pub fn node_mut(&mut self, name: &NodeId) -> Option<&mut ClusterNode> {
        self.nodes.get_mut(name)
    }

    pub fn myself_node(&self) -> &ClusterNode {
        &self.nodes[&self.myself]
    }

    pub fn myself_mut(&mut self) -> &mut ClusterNode {
        self.nodes.get_mut(&self.myself).expect("local node is always in the table")
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.values()
    }

    /// Snapshot of the known ids, for iteration that mutates the table.
    pub fn node_names(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_node(&mut self, node: ClusterNode) {
        debug!(node = %node.name.short(), role = %node.role, "adding node");
        self.nodes.insert(node.name, node);
    }

    /// Removes a node entirely: releases its slots, detaches it from its
    /// master, blacklists the id so gossip does not re-add it, and drops
    /// the table entry. Returns the removed node so the caller can tear
    /// down its link.
    pub fn del_node(&mut self, name: &NodeId, now: u64) -> Option<ClusterNode> {
        self.del_node_slots(name);
        let node = self.nodes.remove(name)?;
        if let Some(master) = node.slaveof {
            self.remove_slave(&master, name);
        }
        self.blacklist_node(*name, now);
        debug!(node = %name.short(), "removed node");
        Some(node)
    }

    /// Completes a handshake: the placeholder id is replaced with the
    /// peer's real identity, keeping slot ownership and relations intact.
    pub fn rename_node(&mut self, old: &NodeId, new: NodeId) {
        let Some(mut node) = self.nodes.remove(old) else {
            return;
        };
        debug!(old = %old.short(), new = %new.short(), "renaming node");
        node.name = new;
        for slot in node.slots.iter() {
            self.slot_table.set_owner(slot, new);
        }
        self.nodes.insert(new, node);
        for other in self.nodes.values_mut() {
            if other.slaveof == Some(*old) {
                other.slaveof = Some(new);
            }
            for slave in other.slaves.iter_mut() {
                if slave == old {
                    *slave = new;
                }
            }
        }
    }

    // --- replication relations ---

    /// Makes `slave` a slave of `master`, maintaining both sides of the
    /// relation. Detaches the slave from any previous master first.
    pub fn add_slave(&mut self, master: &NodeId, slave: &NodeId) {
        let Some(node) = self.nodes.get(slave) else {
            return;
        };
        if node.slaveof.as_ref() == Some(master) {
            return;
        }
        if let Some(old_master) = node.slaveof {
            self.remove_slave(&old_master, slave);
        }
        if let Some(node) = self.nodes.get_mut(slave) {
            node.role = NodeRole::Slave;
            node.slaveof = Some(*master);
        }
        if let Some(master_node) = self.nodes.get_mut(master) {
            if !master_node.slaves.contains(slave) {
                master_node.slaves.push(*slave);
            }
        }
    }

    pub fn remove_slave(&mut self, master: &NodeId, slave: &NodeId) {
        if let Some(master_node) = self.nodes.get_mut(master) {
            master_node.slaves.retain(|s| s != slave);
        }
    }

    /// Turns a node into a master: detaches it from its former master and
    /// clears the replication target. Idempotent. Promoting the local node
    /// also marks it as a migration destination.
    pub fn set_node_as_master(&mut self, name: &NodeId) {
        let Some(node) = self.nodes.get(name) else {
            return;
        };
        if node.is_master() {
            return;
        }
        if let Some(master) = node.slaveof {
            self.remove_slave(&master, name);
        }
        let is_myself = *name == self.myself;
        if let Some(node) = self.nodes.get_mut(name) {
            node.role = NodeRole::Master;
            node.slaveof = None;
            if is_myself {
                node.flags.migrate_to = true;
            }
        }
    }

    // --- slot ownership ---

    pub fn slot_owner(&self, slot: u16) -> Option<NodeId> {
        self.slot_table.owner(slot)
    }

    pub fn assigned_slots(&self) -> usize {
        self.slot_table.assigned_count()
    }

    /// Sets a bit in the node's claimed bitmap. Returns the previous value.
    ///
    /// A node gaining its first slot while other masters have slaves
    /// becomes a migration destination: it clearly matters now, and losing
    /// it would orphan data.
    pub fn set_slot_bit(&mut self, name: &NodeId, slot: u16) -> bool {
        let masters_have_slaves = self
            .nodes
            .values()
            .any(|n| n.name != *name && n.is_master() && !n.slaves.is_empty());
        let Some(node) = self.nodes.get_mut(name) else {
            return false;
        };
        let prev = node.slots.set(slot);
        if !prev {
            node.numslots += 1;
            if node.numslots == 1 && masters_have_slaves {
                node.flags.migrate_to = true;
            }
        }
        prev
    }

    /// Clears a bit in the node's claimed bitmap. Returns the previous value.
    pub fn clear_slot_bit(&mut self, name: &NodeId, slot: u16) -> bool {
        let Some(node) = self.nodes.get_mut(name) else {
            return false;
        };
        let prev = node.slots.clear(slot);
        if prev {
            node.numslots -= 1;
        }
        prev
    }

    /// Assigns a slot to a node. Returns false if the slot already has an
    /// owner (callers must free it first).
    pub fn add_slot(&mut self, name: &NodeId, slot: u16) -> bool {
        if self.slot_table.owner(slot).is_some() {
            return false;
        }
        if !self.nodes.contains_key(name) {
            return false;
        }
        self.set_slot_bit(name, slot);
        self.slot_table.set_owner(slot, *name);
        true
    }

    /// Unassigns a slot. Returns false if it had no owner.
    pub fn del_slot(&mut self, slot: u16) -> bool {
        let Some(owner) = self.slot_table.clear_owner(slot) else {
            return false;
        };
        self.clear_slot_bit(&owner, slot);
        true
    }

    /// Releases every slot owned by the node. Returns how many were freed.
    pub fn del_node_slots(&mut self, name: &NodeId) -> usize {
        let Some(node) = self.nodes.get(name) else {
            return 0;
        };
        let owned: Vec<u16> = node.slots.iter().collect();
        for &slot in &owned {
            self.del_slot(slot);
        }
        owned.len()
    }

    // --- blacklist ---

    pub fn blacklist_node(&mut self, name: NodeId, now: u64) {
        self.blacklist
            .insert(name, now + ClusterConfig::BLACKLIST_TTL_MS);
    }

    /// Expired entries are pruned before the lookup.
    pub fn blacklist_contains(&mut self, name: &NodeId, now: u64) -> bool {
        self.blacklist.retain(|_, expiry| *expiry > now);
        self.blacklist.contains_key(name)
    }

    // --- counters & derived figures ---

    pub fn note_sent(&mut self, kind: MessageKind) {
        *self.stats_sent.entry(kind).or_insert(0) += 1;
    }

    pub fn note_received(&mut self, kind: MessageKind) {
        *self.stats_received.entry(kind).or_insert(0) += 1;
    }

    pub fn sent_count(&self, kind: MessageKind) -> u64 {
        self.stats_sent.get(&kind).copied().unwrap_or(0)
    }

    pub fn received_count(&self, kind: MessageKind) -> u64 {
        self.stats_received.get(&kind).copied().unwrap_or(0)
    }

    pub fn masters_with_slots(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| n.is_master() && n.numslots > 0)
            .count()
    }

    /// Votes needed to confirm a failure or win an election: a majority of
    /// the masters that own slots.
    pub fn quorum(&self) -> usize {
        self.masters_with_slots() / 2 + 1
    }

    /// Renders the INFO block: overall health, slot coverage, epochs and
    /// per-kind message counters.
    pub fn cluster_info(&self) -> String {
        let mut info = format!(
            "cluster_state:{}\r\n\
             cluster_slots_assigned:{}\r\n\
             cluster_known_nodes:{}\r\n\
             cluster_size:{}\r\n\
             cluster_current_epoch:{}\r\n\
             cluster_my_epoch:{}\r\n",
            self.health,
            self.assigned_slots(),
            self.nodes.len(),
            self.size,
            self.current_epoch,
            self.myself_node().config_epoch,
        );
        let mut total_sent = 0;
        let mut total_received = 0;
        for kind in MessageKind::ALL {
            let sent = self.sent_count(kind);
            let received = self.received_count(kind);
            total_sent += sent;
            total_received += received;
            if sent > 0 {
                info.push_str(&format!(
                    "cluster_stats_messages_{}_sent:{}\r\n",
                    kind.stat_name(),
                    sent
                ));
            }
            if received > 0 {
                info.push_str(&format!(
                    "cluster_stats_messages_{}_received:{}\r\n",
                    kind.stat_name(),
                    received
                ));
            }
        }
        info.push_str(&format!("cluster_stats_messages_sent:{total_sent}\r\n"));
        info.push_str(&format!("cluster_stats_messages_received:{total_received}\r\n"));
        info
    }

    /// Renders every known node (handshake entries included) as nodes.conf
    /// style lines, sorted by id.
    pub fn cluster_nodes(&self) -> String {
        let mut lines: Vec<String> = self
            .nodes
            .values()
            .map(|n| NodeRecord::from_node(n).render())
            .collect();
        lines.sort();
        let mut out = lines.join("\r\n");
        out.push_str("\r\n");
        out
    }
}
