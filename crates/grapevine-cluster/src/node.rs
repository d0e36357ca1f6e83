//! Node identity and per-node cluster metadata.
//!
//! Every peer the engine knows about (including the local node) is a
//! [`ClusterNode`]. Role and status are kept orthogonal: [`NodeRole`] is a
//! two-state tag, [`NodeFlags`] a set of independent status bits. Master/slave
//! relations are expressed as [`NodeId`] keys into the cluster's node table,
//! never as owning references, so the relation graph can be relinked freely.

use std::fmt;
use std::str::FromStr;

use rand::Rng;

use crate::error::ClusterError;
use crate::slots::SlotBitmap;

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

/// Stable node identifier: 20 random bytes, rendered as 40 lowercase hex
/// characters on the wire, in logs and in the saved configuration.
///
/// Ordering is lexicographic on the raw bytes, which matches lexicographic
/// ordering of the hex form. Several protocol tie-breaks (config-epoch
/// collisions, slave-migration candidate selection) rely on this order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; 20]);

impl NodeId {
    /// Raw length in bytes.
    pub const RAW_LEN: usize = 20;
    /// Length of the hex rendering.
    pub const HEX_LEN: usize = 40;

    /// Generates a fresh random identifier.
    ///
    /// Callers that insert into a node table must re-roll on collision;
    /// see `ClusterState::generate_node_id`.
    pub fn random() -> Self {
        Self(rand::rng().random())
    }

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// First 8 hex characters, for compact log lines.
    pub fn short(&self) -> String {
        let mut s = String::with_capacity(8);
        for b in &self.0[..4] {
            s.push(HEX_CHARS[(b >> 4) as usize] as char);
            s.push(HEX_CHARS[(b & 0xf) as usize] as char);
        }
        s
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{}{}", HEX_CHARS[(b >> 4) as usize] as char, HEX_CHARS[(b & 0xf) as usize] as char)?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

impl FromStr for NodeId {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != Self::HEX_LEN {
            return Err(ClusterError::InvalidNodeId(s.to_string()));
        }
        let mut out = [0u8; 20];
        for (i, chunk) in bytes.chunks_exact(2).enumerate() {
            let hi = hex_val(chunk[0]).ok_or_else(|| ClusterError::InvalidNodeId(s.to_string()))?;
            let lo = hex_val(chunk[1]).ok_or_else(|| ClusterError::InvalidNodeId(s.to_string()))?;
            out[i] = (hi << 4) | lo;
        }
        Ok(Self(out))
    }
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// A node is either a master (may own slots, may have slaves) or a slave
/// replicating from exactly one master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Master,
    Slave,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Master => write!(f, "master"),
            NodeRole::Slave => write!(f, "slave"),
        }
    }
}

/// Independent status bits, orthogonal to [`NodeRole`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeFlags {
    /// This entry describes the local node.
    pub myself: bool,
    /// Identity not yet confirmed by a PONG from the peer.
    pub handshake: bool,
    /// First contact must be a MEET instead of a PING.
    pub meet: bool,
    /// Locally suspected unreachable (ping timed out).
    pub pfail: bool,
    /// Confirmed unreachable by quorum or by an authoritative FAIL message.
    pub fail: bool,
    /// No valid address is known for this node.
    pub noaddr: bool,
    /// Eligible destination for slave migration.
    pub migrate_to: bool,
}

impl NodeFlags {
    /// Neither suspected nor confirmed failing.
    pub fn is_healthy(&self) -> bool {
        !self.pfail && !self.fail
    }

    /// Renders the flag list used by the nodes listing and the saved
    /// configuration: `myself,master,fail?,fail,handshake,noaddr`.
    /// `meet` and `migrate_to` are runtime-only and never rendered.
    pub fn render(&self, role: NodeRole) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if self.myself {
            parts.push("myself");
        }
        parts.push(match role {
            NodeRole::Master => "master",
            NodeRole::Slave => "slave",
        });
        if self.pfail {
            parts.push("fail?");
        }
        if self.fail {
            parts.push("fail");
        }
        if self.handshake {
            parts.push("handshake");
        }
        if self.noaddr {
            parts.push("noaddr");
        }
        parts.join(",")
    }
}

/// One "this reporter considers that node unreachable" record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureReport {
    pub reporter: NodeId,
    /// Unix-ms time the report was added or last refreshed.
    pub time: u64,
}

/// Identifier for a transport connection, minted by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Engine-side record of a live connection.
///
/// Outbound links are bound to the node they were dialed for; inbound links
/// stay unbound (`node: None`) and only carry request/reply traffic.
#[derive(Debug, Clone)]
pub struct Link {
    pub node: Option<NodeId>,
    /// Unix-ms creation time.
    pub ctime: u64,
    pub inbound: bool,
    /// Remote IP as observed by the transport; used when a MEET has to
    /// create a node before its identity is confirmed.
    pub peer_ip: String,
}

/// Everything the engine tracks about one peer (or about itself).
#[derive(Debug, Clone)]
pub struct ClusterNode {
    pub name: NodeId,
    /// Empty when unknown (freshly met via gossip with no address, or
    /// invalidated by a sender-identity mismatch).
    pub ip: String,
    /// Data port announced by the node. Zero when unknown.
    pub port: u16,
    /// Cluster bus port. Zero when unknown.
    pub cport: u16,
    pub role: NodeRole,
    pub flags: NodeFlags,
    /// Owner-assigned generation counter for slot claims. Never decreases.
    pub config_epoch: u64,
    pub slots: SlotBitmap,
    /// Cached popcount of `slots`; maintained by the slot operations in
    /// `ClusterState`.
    pub numslots: usize,
    /// Names of this node's slaves. Meaningful only while `role` is Master.
    pub slaves: Vec<NodeId>,
    /// This node's master. `Some` iff `role` is Slave.
    pub slaveof: Option<NodeId>,
    /// Unix-ms creation time of this table entry.
    pub ctime: u64,
    /// Time the oldest unacknowledged ping was sent. `None` when no ping is
    /// outstanding.
    pub ping_sent: Option<u64>,
    /// Time of the last pong (or equivalent liveness evidence).
    pub pong_received: u64,
    /// Time the FAIL flag was set. Zero if never.
    pub fail_time: u64,
    /// Time we last granted a failover vote to one of this master's slaves.
    pub voted_time: u64,
    /// Time this master was first observed with zero healthy slaves.
    /// Zero while not orphaned.
    pub orphaned_time: u64,
    /// The engine-initiated connection to this node, if one is open.
    pub link: Option<LinkId>,
    failure_reports: Vec<FailureReport>,
}

impl ClusterNode {
    pub fn new(name: NodeId, role: NodeRole, flags: NodeFlags, now: u64) -> Self {
        Self {
            name,
            ip: String::new(),
            port: 0,
            cport: 0,
            role,
            flags,
            config_epoch: 0,
            slots: SlotBitmap::new(),
            numslots: 0,
            slaves: Vec::new(),
            slaveof: None,
            ctime: now,
            ping_sent: None,
            pong_received: 0,
            fail_time: 0,
            voted_time: 0,
            orphaned_time: 0,
            link: None,
            failure_reports: Vec::new(),
        }
    }

    pub fn is_master(&self) -> bool {
        self.role == NodeRole::Master
    }

    pub fn is_slave(&self) -> bool {
        self.role == NodeRole::Slave
    }

    pub fn in_handshake(&self) -> bool {
        self.flags.handshake
    }

    /// True when the node has a usable address.
    pub fn has_addr(&self) -> bool {
        !self.flags.noaddr && !self.ip.is_empty() && self.cport != 0
    }

    /// `ip:port@cport` as rendered in the nodes listing. Unknown addresses
    /// render as `:0@0`.
    pub fn addr_string(&self) -> String {
        format!("{}:{}@{}", self.ip, self.port, self.cport)
    }

    /// Records a failure report from `reporter`. Re-reports refresh the
    /// existing entry's timestamp. Returns true if the report is new.
    pub fn add_failure_report(&mut self, reporter: NodeId, now: u64) -> bool {
        if let Some(existing) = self.failure_reports.iter_mut().find(|r| r.reporter == reporter) {
            existing.time = now;
            return false;
        }
        self.failure_reports.push(FailureReport { reporter, time: now });
        true
    }

    /// Drops the report from `reporter`, if any. Returns true if one existed.
    pub fn del_failure_report(&mut self, reporter: NodeId) -> bool {
        let before = self.failure_reports.len();
        self.failure_reports.retain(|r| r.reporter != reporter);
        self.failure_reports.len() != before
    }

    /// Number of live failure reports. Reports older than `validity_ms`
    /// are pruned before counting.
    pub fn failure_report_count(&mut self, validity_ms: u64, now: u64) -> usize {
        self.failure_reports
            .retain(|r| now.saturating_sub(r.time) <= validity_ms);
        self.failure_reports.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_roundtrips_through_hex() {
        let id = NodeId::random();
        let hex = id.to_string();
        assert_eq!(hex.len(), NodeId::HEX_LEN);
        assert_eq!(hex.parse::<NodeId>().unwrap(), id);
    }

    #[test]
    fn node_id_rejects_bad_input() {
        assert!("zz".repeat(20).parse::<NodeId>().is_err());
        assert!("abc".parse::<NodeId>().is_err());
        assert!("0".repeat(41).parse::<NodeId>().is_err());
    }

    #[test]
    fn node_id_order_matches_hex_order() {
        let a = NodeId::from_bytes([0x01; 20]);
        let b = NodeId::from_bytes([0xfe; 20]);
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn short_is_prefix_of_display() {
        let id = NodeId::random();
        assert!(id.to_string().starts_with(&id.short()));
        assert_eq!(id.short().len(), 8);
    }

    #[test]
    fn flags_render_in_canonical_order() {
        let flags = NodeFlags {
            myself: true,
            fail: true,
            ..Default::default()
        };
        assert_eq!(flags.render(NodeRole::Master), "myself,master,fail");

        let flags = NodeFlags {
            pfail: true,
            handshake: true,
            ..Default::default()
        };
        assert_eq!(flags.render(NodeRole::Slave), "slave,fail?,handshake");
    }

    #[test]
    fn failure_reports_dedupe_per_reporter() {
        let mut node = ClusterNode::new(NodeId::random(), NodeRole::Master, NodeFlags::default(), 0);
        let reporter = NodeId::random();
        assert!(node.add_failure_report(reporter, 100));
        assert!(!node.add_failure_report(reporter, 200), "re-report must refresh, not add");
        assert_eq!(node.failure_report_count(1_000, 250), 1);
    }

    #[test]
    fn failure_reports_expire() {
        let mut node = ClusterNode::new(NodeId::random(), NodeRole::Master, NodeFlags::default(), 0);
        node.add_failure_report(NodeId::random(), 1_000);
        node.add_failure_report(NodeId::random(), 5_000);
        // validity 2s at t=6s: the t=1s report is stale
        assert_eq!(node.failure_report_count(2_000, 6_000), 1);
        // a refresh keeps a report alive
        let reporter = NodeId::random();
        node.add_failure_report(reporter, 6_000);
        node.add_failure_report(reporter, 9_000);
        assert_eq!(node.failure_report_count(2_000, 10_000), 1);
    }

    #[test]
    fn del_failure_report_removes_only_that_reporter() {
        let mut node = ClusterNode::new(NodeId::random(), NodeRole::Master, NodeFlags::default(), 0);
        let a = NodeId::random();
        let b = NodeId::random();
        node.add_failure_report(a, 100);
        node.add_failure_report(b, 100);
        assert!(node.del_failure_report(a));
        assert!(!node.del_failure_report(a));
        assert_eq!(node.failure_report_count(10_000, 200), 1);
    }
}
