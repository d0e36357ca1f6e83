//! Saved cluster configuration (nodes.conf style).
//!
//! The engine emits a [`ConfigSnapshot`] whenever the durable part of its
//! view changes; the server writes it to disk and feeds it back on startup.
//! The format is one text line per node:
//!
//! ```text
//! <id> <ip>:<port>@<cport> <flags> <master|-> <ping-sent> <pong-received> <config-epoch> <connected|disconnected> [slot ranges...]
//! ```
//!
//! followed by a `vars currentEpoch <n> lastVoteEpoch <n>` trailer. Nodes
//! still in handshake are not persisted: their identity is unconfirmed.

use crate::error::ClusterError;
use crate::node::{ClusterNode, NodeFlags, NodeId, NodeRole};
use crate::slots::{format_slot_ranges, SlotBitmap};

/// One persisted node line, decoupled from the live [`ClusterNode`].
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub name: NodeId,
    pub ip: String,
    pub port: u16,
    pub cport: u16,
    pub role: NodeRole,
    pub myself: bool,
    pub pfail: bool,
    pub fail: bool,
    pub handshake: bool,
    pub noaddr: bool,
    pub master: Option<NodeId>,
    pub ping_sent: u64,
    pub pong_received: u64,
    pub config_epoch: u64,
    pub connected: bool,
    pub slots: SlotBitmap,
}

impl NodeRecord {
    pub fn from_node(node: &ClusterNode) -> Self {
        Self {
            name: node.name,
            ip: node.ip.clone(),
            port: node.port,
            cport: node.cport,
            role: node.role,
            myself: node.flags.myself,
            pfail: node.flags.pfail,
            fail: node.flags.fail,
            handshake: node.flags.handshake,
            noaddr: node.flags.noaddr,
            master: node.slaveof,
            ping_sent: node.ping_sent.unwrap_or(0),
            pong_received: node.pong_received,
            config_epoch: node.config_epoch,
            connected: node.link.is_some() || node.flags.myself,
            slots: node.slots.clone(),
        }
    }

    /// Reconstructs the status flags for restoring a live node.
    pub fn flags(&self) -> NodeFlags {
        NodeFlags {
            myself: self.myself,
            handshake: self.handshake,
            meet: false,
            pfail: self.pfail,
            fail: self.fail,
            noaddr: self.noaddr,
            migrate_to: false,
        }
    }

    /// Renders the node line.
    pub fn render(&self) -> String {
        let flags = NodeFlags {
            myself: self.myself,
            handshake: self.handshake,
            meet: false,
            pfail: self.pfail,
            fail: self.fail,
            noaddr: self.noaddr,
            migrate_to: false,
        };
        let master = match &self.master {
            Some(id) => id.to_string(),
            None => "-".to_string(),
        };
        let mut line = format!(
            "{} {}:{}@{} {} {} {} {} {} {}",
            self.name,
            self.ip,
            self.port,
            self.cport,
            flags.render(self.role),
            master,
            self.ping_sent,
            self.pong_received,
            self.config_epoch,
            if self.connected { "connected" } else { "disconnected" },
        );
        let ranges = format_slot_ranges(&self.slots);
        if !ranges.is_empty() {
            line.push(' ');
            line.push_str(&ranges);
        }
        line
    }

    fn parse(line: &str) -> Result<Self, ClusterError> {
        let bad = |msg: &str| ClusterError::BadConfigFile(format!("{msg}: '{line}'"));

        let mut fields = line.split_whitespace();
        let name: NodeId = fields.next().ok_or_else(|| bad("missing id"))?.parse()?;

        let addr = fields.next().ok_or_else(|| bad("missing address"))?;
        let (ip_port, cport) = addr.split_once('@').ok_or_else(|| bad("missing bus port"))?;
        let (ip, port) = ip_port.rsplit_once(':').ok_or_else(|| bad("missing port"))?;
        let port: u16 = port.parse().map_err(|_| bad("bad port"))?;
        let cport: u16 = cport.parse().map_err(|_| bad("bad bus port"))?;

        let mut role = None;
        let mut myself = false;
        let mut pfail = false;
        let mut fail = false;
        let mut handshake = false;
        let mut noaddr = false;
        for flag in fields.next().ok_or_else(|| bad("missing flags"))?.split(',') {
            match flag {
                "master" => role = Some(NodeRole::Master),
                "slave" => role = Some(NodeRole::Slave),
                "myself" => myself = true,
                "fail?" => pfail = true,
                "fail" => fail = true,
                "handshake" => handshake = true,
                "noaddr" => noaddr = true,
                other => return Err(bad(&format!("unknown flag '{other}'"))),
            }
        }
        let role = role.ok_or_else(|| bad("missing role flag"))?;

        let master = match fields.next().ok_or_else(|| bad("missing master"))? {
            "-" => None,
            id => Some(id.parse()?),
        };
        let ping_sent: u64 = fields
            .next()
            .ok_or_else(|| bad("missing ping-sent"))?
            .parse()
            .map_err(|_| bad("bad ping-sent"))?;
        let pong_received: u64 = fields
            .next()
            .ok_or_else(|| bad("missing pong-received"))?
            .parse()
            .map_err(|_| bad("bad pong-received"))?;
        let config_epoch: u64 = fields
            .next()
            .ok_or_else(|| bad("missing config-epoch"))?
            .parse()
            .map_err(|_| bad("bad config-epoch"))?;
        let connected = match fields.next().ok_or_else(|| bad("missing link state"))? {
            "connected" => true,
            "disconnected" => false,
            _ => return Err(bad("bad link state")),
        };

        let mut slots = SlotBitmap::new();
        for range in fields {
            let (start, end) = match range.split_once('-') {
                Some((s, e)) => (
                    s.parse::<u16>().map_err(|_| bad("bad slot range"))?,
                    e.parse::<u16>().map_err(|_| bad("bad slot range"))?,
                ),
                None => {
                    let s = range.parse::<u16>().map_err(|_| bad("bad slot"))?;
                    (s, s)
                }
            };
            if start > end || end as usize >= crate::slots::SLOT_COUNT {
                return Err(bad("slot range out of bounds"));
            }
            for slot in start..=end {
                slots.set(slot);
            }
        }

        Ok(Self {
            name,
            ip: ip.to_string(),
            port,
            cport,
            role,
            myself,
            pfail,
            fail,
            handshake,
            noaddr,
            master,
            ping_sent,
            pong_received,
            config_epoch,
            connected,
            slots,
        })
    }

    /// True when the durable part of the record matches: identity, address,
    /// role, persistent flags, replication target, epoch and slots. Ping
    /// times, link state and local suspicion are transient and ignored, so
    /// they do not churn the config file.
    fn same_config(&self, other: &Self) -> bool {
        self.name == other.name
            && self.ip == other.ip
            && self.port == other.port
            && self.cport == other.cport
            && self.role == other.role
            && self.myself == other.myself
            && self.fail == other.fail
            && self.noaddr == other.noaddr
            && self.master == other.master
            && self.config_epoch == other.config_epoch
            && self.slots == other.slots
    }
}

/// A full point-in-time copy of the durable cluster view.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSnapshot {
    /// Node records sorted by id. Handshake nodes are excluded.
    pub records: Vec<NodeRecord>,
    pub current_epoch: u64,
    pub last_vote_epoch: u64,
}

impl ConfigSnapshot {
    /// Serializes to the nodes.conf text form.
    pub fn to_config_string(&self) -> String {
        let mut out = String::new();
        for record in &self.records {
            out.push_str(&record.render());
            out.push('\n');
        }
        out.push_str(&format!(
            "vars currentEpoch {} lastVoteEpoch {}\n",
            self.current_epoch, self.last_vote_epoch
        ));
        out
    }

    /// Parses a nodes.conf text form back into a snapshot.
    pub fn parse(text: &str) -> Result<Self, ClusterError> {
        let mut records = Vec::new();
        let mut current_epoch = 0;
        let mut last_vote_epoch = 0;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix("vars ") {
                let mut fields = rest.split_whitespace();
                while let Some(key) = fields.next() {
                    let value = fields
                        .next()
                        .ok_or_else(|| ClusterError::BadConfigFile(format!("vars: missing value for '{key}'")))?;
                    let value: u64 = value
                        .parse()
                        .map_err(|_| ClusterError::BadConfigFile(format!("vars: bad value for '{key}'")))?;
                    match key {
                        "currentEpoch" => current_epoch = value,
                        "lastVoteEpoch" => last_vote_epoch = value,
                        // unknown vars are skipped for forward compatibility
                        _ => {}
                    }
                }
                continue;
            }
            records.push(NodeRecord::parse(line)?);
        }
        records.sort_by_key(|r| r.name);
        Ok(Self {
            records,
            current_epoch,
            last_vote_epoch,
        })
    }

    /// True when the two snapshots describe the same durable configuration.
    /// Used by the engine to decide whether a save is due.
    pub fn same_config(&self, other: &Self) -> bool {
        self.current_epoch == other.current_epoch
            && self.last_vote_epoch == other.last_vote_epoch
            && self.records.len() == other.records.len()
            && self
                .records
                .iter()
                .zip(&other.records)
                .all(|(a, b)| a.same_config(b))
    }
}
