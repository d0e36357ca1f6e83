//! Binary wire format for cluster bus messages.
//!
//! Every message carries the same header (sender identity, epochs, claimed
//! slot bitmap, replication target, announced address, flags) followed by a
//! kind-specific payload. All multi-byte integers are little-endian. The
//! transport frames messages with a u32 length prefix; this module only
//! deals with one framed message at a time.

use std::io::{self, Read};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::node::{NodeId, NodeRole};
use crate::slots::SlotBitmap;

/// Wire protocol version. Messages with any other version are dropped.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum number of gossip entries in one message.
/// Prevents allocation bombs from crafted messages.
const MAX_GOSSIP_ENTRIES: usize = 1024;

/// Maximum size of a publish channel or payload blob.
const MAX_BLOB_LEN: usize = 1 << 20;

/// Message kinds, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Ping,
    Pong,
    Meet,
    Fail,
    Publish,
    FailoverAuthRequest,
    FailoverAuthAck,
    Update,
}

impl MessageKind {
    pub const ALL: [MessageKind; 8] = [
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::Meet,
        MessageKind::Fail,
        MessageKind::Publish,
        MessageKind::FailoverAuthRequest,
        MessageKind::FailoverAuthAck,
        MessageKind::Update,
    ];

    fn as_u8(self) -> u8 {
        match self {
            MessageKind::Ping => 0,
            MessageKind::Pong => 1,
            MessageKind::Meet => 2,
            MessageKind::Fail => 3,
            MessageKind::Publish => 4,
            MessageKind::FailoverAuthRequest => 5,
            MessageKind::FailoverAuthAck => 6,
            MessageKind::Update => 7,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MessageKind::Ping),
            1 => Some(MessageKind::Pong),
            2 => Some(MessageKind::Meet),
            3 => Some(MessageKind::Fail),
            4 => Some(MessageKind::Publish),
            5 => Some(MessageKind::FailoverAuthRequest),
            6 => Some(MessageKind::FailoverAuthAck),
            7 => Some(MessageKind::Update),
            _ => None,
        }
    }

    /// Stat-line name used by INFO.
    pub fn stat_name(self) -> &'static str {
        match self {
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Meet => "meet",
            MessageKind::Fail => "fail",
            MessageKind::Publish => "publish",
            MessageKind::FailoverAuthRequest => "auth-req",
            MessageKind::FailoverAuthAck => "auth-ack",
            MessageKind::Update => "update",
        }
    }
}

/// One piggybacked observation about a third node.
#[derive(Debug, Clone, PartialEq)]
pub struct GossipEntry {
    pub node: NodeId,
    /// When the gossiping node last pinged this node. Zero if no ping is
    /// outstanding there.
    pub ping_sent: u64,
    /// When the gossiping node last heard a pong from this node.
    pub pong_received: u64,
    pub ip: String,
    pub port: u16,
    pub cport: u16,
    pub role: NodeRole,
    pub pfail: bool,
    pub fail: bool,
    pub noaddr: bool,
}

impl GossipEntry {
    /// Neither failing nor address-less from the gossiper's point of view.
    pub fn is_clean(&self) -> bool {
        !self.pfail && !self.fail && !self.noaddr
    }
}

/// Kind-specific message payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Ping { gossip: Vec<GossipEntry> },
    Pong { gossip: Vec<GossipEntry> },
    Meet { gossip: Vec<GossipEntry> },
    /// Authoritative "this node is down" broadcast.
    Fail { node: NodeId },
    /// Cluster-wide pub/sub relay. The engine only surfaces it as an event.
    Publish { channel: Bytes, message: Bytes },
    /// Corrects a peer holding a stale view of `node`'s slot ownership.
    Update {
        epoch: u64,
        node: NodeId,
        slots: SlotBitmap,
    },
    FailoverAuthRequest { force_ack: bool },
    FailoverAuthAck,
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Ping { .. } => MessageKind::Ping,
            Payload::Pong { .. } => MessageKind::Pong,
            Payload::Meet { .. } => MessageKind::Meet,
            Payload::Fail { .. } => MessageKind::Fail,
            Payload::Publish { .. } => MessageKind::Publish,
            Payload::Update { .. } => MessageKind::Update,
            Payload::FailoverAuthRequest { .. } => MessageKind::FailoverAuthRequest,
            Payload::FailoverAuthAck => MessageKind::FailoverAuthAck,
        }
    }
}

/// One cluster bus message: common header plus payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterMessage {
    pub version: u8,
    pub sender: NodeId,
    pub current_epoch: u64,
    /// The sender's own config epoch (a slave announces its master's).
    pub config_epoch: u64,
    /// The slot bitmap the sender (or its master) claims.
    pub slots: SlotBitmap,
    /// The sender's master, if the sender is a slave.
    pub slaveof: Option<NodeId>,
    pub ip: String,
    pub port: u16,
    pub cport: u16,
    pub role: NodeRole,
    pub pfail: bool,
    pub fail: bool,
    /// Whether the sender considers its cluster healthy.
    pub state_ok: bool,
    pub payload: Payload,
}

impl ClusterMessage {
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Serializes the message to bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2300);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Serializes the message into the given buffer.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.kind().as_u8());
        encode_node_id(buf, &self.sender);
        buf.put_u64_le(self.current_epoch);
        buf.put_u64_le(self.config_epoch);
        encode_bitmap(buf, &self.slots);
        encode_opt_node_id(buf, &self.slaveof);
        encode_str(buf, &self.ip);
        buf.put_u16_le(self.port);
        buf.put_u16_le(self.cport);
        buf.put_u8(pack_flags(self.role, self.pfail, self.fail, false));
        buf.put_u8(self.state_ok as u8);

        match &self.payload {
            Payload::Ping { gossip } | Payload::Pong { gossip } | Payload::Meet { gossip } => {
                let count = gossip.len().min(MAX_GOSSIP_ENTRIES);
                buf.put_u16_le(count as u16);
                for entry in &gossip[..count] {
                    encode_node_id(buf, &entry.node);
                    buf.put_u64_le(entry.ping_sent);
                    buf.put_u64_le(entry.pong_received);
                    encode_str(buf, &entry.ip);
                    buf.put_u16_le(entry.port);
                    buf.put_u16_le(entry.cport);
                    buf.put_u8(pack_flags(entry.role, entry.pfail, entry.fail, entry.noaddr));
                }
            }
            Payload::Fail { node } => encode_node_id(buf, node),
            Payload::Publish { channel, message } => {
                buf.put_u32_le(channel.len() as u32);
                buf.put_slice(channel);
                buf.put_u32_le(message.len() as u32);
                buf.put_slice(message);
            }
            Payload::Update { epoch, node, slots } => {
                buf.put_u64_le(*epoch);
                encode_node_id(buf, node);
                encode_bitmap(buf, slots);
            }
            Payload::FailoverAuthRequest { force_ack } => buf.put_u8(*force_ack as u8),
            Payload::FailoverAuthAck => {}
        }
    }

    /// Deserializes a message from bytes.
    pub fn decode(mut buf: &[u8]) -> io::Result<Self> {
        let version = safe_get_u8(&mut buf)?;
        let kind = safe_get_u8(&mut buf)?;
        let kind = MessageKind::from_u8(kind)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("unknown message kind: {kind}")))?;

        let sender = decode_node_id(&mut buf)?;
        let current_epoch = safe_get_u64_le(&mut buf)?;
        let config_epoch = safe_get_u64_le(&mut buf)?;
        let slots = decode_bitmap(&mut buf)?;
        let slaveof = decode_opt_node_id(&mut buf)?;
        let ip = decode_str(&mut buf)?;
        let port = safe_get_u16_le(&mut buf)?;
        let cport = safe_get_u16_le(&mut buf)?;
        let (role, pfail, fail, _noaddr) = unpack_flags(safe_get_u8(&mut buf)?);
        let state_ok = safe_get_u8(&mut buf)? != 0;

        let payload = match kind {
            MessageKind::Ping | MessageKind::Pong | MessageKind::Meet => {
                let count = safe_get_u16_le(&mut buf)? as usize;
                if count > MAX_GOSSIP_ENTRIES {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("gossip count {count} exceeds limit"),
                    ));
                }
                let mut gossip = Vec::with_capacity(count);
                for _ in 0..count {
                    let node = decode_node_id(&mut buf)?;
                    let ping_sent = safe_get_u64_le(&mut buf)?;
                    let pong_received = safe_get_u64_le(&mut buf)?;
                    let ip = decode_str(&mut buf)?;
                    let port = safe_get_u16_le(&mut buf)?;
                    let cport = safe_get_u16_le(&mut buf)?;
                    let (role, pfail, fail, noaddr) = unpack_flags(safe_get_u8(&mut buf)?);
                    gossip.push(GossipEntry {
                        node,
                        ping_sent,
                        pong_received,
                        ip,
                        port,
                        cport,
                        role,
                        pfail,
                        fail,
                        noaddr,
                    });
                }
                match kind {
                    MessageKind::Ping => Payload::Ping { gossip },
                    MessageKind::Pong => Payload::Pong { gossip },
                    _ => Payload::Meet { gossip },
                }
            }
            MessageKind::Fail => Payload::Fail {
                node: decode_node_id(&mut buf)?,
            },
            MessageKind::Publish => {
                let channel = decode_blob(&mut buf)?;
                let message = decode_blob(&mut buf)?;
                Payload::Publish { channel, message }
            }
            MessageKind::Update => {
                let epoch = safe_get_u64_le(&mut buf)?;
                let node = decode_node_id(&mut buf)?;
                let slots = decode_bitmap(&mut buf)?;
                Payload::Update { epoch, node, slots }
            }
            MessageKind::FailoverAuthRequest => Payload::FailoverAuthRequest {
                force_ack: safe_get_u8(&mut buf)? != 0,
            },
            MessageKind::FailoverAuthAck => Payload::FailoverAuthAck,
        };

        Ok(ClusterMessage {
            version,
            sender,
            current_epoch,
            config_epoch,
            slots,
            slaveof,
            ip,
            port,
            cport,
            role,
            pfail,
            fail,
            state_ok,
            payload,
        })
    }
}

// Flag byte layout: bit 0 = slave role, bit 1 = pfail, bit 2 = fail,
// bit 3 = noaddr (gossip entries only).

fn pack_flags(role: NodeRole, pfail: bool, fail: bool, noaddr: bool) -> u8 {
    let mut flags = 0u8;
    if role == NodeRole::Slave {
        flags |= 1;
    }
    if pfail {
        flags |= 2;
    }
    if fail {
        flags |= 4;
    }
    if noaddr {
        flags |= 8;
    }
    flags
}

fn unpack_flags(flags: u8) -> (NodeRole, bool, bool, bool) {
    let role = if flags & 1 != 0 {
        NodeRole::Slave
    } else {
        NodeRole::Master
    };
    (role, flags & 2 != 0, flags & 4 != 0, flags & 8 != 0)
}

// Safe read helpers that return io::Error instead of panicking on truncated input.

fn safe_get_u8(buf: &mut &[u8]) -> io::Result<u8> {
    if buf.is_empty() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 1 byte"));
    }
    Ok(buf.get_u8())
}

fn safe_get_u16_le(buf: &mut &[u8]) -> io::Result<u16> {
    if buf.len() < 2 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 2 bytes"));
    }
    Ok(buf.get_u16_le())
}

fn safe_get_u32_le(buf: &mut &[u8]) -> io::Result<u32> {
    if buf.len() < 4 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 4 bytes"));
    }
    Ok(buf.get_u32_le())
}

fn safe_get_u64_le(buf: &mut &[u8]) -> io::Result<u64> {
    if buf.len() < 8 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 8 bytes"));
    }
    Ok(buf.get_u64_le())
}

fn encode_node_id(buf: &mut BytesMut, id: &NodeId) {
    buf.put_slice(id.as_bytes());
}

fn decode_node_id(buf: &mut &[u8]) -> io::Result<NodeId> {
    if buf.len() < NodeId::RAW_LEN {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "not enough bytes for node id",
        ));
    }
    let mut bytes = [0u8; NodeId::RAW_LEN];
    buf.read_exact(&mut bytes)?;
    Ok(NodeId::from_bytes(bytes))
}

fn encode_opt_node_id(buf: &mut BytesMut, id: &Option<NodeId>) {
    match id {
        Some(id) => {
            buf.put_u8(1);
            encode_node_id(buf, id);
        }
        None => buf.put_u8(0),
    }
}

fn decode_opt_node_id(buf: &mut &[u8]) -> io::Result<Option<NodeId>> {
    match safe_get_u8(buf)? {
        0 => Ok(None),
        1 => Ok(Some(decode_node_id(buf)?)),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad option tag: {other}"),
        )),
    }
}

fn encode_bitmap(buf: &mut BytesMut, slots: &SlotBitmap) {
    for word in slots.words() {
        buf.put_u64_le(*word);
    }
}

fn decode_bitmap(buf: &mut &[u8]) -> io::Result<SlotBitmap> {
    let mut words = [0u64; 256];
    for word in words.iter_mut() {
        *word = safe_get_u64_le(buf)?;
    }
    Ok(SlotBitmap::from_words(words))
}

fn encode_str(buf: &mut BytesMut, s: &str) {
    let len = s.len().min(u8::MAX as usize);
    buf.put_u8(len as u8);
    buf.put_slice(&s.as_bytes()[..len]);
}

fn decode_str(buf: &mut &[u8]) -> io::Result<String> {
    let len = safe_get_u8(buf)? as usize;
    if buf.len() < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "not enough bytes for string",
        ));
    }
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "string is not utf-8"))?
        .to_string();
    buf.advance(len);
    Ok(s)
}

fn decode_blob(buf: &mut &[u8]) -> io::Result<Bytes> {
    let len = safe_get_u32_le(buf)? as usize;
    if len > MAX_BLOB_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("blob length {len} exceeds limit"),
        ));
    }
    if buf.len() < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "not enough bytes for blob",
        ));
    }
    let blob = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(blob)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(payload: Payload) -> ClusterMessage {
        ClusterMessage {
            version: PROTOCOL_VERSION,
            sender: NodeId::random(),
            current_epoch: 7,
            config_epoch: 3,
            slots: SlotBitmap::new(),
            slaveof: None,
            ip: "127.0.0.1".to_string(),
            port: 7000,
            cport: 17000,
            role: NodeRole::Master,
            pfail: false,
            fail: false,
            state_ok: true,
            payload,
        }
    }

    fn entry() -> GossipEntry {
        GossipEntry {
            node: NodeId::random(),
            ping_sent: 1_000,
            pong_received: 2_000,
            ip: "10.0.0.3".to_string(),
            port: 7001,
            cport: 17001,
            role: NodeRole::Slave,
            pfail: true,
            fail: false,
            noaddr: false,
        }
    }

    #[test]
    fn ping_roundtrip() {
        let msg = header(Payload::Ping {
            gossip: vec![entry(), entry()],
        });
        let decoded = ClusterMessage::decode(&msg.encode()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn pong_with_slots_and_slaveof_roundtrip() {
        let mut msg = header(Payload::Pong { gossip: vec![] });
        msg.role = NodeRole::Slave;
        msg.slaveof = Some(NodeId::random());
        msg.slots.set(0);
        msg.slots.set(5460);
        let decoded = ClusterMessage::decode(&msg.encode()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn meet_roundtrip() {
        let msg = header(Payload::Meet { gossip: vec![entry()] });
        let decoded = ClusterMessage::decode(&msg.encode()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn fail_roundtrip() {
        let msg = header(Payload::Fail {
            node: NodeId::random(),
        });
        let decoded = ClusterMessage::decode(&msg.encode()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn publish_roundtrip() {
        let msg = header(Payload::Publish {
            channel: Bytes::from_static(b"news"),
            message: Bytes::from_static(b"hello there"),
        });
        let decoded = ClusterMessage::decode(&msg.encode()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn update_roundtrip() {
        let mut slots = SlotBitmap::new();
        slots.set(42);
        slots.set(16383);
        let msg = header(Payload::Update {
            epoch: 99,
            node: NodeId::random(),
            slots,
        });
        let decoded = ClusterMessage::decode(&msg.encode()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn auth_request_and_ack_roundtrip() {
        let req = header(Payload::FailoverAuthRequest { force_ack: true });
        assert_eq!(ClusterMessage::decode(&req.encode()).unwrap(), req);
        let ack = header(Payload::FailoverAuthAck);
        assert_eq!(ClusterMessage::decode(&ack.encode()).unwrap(), ack);
    }

    #[test]
    fn truncated_input_is_an_error() {
        let msg = header(Payload::Ping {
            gossip: vec![entry()],
        });
        let encoded = msg.encode();
        for len in [0, 1, 10, encoded.len() - 1] {
            assert!(
                ClusterMessage::decode(&encoded[..len]).is_err(),
                "decode of {len} bytes should fail"
            );
        }
    }

    #[test]
    fn unknown_kind_is_an_error() {
        assert!(ClusterMessage::decode(&[PROTOCOL_VERSION, 0xff]).is_err());
    }

    #[test]
    fn oversized_gossip_count_rejected() {
        let msg = header(Payload::Ping { gossip: vec![] });
        let mut encoded = BytesMut::from(&msg.encode()[..]);
        // count field sits right after the fixed-size header
        let count_at = encoded.len() - 2;
        encoded[count_at..].copy_from_slice(&u16::MAX.to_le_bytes());
        assert!(ClusterMessage::decode(&encoded).is_err());
    }

    #[test]
    fn version_is_preserved_for_dispatch_to_check() {
        let mut msg = header(Payload::Ping { gossip: vec![] });
        msg.version = 9;
        let decoded = ClusterMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.version, 9);
    }
}
