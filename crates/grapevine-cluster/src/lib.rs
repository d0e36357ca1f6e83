//! grapevine-cluster: gossip-based cluster membership and slot ownership.
//!
//! This crate implements the cluster protocol as a sans-IO engine: it owns
//! the node table, the 16384-slot ownership map, the failure detector and
//! the failover machinery, but never touches a socket or a clock. A driver
//! (see the `grapevine-server` crate) feeds it decoded messages, link
//! lifecycle notifications and time, and executes the [`Action`]s it
//! returns.
//!
//! # Architecture
//!
//! - **Membership**: nodes meet over a MEET/PING/PONG handshake and learn
//!   about each other through gossip sections piggybacked on every heartbeat.
//! - **Slot ownership**: 16384 hash slots, each owned by at most one master;
//!   conflicting claims are resolved by per-node config epochs.
//! - **Failure detection**: local suspicion (PFAIL) is promoted to an
//!   authoritative FAIL once a majority of slot-owning masters agrees.
//! - **Failover**: slaves of a failed master run an epoch-gated election;
//!   the winner promotes itself and takes over the slots.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use grapevine_cluster::{ClusterConfig, Engine, key_hash_slot};
//! use tokio::sync::mpsc;
//!
//! let (events, _rx) = mpsc::channel(1024);
//! let mut engine = Engine::new(
//!     ClusterConfig::default(),
//!     events,
//!     "127.0.0.1".into(),
//!     7000,
//!     17000,
//!     now_ms(),
//! );
//! for action in engine.tick(now_ms()) {
//!     // connect, send, close, persist...
//! }
//!
//! // Route a key to its slot
//! let slot = key_hash_slot(b"mykey");
//! assert!(engine.state().slot_owner(slot).is_some());
//! ```

mod config;
mod engine;
mod error;
mod failover;
mod message;
mod node;
mod slots;
mod snapshot;
mod state;

pub use config::ClusterConfig;
pub use engine::{Action, ClusterEvent, Engine};
pub use error::ClusterError;
pub use message::{ClusterMessage, GossipEntry, MessageKind, Payload, PROTOCOL_VERSION};
pub use node::{ClusterNode, Link, LinkId, NodeFlags, NodeId, NodeRole};
pub use slots::{format_slot_ranges, key_hash_slot, SlotBitmap, SLOT_COUNT};
pub use snapshot::{ConfigSnapshot, NodeRecord};
pub use state::{ClusterHealth, ClusterState};
