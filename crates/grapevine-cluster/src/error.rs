//! Error types for cluster operations.

use crate::node::NodeId;

/// Errors that can occur during cluster operations.
///
/// Protocol-level problems (truncated packets, stale epochs, unknown
/// senders) are deliberately *not* errors: the engine drops the packet or
/// invalidates the link and moves on. These variants cover admin commands
/// and saved-configuration parsing.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// A node id string was not 40 lowercase hex characters.
    #[error("invalid node id: '{0}'")]
    InvalidNodeId(String),

    /// Node not found in the cluster.
    #[error("node {0} not found in cluster")]
    NodeNotFound(NodeId),

    /// A slot index outside 0..16384.
    #[error("slot {0} out of range")]
    SlotOutOfRange(u16),

    /// The slot is already assigned to a node.
    #[error("slot {0} is already assigned")]
    SlotBusy(u16),

    /// The slot is not assigned to any node.
    #[error("slot {0} is not assigned to any node")]
    SlotNotAssigned(u16),

    /// The local node may not be removed from its own view.
    #[error("cannot forget the local node")]
    ForgetMyself,

    /// A replica may not forget the master it replicates from.
    #[error("cannot forget my master")]
    ForgetMaster,

    /// The saved configuration could not be parsed.
    #[error("malformed cluster configuration: {0}")]
    BadConfigFile(String),
}
