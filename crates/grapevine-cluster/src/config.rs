//! Engine tunables and the timing windows derived from them.
//!
//! Every protocol deadline is derived from the single `node_timeout` base
//! value, so operators tune one number and the handshake, retry, fail-undo
//! and rejoin windows scale with it.

use std::time::Duration;

/// Static configuration for the cluster engine.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Base failure-detection window. A peer that has not answered a ping
    /// for this long is suspected unreachable.
    pub node_timeout: Duration,
    /// Minimum number of slaves a master must keep before one of them may
    /// migrate to an orphaned master.
    pub migration_barrier: usize,
    /// When true the cluster reports FAIL while any slot is unowned or
    /// owned by a failed master.
    pub require_full_coverage: bool,
    /// Address overrides announced to peers instead of the locally
    /// observed ones (NAT / container deployments).
    pub announce_ip: Option<String>,
    pub announce_port: Option<u16>,
    pub announce_bus_port: Option<u16>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_timeout: Duration::from_secs(15),
            migration_barrier: 1,
            require_full_coverage: true,
            announce_ip: None,
            announce_port: None,
            announce_bus_port: None,
        }
    }
}

impl ClusterConfig {
    /// How long a forgotten node id stays suppressed from gossip rediscovery.
    pub const BLACKLIST_TTL_MS: u64 = 60_000;
    /// How long a master must stay orphaned before a slave migrates to it.
    pub const MIGRATION_DELAY_MS: u64 = 5_000;
    /// Boot grace: while FAIL, health is not re-evaluated for this long
    /// after the first evaluation.
    pub const WRITABLE_DELAY_MS: u64 = 2_000;

    pub fn node_timeout_ms(&self) -> u64 {
        self.node_timeout.as_millis() as u64
    }

    /// Handshake nodes are reaped after this window.
    pub fn handshake_timeout_ms(&self) -> u64 {
        self.node_timeout_ms().max(1_000)
    }

    /// A quiet peer is re-pinged after half the timeout, leaving the other
    /// half for the reply before PFAIL.
    pub fn ping_retry_ms(&self) -> u64 {
        self.node_timeout_ms() / 2
    }

    /// A master with slots keeps its FAIL flag at least this long before
    /// fresh reachability may clear it.
    pub fn fail_undo_ms(&self) -> u64 {
        self.node_timeout_ms() * 2
    }

    /// Failure reports older than this no longer count toward quorum.
    pub fn report_validity_ms(&self) -> u64 {
        self.node_timeout_ms() * 2
    }

    /// Minimum spacing between failover votes granted to slaves of the
    /// same master.
    pub fn vote_rate_limit_ms(&self) -> u64 {
        self.node_timeout_ms() * 2
    }

    /// Delay before a node that was fenced off in a minority partition
    /// reports OK again after rejoining the majority.
    pub fn rejoin_delay_ms(&self) -> u64 {
        self.node_timeout_ms().clamp(500, 5_000)
    }

    /// How long a started election waits for votes before it expires.
    pub fn election_timeout_ms(&self) -> u64 {
        (self.node_timeout_ms() * 2).max(2_000)
    }

    /// Minimum spacing between election attempts for the same dead master.
    pub fn election_retry_ms(&self) -> u64 {
        self.election_timeout_ms() * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ClusterConfig::default();
        assert_eq!(cfg.node_timeout_ms(), 15_000);
        assert_eq!(cfg.migration_barrier, 1);
        assert!(cfg.require_full_coverage);
    }

    #[test]
    fn derived_windows_scale_with_node_timeout() {
        let cfg = ClusterConfig {
            node_timeout: Duration::from_secs(4),
            ..Default::default()
        };
        assert_eq!(cfg.ping_retry_ms(), 2_000);
        assert_eq!(cfg.fail_undo_ms(), 8_000);
        assert_eq!(cfg.handshake_timeout_ms(), 4_000);
        assert_eq!(cfg.election_timeout_ms(), 8_000);
        assert_eq!(cfg.election_retry_ms(), 16_000);
    }

    #[test]
    fn handshake_timeout_has_a_floor() {
        let cfg = ClusterConfig {
            node_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        assert_eq!(cfg.handshake_timeout_ms(), 1_000);
    }

    #[test]
    fn rejoin_delay_is_clamped() {
        let short = ClusterConfig {
            node_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        assert_eq!(short.rejoin_delay_ms(), 500);

        let long = ClusterConfig {
            node_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        assert_eq!(long.rejoin_delay_ms(), 5_000);
    }

    #[test]
    fn election_timeout_has_a_floor() {
        let cfg = ClusterConfig {
            node_timeout: Duration::from_millis(300),
            ..Default::default()
        };
        assert_eq!(cfg.election_timeout_ms(), 2_000);
    }
}
