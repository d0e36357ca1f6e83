//! Failover election bookkeeping.
//!
//! When a slave decides its failed master must be replaced, it bumps the
//! cluster epoch and asks every master for a vote. The [`Election`] tracks
//! the votes received for that one epoch; the grant-side guard
//! (one vote per epoch, rate limiting per master) lives in the engine
//! together with the rest of the message handling.

use std::collections::HashSet;

use crate::node::NodeId;

/// State for one in-progress failover election on the slave side.
///
/// Created when the election is started, discarded when it succeeds or
/// expires.
#[derive(Debug)]
pub struct Election {
    /// The epoch this election is contesting. Votes for other epochs do
    /// not count.
    pub epoch: u64,
    /// Unix-ms time the election started; used for expiry.
    pub started_at: u64,
    /// Votes needed to win: a majority of the masters owning slots when
    /// the election started.
    pub required: usize,
    /// Masters that have acked us.
    votes: HashSet<NodeId>,
    /// Whether promotion has already been triggered for this election.
    promoted: bool,
}

impl Election {
    pub fn new(epoch: u64, required: usize, started_at: u64) -> Self {
        Self {
            epoch,
            started_at,
            required,
            votes: HashSet::new(),
            promoted: false,
        }
    }

    /// Records a vote from `from`. Returns `true` exactly once, when the
    /// quorum is newly reached, so the caller promotes exactly once.
    pub fn record_vote(&mut self, from: NodeId) -> bool {
        if self.promoted {
            return false;
        }
        self.votes.insert(from);
        self.promoted = self.votes.len() >= self.required;
        self.promoted
    }

    pub fn votes(&self) -> usize {
        self.votes.len()
    }

    pub fn is_promoted(&self) -> bool {
        self.promoted
    }

    /// An election that has waited longer than `timeout_ms` without quorum
    /// is over.
    pub fn expired(&self, now: u64, timeout_ms: u64) -> bool {
        now.saturating_sub(self.started_at) > timeout_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_reached_exactly_once() {
        let mut e = Election::new(5, 2, 0);
        let a = NodeId::random();
        let b = NodeId::random();
        assert!(!e.record_vote(a), "first vote should not reach quorum");
        assert!(e.record_vote(b), "second vote should reach quorum");
        assert!(e.is_promoted());
        assert!(!e.record_vote(NodeId::random()), "no further triggers after promotion");
    }

    #[test]
    fn duplicate_votes_do_not_count() {
        let mut e = Election::new(1, 2, 0);
        let a = NodeId::random();
        assert!(!e.record_vote(a));
        assert!(!e.record_vote(a));
        assert_eq!(e.votes(), 1);
        assert!(!e.is_promoted());
    }

    #[test]
    fn single_voter_quorum() {
        let mut e = Election::new(1, 1, 0);
        assert!(e.record_vote(NodeId::random()));
    }

    #[test]
    fn expiry_window() {
        let e = Election::new(1, 3, 10_000);
        assert!(!e.expired(10_000, 4_000));
        assert!(!e.expired(14_000, 4_000));
        assert!(e.expired(14_001, 4_000));
    }
}
