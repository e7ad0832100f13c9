//! Replica configuration

use super::{ConsensusError, ConsensusResult, MembershipView, ReplicaId, RoundNumber};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Consensus engine configuration for one replica.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// This replica
    pub replica_id: ReplicaId,
    /// Members of the initial view, in leader rotation order
    pub members: Vec<ReplicaId>,
    /// Byzantine fault bound (f in N >= 3f+1)
    pub f: usize,
    /// Instances ahead of `last_decided` accepted without a state transfer
    pub high_mark: u64,
    /// Window used right after recovering from empty state
    pub revival_high_mark: u64,
    /// Window used instead of `high_mark` while stopped
    pub timeout_high_mark: u64,
    /// Decided instances kept behind the newest decision
    pub stable_retention: u64,
    /// Round timeout before freezing (milliseconds)
    pub round_timeout_ms: u64,
    /// Rounds ahead of an instance's current round held for later; farther
    /// rounds are rejected
    pub max_round_ahead: RoundNumber,
    /// Global cap on out-of-context messages
    pub max_out_of_context: usize,
    /// Cap on out-of-context messages for a single instance
    pub max_buffered_per_instance: usize,
    /// Cap on messages queued while stopped
    pub max_stopped_messages: usize,
    /// Decide directly on a fast-decide quorum of WRITE votes
    pub fast_decide: bool,
    /// Broadcast DECIDE after deciding
    pub announce_decisions: bool,
    /// Worker tasks signing COLLECT proofs
    pub signing_workers: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            replica_id: 0,
            members: vec![0, 1, 2, 3],
            f: 1,
            high_mark: 100,
            revival_high_mark: 10,
            timeout_high_mark: 200,
            stable_retention: 3,
            round_timeout_ms: 2_000,
            max_round_ahead: 16,
            max_out_of_context: 10_000,
            max_buffered_per_instance: 256,
            max_stopped_messages: 10_000,
            fast_decide: false,
            announce_decisions: true,
            signing_workers: 2,
        }
    }
}

impl ConsensusConfig {
    /// Default configuration for replica `replica_id` of a genesis cluster `0..n`.
    pub fn for_cluster(replica_id: ReplicaId, n: usize, f: usize) -> Self {
        Self {
            replica_id,
            members: (0..n as ReplicaId).collect(),
            f,
            ..Self::default()
        }
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    /// Genesis view built from `members` and `f`
    pub fn initial_view(&self) -> MembershipView {
        MembershipView::new(0, self.members.clone(), self.f)
    }

    pub fn validate(&self) -> ConsensusResult<()> {
        let n = self.members.len();
        if n < 3 * self.f + 1 {
            return Err(ConsensusError::InvalidConfig(format!(
                "{} replicas cannot tolerate f = {} (need at least {})",
                n,
                self.f,
                3 * self.f + 1
            )));
        }
        let mut unique = self.members.clone();
        unique.sort_unstable();
        unique.dedup();
        if unique.len() != n {
            return Err(ConsensusError::InvalidConfig(
                "duplicate replica id in members".into(),
            ));
        }
        if !self.members.contains(&self.replica_id) {
            return Err(ConsensusError::InvalidConfig(format!(
                "replica {} is not a member of the initial view",
                self.replica_id
            )));
        }
        if self.high_mark == 0 || self.revival_high_mark == 0 {
            return Err(ConsensusError::InvalidConfig(
                "watermarks must be positive".into(),
            ));
        }
        if self.timeout_high_mark == 0 {
            return Err(ConsensusError::InvalidConfig(
                "timeout_high_mark must be positive".into(),
            ));
        }
        if self.max_buffered_per_instance == 0
            || self.max_out_of_context < self.max_buffered_per_instance
        {
            return Err(ConsensusError::InvalidConfig(
                "max_out_of_context must hold at least one full instance".into(),
            ));
        }
        if self.max_round_ahead == 0 {
            return Err(ConsensusError::InvalidConfig(
                "max_round_ahead must be positive".into(),
            ));
        }
        if self.round_timeout_ms == 0 {
            return Err(ConsensusError::InvalidConfig(
                "round timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}
