//! Leader module
//!
//! Maps `(instance, round)` to the replica allowed to propose. Lookups never
//! fail: a missing instance inherits the leader of the last round of the
//! nearest known predecessor, and an empty table falls back to the bootstrap
//! leader.

use super::{InstanceId, MembershipView, ReplicaId, RoundNumber};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct LeaderModule {
    records: BTreeMap<InstanceId, BTreeMap<RoundNumber, ReplicaId>>,
    bootstrap: ReplicaId,
}

impl LeaderModule {
    pub fn new(bootstrap: ReplicaId) -> Self {
        Self {
            records: BTreeMap::new(),
            bootstrap,
        }
    }

    /// Leader of `(instance, round)`.
    ///
    /// Rounds without their own record use the highest recorded round below
    /// them. An instance without any record inherits (and caches) the leader
    /// of the last round of the nearest earlier instance.
    pub fn leader_of(&mut self, instance: InstanceId, round: RoundNumber) -> ReplicaId {
        if !self.records.contains_key(&instance) {
            let inherited = self.predecessor_leader(instance);
            self.record_leader(instance, 0, inherited);
        }
        self.peek_leader(instance, round)
    }

    /// Read-only lookup that does not cache inherited leaders.
    pub fn peek_leader(&self, instance: InstanceId, round: RoundNumber) -> ReplicaId {
        self.records
            .get(&instance)
            .and_then(|rounds| rounds.range(..=round).next_back())
            .map(|(_, leader)| *leader)
            .unwrap_or_else(|| self.predecessor_leader(instance))
    }

    /// Leader a replica should expect for `(instance, round)` even when it
    /// never saw the freezes that created the round: every round above the
    /// highest recorded one rotates one position further in `view`.
    pub fn expected_leader(
        &self,
        instance: InstanceId,
        round: RoundNumber,
        view: &MembershipView,
    ) -> ReplicaId {
        let (base_round, mut leader) = match self
            .records
            .get(&instance)
            .and_then(|rounds| rounds.range(..=round).next_back())
        {
            Some((number, leader)) => (*number, *leader),
            None => (0, self.predecessor_leader(instance)),
        };
        let steps = (round - base_round) as usize % view.len().max(1);
        for _ in 0..steps {
            leader = view.next_after(leader).unwrap_or(leader);
        }
        leader
    }

    /// Recorded leader for exactly `(instance, round)`, if any.
    pub fn recorded(&self, instance: InstanceId, round: RoundNumber) -> Option<ReplicaId> {
        self.records.get(&instance)?.get(&round).copied()
    }

    pub fn record_leader(&mut self, instance: InstanceId, round: RoundNumber, leader: ReplicaId) {
        self.records
            .entry(instance)
            .or_default()
            .insert(round, leader);
    }

    /// Seed round 0 of the next instance unless it already has a record.
    pub fn on_decided(&mut self, instance: InstanceId, next_leader: ReplicaId) {
        let next = instance + 1;
        if !self.records.contains_key(&next) {
            self.record_leader(next, 0, next_leader);
        }
    }

    /// Drop records for instances `<= upto`, carrying the last known leader
    /// forward to `upto + 1` so later lookups keep working.
    pub fn forget_stable(&mut self, upto: InstanceId) {
        let carried = self
            .records
            .range(..=upto)
            .next_back()
            .and_then(|(_, rounds)| rounds.values().next_back().copied());

        let retained = self.records.split_off(&(upto + 1));
        self.records = retained;

        if let Some(leader) = carried {
            if !self.records.contains_key(&(upto + 1)) {
                self.record_leader(upto + 1, 0, leader);
            }
        }
    }

    /// Number of instances with leader records
    pub fn tracked_instances(&self) -> usize {
        self.records.len()
    }

    fn predecessor_leader(&self, instance: InstanceId) -> ReplicaId {
        self.records
            .range(..instance)
            .next_back()
            .and_then(|(_, rounds)| rounds.values().next_back().copied())
            .unwrap_or(self.bootstrap)
    }
}

impl Default for LeaderModule {
    fn default() -> Self {
        Self::new(0)
    }
}
