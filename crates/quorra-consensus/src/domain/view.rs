//! Membership view
//!
//! Replicas are addressed by id but votes are stored by slot. The view keeps
//! an explicit `ReplicaId -> slot` index so vote tables can be remapped when
//! the membership changes.

use super::QuorumCalculator;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Replica identifier
pub type ReplicaId = u32;

/// Ordered set of replicas participating in consensus.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MembershipView {
    /// Monotonic view number
    pub number: u64,
    members: Vec<ReplicaId>,
    f: usize,
    /// Quick lookup by replica id
    #[serde(skip)]
    slot_of: HashMap<ReplicaId, usize>,
}

impl PartialEq for MembershipView {
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number && self.members == other.members && self.f == other.f
    }
}

impl Eq for MembershipView {}

impl MembershipView {
    /// Create a view. Member order defines leader rotation order.
    pub fn new(number: u64, members: Vec<ReplicaId>, f: usize) -> Self {
        let slot_of = members
            .iter()
            .enumerate()
            .map(|(slot, id)| (*id, slot))
            .collect();
        Self {
            number,
            members,
            f,
            slot_of,
        }
    }

    /// View `0` over replicas `0..n`.
    pub fn genesis(n: usize, f: usize) -> Self {
        Self::new(0, (0..n as ReplicaId).collect(), f)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn f(&self) -> usize {
        self.f
    }

    pub fn members(&self) -> &[ReplicaId] {
        &self.members
    }

    pub fn contains(&self, id: ReplicaId) -> bool {
        self.slot_of.contains_key(&id)
    }

    /// Slot (position) of a replica in this view
    pub fn position_of(&self, id: ReplicaId) -> Option<usize> {
        self.slot_of.get(&id).copied()
    }

    pub fn member_at(&self, position: usize) -> Option<ReplicaId> {
        self.members.get(position).copied()
    }

    /// Next replica in view order after `id`, wrapping around.
    ///
    /// Rotation is by position so every member gets a turn regardless of how
    /// ids are numbered. An id outside the view hands over to position 0.
    pub fn next_after(&self, id: ReplicaId) -> Option<ReplicaId> {
        if self.members.is_empty() {
            return None;
        }
        let next = match self.position_of(id) {
            Some(pos) => (pos + 1) % self.members.len(),
            None => 0,
        };
        self.member_at(next)
    }

    pub fn quorums(&self) -> QuorumCalculator {
        QuorumCalculator::new(self.members.len(), self.f)
    }

    /// Rebuild the lookup table (after deserialization)
    pub fn rebuild_lookup(&mut self) {
        self.slot_of = self
            .members
            .iter()
            .enumerate()
            .map(|(slot, id)| (*id, slot))
            .collect();
    }
}
