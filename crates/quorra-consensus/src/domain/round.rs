//! Round (epoch) state
//!
//! A round is one attempt, under one leader, to decide an instance. It tallies
//! WRITE, ACCEPT and DECIDE votes per acceptor slot, the freezes seen from
//! other replicas and the proposal itself.
//!
//! ## Vote slots
//!
//! ```text
//! round r     [ a0:X  a1:X  a2:-  a3:Y ]      fresh votes
//!                 │     │           │
//! round r+1   [ a0:X' a1:X' a2:-  a3:Y' ]     inherited (') until overwritten once
//! ```
//!
//! A fresh vote is final for the round: the first one recorded per acceptor
//! and kind wins. Inherited votes show in `count` but may be replaced by one
//! fresh vote in the new round. Quorums are decided on fresh votes only.

use super::{Digest, InstanceId, MembershipView, ReplicaId, RoundNumber, SignedCollect};
use std::sync::Arc;

/// Vote phase
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VoteKind {
    Write,
    Accept,
    Decide,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct VoteSlot {
    digest: Option<Digest>,
    fresh: bool,
}

/// Per-slot vote storage for one vote kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteTable {
    slots: Vec<VoteSlot>,
}

impl VoteTable {
    pub fn new(len: usize) -> Self {
        Self {
            slots: vec![VoteSlot::default(); len],
        }
    }

    fn record(&mut self, slot: usize, digest: Digest) -> bool {
        match self.slots.get_mut(slot) {
            Some(entry) if !entry.fresh => {
                entry.digest = Some(digest);
                entry.fresh = true;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, slot: usize) -> Option<Digest> {
        self.slots.get(slot).and_then(|entry| entry.digest)
    }

    pub fn count(&self, digest: &Digest) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.digest.as_ref() == Some(digest))
            .count()
    }

    /// Votes for `digest` cast in this round
    pub fn count_fresh(&self, digest: &Digest) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.fresh && entry.digest.as_ref() == Some(digest))
            .count()
    }

    /// Copy for the next round: same votes, none of them fresh.
    fn inherit(&self) -> Self {
        Self {
            slots: self
                .slots
                .iter()
                .map(|entry| VoteSlot {
                    digest: entry.digest,
                    fresh: false,
                })
                .collect(),
        }
    }

    /// Rebuild for `to`, keeping votes of replicas present in both views.
    fn remap(&self, from: &MembershipView, to: &MembershipView) -> Self {
        let mut remapped = Self::new(to.len());
        for (new_slot, id) in to.members().iter().enumerate() {
            if let Some(old_slot) = from.position_of(*id) {
                if let Some(entry) = self.slots.get(old_slot) {
                    remapped.slots[new_slot] = *entry;
                }
            }
        }
        remapped
    }

    /// Digests held per slot, for inspection and tests
    pub fn digests(&self) -> Vec<Option<Digest>> {
        self.slots.iter().map(|entry| entry.digest).collect()
    }
}

/// One round of one consensus instance.
#[derive(Clone, Debug)]
pub struct Round {
    instance: InstanceId,
    number: RoundNumber,
    view: Arc<MembershipView>,
    proposed_value: Option<Vec<u8>>,
    proposed_digest: Option<Digest>,
    writes: VoteTable,
    accepts: VoteTable,
    decides: VoteTable,
    freezes: Vec<bool>,
    frozen: bool,
    collected: bool,
    /// Signed collects justifying this round's proposal
    proof: Vec<SignedCollect>,
    write_sent: Option<Digest>,
    accept_sent: Option<Digest>,
    decide_sent: Option<Digest>,
}

impl Round {
    /// Fresh round with empty vote tables.
    pub fn new(instance: InstanceId, number: RoundNumber, view: Arc<MembershipView>) -> Self {
        let len = view.len();
        Self {
            instance,
            number,
            writes: VoteTable::new(len),
            accepts: VoteTable::new(len),
            decides: VoteTable::new(len),
            freezes: vec![false; len],
            view,
            proposed_value: None,
            proposed_digest: None,
            frozen: false,
            collected: false,
            proof: Vec::new(),
            write_sent: None,
            accept_sent: None,
            decide_sent: None,
        }
    }

    /// Round `number` continuing from `self`: vote tables are inherited,
    /// remapped by replica id when `view` differs from this round's view.
    pub fn successor(&self, number: RoundNumber, view: Arc<MembershipView>) -> Self {
        let mut next = Round::new(self.instance, number, view.clone());
        if *self.view == *view {
            next.writes = self.writes.inherit();
            next.accepts = self.accepts.inherit();
            next.decides = self.decides.inherit();
        } else {
            next.writes = self.writes.inherit().remap(&self.view, &view);
            next.accepts = self.accepts.inherit().remap(&self.view, &view);
            next.decides = self.decides.inherit().remap(&self.view, &view);
        }
        next
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn number(&self) -> RoundNumber {
        self.number
    }

    pub fn view(&self) -> &Arc<MembershipView> {
        &self.view
    }

    // === PROPOSAL ===

    pub fn set_proposal(&mut self, value: Vec<u8>, digest: Digest) {
        self.proposed_value = Some(value);
        self.proposed_digest = Some(digest);
    }

    pub fn proposed_value(&self) -> Option<&[u8]> {
        self.proposed_value.as_deref()
    }

    pub fn proposed_digest(&self) -> Option<Digest> {
        self.proposed_digest
    }

    pub fn has_proposal(&self) -> bool {
        self.proposed_digest.is_some()
    }

    pub fn set_proof(&mut self, proof: Vec<SignedCollect>) {
        self.proof = proof;
    }

    pub fn proof(&self) -> &[SignedCollect] {
        &self.proof
    }

    // === VOTES ===

    /// Record a vote. Ignored when frozen, when the acceptor is outside the
    /// view, or when the acceptor already cast a fresh vote of this kind.
    pub fn record_vote(&mut self, kind: VoteKind, acceptor: ReplicaId, digest: Digest) -> bool {
        if self.frozen {
            return false;
        }
        let Some(slot) = self.view.position_of(acceptor) else {
            return false;
        };
        self.table_mut(kind).record(slot, digest)
    }

    pub fn record_write(&mut self, acceptor: ReplicaId, digest: Digest) -> bool {
        self.record_vote(VoteKind::Write, acceptor, digest)
    }

    pub fn record_accept(&mut self, acceptor: ReplicaId, digest: Digest) -> bool {
        self.record_vote(VoteKind::Accept, acceptor, digest)
    }

    pub fn count(&self, kind: VoteKind, digest: &Digest) -> usize {
        self.table(kind).count(digest)
    }

    pub fn count_fresh(&self, kind: VoteKind, digest: &Digest) -> usize {
        self.table(kind).count_fresh(digest)
    }

    pub fn count_write(&self, digest: &Digest) -> usize {
        self.count(VoteKind::Write, digest)
    }

    pub fn count_accept(&self, digest: &Digest) -> usize {
        self.count(VoteKind::Accept, digest)
    }

    pub fn vote_of(&self, kind: VoteKind, acceptor: ReplicaId) -> Option<Digest> {
        let slot = self.view.position_of(acceptor)?;
        self.table(kind).get(slot)
    }

    pub fn table(&self, kind: VoteKind) -> &VoteTable {
        match kind {
            VoteKind::Write => &self.writes,
            VoteKind::Accept => &self.accepts,
            VoteKind::Decide => &self.decides,
        }
    }

    fn table_mut(&mut self, kind: VoteKind) -> &mut VoteTable {
        match kind {
            VoteKind::Write => &mut self.writes,
            VoteKind::Accept => &mut self.accepts,
            VoteKind::Decide => &mut self.decides,
        }
    }

    /// Mark our own vote as sent; returns false if one was already sent.
    pub fn mark_sent(&mut self, kind: VoteKind, digest: Digest) -> bool {
        let sent = match kind {
            VoteKind::Write => &mut self.write_sent,
            VoteKind::Accept => &mut self.accept_sent,
            VoteKind::Decide => &mut self.decide_sent,
        };
        if sent.is_some() {
            return false;
        }
        *sent = Some(digest);
        true
    }

    pub fn sent(&self, kind: VoteKind) -> Option<Digest> {
        match kind {
            VoteKind::Write => self.write_sent,
            VoteKind::Accept => self.accept_sent,
            VoteKind::Decide => self.decide_sent,
        }
    }

    // === FREEZE / COLLECT ===

    /// Freeze locally; `me` is recorded as one of the freezes.
    pub fn freeze(&mut self, me: ReplicaId) {
        self.frozen = true;
        self.add_freeze(me);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Count a freeze from `replica`, at most once per replica.
    pub fn add_freeze(&mut self, replica: ReplicaId) -> bool {
        match self.view.position_of(replica) {
            Some(slot) if !self.freezes[slot] => {
                self.freezes[slot] = true;
                true
            }
            _ => false,
        }
    }

    pub fn count_freeze(&self) -> usize {
        self.freezes.iter().filter(|frozen| **frozen).count()
    }

    /// Mark COLLECT as sent; returns false when it already was.
    pub fn collect(&mut self) -> bool {
        if self.collected {
            return false;
        }
        self.collected = true;
        true
    }

    pub fn is_collected(&self) -> bool {
        self.collected
    }

    // === VIEW CHANGE ===

    /// Move an open round onto a new view. Frozen rounds keep their tallies.
    pub fn remap_view(&mut self, view: Arc<MembershipView>) -> bool {
        if self.frozen || *self.view == *view {
            return false;
        }
        self.writes = self.writes.remap(&self.view, &view);
        self.accepts = self.accepts.remap(&self.view, &view);
        self.decides = self.decides.remap(&self.view, &view);
        let mut freezes = vec![false; view.len()];
        for (slot, id) in view.members().iter().enumerate() {
            if let Some(old) = self.view.position_of(*id) {
                freezes[slot] = self.freezes[old];
            }
        }
        self.freezes = freezes;
        self.view = view;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view4() -> Arc<MembershipView> {
        Arc::new(MembershipView::genesis(4, 1))
    }

    #[test]
    fn test_votes_counted_once_per_acceptor() {
        let mut round = Round::new(5, 0, view4());
        let x = [1u8; 32];
        assert!(round.record_write(0, x));
        assert!(!round.record_write(0, x));
        assert!(!round.record_write(0, [2u8; 32]));
        assert!(round.record_write(1, x));
        assert_eq!(round.count_write(&x), 2);
        assert_eq!(round.vote_of(VoteKind::Write, 0), Some(x));
    }

    #[test]
    fn test_votes_outside_view_ignored() {
        let mut round = Round::new(5, 0, view4());
        assert!(!round.record_accept(9, [1u8; 32]));
        assert_eq!(round.count_accept(&[1u8; 32]), 0);
    }

    #[test]
    fn test_frozen_round_rejects_votes() {
        let mut round = Round::new(5, 0, view4());
        round.freeze(0);
        assert!(!round.record_write(1, [1u8; 32]));
        assert_eq!(round.count_write(&[1u8; 32]), 0);
        assert_eq!(round.count_freeze(), 1);
    }

    #[test]
    fn test_write_and_accept_are_independent() {
        let mut round = Round::new(5, 0, view4());
        let x = [3u8; 32];
        round.record_write(2, x);
        assert!(round.record_accept(2, x));
        assert_eq!(round.count_write(&x), 1);
        assert_eq!(round.count_accept(&x), 1);
    }

    #[test]
    fn test_freeze_tally_is_per_replica() {
        let mut round = Round::new(5, 0, view4());
        assert!(round.add_freeze(1));
        assert!(!round.add_freeze(1));
        assert!(!round.add_freeze(17));
        round.freeze(0);
        round.freeze(0);
        assert_eq!(round.count_freeze(), 2);
    }

    #[test]
    fn test_collect_is_idempotent() {
        let mut round = Round::new(5, 0, view4());
        assert!(round.collect());
        assert!(!round.collect());
        assert!(round.is_collected());
    }

    #[test]
    fn test_successor_inherits_votes() {
        let mut round = Round::new(5, 0, view4());
        let x = [4u8; 32];
        round.record_write(0, x);
        round.record_write(3, x);
        round.record_accept(1, x);
        let next = round.successor(1, view4());
        assert_eq!(next.table(VoteKind::Write), &round.table(VoteKind::Write).inherit());
        assert_eq!(next.count_write(&x), 2);
        assert_eq!(next.count_accept(&x), 1);
        assert!(!next.is_frozen());
        assert_eq!(next.count_freeze(), 0);
        assert!(!next.has_proposal());
    }

    #[test]
    fn test_inherited_vote_can_be_replaced_once() {
        let mut round = Round::new(5, 0, view4());
        let (x, y) = ([4u8; 32], [5u8; 32]);
        round.record_write(0, x);
        let mut next = round.successor(1, view4());
        assert!(next.record_write(0, y));
        assert!(!next.record_write(0, x));
        assert_eq!(next.count_write(&y), 1);
        assert_eq!(next.count_write(&x), 0);
    }

    #[test]
    fn test_successor_remaps_on_view_change() {
        let old = Arc::new(MembershipView::new(0, vec![0, 1, 2, 3], 1));
        let new = Arc::new(MembershipView::new(1, vec![3, 1, 4, 5], 1));
        let mut round = Round::new(5, 0, old);
        let x = [6u8; 32];
        for id in 0..4 {
            round.record_write(id, x);
        }
        let next = round.successor(1, new);
        assert_eq!(
            next.table(VoteKind::Write).digests(),
            vec![Some(x), Some(x), None, None]
        );
        assert_eq!(next.count_write(&x), 2);
    }

    #[test]
    fn test_remap_view_drops_leaving_members() {
        let old = Arc::new(MembershipView::new(0, vec![0, 1, 2, 3], 1));
        let new = Arc::new(MembershipView::new(1, vec![0, 1, 2, 4], 1));
        let mut round = Round::new(5, 0, old);
        let x = [6u8; 32];
        round.record_accept(3, x);
        round.record_accept(2, x);
        round.add_freeze(2);
        assert!(round.remap_view(new));
        assert_eq!(round.count_accept(&x), 1);
        assert_eq!(round.count_freeze(), 1);
        assert!(round.record_accept(4, x));
    }

    #[test]
    fn test_fresh_count_ignores_inherited_votes() {
        let mut round = Round::new(5, 0, view4());
        let x = [8u8; 32];
        for id in 0..3 {
            round.record_write(id, x);
        }
        let mut next = round.successor(1, view4());
        assert_eq!(next.count_write(&x), 3);
        assert_eq!(next.count_fresh(VoteKind::Write, &x), 0);
        assert!(next.record_write(3, x));
        assert!(next.record_write(0, x));
        assert_eq!(next.count_write(&x), 4);
        assert_eq!(next.count_fresh(VoteKind::Write, &x), 2);
    }
}
