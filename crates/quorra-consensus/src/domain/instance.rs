//! Consensus instance (execution)
//!
//! Owns the rounds of one instance id, the decision, and the leader-change
//! artifacts (quorum-write certificate and write set).
//!
//! The current round (`ets`) only moves when a round is entered: after a
//! freeze quorum, or on a verified leader-change proposal. Votes and freezes
//! for rounds not entered yet wait in a small stash keyed by
//! `(round, sender, kind)` and come back when their round is entered.

use super::{
    ConsensusMessage, Digest, FreezeProof, InstanceId, MembershipView, MessageKind, ReplicaId,
    Round, RoundNumber, WriteStamp,
};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A decided value
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub instance: InstanceId,
    pub round: RoundNumber,
    pub digest: Digest,
    #[serde_as(as = "Bytes")]
    pub value: Vec<u8>,
}

/// State of one consensus instance.
#[derive(Debug)]
pub struct ConsensusInstance {
    id: InstanceId,
    rounds: BTreeMap<RoundNumber, Round>,
    decision: Option<Decision>,
    /// Digest certified by an ACCEPT quorum before its proposal was seen
    pending_decision: Option<(RoundNumber, Digest)>,
    /// Current round timestamp (highest round entered)
    ets: RoundNumber,
    quorum_write: Option<WriteStamp>,
    /// Latest round each digest was written in by this replica
    write_set: BTreeMap<Digest, RoundNumber>,
    future: BTreeMap<(RoundNumber, ReplicaId, MessageKind), ConsensusMessage>,
}

impl ConsensusInstance {
    pub fn new(id: InstanceId) -> Self {
        Self {
            id,
            rounds: BTreeMap::new(),
            decision: None,
            pending_decision: None,
            ets: 0,
            quorum_write: None,
            write_set: BTreeMap::new(),
            future: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    // === ROUNDS ===

    /// Existing round, or a new one seeded from the closest earlier round.
    ///
    /// The boolean is `true` when the round was created by this call.
    pub fn round_or_create(
        &mut self,
        number: RoundNumber,
        view: &Arc<MembershipView>,
    ) -> (&mut Round, bool) {
        let created = !self.rounds.contains_key(&number);
        if created {
            let round = match self.rounds.range(..number).next_back() {
                Some((_, previous)) => previous.successor(number, view.clone()),
                None => Round::new(self.id, number, view.clone()),
            };
            self.rounds.insert(number, round);
        }
        let id = self.id;
        let round = self
            .rounds
            .entry(number)
            .or_insert_with(|| Round::new(id, number, view.clone()));
        (round, created)
    }

    pub fn round(&self, number: RoundNumber) -> Option<&Round> {
        self.rounds.get(&number)
    }

    pub fn round_mut(&mut self, number: RoundNumber) -> Option<&mut Round> {
        self.rounds.get_mut(&number)
    }

    pub fn last_round(&self) -> Option<&Round> {
        self.rounds.values().next_back()
    }

    pub fn rounds_mut(&mut self) -> impl Iterator<Item = &mut Round> {
        self.rounds.values_mut()
    }

    pub fn round_numbers(&self) -> Vec<RoundNumber> {
        self.rounds.keys().copied().collect()
    }

    /// Discard rounds above `limit`; returns the removed round numbers.
    pub fn remove_rounds_above(&mut self, limit: RoundNumber) -> Vec<RoundNumber> {
        let removed: Vec<RoundNumber> = self
            .rounds
            .range(limit.saturating_add(1)..)
            .map(|(number, _)| *number)
            .collect();
        if limit < RoundNumber::MAX {
            self.rounds.split_off(&(limit + 1));
        }
        removed
    }

    pub fn ets(&self) -> RoundNumber {
        self.ets
    }

    /// Move the current round up to `number`.
    ///
    /// Returns the stashed messages of the entered round; stashed messages
    /// for rounds skipped over are discarded.
    pub fn enter_round(&mut self, number: RoundNumber) -> Vec<ConsensusMessage> {
        if number <= self.ets {
            return Vec::new();
        }
        self.ets = number;
        let keep = match number.checked_add(1) {
            Some(above) => self.future.split_off(&(above, 0, MessageKind::Propose)),
            None => BTreeMap::new(),
        };
        let due = std::mem::replace(&mut self.future, keep);
        due.into_iter()
            .filter(|((round, _, _), _)| *round == number)
            .map(|(_, msg)| msg)
            .collect()
    }

    /// Hold a vote or freeze for a round not entered yet. The first message
    /// per round, sender and kind is kept.
    pub fn stash_future(&mut self, msg: ConsensusMessage) -> bool {
        let key = (msg.round, msg.sender, msg.kind);
        if msg.round <= self.ets || self.future.contains_key(&key) {
            return false;
        }
        self.future.insert(key, msg);
        true
    }

    pub fn stashed(&self) -> usize {
        self.future.len()
    }

    /// Bytes of any proposal in this instance whose digest is `digest`.
    pub fn value_for(&self, digest: &Digest) -> Option<Vec<u8>> {
        self.rounds
            .values()
            .rev()
            .find(|round| round.proposed_digest().as_ref() == Some(digest))
            .and_then(|round| round.proposed_value().map(<[u8]>::to_vec))
    }

    // === DECISION ===

    /// Decide `value` in `round`. Only the first call has an effect.
    pub fn decide(&mut self, round: RoundNumber, digest: Digest, value: Vec<u8>) -> Option<&Decision> {
        if self.decision.is_some() {
            return None;
        }
        self.pending_decision = None;
        self.decision = Some(Decision {
            instance: self.id,
            round,
            digest,
            value,
        });
        self.decision.as_ref()
    }

    pub fn is_decided(&self) -> bool {
        self.decision.is_some()
    }

    pub fn decision(&self) -> Option<&Decision> {
        self.decision.as_ref()
    }

    pub fn decision_round(&self) -> Option<RoundNumber> {
        self.decision.as_ref().map(|d| d.round)
    }

    /// Remember a certified digest whose bytes are still unknown.
    pub fn set_pending_decision(&mut self, round: RoundNumber, digest: Digest) {
        if self.decision.is_none() && self.pending_decision.is_none() {
            self.pending_decision = Some((round, digest));
        }
    }

    pub fn pending_decision(&self) -> Option<(RoundNumber, Digest)> {
        self.pending_decision
    }

    // === LEADER-CHANGE BOOKKEEPING ===

    /// Keep the highest round a WRITE quorum was observed in.
    pub fn record_quorum_write(&mut self, round: RoundNumber, digest: Digest) {
        if self.quorum_write.map_or(true, |current| round >= current.round) {
            self.quorum_write = Some(WriteStamp::new(round, digest));
        }
    }

    pub fn quorum_write(&self) -> Option<WriteStamp> {
        self.quorum_write
    }

    pub fn add_to_write_set(&mut self, round: RoundNumber, digest: Digest) {
        let latest = self.write_set.entry(digest).or_insert(round);
        *latest = (*latest).max(round);
    }

    pub fn remove_from_write_set(&mut self, digest: &Digest) -> bool {
        self.write_set.remove(digest).is_some()
    }

    /// Forget writes made in rounds above `round`.
    pub fn prune_write_set_above(&mut self, round: RoundNumber) {
        self.write_set.retain(|_, written| *written <= round);
        if self.quorum_write.is_some_and(|stamp| stamp.round > round) {
            self.quorum_write = None;
        }
    }

    pub fn write_set(&self) -> Vec<WriteStamp> {
        self.write_set
            .iter()
            .map(|(digest, round)| WriteStamp::new(*round, *digest))
            .collect()
    }

    /// What this replica saw in the instance up to `round`, for a COLLECT.
    pub fn freeze_proof(&self, me: ReplicaId, round: RoundNumber) -> FreezeProof {
        let quorum_write = self.quorum_write.filter(|stamp| stamp.round <= round);
        let write_set = self
            .write_set()
            .into_iter()
            .filter(|stamp| stamp.round <= round)
            .collect();
        let value = match quorum_write {
            Some(stamp) => self.value_for(&stamp.digest),
            None => self
                .round(round)
                .and_then(|r| r.proposed_value().map(<[u8]>::to_vec)),
        };
        FreezeProof {
            replica: me,
            instance: self.id,
            round,
            quorum_write,
            write_set,
            value,
        }
    }
}
