//! Synchronizer: the new leader's side of a leader change
//!
//! Replicas that froze round `r` send a signed COLLECT to the leader of
//! `r + 1`. Each carries the sender's highest quorum write (the latest round
//! it saw a WRITE quorum in) and its write set (per digest, the latest round
//! it wrote it).
//!
//! A stamp `(ts, d)` binds the new round when both hold:
//!
//! - a quorum of proofs report no quorum write, one older than `ts`, or
//!   exactly `(ts, d)`
//! - more than `f` proofs wrote `d` in round `ts` or later
//!
//! The highest binding stamp wins. Without one, the round is free once a
//! quorum of proofs report no quorum write at all. Otherwise the set is not
//! conclusive yet and the leader waits for more collects.
//!
//! The collects travel with the new PROPOSE and every acceptor re-runs the
//! same selection over them before voting.

use crate::domain::{
    ConsensusError, ConsensusResult, Digest, FreezeProof, InstanceId, MembershipView, ReplicaId,
    RoundNumber, SignedCollect, WriteStamp,
};
use crate::ports::{BatchValidator, MessageSigner};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// Value a new round is bound to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Selection {
    /// The proposal must carry this stamp's digest
    Bound(WriteStamp),
    /// No earlier round can have decided; any value is safe
    Free,
}

impl Selection {
    /// Digest the proposal must carry, if any
    pub fn mandated(&self) -> Option<Digest> {
        match self {
            Selection::Bound(stamp) => Some(stamp.digest),
            Selection::Free => None,
        }
    }
}

fn binds(proofs: &[&FreezeProof], stamp: &WriteStamp, view: &MembershipView) -> bool {
    let quorums = view.quorums();
    let compatible = proofs
        .iter()
        .filter(|proof| match proof.quorum_write {
            None => true,
            Some(reported) => reported.round < stamp.round || reported == *stamp,
        })
        .count();
    let written = proofs
        .iter()
        .filter(|proof| proof.wrote_since(stamp.round, &stamp.digest))
        .count();
    compatible >= quorums.quorum() && written > view.f()
}

/// Apply the selection rule to a set of collects.
///
/// `None` means the collects do not settle the value yet.
pub fn select_value(collects: &[SignedCollect], view: &MembershipView) -> Option<Selection> {
    let quorums = view.quorums();
    if collects.len() < quorums.freeze_quorum() {
        return None;
    }
    let proofs: Vec<&FreezeProof> = collects.iter().map(|c| &c.payload.frozen).collect();
    let candidates: BTreeSet<WriteStamp> = proofs.iter().filter_map(|p| p.quorum_write).collect();
    if let Some(stamp) = candidates
        .iter()
        .rev()
        .find(|stamp| binds(&proofs, stamp, view))
    {
        return Some(Selection::Bound(*stamp));
    }
    let unbound = proofs.iter().filter(|p| p.quorum_write.is_none()).count();
    (unbound >= quorums.quorum()).then_some(Selection::Free)
}

/// Bytes of the carried value, taken from whichever proof shipped them.
pub fn carried_value(
    collects: &[SignedCollect],
    digest: &Digest,
    validator: &dyn BatchValidator,
) -> Option<Vec<u8>> {
    collects
        .iter()
        .filter_map(|c| c.payload.frozen.value.as_ref())
        .find(|value| validator.compute_hash(value) == *digest)
        .cloned()
}

/// For a free round: a value more than `f` proofs wrote, with its bytes.
///
/// Re-proposing it keeps a client batch that nearly made it; any value would
/// be safe.
pub fn written_value(
    collects: &[SignedCollect],
    view: &MembershipView,
    validator: &dyn BatchValidator,
) -> Option<Vec<u8>> {
    let mut writers: BTreeMap<Digest, usize> = BTreeMap::new();
    for collect in collects {
        let digests: BTreeSet<Digest> = collect
            .payload
            .frozen
            .write_set
            .iter()
            .map(|stamp| stamp.digest)
            .collect();
        for digest in digests {
            *writers.entry(digest).or_default() += 1;
        }
    }
    let mut ranked: Vec<(Digest, usize)> = writers
        .into_iter()
        .filter(|(_, count)| *count > view.f())
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    ranked
        .iter()
        .find_map(|(digest, _)| carried_value(collects, digest, validator))
}

/// Collects gathered for one round, ready to be proposed on
#[derive(Clone, Debug)]
pub struct LeaderChange {
    pub instance: InstanceId,
    pub round: RoundNumber,
    pub collects: Vec<SignedCollect>,
    pub selection: Selection,
}

#[derive(Debug, Default)]
struct SyncState {
    collects: BTreeMap<(InstanceId, RoundNumber), BTreeMap<ReplicaId, SignedCollect>>,
    completed: BTreeSet<(InstanceId, RoundNumber)>,
    /// Free rounds waiting for a batch to propose
    parked: BTreeMap<InstanceId, LeaderChange>,
}

pub struct Synchronizer {
    me: ReplicaId,
    signer: Arc<dyn MessageSigner>,
    state: Mutex<SyncState>,
}

impl Synchronizer {
    pub fn new(me: ReplicaId, signer: Arc<dyn MessageSigner>) -> Self {
        Self {
            me,
            signer,
            state: Mutex::new(SyncState::default()),
        }
    }

    /// Structural and signature checks on one collect.
    pub fn verify_collect(&self, collect: &SignedCollect, view: &MembershipView) -> ConsensusResult<()> {
        let payload = &collect.payload;
        let invalid = |reason: &str| ConsensusError::InvalidProof {
            instance: payload.instance,
            round: payload.round,
            reason: reason.to_string(),
        };
        if !view.contains(payload.sender) {
            return Err(ConsensusError::UnknownReplica(payload.sender));
        }
        if payload.round == 0 {
            return Err(invalid("collect for round 0"));
        }
        let frozen = &payload.frozen;
        if frozen.instance != payload.instance
            || frozen.round.checked_add(1) != Some(payload.round)
            || frozen.replica != payload.sender
        {
            return Err(invalid("freeze proof does not match collect"));
        }
        let beyond = |stamp: &WriteStamp| stamp.round > frozen.round;
        if frozen.quorum_write.as_ref().is_some_and(beyond) || frozen.write_set.iter().any(beyond) {
            return Err(invalid("freeze proof reports writes after the frozen round"));
        }
        if let Some(later) = &payload.later {
            if later.replica != payload.sender || later.instance <= payload.instance {
                return Err(invalid("later proof does not match collect"));
            }
        }
        let bytes = payload.signing_bytes()?;
        if !self.signer.verify(payload.sender, &bytes, &collect.signature) {
            return Err(ConsensusError::SignatureVerificationFailed(payload.sender));
        }
        Ok(())
    }

    /// Store a collect addressed to this replica as leader of its round.
    ///
    /// Returns the leader change once more than `2f` distinct collects are
    /// held and they settle the value; until then every new collect is added
    /// and the selection re-run. Collects after completion are ignored.
    pub fn on_collect(
        &self,
        collect: SignedCollect,
        view: &MembershipView,
        leader: ReplicaId,
    ) -> ConsensusResult<Option<LeaderChange>> {
        let (instance, round) = (collect.payload.instance, collect.payload.round);
        if leader != self.me {
            return Err(ConsensusError::NotOurTurn(instance));
        }
        self.verify_collect(&collect, view)?;

        let mut state = self.state.lock();
        if state.completed.contains(&(instance, round)) {
            return Ok(None);
        }
        let held = state.collects.entry((instance, round)).or_default();
        held.entry(collect.payload.sender).or_insert(collect);
        debug!(instance, round, held = held.len(), "Collect stored");
        if held.len() < view.quorums().freeze_quorum() {
            return Ok(None);
        }

        let collects: Vec<SignedCollect> = held.values().cloned().collect();
        let Some(selection) = select_value(&collects, view) else {
            debug!(instance, round, held = collects.len(), "Collects not conclusive, waiting for more");
            return Ok(None);
        };
        state.collects.remove(&(instance, round));
        state.completed.insert((instance, round));
        Ok(Some(LeaderChange {
            instance,
            round,
            collects,
            selection,
        }))
    }

    /// Check the proof carried by a PROPOSE for `round > 0`.
    pub fn verify_leader_change(
        &self,
        instance: InstanceId,
        round: RoundNumber,
        collects: &[SignedCollect],
        digest: &Digest,
        view: &MembershipView,
    ) -> ConsensusResult<()> {
        let invalid = |reason: String| ConsensusError::InvalidProof {
            instance,
            round,
            reason,
        };
        let mut senders = BTreeSet::new();
        for collect in collects {
            if collect.payload.instance != instance || collect.payload.round != round {
                return Err(invalid("collect for another round".into()));
            }
            if !senders.insert(collect.payload.sender) {
                return Err(invalid(format!(
                    "duplicate collect from {}",
                    collect.payload.sender
                )));
            }
            self.verify_collect(collect, view)?;
        }
        let needed = view.quorums().freeze_quorum();
        if senders.len() < needed {
            return Err(invalid(format!(
                "{} collects, {} needed",
                senders.len(),
                needed
            )));
        }
        match select_value(collects, view) {
            None => Err(invalid("collects do not settle the value".into())),
            Some(Selection::Bound(stamp)) if stamp.digest != *digest => {
                Err(invalid("proposal does not carry the bound value".into()))
            }
            Some(_) => Ok(()),
        }
    }

    /// Keep a free leader change until a batch shows up.
    pub fn park(&self, change: LeaderChange) {
        self.state.lock().parked.insert(change.instance, change);
    }

    pub fn take_parked(&self, instance: InstanceId) -> Option<LeaderChange> {
        self.state.lock().parked.remove(&instance)
    }

    /// Drop everything for instances `<= upto`.
    pub fn forget_upto(&self, upto: InstanceId) {
        let mut state = self.state.lock();
        state.collects.retain(|(instance, _), _| *instance > upto);
        state.completed.retain(|(instance, _)| *instance > upto);
        state.parked.retain(|instance, _| *instance > upto);
    }

    /// Rounds with collects still below the threshold
    pub fn gathering(&self) -> usize {
        self.state.lock().collects.len()
    }
}
