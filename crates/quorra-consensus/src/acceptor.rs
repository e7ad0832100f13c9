//! Acceptor: the per-instance protocol state machine
//!
//! Handlers run while the caller holds the instance lock. They never call a
//! port; every side effect is returned as an [`Action`] and executed by the
//! execution manager once the lock is released.
//!
//! ```text
//! PROPOSE ──► WRITE ──(quorum)──► ACCEPT ──(quorum)──► decide ──► DECIDE
//!    │                                                  ▲
//!    └── timeout / invalid value ──► FREEZE ──(>2f)──► COLLECT to next leader
//! ```
//!
//! Votes and freezes for a round the instance has not entered yet are held
//! until it does, up to `max_round_ahead` rounds out. A decided instance
//! still answers leader changes: it joins a freeze that more than `f`
//! replicas started, sends its COLLECT, and votes for a later-round proposal
//! of the value it decided.

use crate::domain::{
    ConsensusConfig, ConsensusError, ConsensusInstance, ConsensusMessage, ConsensusResult,
    Decision, Digest, FreezeProof, InstanceId, MembershipView, MessageKind, MessageProof,
    ReplicaId, RoundNumber, VoteKind,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Side effect requested by the acceptor
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Send to every other member of the view
    Broadcast(ConsensusMessage),
    /// Sign and send a COLLECT for `round` to its leader
    SendCollect {
        instance: InstanceId,
        round: RoundNumber,
        leader: ReplicaId,
        frozen: FreezeProof,
    },
    Decided(Decision),
    ScheduleTimeout {
        instance: InstanceId,
        round: RoundNumber,
    },
    CancelTimeout {
        instance: InstanceId,
        round: RoundNumber,
    },
    /// A frozen round handed over to the next leader
    RoundChange {
        instance: InstanceId,
        round: RoundNumber,
        previous_leader: ReplicaId,
        leader: ReplicaId,
    },
    /// A proposal was accepted for this instance
    InProgress(InstanceId),
    /// Held messages whose round was just entered
    Redeliver(Vec<ConsensusMessage>),
}

/// Facts the manager resolves before taking the instance lock
#[derive(Clone, Debug)]
pub struct RoundContext {
    pub view: Arc<MembershipView>,
    /// Leader of the round the message or timeout refers to
    pub leader: ReplicaId,
}

/// Verdict on a proposed value, computed outside the instance lock
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProposalCheck {
    pub digest: Digest,
    pub valid: bool,
}

#[derive(Clone, Debug)]
pub struct Acceptor {
    me: ReplicaId,
    fast_decide: bool,
    announce_decisions: bool,
    round_window: RoundNumber,
}

fn message_kind(kind: VoteKind) -> MessageKind {
    match kind {
        VoteKind::Write => MessageKind::Write,
        VoteKind::Accept => MessageKind::Accept,
        VoteKind::Decide => MessageKind::Decide,
    }
}

/// Votes cast in round `number` itself; inherited votes do not count
fn count_votes(
    instance: &ConsensusInstance,
    kind: VoteKind,
    number: RoundNumber,
    digest: &Digest,
) -> usize {
    instance
        .round(number)
        .map(|round| round.count_fresh(kind, digest))
        .unwrap_or(0)
}

fn redeliver(due: Vec<ConsensusMessage>) -> Option<Action> {
    (!due.is_empty()).then_some(Action::Redeliver(due))
}

impl Acceptor {
    pub fn new(config: &ConsensusConfig) -> Self {
        Self {
            me: config.replica_id,
            fast_decide: config.fast_decide,
            announce_decisions: config.announce_decisions,
            round_window: config.max_round_ahead,
        }
    }

    pub fn me(&self) -> ReplicaId {
        self.me
    }

    /// Route a message to its handler. COLLECT belongs to the synchronizer.
    pub fn handle(
        &self,
        instance: &mut ConsensusInstance,
        ctx: &RoundContext,
        msg: &ConsensusMessage,
        check: Option<ProposalCheck>,
    ) -> ConsensusResult<Vec<Action>> {
        let missing = || ConsensusError::MissingValue {
            kind: msg.kind,
            instance: msg.instance,
        };
        let voting = matches!(
            msg.kind,
            MessageKind::Write | MessageKind::Accept | MessageKind::Decide | MessageKind::Freeze
        );
        if voting && msg.round > instance.ets() {
            return self.hold_future(instance, msg);
        }
        match msg.kind {
            MessageKind::Propose => {
                let check = check.ok_or_else(missing)?;
                self.on_propose(instance, ctx, msg, check)
            }
            MessageKind::Write | MessageKind::Accept | MessageKind::Decide => {
                let digest = msg.digest().ok_or_else(missing)?;
                let kind = match msg.kind {
                    MessageKind::Write => VoteKind::Write,
                    MessageKind::Accept => VoteKind::Accept,
                    _ => VoteKind::Decide,
                };
                Ok(self.on_vote(instance, ctx, kind, msg.round, msg.sender, digest))
            }
            MessageKind::Freeze => Ok(self.on_freeze(instance, ctx, msg.round, msg.sender)),
            MessageKind::Collect => Ok(Vec::new()),
        }
    }

    /// Stash a vote or freeze for a round not entered yet, or reject it when
    /// the round is outside the window.
    fn hold_future(
        &self,
        instance: &mut ConsensusInstance,
        msg: &ConsensusMessage,
    ) -> ConsensusResult<Vec<Action>> {
        let current = instance.ets();
        if msg.round - current > self.round_window {
            return Err(ConsensusError::RoundOutOfWindow {
                instance: msg.instance,
                round: msg.round,
                current,
            });
        }
        if instance.stash_future(msg.clone()) {
            debug!(
                instance = msg.instance,
                round = msg.round,
                sender = msg.sender,
                kind = msg.kind.as_str(),
                "Held for a round not entered yet"
            );
        }
        Ok(Vec::new())
    }

    // === PROPOSE ===

    pub fn on_propose(
        &self,
        instance: &mut ConsensusInstance,
        ctx: &RoundContext,
        msg: &ConsensusMessage,
        check: ProposalCheck,
    ) -> ConsensusResult<Vec<Action>> {
        let (id, number) = (msg.instance, msg.round);
        let value = msg.value.clone().ok_or(ConsensusError::MissingValue {
            kind: MessageKind::Propose,
            instance: id,
        })?;
        if msg.sender != ctx.leader {
            return Err(ConsensusError::NotLeader {
                instance: id,
                round: number,
                sender: msg.sender,
                leader: ctx.leader,
            });
        }
        let proof = match (&msg.proof, number) {
            (_, 0) => Vec::new(),
            (Some(MessageProof::LeaderChange(collects)), _) => collects.clone(),
            _ => {
                return Err(ConsensusError::MissingProof {
                    instance: id,
                    round: number,
                })
            }
        };

        let mut actions = Vec::new();
        let decided = instance.is_decided();
        let current = instance.ets();
        let (round, created) = instance.round_or_create(number, &ctx.view);
        if created && !decided && number >= current {
            actions.push(Action::ScheduleTimeout {
                instance: id,
                round: number,
            });
        }
        if round.is_frozen() {
            return Err(ConsensusError::RoundFrozen {
                instance: id,
                round: number,
            });
        }
        if round.has_proposal() {
            debug!(instance = id, round = number, "Duplicate proposal ignored");
            return Ok(actions);
        }
        round.set_proposal(value.clone(), check.digest);
        round.set_proof(proof);
        actions.extend(redeliver(instance.enter_round(number)));

        if let Some((pending_round, digest)) = instance.pending_decision() {
            if digest == check.digest {
                debug!(instance = id, "Proposal completes a certified decision");
                actions.extend(self.decide(instance, pending_round, digest, value));
                return Ok(actions);
            }
        }
        if let Some(decision) = instance.decision() {
            let (decided_round, decided_digest) = (decision.round, decision.digest);
            if number > decided_round && check.valid && check.digest == decided_digest {
                debug!(instance = id, round = number, "Voting for the decided value in a later round");
                actions.extend(self.cast(instance, VoteKind::Write, number, decided_digest));
                actions.extend(self.cast(instance, VoteKind::Accept, number, decided_digest));
            }
            return Ok(actions);
        }

        actions.push(Action::InProgress(id));
        if number > 0 {
            actions.extend(self.supersede_rounds_below(instance, number));
        }
        if !check.valid {
            warn!(
                instance = id,
                round = number,
                leader = msg.sender,
                "Leader proposed an invalid value, freezing round"
            );
            actions.extend(self.freeze_round(instance, ctx, number));
            return Ok(actions);
        }

        actions.extend(self.cast(instance, VoteKind::Write, number, check.digest));
        actions.extend(self.compute_write(instance, ctx, number, check.digest));
        Ok(actions)
    }

    /// A valid proposal in a later round means a quorum abandoned the
    /// earlier rounds; stop voting in them.
    fn supersede_rounds_below(
        &self,
        instance: &mut ConsensusInstance,
        number: RoundNumber,
    ) -> Vec<Action> {
        let id = instance.id();
        let mut actions = Vec::new();
        for round in instance.rounds_mut() {
            if round.number() < number && !round.is_frozen() {
                round.freeze(self.me);
                actions.push(Action::CancelTimeout {
                    instance: id,
                    round: round.number(),
                });
            }
        }
        actions
    }

    // === VOTES ===

    pub fn on_vote(
        &self,
        instance: &mut ConsensusInstance,
        ctx: &RoundContext,
        kind: VoteKind,
        number: RoundNumber,
        sender: ReplicaId,
        digest: Digest,
    ) -> Vec<Action> {
        let id = instance.id();
        let mut actions = Vec::new();
        let timed = !instance.is_decided() && number == instance.ets();
        let (round, created) = instance.round_or_create(number, &ctx.view);
        if created && timed {
            actions.push(Action::ScheduleTimeout {
                instance: id,
                round: number,
            });
        }
        if !round.record_vote(kind, sender, digest) {
            debug!(
                instance = id,
                round = number,
                sender,
                kind = ?kind,
                "Vote not counted"
            );
            return actions;
        }
        actions.extend(match kind {
            VoteKind::Write => self.compute_write(instance, ctx, number, digest),
            VoteKind::Accept => self.compute_accept(instance, ctx, number, digest),
            VoteKind::Decide => self.compute_decide(instance, ctx, number, digest),
        });
        actions
    }

    /// Send our own vote once per round and kind.
    fn cast(
        &self,
        instance: &mut ConsensusInstance,
        kind: VoteKind,
        number: RoundNumber,
        digest: Digest,
    ) -> Vec<Action> {
        let id = instance.id();
        let Some(round) = instance.round_mut(number) else {
            return Vec::new();
        };
        if !round.mark_sent(kind, digest) {
            return Vec::new();
        }
        round.record_vote(kind, self.me, digest);
        if kind == VoteKind::Write {
            instance.add_to_write_set(number, digest);
        }
        vec![Action::Broadcast(ConsensusMessage::vote(
            message_kind(kind),
            id,
            number,
            self.me,
            digest,
        ))]
    }

    fn compute_write(
        &self,
        instance: &mut ConsensusInstance,
        ctx: &RoundContext,
        number: RoundNumber,
        digest: Digest,
    ) -> Vec<Action> {
        if instance.is_decided() {
            return Vec::new();
        }
        let quorums = ctx.view.quorums();
        if count_votes(instance, VoteKind::Write, number, &digest) < quorums.quorum() {
            return Vec::new();
        }

        // Amplification: join a write quorum we missed the proposal for
        let mut actions = self.cast(instance, VoteKind::Write, number, digest);
        instance.record_quorum_write(number, digest);

        if self.fast_decide
            && count_votes(instance, VoteKind::Write, number, &digest)
                >= quorums.fast_decide_quorum()
        {
            if let Some(value) = instance.value_for(&digest) {
                debug!(instance = instance.id(), round = number, "Fast decide");
                actions.extend(self.decide(instance, number, digest, value));
                return actions;
            }
        }

        actions.extend(self.cast(instance, VoteKind::Accept, number, digest));
        actions.extend(self.compute_accept(instance, ctx, number, digest));
        actions
    }

    fn compute_accept(
        &self,
        instance: &mut ConsensusInstance,
        ctx: &RoundContext,
        number: RoundNumber,
        digest: Digest,
    ) -> Vec<Action> {
        let count = count_votes(instance, VoteKind::Accept, number, &digest);
        if instance.is_decided() || count < ctx.view.quorums().quorum() {
            return Vec::new();
        }
        self.decide_or_wait(instance, number, digest)
    }

    fn compute_decide(
        &self,
        instance: &mut ConsensusInstance,
        ctx: &RoundContext,
        number: RoundNumber,
        digest: Digest,
    ) -> Vec<Action> {
        let count = count_votes(instance, VoteKind::Decide, number, &digest);
        if instance.is_decided() || count < ctx.view.quorums().decide_quorum() {
            return Vec::new();
        }
        self.decide_or_wait(instance, number, digest)
    }

    fn decide_or_wait(
        &self,
        instance: &mut ConsensusInstance,
        number: RoundNumber,
        digest: Digest,
    ) -> Vec<Action> {
        match instance.value_for(&digest) {
            Some(value) => self.decide(instance, number, digest, value),
            None => {
                debug!(
                    instance = instance.id(),
                    round = number,
                    "Quorum certified a value not seen yet"
                );
                instance.set_pending_decision(number, digest);
                Vec::new()
            }
        }
    }

    fn decide(
        &self,
        instance: &mut ConsensusInstance,
        number: RoundNumber,
        digest: Digest,
        value: Vec<u8>,
    ) -> Vec<Action> {
        let id = instance.id();
        let Some(decision) = instance.decide(number, digest, value).cloned() else {
            return Vec::new();
        };
        info!(instance = id, round = number, "Instance decided");

        let mut actions = vec![Action::Decided(decision)];
        for round in instance.round_numbers() {
            actions.push(Action::CancelTimeout { instance: id, round });
        }
        instance.remove_rounds_above(number);
        instance.prune_write_set_above(number);
        if self.announce_decisions {
            actions.extend(self.cast(instance, VoteKind::Decide, number, digest));
        }
        actions
    }

    // === LEADER CHANGE ===

    /// Local round timer expired.
    pub fn on_timeout(
        &self,
        instance: &mut ConsensusInstance,
        ctx: &RoundContext,
        number: RoundNumber,
    ) -> Vec<Action> {
        if instance.is_decided() {
            return Vec::new();
        }
        match instance.round(number) {
            Some(round) if !round.is_frozen() => {}
            _ => return Vec::new(),
        }
        info!(
            instance = instance.id(),
            round = number,
            leader = ctx.leader,
            "Round timed out"
        );
        self.freeze_round(instance, ctx, number)
    }

    pub fn on_freeze(
        &self,
        instance: &mut ConsensusInstance,
        ctx: &RoundContext,
        number: RoundNumber,
        sender: ReplicaId,
    ) -> Vec<Action> {
        let id = instance.id();
        let mut actions = Vec::new();
        let decided = instance.is_decided();
        let timed = !decided && number == instance.ets();
        let (round, created) = instance.round_or_create(number, &ctx.view);
        if created && timed {
            actions.push(Action::ScheduleTimeout {
                instance: id,
                round: number,
            });
        }
        if !round.add_freeze(sender) {
            return actions;
        }
        // A decided replica cannot time out, so it follows the first honest freeze
        let quorums = ctx.view.quorums();
        let threshold = if decided {
            quorums.decide_quorum()
        } else {
            quorums.freeze_quorum()
        };
        let join = !round.is_frozen() && round.count_freeze() >= threshold;
        if join {
            debug!(instance = id, round = number, "Joining freeze");
            actions.extend(self.freeze_round(instance, ctx, number));
        } else {
            actions.extend(self.compute_freeze(instance, ctx, number));
        }
        actions
    }

    fn freeze_round(
        &self,
        instance: &mut ConsensusInstance,
        ctx: &RoundContext,
        number: RoundNumber,
    ) -> Vec<Action> {
        let id = instance.id();
        let Some(round) = instance.round_mut(number) else {
            return Vec::new();
        };
        if round.is_frozen() {
            return Vec::new();
        }
        round.freeze(self.me);
        let mut actions = vec![
            Action::Broadcast(ConsensusMessage::freeze(id, number, self.me)),
            Action::CancelTimeout {
                instance: id,
                round: number,
            },
        ];
        actions.extend(self.compute_freeze(instance, ctx, number));
        actions
    }

    /// Open the next round and send our evidence to its leader once more
    /// than `2f` replicas froze this one.
    fn compute_freeze(
        &self,
        instance: &mut ConsensusInstance,
        ctx: &RoundContext,
        number: RoundNumber,
    ) -> Vec<Action> {
        let id = instance.id();
        let Some(next) = number.checked_add(1) else {
            warn!(instance = id, round = number, "No round after this one");
            return Vec::new();
        };
        let Some(round) = instance.round_mut(number) else {
            return Vec::new();
        };
        if round.count_freeze() < ctx.view.quorums().freeze_quorum() || !round.collect() {
            return Vec::new();
        }
        let frozen = instance.freeze_proof(self.me, number);
        let leader = ctx.view.next_after(ctx.leader).unwrap_or(ctx.leader);

        let mut actions = Vec::new();
        let decided = instance.is_decided();
        let (_, created) = instance.round_or_create(next, &ctx.view);
        if created && !decided {
            actions.push(Action::ScheduleTimeout {
                instance: id,
                round: next,
            });
        }
        let due = instance.enter_round(next);
        info!(
            instance = id,
            round = next,
            previous_leader = ctx.leader,
            leader,
            "Leader change"
        );
        actions.push(Action::RoundChange {
            instance: id,
            round: next,
            previous_leader: ctx.leader,
            leader,
        });
        actions.push(Action::SendCollect {
            instance: id,
            round: next,
            leader,
            frozen,
        });
        actions.extend(redeliver(due));
        actions
    }
}
