//! Execution Manager - per-replica coordination of consensus instances
//!
//! # Responsibilities
//! - Watermark admission around `last_decided` (process, buffer, queue, drop)
//! - Out-of-context buffering and replay when an instance becomes current
//! - Stop/restart around leader-change synchronisation and state installation
//! - Stable-instance eviction after every decision
//! - Executing the acceptor's actions against the outbound ports
//!
//! # Locking
//! Manager-wide state sits behind one mutex, each instance behind its own.
//! The two are never held together and neither is held across a port call.
//! Messages produced while handling another message (local proposals,
//! replays) go to a backlog drained before each public call returns.

use crate::acceptor::{Acceptor, Action, ProposalCheck, RoundContext};
use crate::domain::{
    ConsensusConfig, ConsensusError, ConsensusInstance, ConsensusMessage, ConsensusResult,
    Decision, Digest, FreezeProof, InstanceId, LeaderModule, MembershipView, MessageKind,
    MessageProof, OutOfContextBuffer, ReplicaId, RoundNumber, SignedCollect, StoppedQueue,
    BufferOutcome, CollectPayload,
};
use crate::events::{LeaderChangedEvent, StateTransferRequest};
use crate::metrics;
use crate::ports::{
    BatchProvider, BatchValidator, ConsensusApi, DecisionSink, MessageSigner, SigningJob,
    SigningSink, StateTransferGateway, TimeoutScheduler, Transport,
};
use crate::synchronizer::{carried_value, written_value, LeaderChange, Selection, Synchronizer};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};


/// Outbound dependencies of one replica
#[derive(Clone)]
pub struct ManagerPorts {
    pub transport: Arc<dyn Transport>,
    pub validator: Arc<dyn BatchValidator>,
    pub batches: Arc<dyn BatchProvider>,
    pub state_transfer: Arc<dyn StateTransferGateway>,
    pub decisions: Arc<dyn DecisionSink>,
    pub timers: Arc<dyn TimeoutScheduler>,
    pub signer: Arc<dyn MessageSigner>,
    pub signing: Arc<dyn SigningSink>,
}

/// Admission verdict for an inbound message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    ProcessNow,
    /// Held out of context until its instance becomes current
    Buffered,
    /// Buffered, and the gap is wide enough to ask for state
    StateTransfer,
    /// Held until restart
    Queued,
    /// Already decided
    Dropped,
}

/// What happened to a delivered message
#[derive(Debug)]
pub enum ProcessOutcome {
    Processed,
    Buffered,
    StateTransferRequested,
    Queued,
    Dropped,
    Rejected(ConsensusError),
}

impl ProcessOutcome {
    pub fn is_rejected(&self) -> bool {
        matches!(self, ProcessOutcome::Rejected(_))
    }
}

/// Snapshot for logs and health checks
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStats {
    pub replica: ReplicaId,
    pub view: u64,
    pub last_decided: Option<InstanceId>,
    pub in_progress: Option<InstanceId>,
    pub stopped: bool,
    pub live_instances: usize,
    pub out_of_context: usize,
    pub out_of_context_instances: usize,
    pub stopped_queue: usize,
    pub decisions: u64,
    pub gathering_collects: usize,
}

type SharedInstance = Arc<Mutex<ConsensusInstance>>;

struct ManagerState {
    view: Arc<MembershipView>,
    leaders: LeaderModule,
    last_decided: Option<InstanceId>,
    in_progress: Option<InstanceId>,
    stopped: bool,
    instances: BTreeMap<InstanceId, SharedInstance>,
    out_of_context: OutOfContextBuffer,
    stopped_queue: StoppedQueue,
    /// Rounds this replica already proposed in
    proposed: BTreeSet<(InstanceId, RoundNumber)>,
    started: HashMap<InstanceId, Instant>,
    decisions: u64,
}

impl ManagerState {
    fn next_instance(&self) -> InstanceId {
        self.last_decided.map_or(0, |last| last + 1)
    }

    fn others(&self, me: ReplicaId) -> Vec<ReplicaId> {
        self.view
            .members()
            .iter()
            .copied()
            .filter(|id| *id != me)
            .collect()
    }

    fn leader(&self, instance: InstanceId, round: RoundNumber) -> ReplicaId {
        self.leaders.expected_leader(instance, round, &self.view)
    }
}

/// Buffered messages in replay order: matching ACCEPT/DECIDE votes ahead of
/// the first proposal they already certify, proposals in round order first
/// otherwise.
fn replay_order(
    proposals: Vec<(ConsensusMessage, Digest)>,
    others: Vec<ConsensusMessage>,
    view: &MembershipView,
) -> Vec<ConsensusMessage> {
    let certified = proposals
        .iter()
        .position(|(_, digest)| certifies(&others, digest, view));
    let Some(index) = certified else {
        return proposals
            .into_iter()
            .map(|(proposal, _)| proposal)
            .chain(others)
            .collect();
    };
    let digest = Some(proposals[index].1);
    let (mut ordered, rest): (Vec<_>, Vec<_>) = others.into_iter().partition(|msg| {
        matches!(msg.kind, MessageKind::Accept | MessageKind::Decide) && msg.digest() == digest
    });
    let mut proposals: Vec<ConsensusMessage> = proposals.into_iter().map(|(p, _)| p).collect();
    ordered.push(proposals.remove(index));
    ordered.extend(proposals);
    ordered.extend(rest);
    ordered
}

/// A quorum of ACCEPTs or more than `f` DECIDEs for `digest` from distinct senders
fn certifies(messages: &[ConsensusMessage], digest: &Digest, view: &MembershipView) -> bool {
    let senders = |kind: MessageKind| {
        messages
            .iter()
            .filter(|msg| msg.kind == kind && msg.digest().as_ref() == Some(digest))
            .map(|msg| msg.sender)
            .collect::<BTreeSet<_>>()
            .len()
    };
    let quorums = view.quorums();
    senders(MessageKind::Accept) >= quorums.quorum()
        || senders(MessageKind::Decide) >= quorums.decide_quorum()
}

/// Execution manager of one replica.
pub struct ExecutionManager {
    config: ConsensusConfig,
    me: ReplicaId,
    acceptor: Acceptor,
    synchronizer: Synchronizer,
    ports: ManagerPorts,
    state: Mutex<ManagerState>,
    backlog: Mutex<VecDeque<ConsensusMessage>>,
}

impl ExecutionManager {
    pub fn new(config: ConsensusConfig, ports: ManagerPorts) -> ConsensusResult<Self> {
        config.validate()?;
        let view = Arc::new(config.initial_view());
        let bootstrap = view.member_at(0).unwrap_or(config.replica_id);
        let state = ManagerState {
            view,
            leaders: LeaderModule::new(bootstrap),
            last_decided: None,
            in_progress: None,
            stopped: false,
            instances: BTreeMap::new(),
            out_of_context: OutOfContextBuffer::new(
                config.max_out_of_context,
                config.max_buffered_per_instance,
            ),
            stopped_queue: StoppedQueue::new(config.max_stopped_messages),
            proposed: BTreeSet::new(),
            started: HashMap::new(),
            decisions: 0,
        };
        Ok(Self {
            me: config.replica_id,
            acceptor: Acceptor::new(&config),
            synchronizer: Synchronizer::new(config.replica_id, ports.signer.clone()),
            config,
            ports,
            state: Mutex::new(state),
            backlog: Mutex::new(VecDeque::new()),
        })
    }

    pub fn me(&self) -> ReplicaId {
        self.me
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    // === ADMISSION ===

    /// Route one message through admission and, when admitted, the acceptor.
    pub fn deliver(&self, msg: ConsensusMessage) -> ProcessOutcome {
        let outcome = self.deliver_one(msg);
        self.drain();
        outcome
    }

    /// Where `msg` would go right now, without side effects.
    pub fn check_admission(&self, msg: &ConsensusMessage) -> Admission {
        let retrieving = self.ports.state_transfer.is_retrieving_state();
        let state = self.state.lock();
        self.classify(&state, msg, retrieving)
    }

    fn classify(&self, state: &ManagerState, msg: &ConsensusMessage, retrieving: bool) -> Admission {
        let id = msg.instance;
        let distance = match state.last_decided {
            Some(last) if id <= last => {
                // A retained decided instance still helps a leader change along
                let assists = matches!(
                    msg.kind,
                    MessageKind::Propose | MessageKind::Freeze | MessageKind::Collect
                ) && !state.stopped
                    && state.instances.contains_key(&id);
                return if assists {
                    Admission::ProcessNow
                } else {
                    Admission::Dropped
                };
            }
            Some(last) => id - last,
            None => id.saturating_add(1),
        };
        let recovering = state.last_decided.is_none() && distance >= self.config.revival_high_mark;
        let window = if state.stopped {
            self.config.timeout_high_mark
        } else {
            self.config.high_mark
        };
        if recovering || distance >= window {
            return Admission::StateTransfer;
        }
        if state.stopped {
            return Admission::Queued;
        }
        let current = id == state.next_instance()
            || (msg.kind == MessageKind::Propose && state.in_progress == Some(id));
        if retrieving || !current {
            Admission::Buffered
        } else {
            Admission::ProcessNow
        }
    }

    fn deliver_one(&self, msg: ConsensusMessage) -> ProcessOutcome {
        metrics::record_message(msg.kind.as_str());
        if let Err(err) = self.screen(&msg) {
            return self.reject(&msg, err);
        }
        let retrieving = self.ports.state_transfer.is_retrieving_state();
        let (id, sender) = (msg.instance, msg.sender);

        let mut state = self.state.lock();
        let admission = self.classify(&state, &msg, retrieving);
        match admission {
            Admission::ProcessNow => {
                drop(state);
                self.process(msg)
            }
            Admission::Dropped => {
                debug!(instance = id, sender, kind = msg.kind.as_str(), "Stale message dropped");
                ProcessOutcome::Dropped
            }
            Admission::Queued => {
                if let Some(dropped) = state.stopped_queue.push(msg) {
                    debug!(instance = dropped.instance, "Stopped queue full, oldest message dropped");
                }
                metrics::record_buffered("stopped");
                ProcessOutcome::Queued
            }
            Admission::Buffered | Admission::StateTransfer => {
                if msg.kind == MessageKind::Propose {
                    let (view, leader) = (state.view.clone(), state.leader(id, msg.round));
                    drop(state);
                    if let Err(err) = self.check_proposal(&msg, &view, leader) {
                        return self.reject(&msg, err);
                    }
                    state = self.state.lock();
                }
                let buffered = self.buffer(&mut state, msg);
                let request = StateTransferRequest {
                    last_decided: state.last_decided,
                    observed_instance: id,
                    observed_sender: sender,
                };
                drop(state);

                if admission == Admission::StateTransfer {
                    debug!(instance = id, sender, "Message beyond watermark, requesting state");
                    metrics::record_state_transfer_request();
                    self.ports.state_transfer.request_state_transfer(request);
                    return ProcessOutcome::StateTransferRequested;
                }
                if buffered {
                    ProcessOutcome::Buffered
                } else {
                    ProcessOutcome::Dropped
                }
            }
        }
    }

    /// Shape checks that need no instance state.
    fn screen(&self, msg: &ConsensusMessage) -> ConsensusResult<()> {
        if !self.state.lock().view.contains(msg.sender) {
            return Err(ConsensusError::UnknownReplica(msg.sender));
        }
        let missing = ConsensusError::MissingValue {
            kind: msg.kind,
            instance: msg.instance,
        };
        match msg.kind {
            MessageKind::Propose if msg.value.is_none() => Err(missing),
            MessageKind::Write | MessageKind::Accept | MessageKind::Decide
                if msg.digest().is_none() =>
            {
                Err(missing)
            }
            MessageKind::Collect => match &msg.proof {
                Some(MessageProof::Collect(collect)) if collect.payload.sender == msg.sender => {
                    Ok(())
                }
                _ => Err(ConsensusError::MissingProof {
                    instance: msg.instance,
                    round: msg.round,
                }),
            },
            _ => Ok(()),
        }
    }

    fn buffer(&self, state: &mut ManagerState, msg: ConsensusMessage) -> bool {
        let id = msg.instance;
        let outcome = state.out_of_context.push(msg);
        match outcome {
            BufferOutcome::BufferedEvicting { instance, evicted } => {
                warn!(instance, evicted, "Out-of-context buffer full, evicted farthest instance");
                metrics::record_buffer_eviction(evicted);
            }
            BufferOutcome::Refused => {
                debug!(instance = id, "Out-of-context message refused");
                metrics::record_rejected("buffer_full");
            }
            BufferOutcome::Buffered => {}
        }
        if outcome.is_buffered() {
            metrics::record_buffered("out_of_context");
        }
        metrics::set_out_of_context(state.out_of_context.len());
        outcome.is_buffered()
    }

    fn reject(&self, msg: &ConsensusMessage, err: ConsensusError) -> ProcessOutcome {
        metrics::record_rejected(err.label());
        match err {
            ConsensusError::RoundFrozen { .. } | ConsensusError::NotOurTurn(_) => debug!(
                instance = msg.instance,
                round = msg.round,
                sender = msg.sender,
                kind = msg.kind.as_str(),
                error = %err,
                "Message ignored"
            ),
            _ => warn!(
                instance = msg.instance,
                round = msg.round,
                sender = msg.sender,
                kind = msg.kind.as_str(),
                error = %err,
                "Message rejected"
            ),
        }
        ProcessOutcome::Rejected(err)
    }

    fn drain(&self) {
        loop {
            let next = self.backlog.lock().pop_front();
            let Some(msg) = next else {
                break;
            };
            if let ProcessOutcome::Rejected(err) = self.deliver_one(msg) {
                debug!(error = %err, "Replayed message rejected");
            }
        }
    }

    // === PROCESSING ===

    fn process(&self, msg: ConsensusMessage) -> ProcessOutcome {
        if msg.kind == MessageKind::Collect {
            return self.process_collect(msg);
        }
        let instance = self.instance_or_create(msg.instance);
        self.run(&instance, msg)
    }

    /// The instance, created on first use.
    ///
    /// A new instance immediately replays what was buffered for it, stopping
    /// once it decides.
    pub fn instance_or_create(&self, id: InstanceId) -> SharedInstance {
        let (instance, buffered, view) = {
            let mut state = self.state.lock();
            if let Some(existing) = state.instances.get(&id) {
                return existing.clone();
            }
            let instance = Arc::new(Mutex::new(ConsensusInstance::new(id)));
            state.instances.insert(id, instance.clone());
            let buffered = state
                .out_of_context
                .has(id)
                .then(|| state.out_of_context.take(id));
            metrics::set_out_of_context(state.out_of_context.len());
            (instance, buffered, state.view.clone())
        };

        if let Some((proposals, others)) = buffered {
            let replay = self.replay_list(proposals, others, &view);
            debug!(instance = id, count = replay.len(), "Replaying out-of-context messages");
            for msg in replay {
                if instance.lock().is_decided() {
                    break;
                }
                if let ProcessOutcome::Rejected(err) = self.run(&instance, msg) {
                    debug!(instance = id, error = %err, "Buffered message rejected");
                }
            }
        }
        instance
    }

    fn replay_list(
        &self,
        proposals: Vec<ConsensusMessage>,
        others: Vec<ConsensusMessage>,
        view: &MembershipView,
    ) -> Vec<ConsensusMessage> {
        let proposals = proposals
            .into_iter()
            .filter_map(|p| {
                let digest = self.ports.validator.compute_hash(p.value.as_deref()?);
                Some((p, digest))
            })
            .collect();
        replay_order(proposals, others, view)
    }

    /// Whether the messages buffered for `id` already certify one of its
    /// buffered proposals, so the instance can decide as soon as it is created.
    pub fn is_decidable(&self, id: InstanceId) -> bool {
        let (values, others, view) = {
            let state = self.state.lock();
            let values: Vec<Vec<u8>> = state
                .out_of_context
                .proposals(id)
                .into_iter()
                .filter_map(|p| p.value.clone())
                .collect();
            (values, state.out_of_context.messages(id).to_vec(), state.view.clone())
        };
        values.iter().any(|value| {
            let digest = self.ports.validator.compute_hash(value);
            certifies(&others, &digest, &view)
        })
    }

    fn run(&self, instance: &SharedInstance, msg: ConsensusMessage) -> ProcessOutcome {
        let (view, leader) = {
            let state = self.state.lock();
            (state.view.clone(), state.leader(msg.instance, msg.round))
        };
        let check = if msg.kind == MessageKind::Propose {
            match self.check_proposal(&msg, &view, leader) {
                Ok(check) => Some(check),
                Err(err) => return self.reject(&msg, err),
            }
        } else {
            None
        };
        let ctx = RoundContext { view, leader };
        let result = {
            let mut guard = instance.lock();
            self.acceptor.handle(&mut guard, &ctx, &msg, check)
        };
        match result {
            Ok(actions) => {
                self.execute(actions);
                ProcessOutcome::Processed
            }
            Err(err) => self.reject(&msg, err),
        }
    }

    /// Leader, proof and validity checks on a PROPOSE, outside any lock.
    fn check_proposal(
        &self,
        msg: &ConsensusMessage,
        view: &MembershipView,
        leader: ReplicaId,
    ) -> ConsensusResult<ProposalCheck> {
        if msg.sender != leader {
            return Err(ConsensusError::NotLeader {
                instance: msg.instance,
                round: msg.round,
                sender: msg.sender,
                leader,
            });
        }
        let value = msg.value.as_deref().ok_or(ConsensusError::MissingValue {
            kind: MessageKind::Propose,
            instance: msg.instance,
        })?;
        let digest = self.ports.validator.compute_hash(value);
        if msg.round > 0 {
            let Some(MessageProof::LeaderChange(collects)) = &msg.proof else {
                return Err(ConsensusError::MissingProof {
                    instance: msg.instance,
                    round: msg.round,
                });
            };
            self.synchronizer
                .verify_leader_change(msg.instance, msg.round, collects, &digest, view)?;
        }
        let valid = self.ports.validator.check_proposed_value(value).is_some();
        Ok(ProposalCheck { digest, valid })
    }

    // === LEADER CHANGE ===

    fn process_collect(&self, msg: ConsensusMessage) -> ProcessOutcome {
        let Some(MessageProof::Collect(collect)) = msg.proof.clone() else {
            return self.reject(
                &msg,
                ConsensusError::MissingProof {
                    instance: msg.instance,
                    round: msg.round,
                },
            );
        };
        let current = self.current_round(msg.instance);
        if msg.round > current.saturating_add(self.config.max_round_ahead) {
            return self.reject(
                &msg,
                ConsensusError::RoundOutOfWindow {
                    instance: msg.instance,
                    round: msg.round,
                    current,
                },
            );
        }
        let (view, leader) = {
            let state = self.state.lock();
            (state.view.clone(), state.leader(msg.instance, msg.round))
        };
        match self.synchronizer.on_collect(collect, &view, leader) {
            Ok(Some(change)) => {
                self.lead_round(change, &view);
                ProcessOutcome::Processed
            }
            Ok(None) => ProcessOutcome::Processed,
            Err(err) => self.reject(&msg, err),
        }
    }

    /// Propose in a round this replica now leads.
    fn lead_round(&self, change: LeaderChange, view: &MembershipView) {
        let (id, round) = (change.instance, change.round);
        info!(instance = id, round, selection = ?change.selection, "Leading new round");
        let validator = self.ports.validator.as_ref();
        let value = match (self.decision(id), change.selection) {
            (Some(decision), selection) => match selection.mandated() {
                Some(digest) if digest != decision.digest => None,
                _ => Some(decision.value),
            },
            (None, Selection::Bound(stamp)) => {
                carried_value(&change.collects, &stamp.digest, validator)
                    .or_else(|| self.local_value(id, &stamp.digest))
            }
            (None, Selection::Free) => written_value(&change.collects, view, validator)
                .or_else(|| self.ports.batches.next_batch()),
        };
        match (value, change.selection) {
            (Some(value), _) => {
                if let Err(err) = self.propose_in_round(id, round, value, Some(change.collects)) {
                    warn!(instance = id, round, error = %err, "Could not propose in new round");
                }
            }
            (None, Selection::Free) => {
                debug!(instance = id, round, "Nothing to propose yet, parking round");
                self.synchronizer.park(change);
            }
            (None, Selection::Bound(_)) => warn!(
                instance = id,
                round,
                "Bytes of the bound value are unknown, waiting for round timeout"
            ),
        }
    }

    fn local_value(&self, id: InstanceId, digest: &Digest) -> Option<Vec<u8>> {
        let instance = self.state.lock().instances.get(&id).cloned()?;
        let value = instance.lock().value_for(digest);
        value
    }

    fn propose_in_round(
        &self,
        id: InstanceId,
        round: RoundNumber,
        value: Vec<u8>,
        proof: Option<Vec<SignedCollect>>,
    ) -> ConsensusResult<()> {
        let targets = {
            let mut state = self.state.lock();
            if state.stopped {
                return Err(ConsensusError::Stopped);
            }
            if !state.proposed.insert((id, round)) {
                return Err(ConsensusError::AlreadyProposed(id));
            }
            state.others(self.me)
        };
        info!(instance = id, round, bytes = value.len(), "Proposing");
        let msg = ConsensusMessage::propose(id, round, self.me, value, proof.map(MessageProof::LeaderChange));
        self.ports.transport.send(&targets, msg.clone());
        self.backlog.lock().push_back(msg);
        Ok(())
    }

    /// Propose `value` for the next instance.
    ///
    /// Fills a parked round this replica leads, or round 0 when this replica
    /// is its leader.
    pub fn propose(&self, value: Vec<u8>) -> ConsensusResult<InstanceId> {
        let result = self.propose_value(value);
        self.drain();
        result
    }

    fn propose_value(&self, value: Vec<u8>) -> ConsensusResult<InstanceId> {
        let next = {
            let state = self.state.lock();
            if state.stopped {
                return Err(ConsensusError::Stopped);
            }
            state.next_instance()
        };
        if let Some(change) = self.synchronizer.take_parked(next) {
            self.propose_in_round(next, change.round, value, Some(change.collects))?;
            return Ok(next);
        }
        if self.current_round(next) > 0 || self.leader_of(next, 0) != self.me {
            return Err(ConsensusError::NotOurTurn(next));
        }
        self.propose_in_round(next, 0, value, None)?;
        Ok(next)
    }

    /// Pull a batch when this replica leads the next instance and has not
    /// proposed for it yet.
    fn propose_next_batch(&self) {
        let next = {
            let state = self.state.lock();
            let next = state.next_instance();
            if state.stopped || state.proposed.contains(&(next, 0)) || state.leader(next, 0) != self.me {
                return;
            }
            next
        };
        if self.current_round(next) > 0 {
            return;
        }
        if let Some(batch) = self.ports.batches.next_batch() {
            if let Err(err) = self.propose_value(batch) {
                debug!(instance = next, error = %err, "Batch not proposed");
            }
        }
    }

    fn current_round(&self, id: InstanceId) -> RoundNumber {
        let instance = self.state.lock().instances.get(&id).cloned();
        instance.map_or(0, |instance| instance.lock().ets())
    }

    /// Local round timer expired.
    pub fn on_round_timeout(&self, id: InstanceId, round: RoundNumber) {
        let (view, leader) = {
            let state = self.state.lock();
            if state.stopped || state.last_decided.is_some_and(|last| id <= last) {
                return;
            }
            if id != state.next_instance() && !state.instances.contains_key(&id) {
                return;
            }
            (state.view.clone(), state.leader(id, round))
        };
        let instance = self.instance_or_create(id);
        let ctx = RoundContext { view, leader };
        let actions = {
            let mut guard = instance.lock();
            // Timers only run for rounds this replica entered
            if guard.is_decided() || round > guard.ets() {
                return;
            }
            guard.round_or_create(round, &ctx.view);
            self.acceptor.on_timeout(&mut guard, &ctx, round)
        };
        self.execute(actions);
        self.drain();
    }

    // === ACTIONS ===

    fn execute(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Broadcast(msg) => {
                    let targets = self.state.lock().others(self.me);
                    self.ports.transport.send(&targets, msg);
                }
                Action::SendCollect {
                    instance,
                    round,
                    leader,
                    frozen,
                } => self.send_collect(instance, round, leader, frozen),
                Action::Decided(decision) => self.on_decided(decision),
                Action::ScheduleTimeout { instance, round } => {
                    self.ports
                        .timers
                        .schedule(instance, round, self.config.round_timeout());
                }
                Action::CancelTimeout { instance, round } => {
                    self.ports.timers.cancel(instance, round);
                }
                Action::RoundChange {
                    instance,
                    round,
                    previous_leader,
                    leader,
                } => {
                    self.state.lock().leaders.record_leader(instance, round, leader);
                    metrics::record_leader_change();
                    self.ports.decisions.on_leader_changed(LeaderChangedEvent {
                        instance,
                        round,
                        previous_leader,
                        leader,
                    });
                }
                Action::InProgress(id) => {
                    let mut state = self.state.lock();
                    if id == state.next_instance() {
                        state.in_progress = Some(id);
                        state.started.entry(id).or_insert_with(Instant::now);
                    }
                }
                Action::Redeliver(msgs) => {
                    debug!(count = msgs.len(), "Redelivering held messages");
                    self.backlog.lock().extend(msgs);
                }
            }
        }
    }

    fn send_collect(
        &self,
        id: InstanceId,
        round: RoundNumber,
        leader: ReplicaId,
        frozen: FreezeProof,
    ) {
        let later = id
            .checked_add(1)
            .and_then(|next| self.state.lock().instances.get(&next).cloned());
        let later = later.and_then(|instance| {
            let guard = instance.lock();
            guard
                .decision()
                .map(|decision| guard.freeze_proof(self.me, decision.round))
        });
        let job = SigningJob {
            targets: vec![leader],
            payload: CollectPayload {
                instance: id,
                round,
                sender: self.me,
                frozen,
                later,
            },
        };
        debug!(instance = id, round, leader, "Sending collect");
        if let Err(err) = self.ports.signing.submit(job) {
            warn!(instance = id, round, error = %err, "Collect not submitted for signing");
        }
    }

    fn on_decided(&self, decision: Decision) {
        let id = decision.instance;
        let (latency, buffered, view) = {
            let mut state = self.state.lock();
            if state.last_decided.is_some_and(|last| id <= last) {
                return;
            }
            state.last_decided = Some(id);
            if state.in_progress.is_some_and(|current| current <= id) {
                state.in_progress = None;
            }
            let leader = state.leader(id, decision.round);
            state.leaders.on_decided(id, leader);
            state.decisions += 1;
            let latency = state.started.remove(&id).map(|at| at.elapsed().as_secs_f64());
            self.evict_stable_locked(&mut state, id);
            let buffered = state.out_of_context.take(id + 1);
            metrics::set_out_of_context(state.out_of_context.len());
            (latency, buffered, state.view.clone())
        };
        self.synchronizer.forget_upto(id);
        metrics::record_decision(latency);
        self.ports.decisions.on_decided(decision);

        let (proposals, others) = buffered;
        let replay = self.replay_list(proposals, others, &view);
        if !replay.is_empty() {
            debug!(instance = id + 1, count = replay.len(), "Activating buffered instance");
            self.backlog.lock().extend(replay);
        }
        self.propose_next_batch();
    }

    /// Evict instances and buffers that fell out of the retention window
    /// behind `decided`.
    pub fn evict_stable(&self, decided: InstanceId) {
        let mut state = self.state.lock();
        self.evict_stable_locked(&mut state, decided);
    }

    fn evict_stable_locked(&self, state: &mut ManagerState, decided: InstanceId) {
        let Some(upto) = decided.checked_sub(self.config.stable_retention) else {
            return;
        };
        let retained = state.instances.split_off(&(upto + 1));
        let evicted = std::mem::replace(&mut state.instances, retained);
        let purged = state.out_of_context.purge_upto(upto);
        state.leaders.forget_stable(upto);
        state.proposed.retain(|(id, _)| *id > upto);
        state.started.retain(|id, _| *id > upto);
        if !evicted.is_empty() || purged > 0 {
            debug!(upto, instances = evicted.len(), purged, "Evicted stable instances");
        }
    }

    // === ADMINISTRATION ===

    pub fn stop(&self) {
        let mut state = self.state.lock();
        if !state.stopped {
            info!(replica = self.me, "Execution manager stopped");
            state.stopped = true;
        }
    }

    /// Resume and replay the stopped queue in arrival order.
    pub fn restart(&self) {
        let queued = {
            let mut state = self.state.lock();
            if !state.stopped {
                return;
            }
            state.stopped = false;
            let last = state.last_decided;
            state
                .stopped_queue
                .drain()
                .into_iter()
                .filter(|msg| last.map_or(true, |last| msg.instance > last))
                .collect::<Vec<_>>()
        };
        info!(replica = self.me, replay = queued.len(), "Execution manager restarted");
        self.backlog.lock().extend(queued);
        self.propose_next_batch();
        self.drain();
    }

    /// State transfer installed everything up to and including `upto`.
    pub fn on_state_installed(&self, upto: InstanceId) {
        let (removed, buffered, view) = {
            let mut state = self.state.lock();
            if state.last_decided.is_some_and(|last| upto <= last) {
                return;
            }
            state.last_decided = Some(upto);
            state.in_progress = None;
            let retained = state.instances.split_off(&(upto + 1));
            let removed = std::mem::replace(&mut state.instances, retained);
            state.out_of_context.purge_upto(upto);
            state.leaders.forget_stable(upto);
            state.proposed.retain(|(id, _)| *id > upto);
            state.started.retain(|id, _| *id > upto);
            let buffered = state.out_of_context.take(upto + 1);
            metrics::set_out_of_context(state.out_of_context.len());
            (removed, buffered, state.view.clone())
        };
        info!(replica = self.me, upto, "State installed");
        for (id, instance) in removed {
            let rounds = instance.lock().round_numbers();
            for round in rounds {
                self.ports.timers.cancel(id, round);
            }
        }
        self.synchronizer.forget_upto(upto);

        let (proposals, others) = buffered;
        let replay = self.replay_list(proposals, others, &view);
        self.backlog.lock().extend(replay);
        self.propose_next_batch();
        self.drain();
    }

    /// Switch to a new membership view and remap every open round onto it.
    pub fn install_view(&self, view: MembershipView) {
        let view = Arc::new(view);
        let instances: Vec<SharedInstance> = {
            let mut state = self.state.lock();
            state.view = view.clone();
            state.instances.values().cloned().collect()
        };
        let mut remapped = 0;
        for instance in instances {
            let mut guard = instance.lock();
            for round in guard.rounds_mut() {
                remapped += round.remap_view(view.clone()) as usize;
            }
        }
        info!(view = view.number, members = view.len(), remapped, "View installed");
    }

    // === QUERIES ===

    pub fn last_decided(&self) -> Option<InstanceId> {
        self.state.lock().last_decided
    }

    pub fn in_progress(&self) -> Option<InstanceId> {
        self.state.lock().in_progress
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    pub fn view(&self) -> Arc<MembershipView> {
        self.state.lock().view.clone()
    }

    pub fn leader_of(&self, id: InstanceId, round: RoundNumber) -> ReplicaId {
        self.state.lock().leader(id, round)
    }

    /// Decision of a live instance
    pub fn decision(&self, id: InstanceId) -> Option<Decision> {
        let instance = self.state.lock().instances.get(&id).cloned()?;
        let decision = instance.lock().decision().cloned();
        decision
    }

    pub fn instance(&self, id: InstanceId) -> Option<SharedInstance> {
        self.state.lock().instances.get(&id).cloned()
    }

    pub fn stats(&self) -> ManagerStats {
        let gathering_collects = self.synchronizer.gathering();
        let state = self.state.lock();
        ManagerStats {
            replica: self.me,
            view: state.view.number,
            last_decided: state.last_decided,
            in_progress: state.in_progress,
            stopped: state.stopped,
            live_instances: state.instances.len(),
            out_of_context: state.out_of_context.len(),
            out_of_context_instances: state.out_of_context.instance_count(),
            stopped_queue: state.stopped_queue.len(),
            decisions: state.decisions,
            gathering_collects,
        }
    }
}

#[async_trait]
impl ConsensusApi for ExecutionManager {
    async fn deliver(&self, msg: ConsensusMessage) -> ProcessOutcome {
        ExecutionManager::deliver(self, msg)
    }

    async fn propose(&self, value: Vec<u8>) -> ConsensusResult<InstanceId> {
        ExecutionManager::propose(self, value)
    }

    async fn on_round_timeout(&self, instance: InstanceId, round: RoundNumber) {
        ExecutionManager::on_round_timeout(self, instance, round)
    }

    async fn stop(&self) {
        ExecutionManager::stop(self)
    }

    async fn restart(&self) {
        ExecutionManager::restart(self)
    }

    async fn on_state_installed(&self, upto: InstanceId) {
        ExecutionManager::on_state_installed(self, upto)
    }

    async fn install_view(&self, view: MembershipView) {
        ExecutionManager::install_view(self, view)
    }

    async fn last_decided(&self) -> Option<InstanceId> {
        ExecutionManager::last_decided(self)
    }

    async fn stats(&self) -> ManagerStats {
        ExecutionManager::stats(self)
    }
}
