//! Deterministic in-process cluster.
//!
//! Every replica records what it sends; [`Cluster::run`] moves recorded
//! messages to their targets (the sender included, when it addresses itself)
//! until the cluster is quiet. Timers never fire on their own: tests call
//! [`Cluster::fire_timeout`].

use parking_lot::Mutex;
use quorra_consensus::adapters::{
    keccak256, InlineSigning, K256Signer, KeccakBatchValidator, ManualTimers, QueueBatchProvider,
    RecordingDecisions, RecordingStateTransfer, RecordingTransport,
};
use quorra_consensus::{
    Batch, ConsensusConfig, ConsensusMessage, Decision, ExecutionManager, InstanceId,
    ManagerPorts, MessageKind, ProcessOutcome, ReplicaId, RoundNumber,
};
use std::collections::HashSet;
use std::sync::Arc;

/// Upper bound on routing steps before a run is declared livelocked
const MAX_STEPS: usize = 10_000;

pub const KEY_SEED: &[u8] = b"quorra-integration";

pub struct Node {
    pub manager: ExecutionManager,
    pub transport: Arc<RecordingTransport>,
    pub decisions: Arc<RecordingDecisions>,
    pub timers: Arc<ManualTimers>,
    pub state_transfer: Arc<RecordingStateTransfer>,
    pub batches: Arc<QueueBatchProvider>,
    /// Everything this node ever sent, in order
    pub outbox: Mutex<Vec<(Vec<ReplicaId>, ConsensusMessage)>>,
}

impl Node {
    pub fn id(&self) -> ReplicaId {
        self.manager.me()
    }

    pub fn decided(&self) -> Vec<Decision> {
        self.decisions.decisions()
    }

    pub fn decision_for(&self, instance: InstanceId) -> Option<Decision> {
        self.decided().into_iter().find(|d| d.instance == instance)
    }

    /// Messages of `kind` this node sent for `instance`
    pub fn sent(&self, kind: MessageKind, instance: InstanceId) -> Vec<ConsensusMessage> {
        self.outbox
            .lock()
            .iter()
            .filter(|(_, msg)| msg.kind == kind && msg.instance == instance)
            .map(|(_, msg)| msg.clone())
            .collect()
    }
}

pub struct Cluster {
    pub nodes: Vec<Node>,
    pub signers: Vec<Arc<K256Signer>>,
    crashed: Mutex<HashSet<ReplicaId>>,
    held: Mutex<HashSet<ReplicaId>>,
    held_messages: Mutex<Vec<(ReplicaId, ConsensusMessage)>>,
    duplicate: Mutex<bool>,
}

impl Cluster {
    /// `n` replicas tolerating `f` faults, default configuration.
    pub fn new(n: usize, f: usize) -> Self {
        Self::with_config(n, f, |config| config)
    }

    pub fn with_config(
        n: usize,
        f: usize,
        tune: impl Fn(ConsensusConfig) -> ConsensusConfig,
    ) -> Self {
        let ids: Vec<ReplicaId> = (0..n as ReplicaId).collect();
        let signers: Vec<Arc<K256Signer>> = K256Signer::cluster(KEY_SEED, &ids)
            .unwrap()
            .into_iter()
            .map(Arc::new)
            .collect();
        let nodes = ids
            .iter()
            .map(|&id| {
                let config = tune(ConsensusConfig::for_cluster(id, n, f));
                Self::node(config, signers[id as usize].clone())
            })
            .collect();
        Self {
            nodes,
            signers,
            crashed: Mutex::new(HashSet::new()),
            held: Mutex::new(HashSet::new()),
            held_messages: Mutex::new(Vec::new()),
            duplicate: Mutex::new(false),
        }
    }

    fn node(config: ConsensusConfig, signer: Arc<K256Signer>) -> Node {
        let transport = Arc::new(RecordingTransport::new());
        let decisions = Arc::new(RecordingDecisions::new());
        let timers = Arc::new(ManualTimers::new());
        let state_transfer = Arc::new(RecordingStateTransfer::new());
        let batches = Arc::new(QueueBatchProvider::new(16));
        let ports = ManagerPorts {
            transport: transport.clone(),
            validator: Arc::new(KeccakBatchValidator::default()),
            batches: batches.clone(),
            state_transfer: state_transfer.clone(),
            decisions: decisions.clone(),
            timers: timers.clone(),
            signer: signer.clone(),
            signing: Arc::new(InlineSigning::new(signer, transport.clone())),
        };
        Node {
            manager: ExecutionManager::new(config, ports).unwrap(),
            transport,
            decisions,
            timers,
            state_transfer,
            batches,
            outbox: Mutex::new(Vec::new()),
        }
    }

    pub fn node_ref(&self, id: ReplicaId) -> &Node {
        &self.nodes[id as usize]
    }

    pub fn ids(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.nodes.iter().map(Node::id)
    }

    pub fn is_crashed(&self, id: ReplicaId) -> bool {
        self.crashed.lock().contains(&id)
    }

    /// Stop routing to and from `id`. Traffic addressed to it is lost.
    pub fn crash(&self, id: ReplicaId) {
        self.crashed.lock().insert(id);
    }

    pub fn revive(&self, id: ReplicaId) {
        self.crashed.lock().remove(&id);
    }

    /// Keep traffic addressed to `id` aside instead of delivering it.
    pub fn hold(&self, id: ReplicaId) {
        self.held.lock().insert(id);
    }

    /// Deliver held messages for `id` that match `filter`, in the order they were sent.
    pub fn release_where(
        &self,
        id: ReplicaId,
        filter: impl Fn(&ConsensusMessage) -> bool,
    ) -> Vec<ProcessOutcome> {
        let selected: Vec<ConsensusMessage> = {
            let mut held = self.held_messages.lock();
            let (selected, rest): (Vec<_>, Vec<_>) = held
                .drain(..)
                .partition(|(target, msg)| *target == id && filter(msg));
            *held = rest;
            selected.into_iter().map(|(_, msg)| msg).collect()
        };
        selected
            .into_iter()
            .map(|msg| self.node_ref(id).manager.deliver(msg))
            .collect()
    }

    /// Deliver everything held for `id` and route normally from now on.
    pub fn release(&self, id: ReplicaId) -> Vec<ProcessOutcome> {
        self.held.lock().remove(&id);
        self.release_where(id, |_| true)
    }

    pub fn held_count(&self, id: ReplicaId) -> usize {
        self.held_messages
            .lock()
            .iter()
            .filter(|(target, _)| *target == id)
            .count()
    }

    /// Deliver every routed message twice.
    pub fn duplicate_deliveries(&self, on: bool) {
        *self.duplicate.lock() = on;
    }

    /// Hand `msg` straight to `to`, bypassing the routing rules.
    pub fn inject(&self, to: ReplicaId, msg: ConsensusMessage) -> ProcessOutcome {
        self.node_ref(to).manager.deliver(msg)
    }

    /// Take what `from` sent since the last wave without delivering it, so a
    /// test can route it by hand. The traffic still lands in the outbox.
    pub fn take_sent(&self, from: ReplicaId) -> Vec<(Vec<ReplicaId>, ConsensusMessage)> {
        let node = self.node_ref(from);
        let outgoing = node.transport.take();
        node.outbox.lock().extend(outgoing.iter().cloned());
        outgoing
    }

    /// Route one wave of recorded traffic: everything sent so far is
    /// delivered, replies to it wait for the next wave. Returns the number
    /// of deliveries.
    pub fn step(&self) -> usize {
        let mut wave = Vec::new();
        for node in &self.nodes {
            let outgoing = node.transport.take();
            node.outbox.lock().extend(outgoing.iter().cloned());
            if !self.is_crashed(node.id()) {
                wave.extend(outgoing);
            }
        }
        let mut delivered = 0;
        for (targets, msg) in wave {
            for target in targets {
                delivered += self.route(target, &msg);
            }
        }
        delivered
    }

    fn route(&self, target: ReplicaId, msg: &ConsensusMessage) -> usize {
        if self.is_crashed(target) || target as usize >= self.nodes.len() {
            return 0;
        }
        if self.held.lock().contains(&target) {
            self.held_messages.lock().push((target, msg.clone()));
            return 0;
        }
        let copies = if *self.duplicate.lock() { 2 } else { 1 };
        for _ in 0..copies {
            self.node_ref(target).manager.deliver(msg.clone());
        }
        copies
    }

    /// Route until no replica has anything left to send.
    pub fn run(&self) -> usize {
        let mut total = 0;
        for _ in 0..MAX_STEPS {
            let delivered = self.step();
            if delivered == 0 && self.nodes.iter().all(|n| n.transport.sent().is_empty()) {
                return total;
            }
            total += delivered;
        }
        panic!("cluster did not quiesce after {MAX_STEPS} steps");
    }

    /// Expire `(instance, round)` on every live replica.
    pub fn fire_timeout(&self, instance: InstanceId, round: RoundNumber) {
        for node in &self.nodes {
            if !self.is_crashed(node.id()) {
                node.manager.on_round_timeout(instance, round);
            }
        }
    }

    /// Move every live replica to `last_decided = upto`.
    pub fn install_state(&self, upto: InstanceId) {
        for node in &self.nodes {
            node.manager.on_state_installed(upto);
        }
    }

    pub fn live(&self) -> impl Iterator<Item = &Node> + '_ {
        self.nodes.iter().filter(|n| !self.is_crashed(n.id()))
    }

    /// Every pair of replicas agrees on every instance both decided.
    pub fn assert_agreement(&self) {
        for a in &self.nodes {
            for b in &self.nodes {
                for decision in a.decided() {
                    if let Some(other) = b.decision_for(decision.instance) {
                        assert_eq!(
                            decision.value,
                            other.value,
                            "replicas {} and {} disagree on instance {}",
                            a.id(),
                            b.id(),
                            decision.instance
                        );
                    }
                }
            }
        }
    }
}

/// Encoded single-command batch tagged with `tag`
pub fn batch(tag: u8) -> Vec<u8> {
    Batch::new(vec![vec![tag; 8]]).encode().unwrap()
}

pub fn propose(
    instance: InstanceId,
    round: RoundNumber,
    sender: ReplicaId,
    value: Vec<u8>,
) -> ConsensusMessage {
    ConsensusMessage::propose(instance, round, sender, value, None)
}

pub fn vote(
    kind: MessageKind,
    instance: InstanceId,
    round: RoundNumber,
    sender: ReplicaId,
    value: &[u8],
) -> ConsensusMessage {
    ConsensusMessage::vote(kind, instance, round, sender, keccak256(value))
}
