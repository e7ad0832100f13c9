//! Recording adapters for in-process clusters and tests

use crate::domain::{ConsensusMessage, Decision, InstanceId, ReplicaId, RoundNumber};
use crate::events::{LeaderChangedEvent, StateTransferRequest};
use crate::ports::{DecisionSink, StateTransferGateway, TimeoutScheduler, Transport};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Keeps every outbound message instead of sending it
#[derive(Default)]
pub struct RecordingTransport {
    sent: RwLock<Vec<(Vec<ReplicaId>, ConsensusMessage)>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(Vec<ReplicaId>, ConsensusMessage)> {
        self.sent.read().clone()
    }

    /// Remove and return everything recorded so far
    pub fn take(&self) -> Vec<(Vec<ReplicaId>, ConsensusMessage)> {
        std::mem::take(&mut *self.sent.write())
    }
}

impl Transport for RecordingTransport {
    fn send(&self, targets: &[ReplicaId], msg: ConsensusMessage) {
        self.sent.write().push((targets.to_vec(), msg));
    }
}

#[derive(Default)]
pub struct RecordingDecisions {
    decisions: RwLock<Vec<Decision>>,
    leader_changes: RwLock<Vec<LeaderChangedEvent>>,
}

impl RecordingDecisions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decisions(&self) -> Vec<Decision> {
        self.decisions.read().clone()
    }

    pub fn decision_count(&self) -> usize {
        self.decisions.read().len()
    }

    pub fn leader_changes(&self) -> Vec<LeaderChangedEvent> {
        self.leader_changes.read().clone()
    }
}

impl DecisionSink for RecordingDecisions {
    fn on_decided(&self, decision: Decision) {
        self.decisions.write().push(decision);
    }

    fn on_leader_changed(&self, event: LeaderChangedEvent) {
        self.leader_changes.write().push(event);
    }
}

/// Timers that only fire when the test says so
#[derive(Default)]
pub struct ManualTimers {
    scheduled: RwLock<BTreeSet<(InstanceId, RoundNumber)>>,
}

impl ManualTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_scheduled(&self, instance: InstanceId, round: RoundNumber) -> bool {
        self.scheduled.read().contains(&(instance, round))
    }

    pub fn scheduled(&self) -> Vec<(InstanceId, RoundNumber)> {
        self.scheduled.read().iter().copied().collect()
    }
}

impl TimeoutScheduler for ManualTimers {
    fn schedule(&self, instance: InstanceId, round: RoundNumber, _after: Duration) {
        self.scheduled.write().insert((instance, round));
    }

    fn cancel(&self, instance: InstanceId, round: RoundNumber) {
        self.scheduled.write().remove(&(instance, round));
    }
}

/// State transfer stub that records requests
#[derive(Default)]
pub struct RecordingStateTransfer {
    retrieving: AtomicBool,
    requests: RwLock<Vec<StateTransferRequest>>,
}

impl RecordingStateTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_retrieving(&self, retrieving: bool) {
        self.retrieving.store(retrieving, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<StateTransferRequest> {
        self.requests.read().clone()
    }
}

impl StateTransferGateway for RecordingStateTransfer {
    fn is_retrieving_state(&self) -> bool {
        self.retrieving.load(Ordering::SeqCst)
    }

    fn request_state_transfer(&self, request: StateTransferRequest) {
        self.requests.write().push(request);
    }
}
