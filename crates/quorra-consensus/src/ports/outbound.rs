//! Driven ports (outbound dependencies)
//!
//! The engine calls these from the protocol path, so implementations must not
//! block: queue the work and return.

use crate::domain::{
    Batch, CollectPayload, ConsensusMessage, ConsensusResult, Decision, Digest, InstanceId,
    ReplicaId, RoundNumber,
};
use crate::events::{LeaderChangedEvent, StateTransferRequest};
use std::time::Duration;

/// Fire-and-forget delivery of protocol messages.
///
/// Delivery is not guaranteed. Sending to this replica's own id must loop the
/// message back into its inbound path.
pub trait Transport: Send + Sync {
    fn send(&self, targets: &[ReplicaId], msg: ConsensusMessage);
}

/// Validity oracle for proposed values
pub trait BatchValidator: Send + Sync {
    fn compute_hash(&self, value: &[u8]) -> Digest;

    /// Decoded batch, or `None` when the leader proposed garbage.
    fn check_proposed_value(&self, value: &[u8]) -> Option<Batch>;
}

/// Source of values to propose
pub trait BatchProvider: Send + Sync {
    /// Next encoded batch, or `None` when nothing is pending.
    fn next_batch(&self) -> Option<Vec<u8>>;
}

/// State transfer hooks of the upper layer
pub trait StateTransferGateway: Send + Sync {
    fn is_retrieving_state(&self) -> bool;

    fn request_state_transfer(&self, request: StateTransferRequest);
}

/// Decision upcall
pub trait DecisionSink: Send + Sync {
    /// Called exactly once per decided instance.
    fn on_decided(&self, decision: Decision);

    fn on_leader_changed(&self, _event: LeaderChangedEvent) {}
}

/// Per-round timers
pub trait TimeoutScheduler: Send + Sync {
    fn schedule(&self, instance: InstanceId, round: RoundNumber, after: Duration);

    fn cancel(&self, instance: InstanceId, round: RoundNumber);
}

/// Detached signatures over canonical payload bytes
pub trait MessageSigner: Send + Sync {
    fn sign(&self, payload: &[u8]) -> ConsensusResult<Vec<u8>>;

    fn verify(&self, replica: ReplicaId, payload: &[u8], signature: &[u8]) -> bool;
}

/// A COLLECT waiting for its signature
#[derive(Clone, Debug)]
pub struct SigningJob {
    pub targets: Vec<ReplicaId>,
    pub payload: CollectPayload,
}

/// Signs COLLECT payloads and hands the signed messages to the transport.
pub trait SigningSink: Send + Sync {
    fn submit(&self, job: SigningJob) -> ConsensusResult<()>;
}
