//! Error types for the consensus engine
//!
//! Protocol violations are reported through these variants and logged by the
//! manager. None of them are fatal to the replica: safety comes from quorum
//! counting, not from trusting any single sender.

use super::{InstanceId, MessageKind, ReplicaId, RoundNumber};

/// Consensus error types
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("Sender {sender} is not the leader of instance {instance} round {round} (leader is {leader})")]
    NotLeader {
        instance: InstanceId,
        round: RoundNumber,
        sender: ReplicaId,
        leader: ReplicaId,
    },

    #[error("Sender {0} is not a member of the current view")]
    UnknownReplica(ReplicaId),

    #[error("Message {kind:?} for instance {instance} is missing a value")]
    MissingValue {
        kind: MessageKind,
        instance: InstanceId,
    },

    #[error("Proposal for instance {instance} round {round} carries no leader-change proof")]
    MissingProof {
        instance: InstanceId,
        round: RoundNumber,
    },

    #[error("Invalid leader-change proof for instance {instance} round {round}: {reason}")]
    InvalidProof {
        instance: InstanceId,
        round: RoundNumber,
        reason: String,
    },

    #[error("Signature verification failed for replica {0}")]
    SignatureVerificationFailed(ReplicaId),

    #[error("Proposed value for instance {0} failed validation")]
    InvalidProposal(InstanceId),

    #[error("Round {round} of instance {instance} is frozen")]
    RoundFrozen {
        instance: InstanceId,
        round: RoundNumber,
    },

    #[error("Round {round} of instance {instance} is too far ahead of round {current}")]
    RoundOutOfWindow {
        instance: InstanceId,
        round: RoundNumber,
        current: RoundNumber,
    },

    #[error("Instance {instance} is stale (last decided {last_decided})")]
    StaleInstance {
        instance: InstanceId,
        last_decided: InstanceId,
    },

    #[error("This replica is not the leader of instance {0}")]
    NotOurTurn(InstanceId),

    #[error("A value was already proposed for instance {0}")]
    AlreadyProposed(InstanceId),

    #[error("Execution manager is stopped")]
    Stopped,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Replica runner is closed")]
    RunnerClosed,
}

impl ConsensusError {
    /// Short label for the rejected-messages metric
    pub fn label(&self) -> &'static str {
        match self {
            ConsensusError::NotLeader { .. } => "not_leader",
            ConsensusError::UnknownReplica(_) => "unknown_replica",
            ConsensusError::MissingValue { .. } => "missing_value",
            ConsensusError::MissingProof { .. } => "missing_proof",
            ConsensusError::InvalidProof { .. } => "invalid_proof",
            ConsensusError::SignatureVerificationFailed(_) => "bad_signature",
            ConsensusError::InvalidProposal(_) => "invalid_proposal",
            ConsensusError::RoundFrozen { .. } => "round_frozen",
            ConsensusError::RoundOutOfWindow { .. } => "round_window",
            ConsensusError::StaleInstance { .. } => "stale",
            ConsensusError::NotOurTurn(_) => "not_our_turn",
            ConsensusError::AlreadyProposed(_) => "already_proposed",
            ConsensusError::Stopped => "stopped",
            ConsensusError::Serialization(_) => "serialization",
            ConsensusError::Signing(_) => "signing",
            ConsensusError::InvalidConfig(_) => "config",
            ConsensusError::RunnerClosed => "closed",
        }
    }
}

/// Result type for consensus operations
pub type ConsensusResult<T> = Result<T, ConsensusError>;

impl From<bincode::Error> for ConsensusError {
    fn from(err: bincode::Error) -> Self {
        ConsensusError::Serialization(err.to_string())
    }
}
