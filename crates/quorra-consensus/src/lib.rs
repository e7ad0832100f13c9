//! # quorra-consensus
//!
//! Byzantine fault tolerant consensus execution engine for a replica group of
//! `N >= 3f + 1` members.
//!
//! ## Architecture
//!
//! Each consensus instance agrees on one value (a batch of commands) through
//! rounds of PROPOSE → WRITE → ACCEPT. A round that stalls is frozen and the
//! next replica in view order takes over with the signed COLLECT evidence of
//! more than `2f` replicas:
//!
//! ```text
//!  network/timers ──► ReplicaRunner (one queue per replica)
//!                          │
//!                          ▼
//!                   ExecutionManager ── admission, buffers, stop/restart
//!                     │          │
//!                     ▼          ▼
//!                 Acceptor   Synchronizer
//!                     │
//!                     ▼
//!        ConsensusInstance ─► Round (vote tables by view slot)
//! ```
//!
//! Everything the engine needs from its environment is a port
//! ([`ports::Transport`], [`ports::BatchValidator`], [`ports::DecisionSink`],
//! ...). The adapters module carries Keccak validation, secp256k1 signing,
//! tokio timers and an in-process network.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use quorra_consensus::{ConsensusConfig, ExecutionManager, ManagerPorts};
//!
//! let manager = ExecutionManager::new(ConsensusConfig::for_cluster(0, 4, 1), ports)?;
//! manager.propose(batch)?;
//! let outcome = manager.deliver(message_from_peer);
//! ```

pub mod acceptor;
pub mod adapters;
pub mod domain;
pub mod events;
pub mod manager;
pub mod metrics;
pub mod ports;
pub mod runner;
pub mod synchronizer;

// Re-export main types
pub use acceptor::{Acceptor, Action};
pub use domain::{
    Batch, ConsensusConfig, ConsensusError, ConsensusInstance, ConsensusMessage, ConsensusResult,
    Decision, Digest, InstanceId, LeaderModule, MembershipView, MessageKind, QuorumCalculator,
    ReplicaId, RoundNumber,
};
pub use events::{LeaderChangedEvent, ReplicaInput, StateTransferRequest};
pub use manager::{Admission, ExecutionManager, ManagerPorts, ManagerStats, ProcessOutcome};
pub use ports::ConsensusApi;
pub use runner::{ReplicaHandle, ReplicaRunner};
pub use synchronizer::Synchronizer;
