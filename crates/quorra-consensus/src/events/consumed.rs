//! Consumed events (incoming)
//!
//! Everything a replica reacts to goes through one queue, so protocol
//! processing is serialised per replica.

use crate::domain::{ConsensusMessage, InstanceId, MembershipView, RoundNumber};

#[derive(Clone, Debug)]
pub enum ReplicaInput {
    /// Protocol message from a peer (or from this replica to itself)
    Message(ConsensusMessage),
    /// Round timer expired
    Timeout {
        instance: InstanceId,
        round: RoundNumber,
    },
    /// Value to propose when this replica leads the next instance
    Propose(Vec<u8>),
    Stop,
    Restart,
    /// State transfer finished up to and including `upto`
    StateInstalled { upto: InstanceId },
    InstallView(MembershipView),
    Shutdown,
}

impl ReplicaInput {
    /// Label used in logs
    pub fn label(&self) -> &'static str {
        match self {
            ReplicaInput::Message(msg) => msg.kind.as_str(),
            ReplicaInput::Timeout { .. } => "timeout",
            ReplicaInput::Propose(_) => "propose_request",
            ReplicaInput::Stop => "stop",
            ReplicaInput::Restart => "restart",
            ReplicaInput::StateInstalled { .. } => "state_installed",
            ReplicaInput::InstallView(_) => "install_view",
            ReplicaInput::Shutdown => "shutdown",
        }
    }
}
