//! Published events (outgoing)

use crate::domain::{InstanceId, ReplicaId, RoundNumber};
use serde::{Deserialize, Serialize};

/// Raised when the replica should evaluate fetching state from its peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransferRequest {
    /// Local last decided instance at the time of the request
    pub last_decided: Option<InstanceId>,
    /// Instance of the message that revealed the gap
    pub observed_instance: InstanceId,
    /// Replica that sent that message
    pub observed_sender: ReplicaId,
}

/// A new round was opened for an instance after its previous round froze.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderChangedEvent {
    pub instance: InstanceId,
    pub round: RoundNumber,
    pub previous_leader: ReplicaId,
    pub leader: ReplicaId,
}
