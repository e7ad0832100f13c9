//! Protocol messages and leader-change proofs
//!
//! Wire-format agnostic: the transport decides how to frame these, the engine
//! only relies on `bincode` when it needs canonical bytes to sign.

use super::{ConsensusResult, ReplicaId};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};

/// Consensus instance identifier (monotonically increasing)
pub type InstanceId = u64;

/// Round (epoch) number within an instance
pub type RoundNumber = u32;

/// 32-byte value digest
pub type Digest = [u8; 32];

/// Protocol message type
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageKind {
    Propose,
    Write,
    Accept,
    Decide,
    Freeze,
    Collect,
}

impl MessageKind {
    /// Label used for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Propose => "propose",
            MessageKind::Write => "write",
            MessageKind::Accept => "accept",
            MessageKind::Decide => "decide",
            MessageKind::Freeze => "freeze",
            MessageKind::Collect => "collect",
        }
    }
}

/// A protocol message bound to `(instance, round)`.
///
/// `value` holds the full batch for PROPOSE and the 32-byte digest for
/// WRITE, ACCEPT and DECIDE. FREEZE and COLLECT carry no value.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusMessage {
    pub kind: MessageKind,
    pub instance: InstanceId,
    pub round: RoundNumber,
    pub sender: ReplicaId,
    #[serde_as(as = "Option<Bytes>")]
    pub value: Option<Vec<u8>>,
    pub proof: Option<MessageProof>,
}

impl ConsensusMessage {
    pub fn propose(
        instance: InstanceId,
        round: RoundNumber,
        sender: ReplicaId,
        value: Vec<u8>,
        proof: Option<MessageProof>,
    ) -> Self {
        Self {
            kind: MessageKind::Propose,
            instance,
            round,
            sender,
            value: Some(value),
            proof,
        }
    }

    /// WRITE, ACCEPT or DECIDE carrying a digest
    pub fn vote(
        kind: MessageKind,
        instance: InstanceId,
        round: RoundNumber,
        sender: ReplicaId,
        digest: Digest,
    ) -> Self {
        Self {
            kind,
            instance,
            round,
            sender,
            value: Some(digest.to_vec()),
            proof: None,
        }
    }

    pub fn freeze(instance: InstanceId, round: RoundNumber, sender: ReplicaId) -> Self {
        Self {
            kind: MessageKind::Freeze,
            instance,
            round,
            sender,
            value: None,
            proof: None,
        }
    }

    pub fn collect(collect: SignedCollect) -> Self {
        Self {
            kind: MessageKind::Collect,
            instance: collect.payload.instance,
            round: collect.payload.round,
            sender: collect.payload.sender,
            value: None,
            proof: Some(MessageProof::Collect(collect)),
        }
    }

    /// Vote digest, if `value` is exactly 32 bytes
    pub fn digest(&self) -> Option<Digest> {
        self.value
            .as_deref()
            .and_then(|bytes| <Digest>::try_from(bytes).ok())
    }
}

/// Proof attached to a message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageProof {
    /// Carried by COLLECT
    Collect(SignedCollect),
    /// Carried by PROPOSE in a round above 0: the collects that elected the leader
    LeaderChange(Vec<SignedCollect>),
}

/// A round in which a digest was written or gathered a WRITE quorum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WriteStamp {
    pub round: RoundNumber,
    pub digest: Digest,
}

impl WriteStamp {
    pub fn new(round: RoundNumber, digest: Digest) -> Self {
        Self { round, digest }
    }
}

/// What one replica saw in an instance up to a frozen round.
///
/// `quorum_write` is the highest round in which the replica observed a WRITE
/// quorum. `write_set` lists, per digest, the latest round the replica wrote
/// it. `value` holds the bytes behind `quorum_write`, or the frozen round's
/// proposal when there is no quorum write.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezeProof {
    pub replica: ReplicaId,
    pub instance: InstanceId,
    pub round: RoundNumber,
    pub quorum_write: Option<WriteStamp>,
    pub write_set: Vec<WriteStamp>,
    #[serde_as(as = "Option<Bytes>")]
    pub value: Option<Vec<u8>>,
}

impl FreezeProof {
    /// Proof of a replica that saw nothing
    pub fn empty(replica: ReplicaId, instance: InstanceId, round: RoundNumber) -> Self {
        Self {
            replica,
            instance,
            round,
            quorum_write: None,
            write_set: Vec::new(),
            value: None,
        }
    }

    /// Whether the replica wrote `digest` in `round` or later
    pub fn wrote_since(&self, round: RoundNumber, digest: &Digest) -> bool {
        self.write_set
            .iter()
            .any(|stamp| stamp.round >= round && &stamp.digest == digest)
    }
}

/// Evidence sent to the leader of a new round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectPayload {
    pub instance: InstanceId,
    /// The round being started
    pub round: RoundNumber,
    pub sender: ReplicaId,
    /// Proof for `round - 1` of `instance`
    pub frozen: FreezeProof,
    /// Proof for the last round of `instance + 1`, when the sender already ran it
    pub later: Option<FreezeProof>,
}

impl CollectPayload {
    /// Canonical bytes covered by the detached signature
    pub fn signing_bytes(&self) -> ConsensusResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

/// A collect payload with its detached signature.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedCollect {
    pub payload: CollectPayload,
    #[serde_as(as = "Bytes")]
    pub signature: Vec<u8>,
}

impl SignedCollect {
    /// Payload awaiting a signature
    pub fn unsigned(payload: CollectPayload) -> Self {
        Self {
            payload,
            signature: Vec::new(),
        }
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }
}
