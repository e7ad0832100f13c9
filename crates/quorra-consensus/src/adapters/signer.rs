//! secp256k1 ECDSA signer with a static key registry

use crate::domain::{ConsensusError, ConsensusResult, ReplicaId};
use crate::ports::MessageSigner;
use k256::ecdsa::{
    signature::{Signer, Verifier},
    Signature, SigningKey, VerifyingKey,
};
use sha3::{Digest as _, Keccak256};
use std::collections::HashMap;
use std::sync::Arc;

/// Public keys of every replica, shared by all signers of a cluster.
#[derive(Clone, Debug, Default)]
pub struct KeyRegistry {
    keys: HashMap<ReplicaId, VerifyingKey>,
}

impl KeyRegistry {
    pub fn insert(&mut self, replica: ReplicaId, key: VerifyingKey) {
        self.keys.insert(replica, key);
    }

    pub fn get(&self, replica: ReplicaId) -> Option<&VerifyingKey> {
        self.keys.get(&replica)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

pub struct K256Signer {
    replica: ReplicaId,
    key: SigningKey,
    registry: Arc<KeyRegistry>,
}

impl K256Signer {
    pub fn new(replica: ReplicaId, key: SigningKey, registry: Arc<KeyRegistry>) -> Self {
        Self {
            replica,
            key,
            registry,
        }
    }

    /// Deterministic key for `replica` derived from a cluster seed.
    pub fn derive_key(seed: &[u8], replica: ReplicaId) -> ConsensusResult<SigningKey> {
        let mut hasher = Keccak256::new();
        hasher.update(seed);
        hasher.update(replica.to_be_bytes());
        let bytes: [u8; 32] = hasher.finalize().into();
        SigningKey::from_bytes((&bytes).into())
            .map_err(|err| ConsensusError::Signing(err.to_string()))
    }

    /// One signer per replica, all sharing a registry of each other's keys.
    pub fn cluster(seed: &[u8], replicas: &[ReplicaId]) -> ConsensusResult<Vec<K256Signer>> {
        let keys = replicas
            .iter()
            .map(|id| Self::derive_key(seed, *id).map(|key| (*id, key)))
            .collect::<ConsensusResult<Vec<_>>>()?;
        let mut registry = KeyRegistry::default();
        for (id, key) in &keys {
            registry.insert(*id, *key.verifying_key());
        }
        let registry = Arc::new(registry);
        Ok(keys
            .into_iter()
            .map(|(id, key)| K256Signer::new(id, key, registry.clone()))
            .collect())
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }
}

impl MessageSigner for K256Signer {
    fn sign(&self, payload: &[u8]) -> ConsensusResult<Vec<u8>> {
        let signature: Signature = self
            .key
            .try_sign(payload)
            .map_err(|err| ConsensusError::Signing(err.to_string()))?;
        Ok(signature.to_bytes().to_vec())
    }

    fn verify(&self, replica: ReplicaId, payload: &[u8], signature: &[u8]) -> bool {
        let Some(key) = self.registry.get(replica) else {
            return false;
        };
        match Signature::from_slice(signature) {
            Ok(signature) => key.verify(payload, &signature).is_ok(),
            Err(_) => false,
        }
    }
}
