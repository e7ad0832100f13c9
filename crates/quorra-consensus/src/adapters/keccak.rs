//! Keccak-256 hashing and batch validation

use crate::domain::{Batch, Digest};
use crate::ports::BatchValidator;
use sha3::{Digest as _, Keccak256};
use tracing::debug;

pub fn keccak256(bytes: &[u8]) -> Digest {
    Keccak256::digest(bytes).into()
}

/// Accepts any well-formed [`Batch`] up to `max_commands` commands.
#[derive(Clone, Debug)]
pub struct KeccakBatchValidator {
    max_commands: usize,
}

impl KeccakBatchValidator {
    pub fn new(max_commands: usize) -> Self {
        Self { max_commands }
    }
}

impl Default for KeccakBatchValidator {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl BatchValidator for KeccakBatchValidator {
    fn compute_hash(&self, value: &[u8]) -> Digest {
        keccak256(value)
    }

    fn check_proposed_value(&self, value: &[u8]) -> Option<Batch> {
        match Batch::decode(value) {
            Ok(batch) if batch.len() <= self.max_commands => Some(batch),
            Ok(batch) => {
                debug!(commands = batch.len(), max = self.max_commands, "Batch too large");
                None
            }
            Err(err) => {
                debug!(error = %err, "Undecodable batch");
                None
            }
        }
    }
}
