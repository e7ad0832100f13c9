//! Batch of client commands: the value agreed on by one instance

use super::ConsensusResult;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, Bytes};

#[serde_as]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    #[serde_as(as = "Vec<Bytes>")]
    pub commands: Vec<Vec<u8>>,
}

impl Batch {
    pub fn new(commands: Vec<Vec<u8>>) -> Self {
        Self { commands }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn encode(&self) -> ConsensusResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> ConsensusResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
