//! Node configuration from environment variables.

use anyhow::{bail, Context, Result};
use quorra_consensus::{ConsensusConfig, ReplicaId};
use serde::Serialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeConfig {
    /// Cluster size
    pub replicas: usize,
    /// Tolerated Byzantine faults
    pub faults: usize,
    /// Demo commands submitted at startup
    pub commands: usize,
    /// Maximum commands per proposed batch
    pub batch_size: usize,
    pub round_timeout_ms: u64,
    /// Workers in each replica's signing pool; 0 signs inline
    pub signing_workers: usize,
    /// Seed the replica keys are derived from
    pub key_seed: String,
    /// Give up waiting for decisions after this long
    pub run_timeout_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            replicas: 4,
            faults: 1,
            commands: 64,
            batch_size: 16,
            round_timeout_ms: 2_000,
            signing_workers: 2,
            key_seed: "quorra-local".to_string(),
            run_timeout_secs: 30,
        }
    }
}

impl NodeConfig {
    /// Read `QUORRA_*` variables, falling back to defaults for unset ones.
    ///
    /// - `QUORRA_REPLICAS`, `QUORRA_FAULTS`
    /// - `QUORRA_COMMANDS`, `QUORRA_BATCH_SIZE`
    /// - `QUORRA_ROUND_TIMEOUT_MS`, `QUORRA_SIGNING_WORKERS`
    /// - `QUORRA_KEY_SEED`, `QUORRA_RUN_TIMEOUT_SECS`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let number = |key: &str, default: u64| -> Result<u64> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .with_context(|| format!("{key} must be a number, got {raw:?}")),
                None => Ok(default),
            }
        };

        let config = Self {
            replicas: number("QUORRA_REPLICAS", defaults.replicas as u64)? as usize,
            faults: number("QUORRA_FAULTS", defaults.faults as u64)? as usize,
            commands: number("QUORRA_COMMANDS", defaults.commands as u64)? as usize,
            batch_size: number("QUORRA_BATCH_SIZE", defaults.batch_size as u64)? as usize,
            round_timeout_ms: number("QUORRA_ROUND_TIMEOUT_MS", defaults.round_timeout_ms)?,
            signing_workers: number("QUORRA_SIGNING_WORKERS", defaults.signing_workers as u64)?
                as usize,
            key_seed: lookup("QUORRA_KEY_SEED").unwrap_or(defaults.key_seed),
            run_timeout_secs: number("QUORRA_RUN_TIMEOUT_SECS", defaults.run_timeout_secs)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.replicas < 3 * self.faults + 1 {
            bail!(
                "{} replicas cannot tolerate {} faults (need at least {})",
                self.replicas,
                self.faults,
                3 * self.faults + 1
            );
        }
        if self.batch_size == 0 {
            bail!("QUORRA_BATCH_SIZE must be positive");
        }
        if self.round_timeout_ms == 0 {
            bail!("QUORRA_ROUND_TIMEOUT_MS must be positive");
        }
        Ok(())
    }

    pub fn replica_ids(&self) -> Vec<ReplicaId> {
        (0..self.replicas as ReplicaId).collect()
    }

    /// Consensus configuration for one replica of this cluster.
    pub fn consensus_config(&self, replica: ReplicaId) -> ConsensusConfig {
        ConsensusConfig {
            round_timeout_ms: self.round_timeout_ms,
            signing_workers: self.signing_workers,
            ..ConsensusConfig::for_cluster(replica, self.replicas, self.faults)
        }
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}
