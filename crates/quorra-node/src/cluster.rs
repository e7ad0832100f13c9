//! Local replica cluster over the in-memory network.

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use quorra_consensus::adapters::{
    InMemoryNetwork, InlineSigning, K256Signer, KeccakBatchValidator, QueueBatchProvider,
    RecordingStateTransfer, SigningPool, TokioTimers,
};
use quorra_consensus::ports::{BatchProvider, DecisionSink, SigningSink};
use quorra_consensus::runner::DEFAULT_QUEUE_CAPACITY;
use quorra_consensus::{
    Batch, Decision, ExecutionManager, InstanceId, LeaderChangedEvent, ManagerPorts,
    ManagerStats, ReplicaHandle, ReplicaId, ReplicaRunner,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::NodeConfig;

/// Ordered log of the commands a replica has decided.
pub struct CommandLog {
    replica: ReplicaId,
    commands: Mutex<Vec<Vec<u8>>>,
    last_instance: Mutex<Option<InstanceId>>,
    applied: watch::Sender<usize>,
}

impl CommandLog {
    pub fn new(replica: ReplicaId) -> Self {
        let (applied, _) = watch::channel(0);
        Self {
            replica,
            commands: Mutex::new(Vec::new()),
            last_instance: Mutex::new(None),
            applied,
        }
    }

    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.commands.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.commands.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `count` commands are applied.
    pub async fn wait_for(&self, count: usize) -> Result<()> {
        let mut applied = self.applied.subscribe();
        applied
            .wait_for(|n| *n >= count)
            .await
            .map(|_| ())
            .map_err(|_| anyhow!("command log of replica {} closed", self.replica))
    }
}

impl DecisionSink for CommandLog {
    fn on_decided(&self, decision: Decision) {
        {
            let mut last = self.last_instance.lock();
            if last.is_some_and(|last| decision.instance <= last) {
                warn!(
                    replica = self.replica,
                    instance = decision.instance,
                    "Decision delivered twice, ignoring"
                );
                return;
            }
            *last = Some(decision.instance);
        }
        let batch = match Batch::decode(&decision.value) {
            Ok(batch) => batch,
            Err(err) => {
                warn!(replica = self.replica, instance = decision.instance, error = %err, "Decided value is not a batch");
                return;
            }
        };
        debug!(
            replica = self.replica,
            instance = decision.instance,
            round = decision.round,
            commands = batch.len(),
            "Applying decided batch"
        );
        let total = {
            let mut commands = self.commands.lock();
            commands.extend(batch.commands);
            commands.len()
        };
        self.applied.send_replace(total);
    }

    fn on_leader_changed(&self, event: LeaderChangedEvent) {
        info!(
            replica = self.replica,
            instance = event.instance,
            round = event.round,
            leader = event.leader,
            "Leader changed"
        );
    }
}

struct LocalReplica {
    handle: ReplicaHandle,
    log: Arc<CommandLog>,
    runner: JoinHandle<()>,
    background: Vec<JoinHandle<()>>,
}

/// A running cluster of `config.replicas` replicas inside this process.
pub struct LocalCluster {
    network: Arc<InMemoryNetwork>,
    batches: Arc<QueueBatchProvider>,
    replicas: Vec<LocalReplica>,
}

impl LocalCluster {
    /// Spawn every replica. Must be called from within a tokio runtime.
    pub fn start(config: &NodeConfig) -> Result<Self> {
        config.validate()?;
        let ids = config.replica_ids();
        let signers = K256Signer::cluster(config.key_seed.as_bytes(), &ids)
            .context("Failed to derive replica keys")?;
        let network = Arc::new(InMemoryNetwork::new());
        let batches = Arc::new(QueueBatchProvider::new(config.batch_size));

        let mut replicas = Vec::with_capacity(ids.len());
        for signer in signers {
            let id = signer.replica();
            let signer = Arc::new(signer);
            let (tx, rx) = mpsc::channel(DEFAULT_QUEUE_CAPACITY);
            network.register(id, tx.clone());

            let consensus = config.consensus_config(id);
            let mut background = Vec::new();
            let signing: Arc<dyn SigningSink> = if consensus.signing_workers == 0 {
                Arc::new(InlineSigning::new(signer.clone(), network.clone()))
            } else {
                let (pool, tasks) = SigningPool::spawn(
                    signer.clone(),
                    network.clone(),
                    consensus.signing_workers,
                    DEFAULT_QUEUE_CAPACITY,
                );
                background.extend(tasks);
                Arc::new(pool)
            };

            let log = Arc::new(CommandLog::new(id));
            let ports = ManagerPorts {
                transport: network.clone(),
                validator: Arc::new(KeccakBatchValidator::new(config.batch_size)),
                batches: batches.clone(),
                state_transfer: Arc::new(RecordingStateTransfer::new()),
                decisions: log.clone(),
                timers: Arc::new(TokioTimers::new(tx.clone())),
                signer,
                signing,
            };
            let manager = Arc::new(
                ExecutionManager::new(consensus, ports)
                    .with_context(|| format!("Failed to build replica {id}"))?,
            );
            let runner = ReplicaRunner::new(manager.clone(), rx).spawn();
            replicas.push(LocalReplica {
                handle: ReplicaHandle::new(tx, manager),
                log,
                runner,
                background,
            });
        }

        info!(replicas = replicas.len(), faults = config.faults, "Local cluster started");
        Ok(Self {
            network,
            batches,
            replicas,
        })
    }

    pub fn submit(&self, command: Vec<u8>) {
        self.batches.submit(command);
    }

    pub fn pending(&self) -> usize {
        self.batches.pending()
    }

    /// Hand the next batch to every replica; only the current leader proposes it.
    ///
    /// Leaders pull further batches on their own after each decision, so this
    /// is only needed when the cluster went idle with an empty queue.
    pub async fn kick(&self) -> Result<bool> {
        let Some(batch) = self.batches.next_batch() else {
            return Ok(false);
        };
        for replica in &self.replicas {
            replica.handle.propose(batch.clone()).await?;
        }
        Ok(true)
    }

    /// Wait until every replica applied `count` commands.
    pub async fn wait_for_commands(&self, count: usize, timeout: Duration) -> Result<()> {
        let all = async {
            for replica in &self.replicas {
                replica.log.wait_for(count).await?;
            }
            Ok::<_, anyhow::Error>(())
        };
        tokio::time::timeout(timeout, all)
            .await
            .map_err(|_| anyhow!("replicas did not apply {count} commands within {timeout:?}"))?
    }

    /// Check that every replica applied the same commands in the same order.
    pub fn check_agreement(&self) -> Result<usize> {
        let Some(first) = self.replicas.first() else {
            return Ok(0);
        };
        let reference = first.log.commands();
        for replica in &self.replicas[1..] {
            let commands = replica.log.commands();
            let shared = reference.len().min(commands.len());
            if reference[..shared] != commands[..shared] {
                bail!(
                    "replica {} diverged from replica {}",
                    replica.handle.replica(),
                    first.handle.replica()
                );
            }
        }
        Ok(reference.len())
    }

    pub fn log(&self, replica: ReplicaId) -> Option<Arc<CommandLog>> {
        self.replicas
            .iter()
            .find(|r| r.handle.replica() == replica)
            .map(|r| r.log.clone())
    }

    pub fn stats(&self) -> Vec<ManagerStats> {
        self.replicas.iter().map(|r| r.handle.stats()).collect()
    }

    pub fn handle(&self, replica: ReplicaId) -> Option<&ReplicaHandle> {
        self.replicas
            .iter()
            .map(|r| &r.handle)
            .find(|h| h.replica() == replica)
    }

    /// Cut `replica` off the network in both directions.
    pub fn isolate(&self, replica: ReplicaId) {
        self.network.isolate(replica);
    }

    pub fn heal(&self, replica: ReplicaId) {
        self.network.heal(replica);
    }

    /// Messages the network dropped so far
    pub fn dropped_messages(&self) -> u64 {
        self.network.dropped()
    }

    pub async fn shutdown(self) -> Result<()> {
        for replica in &self.replicas {
            if let Err(err) = replica.handle.shutdown().await {
                debug!(replica = replica.handle.replica(), error = %err, "Runner already closed");
            }
        }
        for replica in self.replicas {
            replica.runner.await.context("Replica runner panicked")?;
            for task in replica.background {
                task.abort();
            }
        }
        info!("Local cluster stopped");
        Ok(())
    }
}
