//! Async replica runner
//!
//! One task per replica drains a bounded queue of [`ReplicaInput`] and feeds
//! the execution manager, so protocol processing for a replica is serialised.
//! Network receivers, timers and clients only ever touch the queue.

use crate::domain::{ConsensusError, ConsensusMessage, ConsensusResult, InstanceId, ReplicaId};
use crate::events::ReplicaInput;
use crate::manager::{ExecutionManager, ManagerStats};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Default depth of a replica's input queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 4_096;

pub struct ReplicaRunner {
    manager: Arc<ExecutionManager>,
    inputs: mpsc::Receiver<ReplicaInput>,
}

impl ReplicaRunner {
    pub fn new(manager: Arc<ExecutionManager>, inputs: mpsc::Receiver<ReplicaInput>) -> Self {
        Self { manager, inputs }
    }

    /// Consume inputs until `Shutdown` or until every sender is gone.
    pub async fn run(mut self) {
        let replica = self.manager.me();
        info!(replica, "Replica runner started");
        while let Some(input) = self.inputs.recv().await {
            if !self.handle(input) {
                break;
            }
        }
        info!(replica, stats = ?self.manager.stats(), "Replica runner stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    fn handle(&self, input: ReplicaInput) -> bool {
        let replica = self.manager.me();
        trace!(replica, input = input.label(), "Replica input");
        match input {
            ReplicaInput::Message(msg) => {
                let outcome = self.manager.deliver(msg);
                trace!(replica, ?outcome, "Message handled");
            }
            ReplicaInput::Timeout { instance, round } => {
                self.manager.on_round_timeout(instance, round)
            }
            ReplicaInput::Propose(value) => {
                if let Err(err) = self.manager.propose(value) {
                    debug!(replica, error = %err, "Proposal not made");
                }
            }
            ReplicaInput::Stop => self.manager.stop(),
            ReplicaInput::Restart => self.manager.restart(),
            ReplicaInput::StateInstalled { upto } => self.manager.on_state_installed(upto),
            ReplicaInput::InstallView(view) => self.manager.install_view(view),
            ReplicaInput::Shutdown => return false,
        }
        true
    }
}

/// Cloneable front of a running replica
#[derive(Clone)]
pub struct ReplicaHandle {
    replica: ReplicaId,
    inputs: mpsc::Sender<ReplicaInput>,
    manager: Arc<ExecutionManager>,
}

impl ReplicaHandle {
    pub fn new(inputs: mpsc::Sender<ReplicaInput>, manager: Arc<ExecutionManager>) -> Self {
        Self {
            replica: manager.me(),
            inputs,
            manager,
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub async fn send(&self, input: ReplicaInput) -> ConsensusResult<()> {
        self.inputs
            .send(input)
            .await
            .map_err(|_| ConsensusError::RunnerClosed)
    }

    pub async fn deliver(&self, msg: ConsensusMessage) -> ConsensusResult<()> {
        self.send(ReplicaInput::Message(msg)).await
    }

    pub async fn propose(&self, value: Vec<u8>) -> ConsensusResult<()> {
        self.send(ReplicaInput::Propose(value)).await
    }

    pub async fn shutdown(&self) -> ConsensusResult<()> {
        self.send(ReplicaInput::Shutdown).await
    }

    pub fn last_decided(&self) -> Option<InstanceId> {
        self.manager.last_decided()
    }

    pub fn stats(&self) -> ManagerStats {
        self.manager.stats()
    }
}
