//! COLLECT signing: inline for deterministic runs, pooled for live replicas
//!
//! ```text
//! submit ──► jobs (bounded) ──► dispatcher ──► spawn_blocking(sign) ──┐
//!                                                                     ▼
//!                         transport ◄── forwarder ◄── results channel
//! ```

use crate::domain::{ConsensusError, ConsensusMessage, ConsensusResult, ReplicaId, SignedCollect};
use crate::ports::{MessageSigner, SigningJob, SigningSink, Transport};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

fn sign_job(signer: &dyn MessageSigner, job: SigningJob) -> ConsensusResult<(Vec<ReplicaId>, ConsensusMessage)> {
    let bytes = job.payload.signing_bytes()?;
    let signature = signer.sign(&bytes)?;
    let collect = SignedCollect {
        payload: job.payload,
        signature,
    };
    Ok((job.targets, ConsensusMessage::collect(collect)))
}

/// Signs on the caller's thread and sends immediately.
pub struct InlineSigning {
    signer: Arc<dyn MessageSigner>,
    transport: Arc<dyn Transport>,
}

impl InlineSigning {
    pub fn new(signer: Arc<dyn MessageSigner>, transport: Arc<dyn Transport>) -> Self {
        Self { signer, transport }
    }
}

impl SigningSink for InlineSigning {
    fn submit(&self, job: SigningJob) -> ConsensusResult<()> {
        let (targets, msg) = sign_job(self.signer.as_ref(), job)?;
        self.transport.send(&targets, msg);
        Ok(())
    }
}

/// Worker pool that signs off the protocol path.
pub struct SigningPool {
    jobs: mpsc::Sender<SigningJob>,
}

impl SigningPool {
    /// Start the pool on the current tokio runtime.
    ///
    /// Returns the pool and the handles of its dispatcher and forwarder tasks;
    /// both end once the pool is dropped and in-flight jobs are done.
    pub fn spawn(
        signer: Arc<dyn MessageSigner>,
        transport: Arc<dyn Transport>,
        workers: usize,
        capacity: usize,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (jobs_tx, mut jobs_rx) = mpsc::channel::<SigningJob>(capacity.max(1));
        let (results_tx, mut results_rx) = mpsc::unbounded_channel();
        let permits = Arc::new(Semaphore::new(workers.max(1)));

        let dispatcher = tokio::spawn(async move {
            while let Some(job) = jobs_rx.recv().await {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let signer = signer.clone();
                let results = results_tx.clone();
                tokio::task::spawn_blocking(move || {
                    let result = sign_job(signer.as_ref(), job);
                    drop(permit);
                    let _ = results.send(result);
                });
            }
            debug!("Signing dispatcher stopped");
        });

        let forwarder = tokio::spawn(async move {
            while let Some(result) = results_rx.recv().await {
                match result {
                    Ok((targets, msg)) => transport.send(&targets, msg),
                    Err(err) => warn!(error = %err, "Failed to sign collect"),
                }
            }
            debug!("Signing forwarder stopped");
        });

        (Self { jobs: jobs_tx }, vec![dispatcher, forwarder])
    }
}

impl SigningSink for SigningPool {
    fn submit(&self, job: SigningJob) -> ConsensusResult<()> {
        self.jobs.try_send(job).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => {
                ConsensusError::Signing("signing queue full".into())
            }
            mpsc::error::TrySendError::Closed(_) => ConsensusError::RunnerClosed,
        })
    }
}
