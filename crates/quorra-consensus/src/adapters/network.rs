//! In-process network connecting replica runners

use crate::domain::{ConsensusMessage, ReplicaId};
use crate::events::ReplicaInput;
use crate::ports::Transport;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::trace;

/// Delivers by `try_send` into each peer's input queue. A full queue drops
/// the message, like a lossy link would.
#[derive(Default)]
pub struct InMemoryNetwork {
    peers: RwLock<HashMap<ReplicaId, mpsc::Sender<ReplicaInput>>>,
    isolated: RwLock<HashSet<ReplicaId>>,
    dropped: AtomicU64,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, replica: ReplicaId, inputs: mpsc::Sender<ReplicaInput>) {
        self.peers.write().insert(replica, inputs);
    }

    /// Cut a replica off: nothing it sends or is sent arrives.
    pub fn isolate(&self, replica: ReplicaId) {
        self.isolated.write().insert(replica);
    }

    pub fn heal(&self, replica: ReplicaId) {
        self.isolated.write().remove(&replica);
    }

    /// Messages lost to full queues, isolation or unknown peers
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Transport for InMemoryNetwork {
    fn send(&self, targets: &[ReplicaId], msg: ConsensusMessage) {
        let isolated = self.isolated.read();
        if isolated.contains(&msg.sender) {
            self.dropped.fetch_add(targets.len() as u64, Ordering::Relaxed);
            return;
        }
        let peers = self.peers.read();
        for target in targets {
            let delivered = !isolated.contains(target)
                && peers
                    .get(target)
                    .is_some_and(|tx| tx.try_send(ReplicaInput::Message(msg.clone())).is_ok());
            if !delivered {
                trace!(target, kind = msg.kind.as_str(), "Message dropped");
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
