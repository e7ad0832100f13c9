//! Batch provider fed from a command queue

use crate::domain::Batch;
use crate::ports::BatchProvider;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::warn;

/// Cuts pending client commands into batches of at most `max_batch` commands.
pub struct QueueBatchProvider {
    pending: Mutex<VecDeque<Vec<u8>>>,
    max_batch: usize,
}

impl QueueBatchProvider {
    pub fn new(max_batch: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            max_batch: max_batch.max(1),
        }
    }

    pub fn submit(&self, command: Vec<u8>) {
        self.pending.lock().push_back(command);
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

impl BatchProvider for QueueBatchProvider {
    fn next_batch(&self) -> Option<Vec<u8>> {
        let commands: Vec<Vec<u8>> = {
            let mut pending = self.pending.lock();
            if pending.is_empty() {
                return None;
            }
            let take = pending.len().min(self.max_batch);
            pending.drain(..take).collect()
        };
        match Batch::new(commands).encode() {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                warn!(error = %err, "Failed to encode batch");
                None
            }
        }
    }
}
