//! Round timers on the tokio runtime

use crate::domain::{InstanceId, RoundNumber};
use crate::events::ReplicaInput;
use crate::ports::TimeoutScheduler;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Each timer is a sleeping task that posts [`ReplicaInput::Timeout`] to the
/// replica's queue; cancelling aborts the task.
pub struct TokioTimers {
    inputs: mpsc::Sender<ReplicaInput>,
    timers: Mutex<HashMap<(InstanceId, RoundNumber), JoinHandle<()>>>,
}

impl TokioTimers {
    pub fn new(inputs: mpsc::Sender<ReplicaInput>) -> Self {
        Self {
            inputs,
            timers: Mutex::new(HashMap::new()),
        }
    }

    pub fn active(&self) -> usize {
        let mut timers = self.timers.lock();
        timers.retain(|_, handle| !handle.is_finished());
        timers.len()
    }
}

impl TimeoutScheduler for TokioTimers {
    fn schedule(&self, instance: InstanceId, round: RoundNumber, after: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(instance, round, "No runtime to schedule round timer on");
            return;
        };
        let inputs = self.inputs.clone();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(after).await;
            let _ = inputs.send(ReplicaInput::Timeout { instance, round }).await;
        });
        let mut timers = self.timers.lock();
        timers.retain(|_, handle| !handle.is_finished());
        if let Some(previous) = timers.insert((instance, round), handle) {
            previous.abort();
        }
    }

    fn cancel(&self, instance: InstanceId, round: RoundNumber) {
        if let Some(handle) = self.timers.lock().remove(&(instance, round)) {
            handle.abort();
        }
    }
}

impl Drop for TokioTimers {
    fn drop(&mut self) {
        for (_, handle) in self.timers.lock().drain() {
            handle.abort();
        }
    }
}
