//! Driving ports (inbound API)

use crate::domain::{
    ConsensusMessage, ConsensusResult, InstanceId, MembershipView, RoundNumber,
};
use crate::manager::{ManagerStats, ProcessOutcome};
use async_trait::async_trait;

/// Primary consensus API of one replica
#[async_trait]
pub trait ConsensusApi: Send + Sync {
    /// Route a protocol message through admission and the acceptor
    async fn deliver(&self, msg: ConsensusMessage) -> ProcessOutcome;

    /// Propose `value` for the next instance if this replica leads it.
    ///
    /// Returns the instance the value was proposed for.
    async fn propose(&self, value: Vec<u8>) -> ConsensusResult<InstanceId>;

    async fn on_round_timeout(&self, instance: InstanceId, round: RoundNumber);

    /// Pause protocol processing (leader-change synchronisation, state installation)
    async fn stop(&self);

    /// Resume and replay what was queued while stopped
    async fn restart(&self);

    async fn on_state_installed(&self, upto: InstanceId);

    async fn install_view(&self, view: MembershipView);

    async fn last_decided(&self) -> Option<InstanceId>;

    async fn stats(&self) -> ManagerStats;
}
