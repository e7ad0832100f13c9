//! # Recovery
//!
//! Lagging replicas, state transfer, stop/restart and membership changes.

#[cfg(test)]
mod tests {
    use crate::integration::harness::{batch, vote, Cluster};
    use quorra_consensus::{
        ConsensusConfig, ConsensusError, MembershipView, MessageKind, ProcessOutcome,
    };

    #[test]
    fn test_lagging_replica_catches_up_through_state_transfer() {
        let cluster = Cluster::with_config(4, 1, |config| ConsensusConfig {
            high_mark: 4,
            revival_high_mark: 3,
            ..config
        });
        cluster.crash(3);
        for tag in 0..6u8 {
            cluster.node_ref(0).manager.propose(batch(tag)).unwrap();
            cluster.run();
        }
        assert_eq!(cluster.node_ref(1).manager.last_decided(), Some(5));

        cluster.revive(3);
        assert_eq!(cluster.node_ref(0).manager.propose(batch(6)).unwrap(), 6);
        cluster.run();

        let lagging = cluster.node_ref(3);
        let requests = lagging.state_transfer.requests();
        assert!(!requests.is_empty());
        assert!(requests
            .iter()
            .all(|r| r.observed_instance == 6 && r.last_decided.is_none()));
        assert!(lagging.decided().is_empty());
        assert!(lagging.outbox.lock().is_empty());
        assert!(lagging.manager.stats().out_of_context > 0);

        // The application installed a snapshot through instance 5
        lagging.manager.on_state_installed(5);
        let decided: Vec<u64> = lagging.decided().iter().map(|d| d.instance).collect();
        assert_eq!(decided, vec![6]);
        assert_eq!(lagging.decision_for(6).unwrap().value, batch(6));

        cluster.node_ref(0).manager.propose(batch(7)).unwrap();
        cluster.run();
        for node in &cluster.nodes {
            assert_eq!(node.manager.last_decided(), Some(7));
        }
        assert_eq!(lagging.sent(MessageKind::Write, 7).len(), 1);
        cluster.assert_agreement();
    }

    #[test]
    fn test_long_run_keeps_only_retention_window() {
        let cluster = Cluster::new(4, 1);
        for tag in 0..8u8 {
            cluster.node_ref(0).manager.propose(batch(tag)).unwrap();
            cluster.run();
        }
        for node in &cluster.nodes {
            let stats = node.manager.stats();
            assert_eq!(stats.last_decided, Some(7));
            assert_eq!(stats.decisions, 8);
            assert_eq!(stats.live_instances, 3);
            assert!(node.manager.instance(4).is_none());
            assert!(node.manager.instance(5).is_some());
        }
    }

    #[test]
    fn test_stopped_replica_replays_after_restart() {
        let cluster = Cluster::new(4, 1);
        let value = batch(11);
        cluster.node_ref(2).manager.stop();
        cluster.node_ref(0).manager.propose(value.clone()).unwrap();
        cluster.run();

        let stopped = cluster.node_ref(2);
        assert!(stopped.manager.is_stopped());
        assert!(stopped.decided().is_empty());
        assert!(stopped.outbox.lock().is_empty());
        assert!(stopped.manager.stats().stopped_queue > 0);
        for id in [0, 1, 3] {
            assert_eq!(cluster.node_ref(id).decision_for(0).unwrap().value, value);
        }

        stopped.manager.restart();
        cluster.run();
        assert_eq!(stopped.decision_for(0).unwrap().value, value);
        assert_eq!(stopped.manager.stats().stopped_queue, 0);
        assert_eq!(stopped.sent(MessageKind::Write, 0).len(), 1);
    }

    #[test]
    fn test_view_change_shrinks_quorum_and_remaps_votes() {
        let cluster = Cluster::new(5, 1);
        cluster.crash(4);
        cluster.hold(3);
        let value = batch(21);
        cluster.node_ref(0).manager.propose(value.clone()).unwrap();
        cluster.run();

        // Three WRITEs out of a 5-member view: one short of the quorum of 4
        for id in 0..3 {
            let node = cluster.node_ref(id);
            assert!(node.decided().is_empty());
            assert!(node.sent(MessageKind::Accept, 0).is_empty());
        }

        let view = MembershipView::new(1, vec![0, 1, 2, 3], 1);
        for id in 0..4 {
            cluster.node_ref(id).manager.install_view(view.clone());
        }
        {
            let instance = cluster.node_ref(1).manager.instance(0).unwrap();
            let guard = instance.lock();
            let round = guard.round(0).unwrap();
            assert_eq!(round.view().len(), 4);
            assert_eq!(
                round.count_write(&quorra_consensus::adapters::keccak256(&value)),
                3
            );
        }

        cluster.release(3);
        cluster.run();
        for id in 0..4 {
            let node = cluster.node_ref(id);
            assert_eq!(node.decision_for(0).unwrap().value, value);
            assert_eq!(node.manager.stats().view, 1);
        }

        let outsider = vote(MessageKind::Write, 1, 0, 4, &batch(1));
        assert!(matches!(
            cluster.inject(1, outsider),
            ProcessOutcome::Rejected(ConsensusError::UnknownReplica(4))
        ));
    }
}
