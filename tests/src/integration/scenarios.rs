//! # Protocol Scenarios
//!
//! Normal-case agreement, replay of out-of-context traffic and leader change
//! on a 4-replica cluster tolerating one fault.

#[cfg(test)]
mod tests {
    use crate::integration::harness::{batch, Cluster};
    use quorra_consensus::domain::MessageProof;
    use quorra_consensus::{
        Batch, ConsensusError, ConsensusMessage, MessageKind, ProcessOutcome, QuorumCalculator,
    };

    #[test]
    fn test_normal_case_decides_once_everywhere() {
        let cluster = Cluster::new(4, 1);
        assert_eq!(QuorumCalculator::new(4, 1).quorum(), 3);
        cluster.install_state(4);

        let value = batch(5);
        assert_eq!(cluster.node_ref(0).manager.propose(value.clone()).unwrap(), 5);
        cluster.run();

        for node in &cluster.nodes {
            let decided = node.decided();
            assert_eq!(decided.len(), 1, "replica {} decided {:?}", node.id(), decided);
            assert_eq!(decided[0].instance, 5);
            assert_eq!(decided[0].round, 0);
            assert_eq!(decided[0].value, value);
            assert_eq!(node.sent(MessageKind::Write, 5).len(), 1);
            assert_eq!(node.sent(MessageKind::Accept, 5).len(), 1);
            assert_eq!(node.manager.last_decided(), Some(5));
            assert!(!node.timers.is_scheduled(5, 0));
        }
    }

    #[test]
    fn test_sequence_of_instances_through_batch_queue() {
        let cluster = Cluster::new(4, 1);
        let leader = cluster.node_ref(0);
        leader.manager.propose(batch(0)).unwrap();
        leader.batches.submit(b"queued".to_vec());
        cluster.run();

        // Instance 1 came from the leader's own queue after instance 0 decided
        for node in &cluster.nodes {
            assert_eq!(node.manager.last_decided(), Some(1));
            let second = node.decision_for(1).unwrap();
            assert_eq!(
                Batch::decode(&second.value).unwrap().commands,
                vec![b"queued".to_vec()]
            );
        }
        cluster.assert_agreement();
    }

    #[test]
    fn test_out_of_context_votes_decide_on_activation() {
        let cluster = Cluster::new(4, 1);
        cluster.install_state(5);
        cluster.hold(1);
        for tag in 6..=9u8 {
            let id = cluster.node_ref(0).manager.propose(batch(tag)).unwrap();
            assert_eq!(id, tag as u64);
            cluster.run();
        }
        assert_eq!(cluster.node_ref(2).manager.last_decided(), Some(9));
        assert_eq!(cluster.node_ref(1).manager.last_decided(), Some(5));

        // Instance 9 traffic first: nothing can happen yet
        let early = cluster.release_where(1, |msg| msg.instance == 9);
        assert!(!early.is_empty());
        assert!(early.iter().all(|o| matches!(o, ProcessOutcome::Buffered)));
        assert!(cluster.node_ref(1).transport.sent().is_empty());
        assert!(cluster.node_ref(1).manager.stats().out_of_context > 0);

        cluster.release(1);
        cluster.run();

        let node = cluster.node_ref(1);
        assert_eq!(node.manager.last_decided(), Some(9));
        let instances: Vec<u64> = node.decided().iter().map(|d| d.instance).collect();
        assert_eq!(instances, vec![6, 7, 8, 9]);
        assert_eq!(node.decision_for(9).unwrap().value, batch(9));
        // The buffered ACCEPT quorum decided it; no vote of our own was needed
        assert!(node.sent(MessageKind::Write, 9).is_empty());
        assert_eq!(node.manager.stats().out_of_context, 0);
        cluster.assert_agreement();
    }

    #[test]
    fn test_out_of_context_proposal_needs_valid_leader_change() {
        let cluster = Cluster::new(4, 1);
        cluster.install_state(5);
        cluster.hold(1);
        for tag in 6..=9u8 {
            cluster.node_ref(0).manager.propose(batch(tag)).unwrap();
            cluster.run();
        }

        // Replica 3 leads round 3 by rotation but has no collects to show
        let forged = ConsensusMessage::propose(
            9,
            3,
            3,
            batch(66),
            Some(MessageProof::LeaderChange(Vec::new())),
        );
        assert!(matches!(
            cluster.inject(1, forged),
            ProcessOutcome::Rejected(ConsensusError::InvalidProof { .. })
        ));

        cluster.release(1);
        cluster.run();

        let node = cluster.node_ref(1);
        assert_eq!(node.manager.last_decided(), Some(9));
        let decision = node.decision_for(9).unwrap();
        assert_eq!((decision.round, decision.value), (0, batch(9)));
        assert_eq!(node.manager.stats().out_of_context, 0);
        cluster.assert_agreement();
    }

    #[test]
    fn test_leader_change_after_timeout() {
        let cluster = Cluster::new(4, 1);
        cluster.install_state(4);
        cluster.crash(0);
        cluster.node_ref(1).batches.submit(b"fresh".to_vec());

        cluster.fire_timeout(5, 0);
        for id in 1..=3 {
            assert_eq!(cluster.node_ref(id).transport.sent().len(), 1);
        }
        cluster.run();

        for id in 1..=3 {
            let node = cluster.node_ref(id);
            assert_eq!(node.manager.leader_of(5, 1), 1);
            let changes = node.decisions.leader_changes();
            assert_eq!(changes.len(), 1);
            assert_eq!((changes[0].round, changes[0].previous_leader, changes[0].leader), (1, 0, 1));

            let collects: Vec<_> = node
                .outbox
                .lock()
                .iter()
                .filter(|(_, msg)| msg.kind == MessageKind::Collect)
                .cloned()
                .collect();
            assert_eq!(collects.len(), 1);
            assert_eq!(collects[0].0, vec![1]);

            let decision = node.decision_for(5).unwrap();
            assert_eq!(decision.round, 1);
            assert_eq!(
                Batch::decode(&decision.value).unwrap().commands,
                vec![b"fresh".to_vec()]
            );
        }
        assert!(cluster.node_ref(0).decided().is_empty());
    }

    #[test]
    fn test_leader_change_carries_written_value() {
        let cluster = Cluster::new(4, 1);
        let value = batch(42);
        cluster.node_ref(0).manager.propose(value.clone()).unwrap();
        // PROPOSE and the leader's WRITE arrive, then the leader dies and
        // every other WRITE is lost
        cluster.step();
        cluster.crash(0);
        for id in 1..=3 {
            assert_eq!(cluster.node_ref(id).transport.take().len(), 1);
        }

        cluster.node_ref(1).batches.submit(b"should not win".to_vec());
        cluster.fire_timeout(0, 0);
        cluster.run();

        for id in 1..=3 {
            let decision = cluster.node_ref(id).decision_for(0).unwrap();
            assert_eq!(decision.round, 1);
            assert_eq!(decision.value, value);
        }
        // The new leader keeps leading and only then serves its own queue
        for id in 1..=3 {
            let node = cluster.node_ref(id);
            assert_eq!(node.manager.leader_of(1, 0), 1);
            let next = node.decision_for(1).unwrap();
            assert_eq!(
                Batch::decode(&next.value).unwrap().commands,
                vec![b"should not win".to_vec()]
            );
        }
        cluster.assert_agreement();
    }
}
