//! # Byzantine Behaviour
//!
//! One faulty replica out of four. Faulty replicas are crashed in the harness
//! so their own manager stays silent, and their traffic is hand-crafted.

#[cfg(test)]
mod tests {
    use crate::integration::harness::{batch, propose, vote, Cluster};
    use quorra_consensus::adapters::keccak256;
    use quorra_consensus::domain::{
        CollectPayload, FreezeProof, MessageProof, SignedCollect, WriteStamp,
    };
    use quorra_consensus::ports::MessageSigner;
    use quorra_consensus::{
        ConsensusError, ConsensusMessage, MessageKind, ProcessOutcome, ReplicaId,
    };

    /// COLLECT for round 1 of instance 0. With `bound` set the sender claims
    /// a round-0 WRITE quorum for those bytes.
    fn collect(
        cluster: &Cluster,
        signer: ReplicaId,
        sender: ReplicaId,
        bound: Option<&[u8]>,
    ) -> SignedCollect {
        let mut frozen = FreezeProof::empty(sender, 0, 0);
        if let Some(value) = bound {
            let stamp = WriteStamp::new(0, keccak256(value));
            frozen.quorum_write = Some(stamp);
            frozen.write_set = vec![stamp];
            frozen.value = Some(value.to_vec());
        }
        let payload = CollectPayload {
            instance: 0,
            round: 1,
            sender,
            frozen,
            later: None,
        };
        let signature = cluster.signers[signer as usize]
            .sign(&payload.signing_bytes().unwrap())
            .unwrap();
        SignedCollect { payload, signature }
    }

    /// Let replica 0 decide a value in round 0 of instance 0 with the help of
    /// faulty replica 3, while 1 and 2 never see an ACCEPT quorum. Replica 2
    /// hears nothing at all. Returns the decided value.
    fn decide_on_replica_zero_only(cluster: &Cluster) -> Vec<u8> {
        cluster.crash(3);
        let value = batch(1);
        cluster.node_ref(0).manager.propose(value.clone()).unwrap();

        // Leader's PROPOSE and WRITE reach replica 1 only, whose WRITE reaches 0 only
        for (_, msg) in cluster.take_sent(0) {
            cluster.inject(1, msg);
        }
        for (_, msg) in cluster.take_sent(1) {
            assert_eq!(msg.kind, MessageKind::Write);
            cluster.inject(0, msg);
        }
        for target in [0, 1] {
            cluster.inject(target, vote(MessageKind::Write, 0, 0, 3, &value));
        }

        // Only replica 0 gathers an ACCEPT quorum
        assert_eq!(cluster.take_sent(0)[0].1.kind, MessageKind::Accept);
        for (_, msg) in cluster.take_sent(1) {
            assert_eq!(msg.kind, MessageKind::Accept);
            cluster.inject(0, msg);
        }
        cluster.inject(0, vote(MessageKind::Accept, 0, 0, 3, &value));
        let decision = cluster.node_ref(0).decision_for(0).unwrap();
        assert_eq!((decision.round, decision.value.clone()), (0, value.clone()));
        cluster.take_sent(0);

        assert!(cluster.node_ref(1).decision_for(0).is_none());
        assert!(cluster.node_ref(2).decision_for(0).is_none());
        value
    }

    /// Replicas 1 and 2 time out on round 0 with replica 3 joining the freeze,
    /// and 3 hands the new leader `faulty` as its COLLECT.
    fn change_leader_with(cluster: &Cluster, faulty: SignedCollect) {
        for id in [1, 2] {
            cluster.node_ref(id).manager.on_round_timeout(0, 0);
        }
        for target in 0..3 {
            cluster.inject(target, ConsensusMessage::freeze(0, 0, 3));
        }
        assert!(matches!(
            cluster.inject(1, ConsensusMessage::collect(faulty)),
            ProcessOutcome::Processed
        ));
        cluster.run();
    }

    fn assert_decided_in_round_one(cluster: &Cluster, value: &[u8]) {
        for id in [1, 2] {
            let decision = cluster.node_ref(id).decision_for(0).unwrap();
            assert_eq!(decision.round, 1, "replica {id}");
            assert_eq!(decision.value, value, "replica {id}");
        }
        cluster.assert_agreement();
    }

    /// Move replicas 1..=3 of `cluster` into round 1 of instance 0 led by 1.
    fn enter_round_one(cluster: &Cluster) {
        cluster.crash(0);
        for id in 1..=3 {
            cluster.node_ref(id).manager.on_round_timeout(0, 0);
        }
        // Freezes only; collects go to replica 1 which has no batch to propose
        cluster.run();
        for id in 1..=3 {
            assert_eq!(cluster.node_ref(id).manager.leader_of(0, 1), 1);
        }
    }

    #[test]
    fn test_equivocating_leader_cannot_split_decisions() {
        let cluster = Cluster::new(4, 1);
        cluster.crash(0);
        let (good, evil) = (batch(1), batch(2));

        for target in [1, 2] {
            cluster.inject(target, propose(0, 0, 0, good.clone()));
            cluster.inject(target, vote(MessageKind::Write, 0, 0, 0, &good));
        }
        cluster.inject(3, propose(0, 0, 0, evil.clone()));
        cluster.inject(3, vote(MessageKind::Write, 0, 0, 0, &evil));
        cluster.run();

        for target in [1, 2] {
            cluster.inject(target, vote(MessageKind::Accept, 0, 0, 0, &good));
        }
        cluster.run();

        for id in [1, 2] {
            let decision = cluster.node_ref(id).decision_for(0).unwrap();
            assert_eq!(decision.value, good);
        }
        // Replica 3 only ever held the other value's bytes
        let third = cluster.node_ref(3).decision_for(0);
        assert!(third.map_or(true, |d| d.value == good));
        cluster.assert_agreement();
    }

    #[test]
    fn test_wrong_votes_from_faulty_replica_are_outvoted() {
        let cluster = Cluster::new(4, 1);
        cluster.crash(3);
        let value = batch(7);
        cluster.node_ref(0).manager.propose(value.clone()).unwrap();
        for target in 0..3 {
            cluster.inject(target, vote(MessageKind::Write, 0, 0, 3, &batch(99)));
            cluster.inject(target, vote(MessageKind::Accept, 0, 0, 3, &batch(99)));
        }
        cluster.run();

        for id in 0..3 {
            assert_eq!(cluster.node_ref(id).decision_for(0).unwrap().value, value);
        }
    }

    #[test]
    fn test_duplicated_traffic_decides_each_instance_once() {
        let cluster = Cluster::new(4, 1);
        cluster.duplicate_deliveries(true);
        for tag in 0..4u8 {
            cluster.node_ref(0).manager.propose(batch(tag)).unwrap();
            cluster.run();
        }
        for node in &cluster.nodes {
            let instances: Vec<u64> = node.decided().iter().map(|d| d.instance).collect();
            assert_eq!(instances, vec![0, 1, 2, 3]);
        }
        cluster.assert_agreement();
    }

    #[test]
    fn test_repeated_vote_counts_once() {
        let cluster = Cluster::new(4, 1);
        cluster.crash(2);
        cluster.crash(3);
        let value = batch(3);
        cluster.node_ref(0).manager.propose(value.clone()).unwrap();
        cluster.run();
        // Two live replicas: one vote short of a quorum however often 0 repeats itself
        for _ in 0..5 {
            cluster.inject(1, vote(MessageKind::Write, 0, 0, 0, &value));
        }
        cluster.run();
        assert!(cluster.node_ref(1).decided().is_empty());
        assert!(cluster.node_ref(1).sent(MessageKind::Accept, 0).is_empty());
    }

    #[test]
    fn test_forged_collect_signature_rejected() {
        let cluster = Cluster::new(4, 1);
        enter_round_one(&cluster);
        let value = batch(8);
        // Replica 3 signs in the name of replica 0
        let collects = vec![
            collect(&cluster, 1, 1, None),
            collect(&cluster, 2, 2, None),
            collect(&cluster, 3, 0, None),
        ];
        let msg = ConsensusMessage::propose(
            0,
            1,
            1,
            value,
            Some(MessageProof::LeaderChange(collects)),
        );
        assert!(cluster.inject(2, msg).is_rejected());
        assert!(cluster.node_ref(2).sent(MessageKind::Write, 0).is_empty());
    }

    #[test]
    fn test_leader_must_carry_the_bound_value() {
        let cluster = Cluster::new(4, 1);
        enter_round_one(&cluster);
        let bound = batch(5);
        let collects = vec![
            collect(&cluster, 1, 1, Some(bound.as_slice())),
            collect(&cluster, 2, 2, Some(bound.as_slice())),
            collect(&cluster, 3, 3, Some(bound.as_slice())),
        ];

        let swapped = ConsensusMessage::propose(
            0,
            1,
            1,
            batch(6),
            Some(MessageProof::LeaderChange(collects.clone())),
        );
        assert!(matches!(
            cluster.inject(3, swapped),
            ProcessOutcome::Rejected(ConsensusError::InvalidProof { .. })
        ));

        let honest = ConsensusMessage::propose(
            0,
            1,
            1,
            bound.clone(),
            Some(MessageProof::LeaderChange(collects)),
        );
        assert!(matches!(cluster.inject(3, honest), ProcessOutcome::Processed));
        cluster.run();
        assert_eq!(cluster.node_ref(3).sent(MessageKind::Write, 0).len(), 1);
    }

    #[test]
    fn test_round_one_proposal_from_wrong_replica_rejected() {
        let cluster = Cluster::new(4, 1);
        enter_round_one(&cluster);
        let collects = vec![
            collect(&cluster, 1, 1, None),
            collect(&cluster, 2, 2, None),
            collect(&cluster, 3, 3, None),
        ];
        let msg = ConsensusMessage::propose(
            0,
            1,
            3,
            batch(4),
            Some(MessageProof::LeaderChange(collects)),
        );
        assert!(matches!(
            cluster.inject(2, msg),
            ProcessOutcome::Rejected(ConsensusError::NotLeader { sender: 3, leader: 1, .. })
        ));
    }

    #[test]
    fn test_lying_collect_cannot_override_decided_value() {
        let cluster = Cluster::new(4, 1);
        let decided = decide_on_replica_zero_only(&cluster);
        let lie = batch(2);
        change_leader_with(&cluster, collect(&cluster, 3, 3, Some(lie.as_slice())));

        assert_decided_in_round_one(&cluster, &decided);
        // Replica 0 backed its own value in the new round
        assert_eq!(cluster.node_ref(0).sent(MessageKind::Write, 0).len(), 2);
    }

    #[test]
    fn test_empty_collect_cannot_free_decided_value() {
        let cluster = Cluster::new(4, 1);
        let decided = decide_on_replica_zero_only(&cluster);
        cluster.node_ref(1).batches.submit(b"must not win".to_vec());
        change_leader_with(&cluster, collect(&cluster, 3, 3, None));

        assert_decided_in_round_one(&cluster, &decided);
    }
}
