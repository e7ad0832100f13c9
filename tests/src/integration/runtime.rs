//! # Async Runtime
//!
//! Replica runners over the in-memory network, with tokio timers and the
//! signing pool doing real work.

#[cfg(test)]
mod tests {
    use quorra_consensus::ReplicaInput;
    use quorra_node::{LocalCluster, NodeConfig};
    use std::time::Duration;

    fn config(commands: usize, batch_size: usize, signing_workers: usize) -> NodeConfig {
        NodeConfig {
            commands,
            batch_size,
            signing_workers,
            round_timeout_ms: 2_000,
            ..NodeConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cluster_orders_every_command() {
        let config = config(40, 4, 2);
        let cluster = LocalCluster::start(&config).unwrap();
        for i in 0..config.commands {
            cluster.submit(format!("cmd-{i}").into_bytes());
        }
        assert!(cluster.kick().await.unwrap());
        cluster
            .wait_for_commands(config.commands, Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(cluster.check_agreement().unwrap(), config.commands);
        let expected: Vec<Vec<u8>> = (0..config.commands)
            .map(|i| format!("cmd-{i}").into_bytes())
            .collect();
        assert_eq!(cluster.log(3).unwrap().commands(), expected);
        assert_eq!(cluster.dropped_messages(), 0);
        cluster.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_isolated_leader_is_replaced() {
        let config = config(6, 2, 2);
        let cluster = LocalCluster::start(&config).unwrap();
        cluster.isolate(0);
        for i in 0..config.commands {
            cluster.submit(format!("cmd-{i}").into_bytes());
        }
        // The first batch goes to the isolated leader and is lost with it
        assert!(cluster.kick().await.unwrap());
        for id in 1..=3 {
            cluster
                .handle(id)
                .unwrap()
                .send(ReplicaInput::Timeout {
                    instance: 0,
                    round: 0,
                })
                .await
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(10), async {
            for id in 1..=3 {
                cluster.log(id).unwrap().wait_for(4).await.unwrap();
            }
        })
        .await
        .expect("surviving replicas did not order the remaining commands");

        let survivors = cluster.log(1).unwrap().commands();
        assert_eq!(survivors[0], b"cmd-2".to_vec());
        assert_eq!(survivors[3], b"cmd-5".to_vec());
        for id in 2..=3 {
            assert_eq!(cluster.log(id).unwrap().commands(), survivors);
        }
        assert!(cluster.log(0).unwrap().is_empty());
        assert!(cluster.dropped_messages() > 0);
        cluster.shutdown().await.unwrap();
    }
}
