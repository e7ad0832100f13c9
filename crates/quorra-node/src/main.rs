//! # Quorra Node
//!
//! Starts a local cluster, submits `QUORRA_COMMANDS` demo commands and waits
//! until every replica applied them in the same order.
//!
//! ## Startup Sequence
//!
//! 1. Initialize logging and metrics, start the admin server
//! 2. Load the node configuration
//! 3. Spawn one runner per replica
//! 4. Submit commands and hand the first batch to the leader
//! 5. Wait for every replica, check agreement, shut down

use anyhow::{Context, Result};
use quorra_node::{start_admin_server, LocalCluster, NodeConfig};
use quorra_telemetry::{gather_metrics, init_telemetry, log_json, TelemetryConfig};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = TelemetryConfig::from_env();
    init_telemetry(&telemetry).context("Failed to initialize telemetry")?;
    let admin = start_admin_server(&telemetry).await?;

    let config = NodeConfig::from_env().context("Invalid node configuration")?;
    log_json("Node configuration", &config);

    let cluster = LocalCluster::start(&config)?;
    for i in 0..config.commands {
        cluster.submit(format!("command-{i}").into_bytes());
    }
    if !cluster.kick().await? {
        warn!("No commands to order");
    }

    let outcome = tokio::select! {
        result = cluster.wait_for_commands(config.commands, config.run_timeout()) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            Ok(())
        }
    };

    match &outcome {
        Ok(()) => {
            let applied = cluster.check_agreement()?;
            info!(applied, "All replicas agree");
        }
        Err(err) => error!(error = %err, pending = cluster.pending(), "Cluster did not finish"),
    }
    for stats in cluster.stats() {
        log_json("Replica stats", &stats);
    }
    if cluster.dropped_messages() > 0 {
        warn!(dropped = cluster.dropped_messages(), "Network dropped messages");
    }
    match gather_metrics() {
        Ok(text) => tracing::debug!(metrics = %text, "Final metrics"),
        Err(err) => warn!(error = %err, "Failed to gather metrics"),
    }

    cluster.shutdown().await?;
    if let Some(admin) = admin {
        admin.shutdown();
    }
    outcome
}
