//! Prometheus exposition.
//!
//! Consensus metrics live in the default registry, so gathering here picks up
//! everything `quorra-consensus` registered alongside the node metrics below.

use lazy_static::lazy_static;
use prometheus::{register_gauge, register_int_gauge_vec, Encoder, Gauge, IntGaugeVec, TextEncoder};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::TelemetryError;

lazy_static! {
    /// Constant 1 labelled with the service name and crate version
    pub static ref NODE_INFO: IntGaugeVec = register_int_gauge_vec!(
        "quorra_node_info",
        "Build information for the running node",
        &["service", "version"]
    )
    .expect("Failed to register quorra_node_info");

    /// Unix time at which the node started
    pub static ref NODE_START_TIME: Gauge = register_gauge!(
        "quorra_node_start_time_seconds",
        "Unix time the node process started"
    )
    .expect("Failed to register quorra_node_start_time_seconds");
}

/// Mark the node as started.
pub fn record_node_start(service: &str) {
    NODE_INFO
        .with_label_values(&[service, env!("CARGO_PKG_VERSION")])
        .set(1);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    NODE_START_TIME.set(now);
}

/// Encode every metric in the default registry as Prometheus text.
pub fn gather_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsEncode(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsEncode(e.to_string()))
}
