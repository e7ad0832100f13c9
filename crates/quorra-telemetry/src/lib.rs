//! # Quorra Telemetry
//!
//! Logging and metrics plumbing shared by Quorra binaries.
//!
//! ## Components
//!
//! - **Logs**: `tracing-subscriber` with an env filter, plain or JSON output
//! - **Metrics**: the default Prometheus registry, where `quorra-consensus`
//!   registers its counters when built with the `metrics` feature
//!
//! ## Usage
//!
//! ```rust,ignore
//! use quorra_telemetry::{init_telemetry, TelemetryConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_telemetry(&TelemetryConfig::from_env())?;
//!     tracing::info!("replica starting");
//!     Ok(())
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `QUORRA_LOG_LEVEL` / `RUST_LOG` | `info` | Log filter directive |
//! | `QUORRA_JSON_LOGS` | `false` | Emit JSON lines instead of text |
//! | `QUORRA_METRICS_PORT` | `9100` | Admin server port for `/metrics` and `/health`, 0 disables |
//! | `QUORRA_SERVICE_NAME` | `quorra` | Service name attached to the startup log |

mod config;
mod logging;
mod metrics;

pub use config::TelemetryConfig;
pub use logging::{init_logging, log_json};
pub use metrics::{gather_metrics, record_node_start, NODE_INFO, NODE_START_TIME};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to install log subscriber: {0}")]
    LoggingInit(String),

    #[error("Failed to encode Prometheus metrics: {0}")]
    MetricsEncode(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Install the log subscriber and announce the process in the metrics.
///
/// Calling this twice returns [`TelemetryError::LoggingInit`], since only
/// one global subscriber can be installed.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    init_logging(config)?;
    record_node_start(&config.service_name);
    tracing::info!(
        service = %config.service_name,
        json_logs = config.json_logs,
        metrics_port = config.metrics_port,
        "Telemetry initialized"
    );
    Ok(())
}

/// Create a span carrying the replica identifier.
///
/// ```rust,ignore
/// let _span = replica_span!("consensus", replica = 3).entered();
/// ```
#[macro_export]
macro_rules! replica_span {
    ($name:expr, $($field:tt)*) => {
        tracing::info_span!($name, $($field)*)
    };
}
