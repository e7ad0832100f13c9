//! Telemetry configuration from environment variables.

use std::env;

use crate::TelemetryError;

/// Configuration for logging and metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name for the startup log and the info metric
    pub service_name: String,

    /// Log filter directive (trace, debug, info, warn, error, or a full `EnvFilter` string)
    pub log_level: String,

    /// Whether to emit JSON formatted logs
    pub json_logs: bool,

    /// Include the emitting module in each log line
    pub with_target: bool,

    /// Port of the admin server serving `/metrics` and `/health`; 0 disables it
    pub metrics_port: u16,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "quorra".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            with_target: true,
            metrics_port: 9100,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    ///
    /// Unparseable values fall back to the defaults. Use [`Self::try_from_env`]
    /// to surface them as errors instead.
    pub fn from_env() -> Self {
        Self::try_from_env().unwrap_or_default()
    }

    /// Create configuration from environment variables, rejecting malformed values.
    ///
    /// - `QUORRA_SERVICE_NAME`: Service name (default: quorra)
    /// - `QUORRA_LOG_LEVEL` or `RUST_LOG`: Log filter (default: info)
    /// - `QUORRA_JSON_LOGS`: Enable JSON logs (default: false, true in containers)
    /// - `QUORRA_LOG_TARGET`: Include log targets (default: true)
    /// - `QUORRA_METRICS_PORT`: Admin server port, 0 to disable (default: 9100)
    pub fn try_from_env() -> Result<Self, TelemetryError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, TelemetryError> {
        let defaults = Self::default();
        let in_container =
            lookup("KUBERNETES_SERVICE_HOST").is_some() || lookup("DOCKER_CONTAINER").is_some();

        let metrics_port = match lookup("QUORRA_METRICS_PORT") {
            Some(raw) => raw.parse().map_err(|_| {
                TelemetryError::Config(format!("QUORRA_METRICS_PORT is not a port: {raw}"))
            })?,
            None => defaults.metrics_port,
        };

        Ok(Self {
            service_name: lookup("QUORRA_SERVICE_NAME").unwrap_or(defaults.service_name),
            log_level: lookup("QUORRA_LOG_LEVEL")
                .or_else(|| lookup("RUST_LOG"))
                .unwrap_or(defaults.log_level),
            json_logs: flag(lookup("QUORRA_JSON_LOGS"), in_container)?,
            with_target: flag(lookup("QUORRA_LOG_TARGET"), defaults.with_target)?,
            metrics_port,
        })
    }
}

fn flag(raw: Option<String>, default: bool) -> Result<bool, TelemetryError> {
    match raw.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(TelemetryError::Config(format!(
            "expected a boolean flag, got {other}"
        ))),
    }
}
