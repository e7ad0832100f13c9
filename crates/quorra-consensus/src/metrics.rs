//! # Consensus Metrics
//!
//! Prometheus metrics for the execution engine.
//!
//! Enable with the `metrics` feature:
//! ```toml
//! quorra-consensus = { path = "...", features = ["metrics"] }
//! ```
//!
//! ## Metrics Exported
//!
//! - `quorra_messages_total` - Counter of delivered messages (by kind)
//! - `quorra_messages_rejected_total` - Counter of rejected messages (by reason)
//! - `quorra_decisions_total` - Counter of decided instances
//! - `quorra_decision_latency_seconds` - Histogram from instance activation to decision
//! - `quorra_leader_changes_total` - Counter of rounds opened by a freeze
//! - `quorra_out_of_context_messages` - Gauge of buffered out-of-context messages
//! - `quorra_state_transfer_requests_total` - Counter of state transfer requests

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

#[cfg(feature = "metrics")]
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

#[cfg(feature = "metrics")]
lazy_static! {
    pub static ref MESSAGES: IntCounterVec = register_int_counter_vec!(
        "quorra_messages_total",
        "Protocol messages delivered to the execution manager",
        &["kind"]
    )
    .expect("Failed to create MESSAGES metric");

    /// Rejected messages, labeled by reason
    pub static ref MESSAGES_REJECTED: IntCounterVec = register_int_counter_vec!(
        "quorra_messages_rejected_total",
        "Protocol messages rejected",
        &["reason"]
    )
    .expect("Failed to create MESSAGES_REJECTED metric");

    pub static ref DECISIONS: IntCounter = register_int_counter!(
        "quorra_decisions_total",
        "Consensus instances decided"
    )
    .expect("Failed to create DECISIONS metric");

    pub static ref DECISION_LATENCY: Histogram = register_histogram!(
        "quorra_decision_latency_seconds",
        "Time from instance activation to decision in seconds",
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to create DECISION_LATENCY metric");

    pub static ref LEADER_CHANGES: IntCounter = register_int_counter!(
        "quorra_leader_changes_total",
        "Rounds opened after a freeze"
    )
    .expect("Failed to create LEADER_CHANGES metric");

    pub static ref BUFFERED: IntCounterVec = register_int_counter_vec!(
        "quorra_buffered_messages_total",
        "Messages buffered instead of processed",
        &["queue"]
    )
    .expect("Failed to create BUFFERED metric");

    pub static ref BUFFER_EVICTIONS: IntCounter = register_int_counter!(
        "quorra_buffer_evictions_total",
        "Out-of-context messages evicted on overflow"
    )
    .expect("Failed to create BUFFER_EVICTIONS metric");

    pub static ref OUT_OF_CONTEXT: IntGauge = register_int_gauge!(
        "quorra_out_of_context_messages",
        "Out-of-context messages currently buffered"
    )
    .expect("Failed to create OUT_OF_CONTEXT metric");

    pub static ref STATE_TRANSFER_REQUESTS: IntCounter = register_int_counter!(
        "quorra_state_transfer_requests_total",
        "State transfer requests raised by admission"
    )
    .expect("Failed to create STATE_TRANSFER_REQUESTS metric");
}

#[cfg(feature = "metrics")]
pub fn record_message(kind: &str) {
    MESSAGES.with_label_values(&[kind]).inc();
}

/// Record a rejected message with reason
#[cfg(feature = "metrics")]
pub fn record_rejected(reason: &str) {
    MESSAGES_REJECTED.with_label_values(&[reason]).inc();
}

/// Record a decision and its latency
#[cfg(feature = "metrics")]
pub fn record_decision(latency_seconds: Option<f64>) {
    DECISIONS.inc();
    if let Some(seconds) = latency_seconds {
        DECISION_LATENCY.observe(seconds);
    }
}

#[cfg(feature = "metrics")]
pub fn record_leader_change() {
    LEADER_CHANGES.inc();
}

/// `queue` is `out_of_context` or `stopped`
#[cfg(feature = "metrics")]
pub fn record_buffered(queue: &str) {
    BUFFERED.with_label_values(&[queue]).inc();
}

#[cfg(feature = "metrics")]
pub fn record_buffer_eviction(evicted: usize) {
    BUFFER_EVICTIONS.inc_by(evicted as u64);
}

#[cfg(feature = "metrics")]
pub fn set_out_of_context(len: usize) {
    OUT_OF_CONTEXT.set(len as i64);
}

#[cfg(feature = "metrics")]
pub fn record_state_transfer_request() {
    STATE_TRANSFER_REQUESTS.inc();
}

// No-op implementations when metrics feature is disabled
#[cfg(not(feature = "metrics"))]
pub fn record_message(_kind: &str) {}

#[cfg(not(feature = "metrics"))]
pub fn record_rejected(_reason: &str) {}

#[cfg(not(feature = "metrics"))]
pub fn record_decision(_latency_seconds: Option<f64>) {}

#[cfg(not(feature = "metrics"))]
pub fn record_leader_change() {}

#[cfg(not(feature = "metrics"))]
pub fn record_buffered(_queue: &str) {}

#[cfg(not(feature = "metrics"))]
pub fn record_buffer_eviction(_evicted: usize) {}

#[cfg(not(feature = "metrics"))]
pub fn set_out_of_context(_len: usize) {}

#[cfg(not(feature = "metrics"))]
pub fn record_state_transfer_request() {}
