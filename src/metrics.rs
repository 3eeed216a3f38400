//! Metrics for observability.
//!
//! Emits through the `metrics` facade; the binary (or an embedding service)
//! decides which exporter, if any, is installed. Without a recorder every
//! call is a no-op.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `rfq_sync_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use rfq_sync::metrics;
//! use std::time::Duration;
//!
//! metrics::record_batch(12, Duration::from_millis(40));
//! metrics::record_dead_letter("rfq.sync.to_medusa");
//! ```

use crate::circuit_breaker::CircuitState;
use crate::error::ErrorKind;
use crate::model::SyncResult;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Sync Outcome Metrics
// =============================================================================

/// Record the outcome of one orchestration call.
pub fn record_sync_outcome(result: &SyncResult) {
    let direction = result.direction.as_str();
    counter!(
        "rfq_sync_requests_total",
        "direction" => direction,
        "status" => result.status.as_str()
    )
    .increment(1);

    if result.duration_ms > 0 {
        histogram!("rfq_sync_duration_seconds", "direction" => direction)
            .record(result.duration_ms as f64 / 1000.0);
    }
}

/// Record an error that escaped the orchestrator.
pub fn record_sync_error(kind: ErrorKind) {
    counter!("rfq_sync_errors_total", "error_type" => kind.as_str()).increment(1);
}

/// Record a duplicate delivery answered from the cache or the database.
pub fn record_idempotency_hit(source: &'static str) {
    counter!("rfq_sync_idempotency_hits_total", "source" => source).increment(1);
}

/// Record a lock acquisition that found another holder.
pub fn record_lock_contention() {
    counter!("rfq_sync_lock_contention_total").increment(1);
}

/// Record a retry scheduled by the sync policy.
pub fn record_retry(kind: ErrorKind) {
    counter!("rfq_sync_retries_total", "error_type" => kind.as_str()).increment(1);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Set circuit breaker state gauge (0=closed, 1=half_open, 2=open).
pub fn record_circuit_state(circuit_name: &str, state: CircuitState) {
    gauge!("rfq_sync_circuit_state", "circuit" => circuit_name.to_string())
        .set(state as u8 as f64);
    counter!(
        "rfq_sync_circuit_transitions_total",
        "circuit" => circuit_name.to_string(),
        "to" => state.to_string()
    )
    .increment(1);
}

/// Record circuit breaker rejection (circuit was open).
pub fn record_circuit_rejection(circuit_name: &str) {
    counter!(
        "rfq_sync_circuit_rejections_total",
        "circuit" => circuit_name.to_string()
    )
    .increment(1);
}

// =============================================================================
// Dead-Letter Metrics
// =============================================================================

/// Record a message routed to the dead-letter topic.
pub fn record_dead_letter(original_topic: &str) {
    counter!(
        "rfq_sync_dead_letters_total",
        "original_topic" => original_topic.to_string()
    )
    .increment(1);
}

/// Record a dead-letter publish that failed and was swallowed.
pub fn record_dead_letter_publish_failure() {
    counter!("rfq_sync_dead_letter_publish_failures_total").increment(1);
}

// =============================================================================
// Consumer Metrics
// =============================================================================

/// Gauge for consumer state.
pub fn record_consumer_state(state: &str) {
    let value = match state {
        "Stopped" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "Stopping" => 3.0,
        _ => -1.0,
    };
    gauge!("rfq_sync_consumer_state").set(value);
}

/// Record one polled batch and how long handling it took.
pub fn record_batch(size: usize, duration: Duration) {
    counter!("rfq_sync_messages_total").increment(size as u64);
    histogram!("rfq_sync_batch_size").record(size as f64);
    histogram!("rfq_sync_batch_duration_seconds").record(duration.as_secs_f64());
}

/// Record a message handled on `topic`.
pub fn record_message(topic: &str, outcome: &'static str) {
    counter!(
        "rfq_sync_messages_handled_total",
        "topic" => topic.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a bus operation that failed (poll, publish, ack).
pub fn record_bus_error(operation: &'static str) {
    counter!("rfq_sync_bus_errors_total", "operation" => operation).increment(1);
}

/// Record a status-change notification and what became of it.
pub fn record_status_change(outcome: &'static str) {
    counter!("rfq_sync_status_changes_total", "outcome" => outcome).increment(1);
}
