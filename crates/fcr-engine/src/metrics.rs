//! Metric recording for the router.
//!
//! Only the `metrics` facade is used here; wiring an exporter is the hosting
//! binary's concern.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Body failed to parse into a message pointer.
pub fn record_malformed(queue: &str) {
    counter!("fcr_malformed_bodies_total", "queue" => queue.to_string()).increment(1);
}

/// Delivery for a message id that is already in flight.
pub fn record_duplicate(queue: &str) {
    counter!("fcr_duplicate_deliveries_total", "queue" => queue.to_string()).increment(1);
}

/// Pointer addressed to a pool that is not deployed.
pub fn record_unknown_pool(pool: &str) {
    counter!("fcr_unknown_pool_total", "pool" => pool.to_string()).increment(1);
}

/// Outcome of one mediator dispatch, labelled by verdict.
pub fn record_dispatch(pool: &str, verdict: &str) {
    counter!(
        "fcr_dispatches_total",
        "pool" => pool.to_string(),
        "verdict" => verdict.to_string()
    )
    .increment(1);
}

pub fn record_dispatch_latency(pool: &str, duration: Duration) {
    histogram!("fcr_dispatch_duration_seconds", "pool" => pool.to_string())
        .record(duration.as_secs_f64());
}

/// Message short-circuited because its batch+group already failed.
pub fn record_cascade(pool: &str) {
    counter!("fcr_cascade_nacks_total", "pool" => pool.to_string()).increment(1);
}

pub fn record_rate_limited(pool: &str) {
    counter!("fcr_rate_limited_total", "pool" => pool.to_string()).increment(1);
}

pub fn record_circuit_open(pool: &str) {
    counter!("fcr_circuit_open_total", "pool" => pool.to_string()).increment(1);
}

pub fn record_broker_ack_failure(queue: &str) {
    counter!("fcr_broker_ack_failures_total", "queue" => queue.to_string()).increment(1);
}

pub fn record_broker_nack_failure(queue: &str) {
    counter!("fcr_broker_nack_failures_total", "queue" => queue.to_string()).increment(1);
}

pub fn set_in_flight(count: usize) {
    gauge!("fcr_in_flight_messages").set(count as f64);
}

pub fn record_consumer_poll(queue: &str, message_count: usize) {
    counter!("fcr_consumer_polls_total", "queue" => queue.to_string()).increment(1);
    if message_count > 0 {
        counter!("fcr_consumer_messages_total", "queue" => queue.to_string())
            .increment(message_count as u64);
    }
}

pub fn record_consumer_error(queue: &str) {
    counter!("fcr_consumer_errors_total", "queue" => queue.to_string()).increment(1);
}

pub fn record_visibility_extension(count: usize) {
    counter!("fcr_visibility_extensions_total").increment(count as u64);
}
