//! Prometheus metrics for the registration event pipeline
//!
//! - Publishing (registration side)
//! - Consumption and notification delivery (worker side)
//! - Dead-lettering and broker health

use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, IntCounter, IntCounterVec, TextEncoder, opts, register_histogram,
    register_int_counter, register_int_counter_vec,
};

// ============================================================================
// Publish Metrics
// ============================================================================

pub static EVENTS_PUBLISHED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "herald_events_published_total",
        "UserRegistered events acknowledged by the broker"
    ))
    .expect("Failed to register EVENTS_PUBLISHED_TOTAL metric")
});

pub static PUBLISH_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "herald_publish_failures_total",
        "UserRegistered events the broker did not acknowledge"
    ))
    .expect("Failed to register PUBLISH_FAILURES_TOTAL metric")
});

pub static PUBLISH_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "herald_publish_latency_seconds",
        "Time from send to broker acknowledgment",
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("Failed to register PUBLISH_LATENCY metric")
});

// ============================================================================
// Delivery Metrics
// ============================================================================

pub static EVENTS_CONSUMED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "herald_events_consumed_total",
        "Records fetched by the notification dispatcher"
    ))
    .expect("Failed to register EVENTS_CONSUMED_TOTAL metric")
});

pub static NOTIFICATIONS_DELIVERED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "herald_notifications_delivered_total",
        "Welcome notifications accepted by the channel"
    ))
    .expect("Failed to register NOTIFICATIONS_DELIVERED_TOTAL metric")
});

pub static DELIVERY_ATTEMPTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "herald_delivery_attempts_total",
        "Send attempts made against the notification channel"
    ))
    .expect("Failed to register DELIVERY_ATTEMPTS_TOTAL metric")
});

pub static DELIVERY_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "herald_delivery_latency_seconds",
        "Time spent delivering one event, retries included",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .expect("Failed to register DELIVERY_LATENCY metric")
});

pub static DEAD_LETTERED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "herald_dead_lettered_total",
            "Events moved to the dead-letter topic"
        ),
        &["failure_kind"]
    )
    .expect("Failed to register DEAD_LETTERED_TOTAL metric")
});

pub static POISON_RECORDS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "herald_poison_records_total",
        "Records skipped because they could not be decoded"
    ))
    .expect("Failed to register POISON_RECORDS_TOTAL metric")
});

pub static DUPLICATES_SKIPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "herald_duplicates_skipped_total",
        "Redelivered events skipped by the deduplication store"
    ))
    .expect("Failed to register DUPLICATES_SKIPPED_TOTAL metric")
});

// ============================================================================
// Broker Metrics
// ============================================================================

pub static COMMIT_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "herald_commit_failures_total",
        "Offset commits rejected by the broker"
    ))
    .expect("Failed to register COMMIT_FAILURES_TOTAL metric")
});

pub static BROKER_RECONNECTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!(
        "herald_broker_reconnects_total",
        "Consumer re-subscriptions after a broker connection loss"
    ))
    .expect("Failed to register BROKER_RECONNECTS_TOTAL metric")
});

/// Gather all registered metrics and encode as Prometheus text format
pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer)?;

    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_metrics() {
        EVENTS_PUBLISHED_TOTAL.inc();
        DEAD_LETTERED_TOTAL.with_label_values(&["permanent"]).inc();

        let output = gather_metrics().unwrap();
        assert!(output.contains("herald_events_published_total"));
        assert!(output.contains("herald_dead_lettered_total"));
    }
}
