// ============================================================================
// Delivery Worker Configuration
// ============================================================================

use crate::constants::*;
use std::time::Duration;

/// Retry, polling and shutdown knobs for the notification dispatcher
#[derive(Clone, Debug)]
pub struct DeliveryConfig {
    /// Total send attempts per event (initial attempt included)
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Randomization applied to each backoff (0.0 - 1.0)
    pub jitter_factor: f64,
    /// Bounded wait for the next record
    pub poll_timeout_ms: u64,
    /// Independent consumer-group members hosted by one process
    pub concurrency: usize,
    /// Consecutive broker failures tolerated before the worker reports fatal
    pub reconnect_max_failures: u32,
    pub shutdown_grace_secs: u64,
    pub dedup_enabled: bool,
    pub dedup_ttl_hours: u64,
    /// Shared dedup store; in-process store is used when absent
    pub redis_url: Option<String>,
}

impl DeliveryConfig {
    pub(crate) fn from_env() -> Self {
        Self {
            max_attempts: std::env::var("DELIVERY_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
            initial_backoff_ms: std::env::var("DELIVERY_INITIAL_BACKOFF_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_INITIAL_BACKOFF_MS),
            max_backoff_ms: std::env::var("DELIVERY_MAX_BACKOFF_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_BACKOFF_MS),
            jitter_factor: std::env::var("DELIVERY_JITTER_FACTOR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_JITTER_FACTOR),
            poll_timeout_ms: std::env::var("CONSUMER_POLL_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_POLL_TIMEOUT_MS),
            concurrency: std::env::var("CONSUMER_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            reconnect_max_failures: std::env::var("BROKER_RECONNECT_MAX_FAILURES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_RECONNECT_MAX_FAILURES),
            shutdown_grace_secs: std::env::var("SHUTDOWN_GRACE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
            dedup_enabled: std::env::var("DEDUP_ENABLED")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            dedup_ttl_hours: std::env::var("DEDUP_TTL_HOURS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_DEDUP_TTL_HOURS),
            redis_url: std::env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),
        }
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_hours * SECONDS_PER_HOUR)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            concurrency: 1,
            reconnect_max_failures: DEFAULT_RECONNECT_MAX_FAILURES,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            dedup_enabled: false,
            dedup_ttl_hours: DEFAULT_DEDUP_TTL_HOURS,
            redis_url: None,
        }
    }
}
