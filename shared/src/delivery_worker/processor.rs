// ============================================================================
// Delivery Executor
// ============================================================================
//
// Turns one UserRegistered event into one welcome notification:
//
// 1. Dedup check (only when a store is configured and the event has a token)
// 2. Render the welcome message
// 3. Send through the channel
//    - accepted            -> Delivered (mark dedup key)
//    - permanent failure   -> PermanentFailure, no retry
//    - transient failure   -> backoff and retry until `max_attempts`, then
//                             TransientFailure
//
// A send already in flight is allowed to finish; only the backoff waits
// between attempts observe the cancellation token. An interrupted retry
// sequence is reported with `interrupted = true` and the consumer leaves the
// record uncommitted.
//
// ============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::deduplication::DedupStore;
use super::retry::{RetryPolicy, sleep_or_cancel};
use crate::events::UserRegisteredEvent;
use crate::metrics;
use crate::notification::{ChannelError, NotificationChannel, Sender, welcome_message};
use crate::utils::log_safe_id;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    TransientFailure(ChannelError),
    PermanentFailure(ChannelError),
}

/// What happened to one event, for the consumer's commit decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub outcome: DeliveryOutcome,
    /// Channel calls made (0 when skipped as a duplicate)
    pub attempts: u32,
    /// Cancellation cut the retry sequence short
    pub interrupted: bool,
    pub skipped_duplicate: bool,
}

impl DeliveryReport {
    fn finished(outcome: DeliveryOutcome, attempts: u32) -> Self {
        Self {
            outcome,
            attempts,
            interrupted: false,
            skipped_duplicate: false,
        }
    }
}

pub struct DeliveryExecutor {
    channel: Arc<dyn NotificationChannel>,
    sender: Sender,
    policy: RetryPolicy,
    dedup: Option<(Arc<dyn DedupStore>, Duration)>,
    log_salt: String,
}

impl DeliveryExecutor {
    pub fn new(channel: Arc<dyn NotificationChannel>, sender: Sender, policy: RetryPolicy) -> Self {
        Self {
            channel,
            sender,
            policy,
            dedup: None,
            log_salt: String::new(),
        }
    }

    pub fn with_dedup(mut self, store: Arc<dyn DedupStore>, ttl: Duration) -> Self {
        self.dedup = Some((store, ttl));
        self
    }

    pub fn with_log_salt(mut self, salt: impl Into<String>) -> Self {
        self.log_salt = salt.into();
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn already_delivered(&self, event: &UserRegisteredEvent) -> bool {
        let (Some((store, _)), Some(key)) = (&self.dedup, event.dedup_key()) else {
            return false;
        };
        match store.is_processed(&key).await {
            Ok(seen) => seen,
            Err(e) => {
                warn!(error = %e, "Dedup check failed, delivering anyway");
                false
            }
        }
    }

    async fn mark_delivered(&self, event: &UserRegisteredEvent) {
        let (Some((store, ttl)), Some(key)) = (&self.dedup, event.dedup_key()) else {
            return;
        };
        if let Err(e) = store.mark_processed(&key, *ttl).await {
            warn!(error = %e, "Failed to record delivery in dedup store");
        }
    }

    /// Deliver the welcome notification for `event`
    pub async fn deliver(
        &self,
        event: &UserRegisteredEvent,
        cancel: &CancellationToken,
    ) -> DeliveryReport {
        let user_hash = log_safe_id(&event.email, &self.log_salt);

        if self.already_delivered(event).await {
            metrics::DUPLICATES_SKIPPED_TOTAL.inc();
            debug!(user_hash = %user_hash, "Welcome already delivered, skipping");
            return DeliveryReport {
                outcome: DeliveryOutcome::Delivered,
                attempts: 0,
                interrupted: false,
                skipped_duplicate: true,
            };
        }

        let message = welcome_message(event, &self.sender);
        let started = Instant::now();
        let mut attempt = 1;

        loop {
            metrics::DELIVERY_ATTEMPTS_TOTAL.inc();

            let err = match self.channel.send(&message).await {
                Ok(()) => {
                    self.mark_delivered(event).await;
                    metrics::NOTIFICATIONS_DELIVERED_TOTAL.inc();
                    metrics::DELIVERY_LATENCY.observe(started.elapsed().as_secs_f64());
                    info!(
                        user_hash = %user_hash,
                        attempts = attempt,
                        "Welcome notification delivered"
                    );
                    return DeliveryReport::finished(DeliveryOutcome::Delivered, attempt);
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                warn!(
                    user_hash = %user_hash,
                    error = %err,
                    error_kind = err.kind(),
                    "Permanent delivery failure"
                );
                return DeliveryReport::finished(DeliveryOutcome::PermanentFailure(err), attempt);
            }

            if !self.policy.allows_another(attempt) {
                warn!(
                    user_hash = %user_hash,
                    attempts = attempt,
                    error = %err,
                    "Delivery retries exhausted"
                );
                return DeliveryReport::finished(DeliveryOutcome::TransientFailure(err), attempt);
            }

            let delay = self.policy.backoff(attempt);
            warn!(
                user_hash = %user_hash,
                attempt = attempt,
                max_attempts = self.policy.max_attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "Transient delivery failure, will retry"
            );

            if !sleep_or_cancel(delay, cancel).await {
                info!(
                    user_hash = %user_hash,
                    attempts = attempt,
                    "Shutdown during retry backoff, leaving event for redelivery"
                );
                return DeliveryReport {
                    outcome: DeliveryOutcome::TransientFailure(err),
                    attempts: attempt,
                    interrupted: true,
                    skipped_duplicate: false,
                };
            }
            attempt += 1;
        }
    }
}
