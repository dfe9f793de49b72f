// ============================================================================
// Event Publisher
// ============================================================================
//
// Appends UserRegistered events to the log, keyed by email. Called by the
// registration workflow only after the account is persisted.
//
// Every send is bounded by `send_timeout`; a slow broker surfaces as
// `PublishFailure::Timeout` instead of stalling the request.
//
// ============================================================================

use crate::broker::{BrokerError, DeliveryReceipt, RecordProducer};
use crate::delivery_worker::retry::{RetryPolicy, sleep_or_cancel};
use crate::events::{EventError, UserRegisteredEvent};
use crate::metrics;
use crate::utils::log_safe_id;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PublishFailure {
    #[error("partition key must not be empty")]
    EmptyKey,

    #[error("event rejected before send: {0}")]
    InvalidEvent(#[from] EventError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("broker did not acknowledge within {0:?}")]
    Timeout(Duration),
}

impl PublishFailure {
    /// Broker-side failures may succeed on a later attempt; input errors never do
    pub fn is_retryable(&self) -> bool {
        matches!(self, PublishFailure::Broker(_) | PublishFailure::Timeout(_))
    }
}

#[derive(Clone)]
pub struct EventPublisher {
    producer: Arc<dyn RecordProducer>,
    topic: String,
    send_timeout: Duration,
    retry_policy: RetryPolicy,
    log_salt: String,
}

impl EventPublisher {
    pub fn new(producer: Arc<dyn RecordProducer>, topic: impl Into<String>, send_timeout: Duration) -> Self {
        Self {
            producer,
            topic: topic.into(),
            send_timeout,
            retry_policy: RetryPolicy::default(),
            log_salt: String::new(),
        }
    }

    /// Policy used by [`EventPublisher::publish_with_retry`]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_log_salt(mut self, salt: impl Into<String>) -> Self {
        self.log_salt = salt.into();
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Append one event and wait for the broker acknowledgment
    pub async fn publish(
        &self,
        key: &str,
        event: &UserRegisteredEvent,
    ) -> Result<DeliveryReceipt, PublishFailure> {
        if key.trim().is_empty() {
            return Err(PublishFailure::EmptyKey);
        }
        let payload = event.to_payload()?;

        let start = Instant::now();
        let result = tokio::time::timeout(
            self.send_timeout,
            self.producer.send(&self.topic, key, &payload),
        )
        .await;

        let receipt = match result {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(err)) => {
                metrics::PUBLISH_FAILURES_TOTAL.inc();
                return Err(err.into());
            }
            Err(_) => {
                metrics::PUBLISH_FAILURES_TOTAL.inc();
                return Err(PublishFailure::Timeout(self.send_timeout));
            }
        };

        metrics::EVENTS_PUBLISHED_TOTAL.inc();
        metrics::PUBLISH_LATENCY.observe(start.elapsed().as_secs_f64());
        info!(
            user_hash = %log_safe_id(key, &self.log_salt),
            topic = %self.topic,
            partition = receipt.partition,
            offset = receipt.offset,
            "UserRegistered event published"
        );

        Ok(receipt)
    }

    /// [`EventPublisher::publish`] with bounded local retry of broker failures
    pub async fn publish_with_retry(
        &self,
        key: &str,
        event: &UserRegisteredEvent,
        cancel: &CancellationToken,
    ) -> Result<DeliveryReceipt, PublishFailure> {
        let mut attempt = 1;
        loop {
            match self.publish(key, event).await {
                Ok(receipt) => return Ok(receipt),
                Err(err) if err.is_retryable() && self.retry_policy.allows_another(attempt) => {
                    let delay = self.retry_policy.backoff(attempt);
                    warn!(
                        user_hash = %log_safe_id(key, &self.log_salt),
                        attempt = attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err,
                        "Publish failed, retrying"
                    );
                    if !sleep_or_cancel(delay, cancel).await {
                        return Err(err);
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::events::USER_REGISTERED_TOPIC;

    fn publisher(broker: &InMemoryBroker) -> EventPublisher {
        EventPublisher::new(
            Arc::new(broker.producer()),
            USER_REGISTERED_TOPIC,
            Duration::from_millis(200),
        )
        .with_retry_policy(RetryPolicy::immediate(3))
    }

    #[tokio::test]
    async fn test_publish_appends_keyed_record() {
        let broker = InMemoryBroker::new(4);
        let event = UserRegisteredEvent::new("a@x.com", "alice");

        let receipt = publisher(&broker).publish("a@x.com", &event).await.unwrap();
        assert_eq!(receipt.partition, broker.partition_for("a@x.com"));

        let records = broker.records(USER_REGISTERED_TOPIC);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key_str(), Some("a@x.com"));
        assert_eq!(
            UserRegisteredEvent::from_payload(records[0].payload()).unwrap(),
            event
        );
    }

    #[tokio::test]
    async fn test_empty_key_is_rejected() {
        let broker = InMemoryBroker::new(1);
        let event = UserRegisteredEvent::new("a@x.com", "alice");

        let err = publisher(&broker).publish("  ", &event).await.unwrap_err();
        assert!(matches!(err, PublishFailure::EmptyKey));
        assert!(!err.is_retryable());
        assert!(broker.records(USER_REGISTERED_TOPIC).is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_broker_surfaces_failure() {
        let broker = InMemoryBroker::new(1);
        broker.set_available(false);
        let event = UserRegisteredEvent::new("a@x.com", "alice");

        let err = publisher(&broker).publish("a@x.com", &event).await.unwrap_err();
        assert!(matches!(err, PublishFailure::Broker(BrokerError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_slow_broker_times_out() {
        let broker = InMemoryBroker::new(1);
        broker.set_send_delay(Duration::from_secs(5));
        let event = UserRegisteredEvent::new("a@x.com", "alice");

        let err = publisher(&broker).publish("a@x.com", &event).await.unwrap_err();
        assert!(matches!(err, PublishFailure::Timeout(_)));
    }

    #[tokio::test]
    async fn test_publish_with_retry_recovers_from_rejections() {
        let broker = InMemoryBroker::new(1);
        broker.fail_next_sends(2);
        let event = UserRegisteredEvent::new("a@x.com", "alice");

        let receipt = publisher(&broker)
            .publish_with_retry("a@x.com", &event, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(receipt.offset, 0);
        assert_eq!(broker.records(USER_REGISTERED_TOPIC).len(), 1);
    }

    #[tokio::test]
    async fn test_publish_with_retry_gives_up_after_max_attempts() {
        let broker = InMemoryBroker::new(1);
        broker.fail_next_sends(5);
        let event = UserRegisteredEvent::new("a@x.com", "alice");

        let err = publisher(&broker)
            .publish_with_retry("a@x.com", &event, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PublishFailure::Broker(BrokerError::Rejected(_))));
        assert!(broker.records(USER_REGISTERED_TOPIC).is_empty());
    }
}
