// ============================================================================
// Dead-Letter Path
// ============================================================================
//
// Events that could not be delivered (permanent failure, or retries
// exhausted) are written to `{topic}-dlq` with the reason and their source
// position, so they can be inspected or replayed. The consumer commits the
// source offset only after this write is acknowledged.
//
// ============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use crate::broker::{BrokerError, ConsumedRecord, DeliveryReceipt, RecordProducer};
use crate::events::UserRegisteredEvent;
use crate::utils::log_safe_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    RetriesExhausted,
    Permanent,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::RetriesExhausted => "retries_exhausted",
            FailureKind::Permanent => "permanent",
        }
    }
}

/// An undeliverable event plus why and where it came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub event: UserRegisteredEvent,
    pub source_topic: String,
    pub source_partition: i32,
    pub source_offset: i64,
    pub attempts: u32,
    pub failure_kind: FailureKind,
    pub failure_reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(
        event: UserRegisteredEvent,
        source: &ConsumedRecord,
        attempts: u32,
        failure_kind: FailureKind,
        failure_reason: impl Into<String>,
    ) -> Self {
        Self {
            event,
            source_topic: source.topic.clone(),
            source_partition: source.partition,
            source_offset: source.offset,
            attempts,
            failure_kind,
            failure_reason: failure_reason.into(),
            dead_lettered_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Durably store `record`; `Ok` means the source offset may be committed
    async fn write(&self, record: &DeadLetterRecord) -> Result<DeliveryReceipt, BrokerError>;
}

/// Dead-letter sink backed by a topic on the same broker
#[derive(Clone)]
pub struct TopicDeadLetterSink {
    producer: Arc<dyn RecordProducer>,
    topic: String,
    log_salt: String,
}

impl TopicDeadLetterSink {
    pub fn new(producer: Arc<dyn RecordProducer>, topic: impl Into<String>, log_salt: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
            log_salt: log_salt.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl DeadLetterSink for TopicDeadLetterSink {
    async fn write(&self, record: &DeadLetterRecord) -> Result<DeliveryReceipt, BrokerError> {
        let payload = serde_json::to_vec(record)
            .map_err(|e| BrokerError::Rejected(format!("dead-letter encoding failed: {}", e)))?;

        let receipt = self
            .producer
            .send(&self.topic, &record.event.email, &payload)
            .await?;

        warn!(
            target: "dlq",
            user_hash = %log_safe_id(&record.event.email, &self.log_salt),
            dlq_topic = %self.topic,
            source_partition = record.source_partition,
            source_offset = record.source_offset,
            attempts = record.attempts,
            failure_kind = record.failure_kind.as_str(),
            reason = %record.failure_reason,
            "Event moved to dead-letter topic"
        );

        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;

    fn source() -> ConsumedRecord {
        ConsumedRecord {
            topic: "user-registered".to_string(),
            partition: 2,
            offset: 41,
            key: Some(b"a@x.com".to_vec()),
            payload: None,
        }
    }

    #[test]
    fn test_record_wire_format() {
        let record = DeadLetterRecord::new(
            UserRegisteredEvent::new("a@x.com", "alice"),
            &source(),
            3,
            FailureKind::RetriesExhausted,
            "relay unavailable",
        );
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["sourceTopic"], "user-registered");
        assert_eq!(json["sourcePartition"], 2);
        assert_eq!(json["sourceOffset"], 41);
        assert_eq!(json["failureKind"], "retries_exhausted");
        assert_eq!(json["event"]["email"], "a@x.com");
        assert!(json["deadLetteredAt"].is_string());
    }

    #[tokio::test]
    async fn test_topic_sink_writes_keyed_record() {
        let broker = InMemoryBroker::new(1);
        let sink = TopicDeadLetterSink::new(Arc::new(broker.producer()), "user-registered-dlq", "salt");
        let record = DeadLetterRecord::new(
            UserRegisteredEvent::new("a@x.com", "alice"),
            &source(),
            1,
            FailureKind::Permanent,
            "invalid recipient",
        );

        sink.write(&record).await.unwrap();

        let written = broker.records("user-registered-dlq");
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].key_str(), Some("a@x.com"));
        let decoded: DeadLetterRecord = serde_json::from_slice(written[0].payload()).unwrap();
        assert_eq!(decoded, record);
    }

    #[tokio::test]
    async fn test_topic_sink_surfaces_broker_errors() {
        let broker = InMemoryBroker::new(1);
        broker.set_available(false);
        let sink = TopicDeadLetterSink::new(Arc::new(broker.producer()), "user-registered-dlq", "salt");
        let record = DeadLetterRecord::new(
            UserRegisteredEvent::new("a@x.com", "alice"),
            &source(),
            1,
            FailureKind::Permanent,
            "invalid recipient",
        );

        assert!(sink.write(&record).await.is_err());
    }
}
