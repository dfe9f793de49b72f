// ============================================================================
// Broker seam
// ============================================================================
//
// The pipeline talks to the partitioned log only through these traits.
// `kafka` implements them over rdkafka, `memory` implements them in-process
// for tests and local runs.
//
// Offset semantics follow Kafka: a consumer's position advances when a record
// is fetched, while the committed offset (next offset to read) only moves on
// an explicit commit. On restart a group member resumes from the committed
// offset, which is what makes delivery at-least-once.
//
// ============================================================================

pub mod memory;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use memory::InMemoryBroker;

/// Broker-side failures, shared by producers and consumers
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker rejected the write: {0}")]
    Rejected(String),

    #[error("broker did not answer within {0:?}")]
    Timeout(Duration),

    #[error("offset commit failed: {0}")]
    Commit(String),

    #[error("consumer is not subscribed")]
    NotSubscribed,
}

impl BrokerError {
    /// Errors that mean the connection itself is gone (vs. a single bad call)
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            BrokerError::Unavailable(_) | BrokerError::Timeout(_) | BrokerError::NotSubscribed
        )
    }
}

/// Position of an appended record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub partition: i32,
    pub offset: i64,
}

impl DeliveryReceipt {
    /// Receipt returned when the broker is disabled and nothing was written
    pub const DISABLED: DeliveryReceipt = DeliveryReceipt {
        partition: -1,
        offset: -1,
    };
}

/// A record fetched from an assigned partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
}

impl ConsumedRecord {
    pub fn key_str(&self) -> Option<&str> {
        self.key.as_deref().and_then(|k| std::str::from_utf8(k).ok())
    }

    pub fn payload(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }
}

/// Append side of the log
#[async_trait]
pub trait RecordProducer: Send + Sync {
    /// Append one keyed record and wait for the broker acknowledgment
    async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<DeliveryReceipt, BrokerError>;

    /// Wait for in-flight records to be acknowledged
    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError>;
}

/// Read side of the log, one consumer-group member
///
/// A handle is owned by exactly one consumer loop; it is never shared.
#[async_trait]
pub trait RecordConsumer: Send {
    /// Join the consumer group and subscribe to the topic
    ///
    /// Calling it again after a connection loss re-establishes the handle.
    async fn subscribe(&mut self) -> Result<(), BrokerError>;

    /// Wait up to `timeout` for the next record on an assigned partition
    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedRecord>, BrokerError>;

    /// Mark `record` (and everything before it on its partition) as processed
    async fn commit(&mut self, record: &ConsumedRecord) -> Result<(), BrokerError>;

    /// Leave the group and release the partition assignment
    async fn close(&mut self) -> Result<(), BrokerError>;
}
