// ============================================================================
// Delivery Worker Module
// ============================================================================
//
// The consume side of the pipeline:
// - processor: delivery executor (dedup check, send, retry classification)
// - retry: backoff policy and cancellable waits
// - dlq: dead-letter records and sink
// - deduplication: optional delivered-token store (in-memory or Redis)
// - worker: consumer-group member poll loop and lifecycle handle
//
// ============================================================================

pub mod deduplication;
pub mod dlq;
pub mod processor;
pub mod retry;
pub mod worker;

pub use deduplication::{DedupStore, InMemoryDedupStore, RedisDedupStore};
pub use dlq::{DeadLetterRecord, DeadLetterSink, FailureKind, TopicDeadLetterSink};
pub use processor::{DeliveryExecutor, DeliveryOutcome, DeliveryReport};
pub use retry::{RetryPolicy, sleep_or_cancel};
pub use worker::{
    ConsumerError, ConsumerHandle, ConsumerSettings, ConsumerState, ConsumerStats, DrainReport,
    EventConsumer, drain_members,
};
