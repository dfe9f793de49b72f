// Broker abstraction and its two backends (Kafka, in-process)
pub mod broker;
pub mod kafka;

// Domain event and the publish side
pub mod events;
pub mod publisher;
pub mod registration;

// Consume side: delivery, retry, dead-letter, consumer loop
pub mod delivery_worker;
pub mod notification;

// Process plumbing
pub mod health;
pub mod metrics;
pub mod utils;
