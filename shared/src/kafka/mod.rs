// Kafka implementations of the broker seam
//
// The producer is shared by the registration publisher and the dead-letter
// sink; each worker task owns its own consumer.

pub mod circuit_breaker;
pub mod config;
pub mod consumer;
pub mod producer;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
pub use config::create_client_config;
pub use consumer::KafkaEventConsumer;
pub use producer::KafkaEventProducer;
