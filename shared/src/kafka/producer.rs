use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
use super::config::create_client_config;
use crate::broker::{BrokerError, DeliveryReceipt, RecordProducer};
use herald_config::KafkaConfig;

/// Kafka producer for registration events and dead-letter records
///
/// - `acks=all` with idempotence, so a retried send is not duplicated by
///   the broker within one producer session
/// - every send goes through a circuit breaker so a broker outage fails fast
/// - when Kafka is disabled no client is created and sends are dropped with
///   [`DeliveryReceipt::DISABLED`]
#[derive(Clone)]
pub struct KafkaEventProducer {
    producer: Option<Arc<FutureProducer>>,
    circuit_breaker: Arc<CircuitBreaker>,
    send_timeout: Duration,
}

impl KafkaEventProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let send_timeout = Duration::from_millis(config.producer_send_timeout_ms);
        let circuit_breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
            timeout: send_timeout,
            ..CircuitBreakerConfig::default()
        }));

        if !config.enabled {
            info!("Kafka producer disabled (KAFKA_ENABLED=false)");
            return Ok(Self {
                producer: None,
                circuit_breaker,
                send_timeout,
            });
        }

        let mut client_config = create_client_config(config)?;
        let producer: FutureProducer = client_config
            .set("acks", &config.producer_acks)
            .set(
                "enable.idempotence",
                config.producer_enable_idempotence.to_string(),
            )
            .set(
                "max.in.flight.requests.per.connection",
                config.producer_max_in_flight.to_string(),
            )
            .set("retries", config.producer_retries.to_string())
            .set("compression.type", &config.producer_compression)
            .set("linger.ms", config.producer_linger_ms.to_string())
            .set("batch.size", config.producer_batch_size.to_string())
            .set(
                "request.timeout.ms",
                config.producer_request_timeout_ms.to_string(),
            )
            .set(
                "delivery.timeout.ms",
                config.producer_delivery_timeout_ms.to_string(),
            )
            .create()
            .context("Failed to create Kafka producer")?;

        info!(brokers = %config.brokers, "Kafka producer initialized");

        Ok(Self {
            producer: Some(Arc::new(producer)),
            circuit_breaker,
            send_timeout,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.producer.is_some()
    }

    async fn send_internal(
        producer: &FutureProducer,
        topic: &str,
        key: &str,
        payload: &[u8],
        queue_timeout: Duration,
    ) -> Result<DeliveryReceipt, BrokerError> {
        let record = FutureRecord::to(topic).key(key).payload(payload);
        let start = Instant::now();

        match producer.send(record, Timeout::After(queue_timeout)).await {
            Ok((partition, offset)) => {
                debug!(
                    topic = %topic,
                    partition = partition,
                    offset = offset,
                    latency_ms = start.elapsed().as_millis() as u64,
                    "Record acknowledged by Kafka"
                );
                Ok(DeliveryReceipt { partition, offset })
            }
            Err((kafka_err, _)) => {
                error!(
                    error = %kafka_err,
                    topic = %topic,
                    latency_ms = start.elapsed().as_millis() as u64,
                    "Kafka send failed"
                );
                Err(BrokerError::Rejected(kafka_err.to_string()))
            }
        }
    }
}

#[async_trait]
impl RecordProducer for KafkaEventProducer {
    async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<DeliveryReceipt, BrokerError> {
        let Some(producer) = &self.producer else {
            debug!(topic = %topic, "Kafka disabled - record dropped");
            return Ok(DeliveryReceipt::DISABLED);
        };

        self.circuit_breaker
            .call(Self::send_internal(
                producer,
                topic,
                key,
                payload,
                self.send_timeout,
            ))
            .await
            .map_err(|err| match err {
                CircuitBreakerError::Open(_) => {
                    BrokerError::Unavailable("circuit breaker open".to_string())
                }
                CircuitBreakerError::Timeout { timeout } => BrokerError::Timeout(timeout),
                CircuitBreakerError::Inner(inner) => inner,
            })
    }

    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        let Some(producer) = &self.producer else {
            return Ok(());
        };

        info!(timeout_ms = timeout.as_millis() as u64, "Flushing Kafka producer");
        let producer = Arc::clone(producer);
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| BrokerError::Unavailable(format!("flush task failed: {}", e)))?
            .map_err(|e| BrokerError::Unavailable(format!("flush failed: {}", e)))
    }
}
