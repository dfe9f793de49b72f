use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{Message, Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::config::create_client_config;
use crate::broker::{BrokerError, ConsumedRecord, RecordConsumer};
use herald_config::KafkaConfig;

/// One consumer-group member reading the registration topic
///
/// - `enable.auto.commit=false`: offsets move only through [`RecordConsumer::commit`]
/// - `auto.offset.reset` comes from config (earliest by default)
/// - the rdkafka client is created on `subscribe`, so a lost connection is
///   recovered by dropping the client and subscribing again
pub struct KafkaEventConsumer {
    config: KafkaConfig,
    consumer: Option<Arc<StreamConsumer>>,
}

impl KafkaEventConsumer {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        if !config.enabled {
            anyhow::bail!("Cannot create Kafka consumer when Kafka is disabled");
        }
        Ok(Self {
            config: config.clone(),
            consumer: None,
        })
    }

    fn build(&self) -> Result<StreamConsumer> {
        let mut client_config = create_client_config(&self.config)?;
        let consumer: StreamConsumer = client_config
            .set("group.id", &self.config.consumer_group)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", self.config.auto_offset_reset.as_str())
            .set("allow.auto.create.topics", "true")
            .set("fetch.min.bytes", "1")
            .set("fetch.wait.max.ms", "500")
            .set(
                "session.timeout.ms",
                self.config.consumer_session_timeout_ms.to_string(),
            )
            .set("heartbeat.interval.ms", "3000")
            .set(
                "max.poll.interval.ms",
                self.config.consumer_max_poll_interval_ms.to_string(),
            )
            .create()
            .context("Failed to create Kafka consumer")?;

        consumer
            .subscribe(&[&self.config.topic])
            .context("Failed to subscribe to Kafka topic")?;

        Ok(consumer)
    }
}

fn classify(err: KafkaError) -> BrokerError {
    match err {
        KafkaError::ConsumerCommit(code) => BrokerError::Commit(code.to_string()),
        other => BrokerError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl RecordConsumer for KafkaEventConsumer {
    async fn subscribe(&mut self) -> Result<(), BrokerError> {
        // Drop any previous client before re-joining the group
        self.consumer = None;
        let consumer = self
            .build()
            .map_err(|e| BrokerError::Unavailable(format!("{:#}", e)))?;

        info!(
            topic = %self.config.topic,
            group = %self.config.consumer_group,
            "Kafka consumer subscribed"
        );
        self.consumer = Some(Arc::new(consumer));
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<ConsumedRecord>, BrokerError> {
        let consumer = self.consumer.as_ref().ok_or(BrokerError::NotSubscribed)?;

        match tokio::time::timeout(timeout, consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Err(err)) => {
                warn!(error = %err, "Kafka consumer error");
                Err(classify(err))
            }
            Ok(Ok(message)) => Ok(Some(ConsumedRecord {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message.key().map(<[u8]>::to_vec),
                payload: message.payload().map(<[u8]>::to_vec),
            })),
        }
    }

    async fn commit(&mut self, record: &ConsumedRecord) -> Result<(), BrokerError> {
        let consumer = self.consumer.clone().ok_or(BrokerError::NotSubscribed)?;

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&record.topic, record.partition, Offset::Offset(record.offset + 1))
            .map_err(classify)?;
        // Sync commit waits on the broker round-trip; keep it off the async workers
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| BrokerError::Commit(format!("commit task failed: {}", e)))?
            .map_err(classify)
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
            info!(group = %self.config.consumer_group, "Kafka consumer left the group");
        }
        Ok(())
    }
}
