// ============================================================================
// Herald Config - Centralized configuration management
// ============================================================================
//
// Configuration for the registration publisher and the notification worker.
// Loaded from environment variables (and `.env`) with sensible defaults.
//
// ============================================================================

mod channel;
mod constants;
mod delivery;
mod kafka;
mod logging;

pub use channel::{ChannelConfig, ChannelKind};
pub use constants::SECONDS_PER_HOUR;
pub use delivery::DeliveryConfig;
pub use kafka::{KafkaConfig, OffsetReset};
pub use logging::LoggingConfig;

use anyhow::Result;
use constants::DEFAULT_HEALTH_PORT;

/// Main configuration structure for Herald services
#[derive(Clone, Debug)]
pub struct Config {
    pub health_port: u16,
    pub rust_log: String,

    // Sub-configurations
    pub logging: LoggingConfig,
    pub kafka: KafkaConfig,
    pub delivery: DeliveryConfig,
    pub channel: ChannelConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            health_port: std::env::var("HEALTH_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_HEALTH_PORT),
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            logging: LoggingConfig::from_env()?,
            kafka: KafkaConfig::from_env(),
            delivery: DeliveryConfig::from_env(),
            channel: ChannelConfig::from_env(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.kafka.brokers.trim().is_empty() {
            anyhow::bail!("KAFKA_BROKERS must not be empty");
        }
        if self.kafka.topic.trim().is_empty() {
            anyhow::bail!("KAFKA_TOPIC must not be empty");
        }
        if self.kafka.consumer_group.trim().is_empty() {
            anyhow::bail!("KAFKA_CONSUMER_GROUP must not be empty");
        }
        if self.kafka.dead_letter_topic == self.kafka.topic {
            anyhow::bail!("KAFKA_DEAD_LETTER_TOPIC must differ from KAFKA_TOPIC");
        }
        if self.delivery.max_attempts == 0 {
            anyhow::bail!("DELIVERY_MAX_ATTEMPTS must be at least 1");
        }
        if self.delivery.concurrency == 0 {
            anyhow::bail!("CONSUMER_CONCURRENCY must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.delivery.jitter_factor) {
            anyhow::bail!("DELIVERY_JITTER_FACTOR must be between 0.0 and 1.0");
        }
        if self.channel.kind == ChannelKind::Relay && self.channel.relay_url.is_none() {
            anyhow::bail!("EMAIL_RELAY_URL is required when NOTIFICATION_CHANNEL=relay");
        }
        for warning in self.warnings() {
            tracing::warn!("{}", warning);
        }
        Ok(())
    }

    /// Settings that run, but probably not the way the operator intended
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.channel.kind == ChannelKind::Log {
            warnings.push(
                "NOTIFICATION_CHANNEL=log: welcome emails are logged, not sent".to_string(),
            );
        }
        if self.delivery.shutdown_grace() < self.channel.send_timeout() {
            warnings.push(format!(
                "SHUTDOWN_GRACE_SECS ({}s) is shorter than EMAIL_SEND_TIMEOUT_MS ({}ms): \
                 an in-flight send may be abandoned at shutdown",
                self.delivery.shutdown_grace_secs, self.channel.send_timeout_ms
            ));
        }
        warnings
    }
}
