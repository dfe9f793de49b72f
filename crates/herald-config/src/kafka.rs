// ============================================================================
// Kafka Configuration
// ============================================================================

use crate::constants::{DEAD_LETTER_SUFFIX, DEFAULT_CONSUMER_GROUP, DEFAULT_TOPIC};

/// Where a consumer group starts reading when it has no committed offset
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OffsetReset {
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }

    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "latest" | "largest" | "end" => OffsetReset::Latest,
            _ => OffsetReset::Earliest,
        }
    }
}

/// Kafka configuration for the user-registered event pipeline
#[derive(Clone, Debug)]
pub struct KafkaConfig {
    /// Whether Kafka is enabled (false = publishes are accepted and dropped)
    pub enabled: bool,
    /// Comma-separated list of Kafka brokers (e.g., "kafka1:9092,kafka2:9092")
    pub brokers: String,
    /// Topic carrying UserRegistered events
    pub topic: String,
    /// Consumer group of the notification dispatcher
    pub consumer_group: String,
    /// Topic receiving events that could not be delivered
    pub dead_letter_topic: String,
    /// Initial offset policy on first join
    pub auto_offset_reset: OffsetReset,
    /// SSL/TLS enabled
    pub ssl_enabled: bool,
    /// SASL mechanism (e.g., "SCRAM-SHA-256", "PLAIN")
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    /// Path to CA certificate file (for self-signed certificates)
    pub ssl_ca_location: Option<String>,
    // producer-specific settings
    pub producer_compression: String, // "zstd" | "snappy" | "gzip" | "lz4" | "none"
    pub producer_acks: String,        // "all" | "1" | "-1" | "0"
    pub producer_linger_ms: u32,
    pub producer_batch_size: u32,
    pub producer_max_in_flight: u32,
    pub producer_retries: u32,
    pub producer_request_timeout_ms: u32,
    pub producer_delivery_timeout_ms: u32,
    pub producer_enable_idempotence: bool,
    /// Upper bound a caller waits for a broker acknowledgment
    pub producer_send_timeout_ms: u64,
    // consumer-specific settings
    pub consumer_session_timeout_ms: u32,
    pub consumer_max_poll_interval_ms: u32,
}

impl KafkaConfig {
    pub(crate) fn from_env() -> Self {
        let topic = std::env::var("KAFKA_TOPIC").unwrap_or_else(|_| DEFAULT_TOPIC.to_string());
        let dead_letter_topic = std::env::var("KAFKA_DEAD_LETTER_TOPIC")
            .unwrap_or_else(|_| format!("{}{}", topic, DEAD_LETTER_SUFFIX));

        Self {
            enabled: std::env::var("KAFKA_ENABLED")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            brokers: std::env::var("KAFKA_BROKERS")
                .unwrap_or_else(|_| "localhost:9092".to_string()),
            topic,
            consumer_group: std::env::var("KAFKA_CONSUMER_GROUP")
                .unwrap_or_else(|_| DEFAULT_CONSUMER_GROUP.to_string()),
            dead_letter_topic,
            auto_offset_reset: OffsetReset::parse(
                &std::env::var("KAFKA_AUTO_OFFSET_RESET")
                    .unwrap_or_else(|_| "earliest".to_string()),
            ),
            ssl_enabled: std::env::var("KAFKA_SSL_ENABLED")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            sasl_mechanism: std::env::var("KAFKA_SASL_MECHANISM").ok(),
            sasl_username: std::env::var("KAFKA_SASL_USERNAME").ok(),
            sasl_password: std::env::var("KAFKA_SASL_PASSWORD").ok(),
            ssl_ca_location: std::env::var("KAFKA_SSL_CA_LOCATION").ok(),
            producer_compression: std::env::var("KAFKA_PRODUCER_COMPRESSION")
                .unwrap_or_else(|_| "snappy".to_string()),
            producer_acks: std::env::var("KAFKA_PRODUCER_ACKS")
                .unwrap_or_else(|_| "all".to_string()),
            producer_linger_ms: std::env::var("KAFKA_PRODUCER_LINGER_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            producer_batch_size: std::env::var("KAFKA_PRODUCER_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(16384),
            producer_max_in_flight: std::env::var("KAFKA_PRODUCER_MAX_IN_FLIGHT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            producer_retries: std::env::var("KAFKA_PRODUCER_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            producer_request_timeout_ms: std::env::var("KAFKA_PRODUCER_REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30000),
            producer_delivery_timeout_ms: std::env::var("KAFKA_PRODUCER_DELIVERY_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60000),
            producer_enable_idempotence: std::env::var("KAFKA_PRODUCER_ENABLE_IDEMPOTENCE")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            producer_send_timeout_ms: std::env::var("KAFKA_PRODUCER_SEND_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5000),
            consumer_session_timeout_ms: std::env::var("KAFKA_CONSUMER_SESSION_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30000),
            consumer_max_poll_interval_ms: std::env::var("KAFKA_CONSUMER_MAX_POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300000),
        }
    }

    /// Local development defaults pointing at `brokers`
    pub fn for_brokers(brokers: impl Into<String>) -> Self {
        Self {
            enabled: true,
            brokers: brokers.into(),
            topic: DEFAULT_TOPIC.to_string(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            dead_letter_topic: format!("{}{}", DEFAULT_TOPIC, DEAD_LETTER_SUFFIX),
            auto_offset_reset: OffsetReset::Earliest,
            ssl_enabled: false,
            sasl_mechanism: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
            producer_compression: "snappy".to_string(),
            producer_acks: "all".to_string(),
            producer_linger_ms: 10,
            producer_batch_size: 16384,
            producer_max_in_flight: 5,
            producer_retries: 10,
            producer_request_timeout_ms: 30000,
            producer_delivery_timeout_ms: 60000,
            producer_enable_idempotence: true,
            producer_send_timeout_ms: 5000,
            consumer_session_timeout_ms: 30000,
            consumer_max_poll_interval_ms: 300000,
        }
    }
}
