// ============================================================================
// Configuration Constants
// ============================================================================

pub(crate) const DEFAULT_HEALTH_PORT: u16 = 8081;

// Topic contract shared by the registration publisher and the email consumer
pub(crate) const DEFAULT_TOPIC: &str = "user-registered";
pub(crate) const DEFAULT_CONSUMER_GROUP: &str = "email-service-group";
pub(crate) const DEAD_LETTER_SUFFIX: &str = "-dlq";

// Delivery retry defaults
pub(crate) const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub(crate) const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;
pub(crate) const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;
pub(crate) const DEFAULT_JITTER_FACTOR: f64 = 0.2;

// Consumer loop defaults
pub(crate) const DEFAULT_POLL_TIMEOUT_MS: u64 = 1_000;
pub(crate) const DEFAULT_RECONNECT_MAX_FAILURES: u32 = 10;
pub(crate) const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;

// Deduplication window: comfortably longer than default Kafka retention (7 days)
pub(crate) const DEFAULT_DEDUP_TTL_HOURS: u64 = 7 * 24 + 2;

// Notification channel defaults
pub(crate) const DEFAULT_FROM_NAME: &str = "Your App";
pub(crate) const DEFAULT_EMAIL_SEND_TIMEOUT_MS: u64 = 10_000;

// Time conversion constants
pub const SECONDS_PER_HOUR: u64 = 3600;
