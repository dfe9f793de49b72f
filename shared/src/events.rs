use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Topic shared by every publisher and consumer of registration events
pub const USER_REGISTERED_TOPIC: &str = "user-registered";

/// Why a record payload could not be turned into an event
///
/// Any of these makes the record a poison message: retrying cannot fix it.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("record has no payload")]
    EmptyPayload,

    #[error("payload is not a valid UserRegistered event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{0} is required")]
    MissingField(&'static str),
}

/// Domain event emitted once an account has been durably created
///
/// Serialized to a flat JSON object and stored in Kafka keyed by `email`, so
/// every event for one identity lands on the same partition. The schema is
/// additive-only: unknown fields are ignored on decode, and the PascalCase
/// names written by older producers are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRegisteredEvent {
    /// Recipient address, also the partition key
    #[serde(alias = "Email")]
    pub email: String,

    /// Display label used in the greeting
    #[serde(alias = "Username")]
    pub username: String,

    /// Set by the publisher at creation time (RFC 3339, UTC)
    #[serde(rename = "timestamp", alias = "Timestamp")]
    pub occurred_at: DateTime<Utc>,

    /// Publisher-assigned token for optional consumer-side deduplication
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "IdempotencyToken"
    )]
    pub idempotency_token: Option<String>,
}

impl UserRegisteredEvent {
    /// Create a new event stamped with the current time and a fresh token
    pub fn new(email: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            username: username.into(),
            occurred_at: Utc::now(),
            idempotency_token: Some(uuid::Uuid::new_v4().to_string()),
        }
    }

    /// Validate event structure
    pub fn validate(&self) -> Result<(), EventError> {
        if self.email.trim().is_empty() {
            return Err(EventError::MissingField("email"));
        }
        if self.username.trim().is_empty() {
            return Err(EventError::MissingField("username"));
        }
        Ok(())
    }

    /// Encode as the JSON record value
    pub fn to_payload(&self) -> Result<Vec<u8>, EventError> {
        self.validate()?;
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode and validate a record value
    pub fn from_payload(payload: &[u8]) -> Result<Self, EventError> {
        if payload.is_empty() {
            return Err(EventError::EmptyPayload);
        }
        let event: Self = serde_json::from_slice(payload)?;
        event.validate()?;
        Ok(event)
    }

    /// Deduplication key (`email` + token); `None` when no token was assigned
    pub fn dedup_key(&self) -> Option<String> {
        self.idempotency_token
            .as_ref()
            .map(|token| format!("{}:{}", self.email.to_ascii_lowercase(), token))
    }
}
