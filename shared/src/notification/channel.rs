use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use super::template::WelcomeMessage;
use crate::utils::log_safe_id;

/// Failures reported by a notification channel
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("could not reach notification channel: {0}")]
    Connection(String),

    #[error("notification channel did not answer within {0:?}")]
    Timeout(Duration),

    #[error("notification channel refused credentials: {0}")]
    Authentication(String),

    #[error("notification channel unavailable (HTTP {status})")]
    Unavailable { status: u16 },

    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("notification rejected (HTTP {status}): {reason}")]
    Rejected { status: u16, reason: String },
}

impl ChannelError {
    /// Transient failures are worth retrying; the rest go straight to dead-letter
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChannelError::Connection(_)
                | ChannelError::Timeout(_)
                | ChannelError::Authentication(_)
                | ChannelError::Unavailable { .. }
        )
    }

    /// Short label for metrics and dead-letter records
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelError::Connection(_) => "connection",
            ChannelError::Timeout(_) => "timeout",
            ChannelError::Authentication(_) => "authentication",
            ChannelError::Unavailable { .. } => "unavailable",
            ChannelError::InvalidRecipient(_) => "invalid_recipient",
            ChannelError::Rejected { .. } => "rejected",
        }
    }
}

/// External collaborator that actually delivers the welcome message
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(&self, message: &WelcomeMessage) -> Result<(), ChannelError>;
}

/// Dry-run channel: logs the message instead of sending it
#[derive(Debug, Clone, Default)]
pub struct LogChannel {
    log_salt: String,
}

impl LogChannel {
    pub fn new(log_salt: impl Into<String>) -> Self {
        Self {
            log_salt: log_salt.into(),
        }
    }
}

#[async_trait]
impl NotificationChannel for LogChannel {
    async fn send(&self, message: &WelcomeMessage) -> Result<(), ChannelError> {
        info!(
            recipient_hash = %log_safe_id(&message.to, &self.log_salt),
            subject = %message.subject,
            body_bytes = message.html_body.len(),
            "Welcome notification (dry run)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ChannelError::Connection("refused".into()).is_transient());
        assert!(ChannelError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(ChannelError::Authentication("401".into()).is_transient());
        assert!(ChannelError::Unavailable { status: 503 }.is_transient());

        assert!(!ChannelError::InvalidRecipient("no @".into()).is_transient());
        assert!(!ChannelError::Rejected {
            status: 400,
            reason: "bad".into()
        }
        .is_transient());
    }
}
