// ============================================================================
// Notification Channel Configuration
// ============================================================================

use crate::constants::{DEFAULT_EMAIL_SEND_TIMEOUT_MS, DEFAULT_FROM_NAME};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelKind {
    /// HTTP email relay (SMTP bridge)
    Relay,
    /// Log-only dry run
    Log,
}

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    pub relay_url: Option<String>,
    pub relay_token: Option<String>,
    pub from_address: String,
    pub from_name: String,
    pub send_timeout_ms: u64,
}

impl ChannelConfig {
    pub(crate) fn from_env() -> Self {
        let kind = match std::env::var("NOTIFICATION_CHANNEL")
            .unwrap_or_else(|_| "relay".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "log" | "dry-run" => ChannelKind::Log,
            _ => ChannelKind::Relay,
        };

        Self {
            kind,
            relay_url: std::env::var("EMAIL_RELAY_URL").ok().filter(|v| !v.is_empty()),
            relay_token: std::env::var("EMAIL_RELAY_TOKEN").ok().filter(|v| !v.is_empty()),
            from_address: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "no-reply@localhost".to_string()),
            from_name: std::env::var("EMAIL_FROM_NAME")
                .unwrap_or_else(|_| DEFAULT_FROM_NAME.to_string()),
            send_timeout_ms: std::env::var("EMAIL_SEND_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_EMAIL_SEND_TIMEOUT_MS),
        }
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            kind: ChannelKind::Log,
            relay_url: None,
            relay_token: None,
            from_address: "no-reply@localhost".to_string(),
            from_name: DEFAULT_FROM_NAME.to_string(),
            send_timeout_ms: DEFAULT_EMAIL_SEND_TIMEOUT_MS,
        }
    }
}
