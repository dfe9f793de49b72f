// ============================================================================
// HTTP Email Relay Channel
// ============================================================================
//
// Posts the rendered welcome message as JSON to an email relay (an SMTP
// bridge). The client keeps no idle connections: each send opens and
// releases its own, so a relay outage between events leaks nothing.
//
// Status mapping:
// - 2xx                          -> delivered
// - 401 / 403                    -> Authentication (transient, creds may rotate)
// - 408 / 429 / 5xx              -> Unavailable (transient)
// - 422                          -> InvalidRecipient (permanent)
// - other 4xx                    -> Rejected (permanent)
// - connect error / timeout      -> Connection / Timeout (transient)
//
// ============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use herald_config::ChannelConfig;
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;

use super::channel::{ChannelError, NotificationChannel};
use super::template::WelcomeMessage;
use crate::utils::validate_email;

#[derive(Serialize)]
struct RelayAddress<'a> {
    email: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
struct RelayRequest<'a> {
    from: RelayAddress<'a>,
    to: RelayAddress<'a>,
    subject: &'a str,
    html: &'a str,
}

pub struct HttpRelayChannel {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpRelayChannel {
    pub fn new(endpoint: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_max_idle_per_host(0)
            .build()
            .context("Failed to build email relay HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token,
            timeout,
        })
    }

    pub fn from_config(config: &ChannelConfig) -> Result<Self> {
        let endpoint = config
            .relay_url
            .clone()
            .context("EMAIL_RELAY_URL is required for the relay channel")?;
        Self::new(endpoint, config.relay_token.clone(), config.send_timeout())
    }

    fn classify_transport(&self, err: reqwest::Error) -> ChannelError {
        if err.is_timeout() {
            ChannelError::Timeout(self.timeout)
        } else {
            ChannelError::Connection(err.to_string())
        }
    }
}

const MAX_ERROR_BODY_BYTES: usize = 512;

/// Cut `body` to at most `max` bytes without splitting a character
fn truncate_body(mut body: String, max: usize) -> String {
    if body.len() > max {
        let cut = body
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= max)
            .last()
            .unwrap_or(0);
        body.truncate(cut);
    }
    body
}

fn classify_status(status: StatusCode, body: String) -> ChannelError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ChannelError::Authentication(format!("HTTP {}", status.as_u16()))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => ChannelError::Unavailable {
            status: status.as_u16(),
        },
        s if s.is_server_error() => ChannelError::Unavailable { status: s.as_u16() },
        StatusCode::UNPROCESSABLE_ENTITY => ChannelError::InvalidRecipient(body),
        s => ChannelError::Rejected {
            status: s.as_u16(),
            reason: body,
        },
    }
}

#[async_trait]
impl NotificationChannel for HttpRelayChannel {
    async fn send(&self, message: &WelcomeMessage) -> Result<(), ChannelError> {
        validate_email(&message.to).map_err(ChannelError::InvalidRecipient)?;

        let request = RelayRequest {
            from: RelayAddress {
                email: &message.from.address,
                name: &message.from.name,
            },
            to: RelayAddress {
                email: &message.to,
                name: &message.recipient_name,
            },
            subject: &message.subject,
            html: &message.html_body,
        };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.classify_transport(e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        // Relay error bodies are short; cap what ends up in dead-letter records
        let body = truncate_body(response.text().await.unwrap_or_default(), MAX_ERROR_BODY_BYTES);
        Err(classify_status(status, body))
    }
}
