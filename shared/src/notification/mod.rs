// Notification channels: what the delivery executor calls to send the
// welcome message, and how their failures are classified.

pub mod channel;
pub mod relay;
pub mod template;

pub use channel::{ChannelError, LogChannel, NotificationChannel};
pub use relay::HttpRelayChannel;
pub use template::{Sender, WelcomeMessage, welcome_message};

use anyhow::Result;
use herald_config::{ChannelConfig, ChannelKind};
use std::sync::Arc;

/// Build the channel selected by `NOTIFICATION_CHANNEL`
pub fn build_channel(config: &ChannelConfig, log_salt: &str) -> Result<Arc<dyn NotificationChannel>> {
    Ok(match config.kind {
        ChannelKind::Relay => Arc::new(HttpRelayChannel::from_config(config)?),
        ChannelKind::Log => Arc::new(LogChannel::new(log_salt)),
    })
}

impl Sender {
    pub fn from_config(config: &ChannelConfig) -> Self {
        Self {
            address: config.from_address.clone(),
            name: config.from_name.clone(),
        }
    }
}
