use serde::Serialize;

use crate::events::UserRegisteredEvent;

pub const WELCOME_SUBJECT: &str = "Welcome to Our App!";

/// Sender identity stamped on outgoing mail
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sender {
    pub address: String,
    pub name: String,
}

/// A rendered welcome notification, ready for a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WelcomeMessage {
    pub from: Sender,
    pub to: String,
    pub recipient_name: String,
    pub subject: String,
    pub html_body: String,
}

pub fn welcome_message(event: &UserRegisteredEvent, from: &Sender) -> WelcomeMessage {
    WelcomeMessage {
        from: from.clone(),
        to: event.email.clone(),
        recipient_name: event.username.clone(),
        subject: WELCOME_SUBJECT.to_string(),
        html_body: welcome_body(&event.username, &from.name),
    }
}

fn welcome_body(username: &str, signature: &str) -> String {
    format!(
        "<h1>Welcome to Our App!</h1>\
         <p>Dear {},</p>\
         <p>Thank you for registering with us. We're excited to have you on board!</p>\
         <p>Best regards,<br>{} Team</p>",
        escape_html(username),
        escape_html(signature)
    )
}

fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
