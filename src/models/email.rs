//! Email Models

use serde::{Deserialize, Serialize};

/// Email address with optional name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    /// Email address
    pub email: String,
    /// Display name (optional)
    pub name: Option<String>,
}

impl EmailAddress {
    pub fn new(email: &str) -> Self {
        Self {
            email: email.trim().to_string(),
            name: None,
        }
    }

    pub fn with_name(email: &str, name: &str) -> Self {
        Self {
            email: email.trim().to_string(),
            name: Some(name.to_string()),
        }
    }

    pub fn formatted(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }

    /// Lowercased address, used as the key for suppression and reply lookups
    pub fn normalized(&self) -> String {
        normalize_email(&self.email)
    }

    /// Local part and domain, if the address has exactly one `@`
    pub fn parts(&self) -> Option<(&str, &str)> {
        let (local, domain) = self.email.split_once('@')?;
        if local.is_empty() || domain.is_empty() || domain.contains('@') {
            return None;
        }
        Some((local, domain))
    }

    pub fn is_valid(&self) -> bool {
        self.parts().map_or(false, |(_, domain)| domain.contains('.'))
    }
}

impl From<&str> for EmailAddress {
    fn from(email: &str) -> Self {
        Self::new(email)
    }
}

impl From<String> for EmailAddress {
    fn from(email: String) -> Self {
        Self::new(&email)
    }
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Subject and HTML body of an outreach message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    pub subject: String,
    pub html: String,
}

impl MessageContent {
    pub fn new(subject: &str, html: &str) -> Self {
        Self {
            subject: subject.to_string(),
            html: html.to_string(),
        }
    }
}

/// A single message handed to the transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Sender
    pub from: EmailAddress,
    /// Recipient
    pub to: EmailAddress,
    /// Subject line
    pub subject: String,
    /// Tracked HTML body
    pub html: String,
    /// Message token, used as the Message-ID local part
    pub message_token: String,
}

impl OutboundMessage {
    /// Message-ID header value for the given domain
    pub fn message_id(&self, domain: &str) -> String {
        format!("<{}@{}>", self.message_token, domain)
    }
}
