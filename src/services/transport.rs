//! Mail Transport
//!
//! The dispatcher hands single messages to a `Transport`. SMTP is the
//! built-in implementation; anything that can deliver an `OutboundMessage`
//! (a provider HTTP API, a test double) can stand in for it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::OutboundMessage;

/// Transport error
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Rejected by server: {0}")]
    Rejected(String),
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Not configured: {0}")]
    NotConfigured(String),
}

/// Accepted send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Provider message id; the message token when the provider has none
    pub message_id: String,
}

impl SendReceipt {
    pub fn new(message_id: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
        }
    }
}

/// Delivers one message
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, TransportError>;

    fn name(&self) -> &str {
        "custom"
    }
}
