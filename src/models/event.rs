//! Engagement Event Models

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::RecipientUpdate;

/// Provider callback vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderEventType {
    /// Accepted by the provider
    Processed,
    /// Accepted by the receiving server
    Delivered,
    /// Opened (provider pixel)
    Open,
    /// Link clicked (provider redirect)
    Click,
    /// Rejected by the receiving server
    Bounce,
    /// Marked as spam
    #[serde(rename = "spamreport")]
    SpamReport,
    /// Unsubscribed
    Unsubscribe,
    /// Dropped by the provider before sending
    Dropped,
}

impl ProviderEventType {
    /// Map to the recipient transition both tracking channels share
    pub fn to_update(self, url: Option<&str>, reason: Option<&str>) -> RecipientUpdate {
        let reason = reason.map(str::to_string);
        match self {
            Self::Processed => RecipientUpdate::Processed,
            Self::Delivered => RecipientUpdate::Delivered,
            Self::Open => RecipientUpdate::Opened,
            Self::Click => RecipientUpdate::Clicked {
                url: url.map(str::to_string),
            },
            Self::Bounce => RecipientUpdate::Bounced { reason },
            Self::SpamReport => RecipientUpdate::Complained,
            Self::Unsubscribe => RecipientUpdate::Unsubscribed,
            Self::Dropped => RecipientUpdate::Dropped { reason },
        }
    }

    /// Whether the address should stop receiving mail
    pub fn suppression_reason(self) -> Option<SuppressionReason> {
        match self {
            Self::Bounce => Some(SuppressionReason::HardBounce),
            Self::SpamReport => Some(SuppressionReason::SpamComplaint),
            Self::Unsubscribe => Some(SuppressionReason::Unsubscribed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Processed => write!(f, "processed"),
            Self::Delivered => write!(f, "delivered"),
            Self::Open => write!(f, "open"),
            Self::Click => write!(f, "click"),
            Self::Bounce => write!(f, "bounce"),
            Self::SpamReport => write!(f, "spamreport"),
            Self::Unsubscribe => write!(f, "unsubscribe"),
            Self::Dropped => write!(f, "dropped"),
        }
    }
}

/// One event posted to the provider webhook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEvent {
    #[serde(alias = "messageToken", alias = "sg_message_id")]
    pub message_token: String,
    #[serde(alias = "eventType", alias = "event")]
    pub event_type: ProviderEventType,
    /// Unix seconds
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl ProviderEvent {
    pub fn new(message_token: &str, event_type: ProviderEventType) -> Self {
        Self {
            message_token: message_token.to_string(),
            event_type,
            timestamp: None,
            url: None,
            reason: None,
            email: None,
        }
    }

    /// Token without provider suffixes (`<token>.filter0001...`)
    pub fn token(&self) -> &str {
        let token = self.message_token.trim().trim_start_matches('<').trim_end_matches('>');
        let token = token.split('@').next().unwrap_or(token);
        token.split('.').next().unwrap_or(token)
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.timestamp
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .unwrap_or_else(Utc::now)
    }

    pub fn to_update(&self) -> RecipientUpdate {
        self.event_type.to_update(self.url.as_deref(), self.reason.as_deref())
    }
}

/// Why one event of a batch was not applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedEvent {
    /// Position in the posted batch
    pub index: usize,
    pub reason: String,
}

/// Summary of one webhook batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBatchReport {
    pub received: usize,
    pub applied: usize,
    pub unresolved: usize,
    pub malformed: usize,
    pub skipped: Vec<SkippedEvent>,
}

/// Inbound message as handed over by the mail receiver
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundReply {
    /// Token taken from In-Reply-To / References, if any
    #[serde(default, alias = "messageToken", alias = "in_reply_to")]
    pub message_token: Option<String>,
    pub from: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

/// Extract a message token from an `In-Reply-To`/`References` header value
pub fn token_from_message_id(header: &str) -> Option<String> {
    header
        .split_whitespace()
        .rev()
        .map(|id| id.trim_matches(|c| c == '<' || c == '>' || c == ','))
        .filter_map(|id| id.split('@').next())
        .find(|local| !local.is_empty())
        .map(str::to_string)
}

/// A received reply correlated to a campaign recipient. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub recipient_index: usize,
    pub from: String,
    pub subject: String,
    pub body: String,
    pub message_token: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// How an inbound reply was handled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReplyOutcome {
    /// Stored and attributed; `first` is true when it flipped the replied flag
    Recorded { reply_id: Uuid, campaign_id: Uuid, first: bool },
    /// No recipient matched the token or sender
    Unmatched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuppressionReason {
    HardBounce,
    SpamComplaint,
    Unsubscribed,
    Manual,
}

impl std::fmt::Display for SuppressionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HardBounce => write!(f, "hard bounce"),
            Self::SpamComplaint => write!(f, "spam complaint"),
            Self::Unsubscribed => write!(f, "unsubscribed"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Suppression list entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppressionEntry {
    pub email: String,
    pub reason: SuppressionReason,
    pub added_at: DateTime<Utc>,
}
