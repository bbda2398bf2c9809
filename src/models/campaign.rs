//! Campaign and Recipient Models
//!
//! A [`Campaign`] owns its [`Recipient`]s and the campaign-level counters.
//! Every mutation of a recipient goes through [`Campaign::apply`], which
//! applies a [`RecipientUpdate`] as a compare-and-set on the delivery state
//! and bumps counters only on first occurrences.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{normalize_email, EmailAddress, MessageContent};

/// Mint an opaque 128-bit random token
pub fn mint_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Campaign lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    /// Recipients still waiting to be attempted
    #[default]
    Active,
    /// Every recipient has been attempted
    Completed,
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Delivery state of a single recipient
///
/// States are ranked; a recipient only ever moves to a higher rank.
/// `Failed`, `Bounced` and `Complained` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    #[default]
    Pending,
    Sending,
    Sent,
    Failed,
    Delivered,
    Bounced,
    Complained,
}

impl DeliveryState {
    pub fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Sending => 1,
            Self::Sent | Self::Failed => 2,
            Self::Delivered => 3,
            Self::Bounced | Self::Complained => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Bounced | Self::Complained)
    }

    /// Whether the dispatcher has finished with this recipient
    pub fn is_attempted(self) -> bool {
        !matches!(self, Self::Pending | Self::Sending)
    }

    /// Whether moving to `next` keeps the state non-decreasing
    pub fn can_advance_to(self, next: DeliveryState) -> bool {
        if self == next || self.is_terminal() {
            return false;
        }
        match next {
            // A provider drop may still fail a message the transport accepted.
            Self::Failed => matches!(self, Self::Pending | Self::Sending | Self::Sent),
            _ => next.rank() > self.rank(),
        }
    }
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sending => write!(f, "sending"),
            Self::Sent => write!(f, "sent"),
            Self::Failed => write!(f, "failed"),
            Self::Delivered => write!(f, "delivered"),
            Self::Bounced => write!(f, "bounced"),
            Self::Complained => write!(f, "complained"),
        }
    }
}

/// Outreach priority, used to presort recipients before dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecipientPriority {
    High,
    #[default]
    Medium,
    Low,
}

/// Recipient as supplied by the caller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecipientInput {
    pub email: String,
    /// Contact name
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub firm_name: Option<String>,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub priority: RecipientPriority,
    /// Pre-personalised content overriding the campaign content
    #[serde(default)]
    pub content: Option<MessageContent>,
}

impl RecipientInput {
    pub fn new(email: &str) -> Self {
        Self {
            email: email.to_string(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: RecipientPriority) -> Self {
        self.priority = priority;
        self
    }
}

/// Stable sort high -> medium -> low; input order is kept within a priority
pub fn sort_by_priority(inputs: &mut [RecipientInput]) {
    inputs.sort_by_key(|input| input.priority);
}

/// One destination address within a campaign
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub email: String,
    pub contact_name: String,
    pub firm_name: String,
    pub sector: String,
    pub location: String,
    pub priority: RecipientPriority,
    /// Per-recipient content override
    pub content: Option<MessageContent>,
    /// Correlates provider events and replies
    pub message_token: String,
    /// Embedded in the open pixel and click links
    pub tracking_token: Option<String>,
    pub state: DeliveryState,
    /// Last send or delivery error
    pub error: Option<String>,
    pub provider_message_id: Option<String>,
    pub attempts: u32,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub bounced_at: Option<DateTime<Utc>>,
    pub complained_at: Option<DateTime<Utc>>,
    pub opened: bool,
    pub open_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked: bool,
    pub click_count: u32,
    pub first_clicked_at: Option<DateTime<Utc>>,
    pub last_clicked_at: Option<DateTime<Utc>>,
    pub last_clicked_url: Option<String>,
    pub replied: bool,
    pub replied_at: Option<DateTime<Utc>>,
    pub unsubscribed: bool,
}

impl Recipient {
    /// Build a recipient, filling missing metadata from the address
    pub fn from_input(input: RecipientInput) -> Self {
        let address = EmailAddress::new(&input.email);
        let (local, domain) = address.parts().unwrap_or((address.email.as_str(), ""));

        let contact_name = non_empty(input.name).unwrap_or_else(|| contact_from_local(local));
        let firm_name = non_empty(input.firm_name).unwrap_or_else(|| firm_from_domain(domain));

        Self {
            email: address.email.clone(),
            contact_name,
            firm_name,
            sector: non_empty(input.sector).unwrap_or_else(|| "Unknown".to_string()),
            location: non_empty(input.location).unwrap_or_else(|| "Unknown".to_string()),
            priority: input.priority,
            content: input.content,
            message_token: mint_token(),
            tracking_token: None,
            state: DeliveryState::Pending,
            error: None,
            provider_message_id: None,
            attempts: 0,
            sent_at: None,
            delivered_at: None,
            failed_at: None,
            bounced_at: None,
            complained_at: None,
            opened: false,
            open_count: 0,
            opened_at: None,
            clicked: false,
            click_count: 0,
            first_clicked_at: None,
            last_clicked_at: None,
            last_clicked_url: None,
            replied: false,
            replied_at: None,
            unsubscribed: false,
        }
    }

    pub fn address(&self) -> EmailAddress {
        EmailAddress::with_name(&self.email, &self.contact_name)
    }

    pub fn normalized_email(&self) -> String {
        normalize_email(&self.email)
    }

    pub fn is_undeliverable(&self) -> bool {
        self.state.is_terminal()
    }

    fn advance(&mut self, next: DeliveryState) -> bool {
        if self.state.can_advance_to(next) {
            self.state = next;
            true
        } else {
            false
        }
    }

    fn mark_delivered(&mut self, at: DateTime<Utc>, delta: &mut CounterDelta) {
        if self.advance(DeliveryState::Delivered) {
            self.delivered_at = Some(at);
            delta.delivered = true;
        }
    }

    /// A recipient already counted as sent is counted as dropped instead of
    /// failed, so `sent` and `failed` stay disjoint.
    fn mark_failed(&mut self, error: String, at: DateTime<Utc>, delta: &mut CounterDelta) {
        if self.advance(DeliveryState::Failed) {
            self.error = Some(error);
            self.failed_at = Some(at);
            if self.sent_at.is_some() {
                delta.dropped = true;
            } else {
                delta.failed = true;
            }
        }
    }

    /// Apply an update; never downgrades state, counts first occurrences only
    pub fn apply(&mut self, update: &RecipientUpdate, at: DateTime<Utc>) -> UpdateEffect {
        let previous = self.state;
        let mut delta = CounterDelta::default();

        match update {
            RecipientUpdate::Sending => {
                self.advance(DeliveryState::Sending);
            }
            RecipientUpdate::Released => {
                // The only backwards move; nothing was counted for Sending
                if self.state == DeliveryState::Sending {
                    self.state = DeliveryState::Pending;
                }
            }
            RecipientUpdate::Sent { provider_message_id, attempts } => {
                self.attempts = self.attempts.max(*attempts);
                if self.sent_at.is_none() {
                    self.sent_at = Some(at);
                    self.provider_message_id = provider_message_id.clone();
                    delta.sent = true;
                }
                self.advance(DeliveryState::Sent);
            }
            RecipientUpdate::Failed { error, attempts } => {
                self.attempts = self.attempts.max(*attempts);
                self.mark_failed(error.clone(), at, &mut delta);
            }
            RecipientUpdate::AssignTrackingToken { token } => {
                if self.tracking_token.is_none() {
                    self.tracking_token = Some(token.clone());
                }
            }
            RecipientUpdate::Processed => {
                if matches!(self.state, DeliveryState::Pending | DeliveryState::Sending) {
                    self.advance(DeliveryState::Sent);
                }
            }
            RecipientUpdate::Delivered => self.mark_delivered(at, &mut delta),
            RecipientUpdate::Opened => {
                self.open_count += 1;
                if !self.opened {
                    self.opened = true;
                    self.opened_at = Some(at);
                    delta.opened = true;
                }
                self.mark_delivered(at, &mut delta);
            }
            RecipientUpdate::Clicked { url } => {
                self.click_count += 1;
                self.last_clicked_at = Some(at);
                if url.is_some() {
                    self.last_clicked_url = url.clone();
                }
                if !self.clicked {
                    self.clicked = true;
                    self.first_clicked_at = Some(at);
                    delta.clicked = true;
                }
                self.mark_delivered(at, &mut delta);
            }
            RecipientUpdate::Bounced { reason } => {
                if self.advance(DeliveryState::Bounced) {
                    self.bounced_at = Some(at);
                    self.error = reason.clone().or_else(|| Some("bounced".to_string()));
                    delta.bounced = true;
                }
            }
            RecipientUpdate::Complained => {
                if self.advance(DeliveryState::Complained) {
                    self.complained_at = Some(at);
                    delta.complained = true;
                }
            }
            RecipientUpdate::Unsubscribed => {
                if !self.unsubscribed {
                    self.unsubscribed = true;
                    delta.unsubscribed = true;
                }
            }
            RecipientUpdate::Dropped { reason } => {
                let error = reason.clone().unwrap_or_else(|| "dropped by provider".to_string());
                self.mark_failed(error, at, &mut delta);
            }
            RecipientUpdate::Replied => {
                if !self.replied {
                    self.replied = true;
                    self.replied_at = Some(at);
                    delta.replied = true;
                }
                self.mark_delivered(at, &mut delta);
            }
        }

        UpdateEffect {
            previous,
            current: self.state,
            delta,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

const ROLE_MAILBOXES: &[&str] = &[
    "info", "contact", "hello", "team", "invest", "investments", "investors", "deals", "admin",
    "office", "partners",
];

fn title_case(words: impl Iterator<Item = String>) -> String {
    words
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// `jane.doe+vc` -> `Jane Doe`; role mailboxes become `Investment Team`
pub fn contact_from_local(local: &str) -> String {
    let local = local.split('+').next().unwrap_or(local);
    if ROLE_MAILBOXES.contains(&local.to_lowercase().as_str()) {
        return "Investment Team".to_string();
    }
    let name = title_case(
        local
            .split(|c: char| c == '.' || c == '_' || c == '-')
            .map(|w| w.trim_matches(|c: char| c.is_ascii_digit()).to_string()),
    );
    if name.is_empty() {
        "Investment Team".to_string()
    } else {
        name
    }
}

/// `acme-capital.com` -> `Acme Capital`
pub fn firm_from_domain(domain: &str) -> String {
    let label = domain.split('.').next().unwrap_or(domain);
    let name = title_case(
        label
            .split(|c: char| c == '-' || c == '_')
            .map(str::to_string),
    );
    if name.is_empty() {
        "Unknown".to_string()
    } else {
        name
    }
}

/// A transition requested by the dispatcher or the event correlator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecipientUpdate {
    Sending,
    /// Undo `Sending` for a recipient whose run stopped before an outcome
    Released,
    Sent {
        provider_message_id: Option<String>,
        attempts: u32,
    },
    Failed {
        error: String,
        attempts: u32,
    },
    AssignTrackingToken {
        token: String,
    },
    Processed,
    Delivered,
    Opened,
    Clicked {
        url: Option<String>,
    },
    Bounced {
        reason: Option<String>,
    },
    Complained,
    Unsubscribed,
    Dropped {
        reason: Option<String>,
    },
    Replied,
}

/// Which campaign counters an update incremented
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub sent: bool,
    pub delivered: bool,
    pub failed: bool,
    /// Failed after the send was counted
    pub dropped: bool,
    pub bounced: bool,
    pub complained: bool,
    pub unsubscribed: bool,
    pub opened: bool,
    pub clicked: bool,
    pub replied: bool,
}

impl CounterDelta {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Result of applying an update to one recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateEffect {
    pub previous: DeliveryState,
    pub current: DeliveryState,
    pub delta: CounterDelta,
}

impl UpdateEffect {
    pub fn state_changed(&self) -> bool {
        self.previous != self.current
    }
}

/// Monotonic campaign counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignCounters {
    pub total: u64,
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    /// Sent, then dropped by the provider; not part of `failed`
    #[serde(default)]
    pub dropped: u64,
    pub bounced: u64,
    pub complained: u64,
    pub unsubscribed: u64,
    pub opened: u64,
    pub clicked: u64,
    pub replied: u64,
}

impl CampaignCounters {
    pub fn record(&mut self, delta: &CounterDelta) {
        self.sent += u64::from(delta.sent);
        self.delivered += u64::from(delta.delivered);
        self.failed += u64::from(delta.failed);
        self.dropped += u64::from(delta.dropped);
        self.bounced += u64::from(delta.bounced);
        self.complained += u64::from(delta.complained);
        self.unsubscribed += u64::from(delta.unsubscribed);
        self.opened += u64::from(delta.opened);
        self.clicked += u64::from(delta.clicked);
        self.replied += u64::from(delta.replied);
    }

    pub fn open_rate(&self) -> f64 {
        ratio(self.opened, self.sent)
    }

    pub fn click_rate(&self) -> f64 {
        ratio(self.clicked, self.sent)
    }

    pub fn response_rate(&self) -> f64 {
        ratio(self.replied, self.sent)
    }
}

/// `numerator / denominator`, or 0 when the denominator is 0
pub fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// One outreach effort
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    /// Owning client identifier
    pub client_id: String,
    /// Quota key of the sending identity
    pub sender_id: String,
    pub from: EmailAddress,
    pub content: MessageContent,
    pub status: CampaignStatus,
    pub recipients: Vec<Recipient>,
    pub counters: CampaignCounters,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    pub fn new(
        name: &str,
        client_id: &str,
        sender_id: &str,
        from: EmailAddress,
        content: MessageContent,
        recipients: Vec<RecipientInput>,
    ) -> Self {
        let recipients: Vec<Recipient> = recipients.into_iter().map(Recipient::from_input).collect();
        let counters = CampaignCounters {
            total: recipients.len() as u64,
            ..Default::default()
        };

        Self {
            id: Uuid::now_v7(),
            name: name.to_string(),
            client_id: client_id.to_string(),
            sender_id: sender_id.to_string(),
            from,
            content,
            status: CampaignStatus::Active,
            recipients,
            counters,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Content for one recipient, honouring its override
    pub fn content_for(&self, index: usize) -> &MessageContent {
        self.recipients
            .get(index)
            .and_then(|r| r.content.as_ref())
            .unwrap_or(&self.content)
    }

    /// Apply an update to the recipient at `index`
    pub fn apply(&mut self, index: usize, update: &RecipientUpdate, at: DateTime<Utc>) -> Option<UpdateEffect> {
        let effect = self.recipients.get_mut(index)?.apply(update, at);
        self.counters.record(&effect.delta);
        self.refresh_status(at);
        Some(effect)
    }

    fn refresh_status(&mut self, at: DateTime<Utc>) {
        if self.status == CampaignStatus::Active
            && !self.recipients.is_empty()
            && self.recipients.iter().all(|r| r.state.is_attempted())
        {
            self.status = CampaignStatus::Completed;
            self.completed_at = Some(at);
        }
    }

    pub fn find_recipient(&self, email: &str) -> Option<usize> {
        let email = normalize_email(email);
        self.recipients.iter().position(|r| r.normalized_email() == email)
    }
}

/// Campaign listing filter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CampaignFilter {
    pub client_id: Option<String>,
    pub status: Option<CampaignStatus>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl CampaignFilter {
    pub fn for_client(client_id: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            ..Default::default()
        }
    }

    pub fn matches(&self, campaign: &Campaign) -> bool {
        self.client_id.as_ref().map_or(true, |c| &campaign.client_id == c)
            && self.status.map_or(true, |s| campaign.status == s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn campaign(emails: &[&str]) -> Campaign {
        Campaign::new(
            "Seed round",
            "client-1",
            "sender-1",
            EmailAddress::new("founder@startup.io"),
            MessageContent::new("Hello", "<p>Hello</p>"),
            emails.iter().map(|e| RecipientInput::new(e)).collect(),
        )
    }

    #[test]
    fn test_heuristics() {
        let r = Recipient::from_input(RecipientInput::new("jane.doe@acme-capital.com"));
        assert_eq!(r.contact_name, "Jane Doe");
        assert_eq!(r.firm_name, "Acme Capital");
        assert_eq!(r.sector, "Unknown");
        assert_eq!(r.location, "Unknown");

        assert_eq!(contact_from_local("info"), "Investment Team");
        assert_eq!(contact_from_local("john_smith+vc"), "John Smith");
        assert_eq!(firm_from_domain("sequoia.com"), "Sequoia");

        let mut input = RecipientInput::new("x@y.com");
        input.firm_name = Some("  Benchmark  ".to_string());
        input.sector = Some(String::new());
        let r = Recipient::from_input(input);
        assert_eq!(r.firm_name, "Benchmark");
        assert_eq!(r.sector, "Unknown");
    }

    #[test]
    fn test_tokens_unique() {
        let c = campaign(&["a@x.com", "b@x.com", "c@x.com"]);
        let mut tokens: Vec<_> = c.recipients.iter().map(|r| r.message_token.clone()).collect();
        tokens.sort();
        tokens.dedup();
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0].len(), 32);
    }

    #[test]
    fn test_priority_sort_is_stable() {
        let mut inputs = vec![
            RecipientInput::new("1@x.com").with_priority(RecipientPriority::Low),
            RecipientInput::new("2@x.com"),
            RecipientInput::new("3@x.com").with_priority(RecipientPriority::High),
            RecipientInput::new("4@x.com"),
            RecipientInput::new("5@x.com").with_priority(RecipientPriority::High),
        ];
        sort_by_priority(&mut inputs);
        let order: Vec<_> = inputs.iter().map(|i| i.email.as_str()).collect();
        assert_eq!(order, vec!["3@x.com", "5@x.com", "2@x.com", "4@x.com", "1@x.com"]);
    }

    #[test]
    fn test_state_never_downgrades() {
        assert!(DeliveryState::Sent.can_advance_to(DeliveryState::Delivered));
        assert!(DeliveryState::Sent.can_advance_to(DeliveryState::Failed));
        assert!(!DeliveryState::Delivered.can_advance_to(DeliveryState::Sent));
        assert!(!DeliveryState::Delivered.can_advance_to(DeliveryState::Failed));
        assert!(!DeliveryState::Bounced.can_advance_to(DeliveryState::Complained));
        assert!(!DeliveryState::Failed.can_advance_to(DeliveryState::Sent));
        assert!(DeliveryState::Pending.can_advance_to(DeliveryState::Sending));
    }

    #[test]
    fn test_delivered_before_sent_race() {
        let mut c = campaign(&["a@x.com"]);
        let now = Utc::now();

        c.apply(0, &RecipientUpdate::Sending, now);
        // Provider event lands before the dispatcher records the send.
        let effect = c.apply(0, &RecipientUpdate::Delivered, now).unwrap();
        assert_eq!(effect.current, DeliveryState::Delivered);

        let effect = c
            .apply(0, &RecipientUpdate::Sent { provider_message_id: None, attempts: 1 }, now)
            .unwrap();
        assert_eq!(effect.current, DeliveryState::Delivered);
        assert!(effect.delta.sent);
        assert_eq!(c.counters.sent, 1);
        assert_eq!(c.counters.delivered, 1);
    }

    #[test]
    fn test_first_occurrence_counters() {
        let mut c = campaign(&["a@x.com", "b@x.com"]);
        let now = Utc::now();
        c.apply(0, &RecipientUpdate::Sent { provider_message_id: None, attempts: 1 }, now);

        for _ in 0..3 {
            c.apply(0, &RecipientUpdate::Opened, now);
            c.apply(0, &RecipientUpdate::Clicked { url: Some("https://a.io".into()) }, now);
            c.apply(0, &RecipientUpdate::Replied, now);
        }

        let r = &c.recipients[0];
        assert_eq!(r.open_count, 3);
        assert_eq!(r.click_count, 3);
        assert_eq!(r.state, DeliveryState::Delivered);
        assert_eq!(c.counters.opened, 1);
        assert_eq!(c.counters.clicked, 1);
        assert_eq!(c.counters.replied, 1);
        assert_eq!(c.counters.delivered, 1);
    }

    #[test]
    fn test_bounce_is_terminal() {
        let mut c = campaign(&["a@x.com"]);
        let now = Utc::now();
        c.apply(0, &RecipientUpdate::Sent { provider_message_id: None, attempts: 1 }, now);
        c.apply(0, &RecipientUpdate::Bounced { reason: Some("550 no such user".into()) }, now);
        c.apply(0, &RecipientUpdate::Delivered, now);
        c.apply(0, &RecipientUpdate::Bounced { reason: None }, now);

        let r = &c.recipients[0];
        assert_eq!(r.state, DeliveryState::Bounced);
        assert_eq!(r.error.as_deref(), Some("550 no such user"));
        assert_eq!(c.counters.bounced, 1);
        assert_eq!(c.counters.delivered, 0);
    }

    #[test]
    fn test_completion_after_all_attempted() {
        let mut c = campaign(&["a@x.com", "b@x.com"]);
        let now = Utc::now();
        c.apply(0, &RecipientUpdate::Sent { provider_message_id: None, attempts: 1 }, now);
        assert_eq!(c.status, CampaignStatus::Active);
        c.apply(1, &RecipientUpdate::Failed { error: "boom".into(), attempts: 1 }, now);
        assert_eq!(c.status, CampaignStatus::Completed);
        assert!(c.completed_at.is_some());
        assert!(c.apply(5, &RecipientUpdate::Opened, now).is_none());
    }

    #[test]
    fn test_drop_after_send_keeps_outcomes_disjoint() {
        let mut c = campaign(&["a@x.com", "b@x.com", "c@x.com"]);
        let now = Utc::now();
        let sent = RecipientUpdate::Sent { provider_message_id: None, attempts: 1 };

        c.apply(0, &sent, now);
        let effect = c.apply(0, &RecipientUpdate::Dropped { reason: None }, now).unwrap();
        assert_eq!(effect.current, DeliveryState::Failed);
        assert!(effect.delta.dropped && !effect.delta.failed);
        assert_eq!(c.recipients[0].error.as_deref(), Some("dropped by provider"));

        // dropped before the dispatcher recorded anything
        c.apply(1, &RecipientUpdate::Sending, now);
        c.apply(1, &RecipientUpdate::Dropped { reason: Some("invalid".into()) }, now);

        // ignored once delivered
        c.apply(2, &sent, now);
        c.apply(2, &RecipientUpdate::Delivered, now);
        assert!(c.apply(2, &RecipientUpdate::Dropped { reason: None }, now).unwrap().delta.is_empty());
        assert_eq!(c.recipients[2].state, DeliveryState::Delivered);

        assert_eq!((c.counters.sent, c.counters.failed, c.counters.dropped), (2, 1, 1));
        assert!(c.counters.sent + c.counters.failed <= c.counters.total);
    }

    #[test]
    fn test_release_only_undoes_sending() {
        let mut c = campaign(&["a@x.com", "b@x.com"]);
        let now = Utc::now();
        c.apply(0, &RecipientUpdate::Sending, now);
        let effect = c.apply(0, &RecipientUpdate::Released, now).unwrap();
        assert_eq!(effect.current, DeliveryState::Pending);
        assert!(effect.delta.is_empty());

        c.apply(1, &RecipientUpdate::Sent { provider_message_id: None, attempts: 1 }, now);
        c.apply(1, &RecipientUpdate::Released, now);
        assert_eq!(c.recipients[1].state, DeliveryState::Sent);
        assert_eq!(c.status, CampaignStatus::Active);
    }

    #[test]
    fn test_rates_without_sends() {
        let counters = CampaignCounters::default();
        assert_eq!(counters.open_rate(), 0.0);
        assert_eq!(counters.click_rate(), 0.0);
        assert_eq!(counters.response_rate(), 0.0);

        let counters = CampaignCounters { sent: 4, opened: 2, clicked: 1, replied: 1, ..Default::default() };
        assert_eq!(counters.open_rate(), 0.5);
        assert_eq!(counters.click_rate(), 0.25);
        assert_eq!(counters.response_rate(), 0.25);
    }
}
