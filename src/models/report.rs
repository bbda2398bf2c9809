//! Campaign Report Models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Campaign, CampaignStatus, DeliveryState, Recipient};

/// Aggregate counts and rates for one campaign
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignSummary {
    pub campaign_id: Uuid,
    pub name: String,
    pub client_id: String,
    pub status: CampaignStatus,
    pub total: u64,
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    /// Sent, then dropped by the provider
    pub dropped: u64,
    pub bounced: u64,
    pub complained: u64,
    pub unsubscribed: u64,
    pub opened: u64,
    pub clicked: u64,
    pub replied: u64,
    /// opened / sent
    pub open_rate: f64,
    /// clicked / sent
    pub click_rate: f64,
    /// replied / sent
    pub response_rate: f64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Campaign> for CampaignSummary {
    fn from(campaign: &Campaign) -> Self {
        let c = &campaign.counters;
        Self {
            campaign_id: campaign.id,
            name: campaign.name.clone(),
            client_id: campaign.client_id.clone(),
            status: campaign.status,
            total: c.total,
            sent: c.sent,
            delivered: c.delivered,
            failed: c.failed,
            dropped: c.dropped,
            bounced: c.bounced,
            complained: c.complained,
            unsubscribed: c.unsubscribed,
            opened: c.opened,
            clicked: c.clicked,
            replied: c.replied,
            open_rate: c.open_rate(),
            click_rate: c.click_rate(),
            response_rate: c.response_rate(),
            created_at: campaign.created_at,
            completed_at: campaign.completed_at,
        }
    }
}

/// Derived per-recipient status, highest priority first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Replied,
    /// Opened or clicked
    Engaged,
    /// Failed, bounced or complained
    Undeliverable,
    DeliveredNoReply,
    FollowUpPending,
}

impl FinalStatus {
    pub fn of(recipient: &Recipient) -> Self {
        if recipient.replied {
            Self::Replied
        } else if recipient.opened || recipient.clicked {
            Self::Engaged
        } else if recipient.is_undeliverable() {
            Self::Undeliverable
        } else if recipient.state == DeliveryState::Delivered {
            Self::DeliveredNoReply
        } else {
            Self::FollowUpPending
        }
    }

    /// Sort group: replied, then engaged, then everything else
    pub fn sort_group(self) -> u8 {
        match self {
            Self::Replied => 0,
            Self::Engaged => 1,
            _ => 2,
        }
    }
}

impl std::fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Replied => write!(f, "replied"),
            Self::Engaged => write!(f, "engaged"),
            Self::Undeliverable => write!(f, "undeliverable"),
            Self::DeliveredNoReply => write!(f, "delivered_no_reply"),
            Self::FollowUpPending => write!(f, "follow_up_pending"),
        }
    }
}

/// Detailed report query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailedQuery {
    /// 1-based page
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Free text across firm, contact and email
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

fn default_page() -> usize {
    1
}

fn default_limit() -> usize {
    20
}

impl Default for DetailedQuery {
    fn default() -> Self {
        Self {
            page: default_page(),
            limit: default_limit(),
            search: None,
            sector: None,
            location: None,
        }
    }
}

impl DetailedQuery {
    pub const MAX_LIMIT: usize = 100;

    pub fn page(page: usize, limit: usize) -> Self {
        Self {
            page,
            limit,
            ..Default::default()
        }
    }

    pub fn with_search(mut self, search: &str) -> Self {
        self.search = Some(search.to_string());
        self
    }

    pub fn normalized_page(&self) -> usize {
        self.page.max(1)
    }

    pub fn normalized_limit(&self) -> usize {
        self.limit.clamp(1, Self::MAX_LIMIT)
    }

    pub fn matches(&self, recipient: &Recipient) -> bool {
        let search_ok = match self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(search) => {
                let needle = search.to_lowercase();
                [&recipient.firm_name, &recipient.contact_name, &recipient.email]
                    .iter()
                    .any(|field| field.to_lowercase().contains(&needle))
            }
            None => true,
        };
        search_ok
            && field_matches(self.sector.as_deref(), &recipient.sector)
            && field_matches(self.location.as_deref(), &recipient.location)
    }
}

fn field_matches(filter: Option<&str>, value: &str) -> bool {
    match filter.map(str::trim).filter(|f| !f.is_empty()) {
        Some(filter) => value.eq_ignore_ascii_case(filter),
        None => true,
    }
}

/// One recipient row of the detailed report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailedRow {
    pub index: usize,
    pub email: String,
    pub contact_name: String,
    pub firm_name: String,
    pub sector: String,
    pub location: String,
    pub state: DeliveryState,
    pub final_status: FinalStatus,
    pub opened: bool,
    pub open_count: u32,
    pub clicked: bool,
    pub click_count: u32,
    pub last_clicked_at: Option<DateTime<Utc>>,
    pub replied: bool,
    pub error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl DetailedRow {
    pub fn new(index: usize, recipient: &Recipient) -> Self {
        Self {
            index,
            email: recipient.email.clone(),
            contact_name: recipient.contact_name.clone(),
            firm_name: recipient.firm_name.clone(),
            sector: recipient.sector.clone(),
            location: recipient.location.clone(),
            state: recipient.state,
            final_status: FinalStatus::of(recipient),
            opened: recipient.opened,
            open_count: recipient.open_count,
            clicked: recipient.clicked,
            click_count: recipient.click_count,
            last_clicked_at: recipient.last_clicked_at,
            replied: recipient.replied,
            error: recipient.error.clone(),
            sent_at: recipient.sent_at,
        }
    }
}

/// Paginated detailed report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailedReport {
    pub campaign_id: Uuid,
    pub rows: Vec<DetailedRow>,
    pub page: usize,
    pub limit: usize,
    /// Rows matching the filters, across all pages
    pub total: usize,
    pub total_pages: usize,
}

/// A recipient worth following up with
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpCandidate {
    pub index: usize,
    pub email: String,
    pub contact_name: String,
    pub firm_name: String,
    pub state: DeliveryState,
    pub opened: bool,
    pub clicked: bool,
    pub days_since_sent: i64,
    /// Score in [0, 10]
    pub priority: u8,
    pub sent_at: DateTime<Utc>,
}

/// Minimum days since send before a recipient is suggested
pub const FOLLOW_UP_AFTER_DAYS: i64 = 3;

/// `min(10, 5*opened + 3*clicked + time factor + delivery bonus)`
pub fn follow_up_priority(recipient: &Recipient, days_since_sent: i64) -> u8 {
    let time_factor = if days_since_sent >= 7 {
        3
    } else if days_since_sent >= 5 {
        2
    } else {
        1
    };
    let delivery_bonus = if recipient.state == DeliveryState::Delivered { 2 } else { 0 };
    let score = 5 * u8::from(recipient.opened) + 3 * u8::from(recipient.clicked) + time_factor + delivery_bonus;
    score.min(10)
}
