//! Campaign Store
//!
//! The persistence seam for campaigns, their recipients and replies. The
//! in-memory implementation keeps a token index next to the campaigns so
//! event correlation is a single map lookup.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{
    normalize_email, Campaign, CampaignFilter, CampaignStatus, Recipient, RecipientUpdate, Reply,
    UpdateEffect,
};

/// Store error
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Campaign not found: {0}")]
    NotFound(Uuid),
    #[error("Recipient {index} not found in campaign {campaign_id}")]
    RecipientNotFound { campaign_id: Uuid, index: usize },
    #[error("Campaign already exists: {0}")]
    Duplicate(Uuid),
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Points at one recipient of one campaign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecipientRef {
    pub campaign_id: Uuid,
    pub index: usize,
}

impl RecipientRef {
    pub fn new(campaign_id: Uuid, index: usize) -> Self {
        Self { campaign_id, index }
    }
}

/// State after an update was applied
#[derive(Debug, Clone)]
pub struct AppliedUpdate {
    pub target: RecipientRef,
    pub effect: UpdateEffect,
    pub recipient: Recipient,
    pub campaign_status: CampaignStatus,
}

/// Persistence for campaigns and replies
#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn create(&self, campaign: Campaign) -> Result<Campaign, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Campaign>, StoreError>;

    async fn get_recipient(&self, target: RecipientRef) -> Result<Option<Recipient>, StoreError>;

    async fn list(&self, filter: &CampaignFilter) -> Result<Vec<Campaign>, StoreError>;

    async fn count(&self, filter: &CampaignFilter) -> Result<usize, StoreError>;

    /// Delete a campaign with its tokens and replies. Returns whether it existed.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Resolve a message or tracking token
    async fn resolve_token(&self, token: &str) -> Result<Option<RecipientRef>, StoreError>;

    /// Most recently sent recipient with this address
    async fn find_latest_by_email(&self, email: &str) -> Result<Option<RecipientRef>, StoreError>;

    /// Apply an update atomically with the campaign counters
    async fn update_recipient(
        &self,
        target: RecipientRef,
        update: RecipientUpdate,
        at: DateTime<Utc>,
    ) -> Result<AppliedUpdate, StoreError>;

    async fn append_reply(&self, reply: Reply) -> Result<(), StoreError>;

    async fn replies(&self, campaign_id: Uuid) -> Result<Vec<Reply>, StoreError>;
}

/// In-memory campaign store
pub struct MemoryCampaignStore {
    /// Campaigns by ID
    campaigns: Arc<RwLock<HashMap<Uuid, Campaign>>>,
    /// Message and tracking tokens
    tokens: Arc<RwLock<HashMap<String, RecipientRef>>>,
    /// Recipients by normalized address
    emails: Arc<RwLock<HashMap<String, Vec<RecipientRef>>>>,
    /// Replies, in arrival order
    replies: Arc<RwLock<Vec<Reply>>>,
}

impl MemoryCampaignStore {
    pub fn new() -> Self {
        Self {
            campaigns: Arc::new(RwLock::new(HashMap::new())),
            tokens: Arc::new(RwLock::new(HashMap::new())),
            emails: Arc::new(RwLock::new(HashMap::new())),
            replies: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Number of indexed tokens
    pub async fn token_count(&self) -> usize {
        self.tokens.read().await.len()
    }
}

impl Default for MemoryCampaignStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CampaignStore for MemoryCampaignStore {
    async fn create(&self, campaign: Campaign) -> Result<Campaign, StoreError> {
        // Lock order: campaigns, tokens, emails
        let mut campaigns = self.campaigns.write().await;
        if campaigns.contains_key(&campaign.id) {
            return Err(StoreError::Duplicate(campaign.id));
        }

        let mut tokens = self.tokens.write().await;
        let mut emails = self.emails.write().await;
        for (index, recipient) in campaign.recipients.iter().enumerate() {
            let target = RecipientRef::new(campaign.id, index);
            tokens.insert(recipient.message_token.clone(), target);
            if let Some(token) = &recipient.tracking_token {
                tokens.insert(token.clone(), target);
            }
            emails.entry(recipient.normalized_email()).or_default().push(target);
        }

        campaigns.insert(campaign.id, campaign.clone());
        Ok(campaign)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Campaign>, StoreError> {
        let campaigns = self.campaigns.read().await;
        Ok(campaigns.get(&id).cloned())
    }

    async fn get_recipient(&self, target: RecipientRef) -> Result<Option<Recipient>, StoreError> {
        let campaigns = self.campaigns.read().await;
        Ok(campaigns
            .get(&target.campaign_id)
            .and_then(|c| c.recipients.get(target.index))
            .cloned())
    }

    async fn list(&self, filter: &CampaignFilter) -> Result<Vec<Campaign>, StoreError> {
        let campaigns = self.campaigns.read().await;

        let mut matching: Vec<&Campaign> = campaigns.values().filter(|c| filter.matches(c)).collect();
        // Newest first
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn count(&self, filter: &CampaignFilter) -> Result<usize, StoreError> {
        let campaigns = self.campaigns.read().await;
        Ok(campaigns.values().filter(|c| filter.matches(c)).count())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut campaigns = self.campaigns.write().await;
        let Some(campaign) = campaigns.remove(&id) else {
            return Ok(false);
        };

        let mut tokens = self.tokens.write().await;
        let mut emails = self.emails.write().await;
        for recipient in &campaign.recipients {
            tokens.remove(&recipient.message_token);
            if let Some(token) = &recipient.tracking_token {
                tokens.remove(token);
            }
            let key = recipient.normalized_email();
            if let Some(refs) = emails.get_mut(&key) {
                refs.retain(|r| r.campaign_id != id);
                if refs.is_empty() {
                    emails.remove(&key);
                }
            }
        }
        drop(emails);
        drop(tokens);
        drop(campaigns);

        let mut replies = self.replies.write().await;
        replies.retain(|r| r.campaign_id != id);

        Ok(true)
    }

    async fn resolve_token(&self, token: &str) -> Result<Option<RecipientRef>, StoreError> {
        let tokens = self.tokens.read().await;
        Ok(tokens.get(token).copied())
    }

    async fn find_latest_by_email(&self, email: &str) -> Result<Option<RecipientRef>, StoreError> {
        let campaigns = self.campaigns.read().await;
        let emails = self.emails.read().await;

        let Some(refs) = emails.get(&normalize_email(email)) else {
            return Ok(None);
        };

        Ok(refs
            .iter()
            .filter_map(|target| {
                let recipient = campaigns.get(&target.campaign_id)?.recipients.get(target.index)?;
                recipient.sent_at.map(|sent_at| (sent_at, *target))
            })
            .max_by_key(|(sent_at, _)| *sent_at)
            .map(|(_, target)| target))
    }

    async fn update_recipient(
        &self,
        target: RecipientRef,
        update: RecipientUpdate,
        at: DateTime<Utc>,
    ) -> Result<AppliedUpdate, StoreError> {
        let mut campaigns = self.campaigns.write().await;

        let campaign = campaigns
            .get_mut(&target.campaign_id)
            .ok_or(StoreError::NotFound(target.campaign_id))?;

        let effect = campaign
            .apply(target.index, &update, at)
            .ok_or(StoreError::RecipientNotFound {
                campaign_id: target.campaign_id,
                index: target.index,
            })?;

        let recipient = campaign.recipients[target.index].clone();
        let campaign_status = campaign.status;

        if let RecipientUpdate::AssignTrackingToken { token } = &update {
            if recipient.tracking_token.as_ref() == Some(token) {
                let mut tokens = self.tokens.write().await;
                tokens.insert(token.clone(), target);
            }
        }

        Ok(AppliedUpdate {
            target,
            effect,
            recipient,
            campaign_status,
        })
    }

    async fn append_reply(&self, reply: Reply) -> Result<(), StoreError> {
        let campaigns = self.campaigns.read().await;
        if !campaigns.contains_key(&reply.campaign_id) {
            return Err(StoreError::NotFound(reply.campaign_id));
        }
        drop(campaigns);

        let mut replies = self.replies.write().await;
        replies.push(reply);
        Ok(())
    }

    async fn replies(&self, campaign_id: Uuid) -> Result<Vec<Reply>, StoreError> {
        let replies = self.replies.read().await;
        Ok(replies.iter().filter(|r| r.campaign_id == campaign_id).cloned().collect())
    }
}
