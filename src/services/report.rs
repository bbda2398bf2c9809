//! Report Service

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::store::{CampaignStore, StoreError};
use crate::models::{
    follow_up_priority, Campaign, CampaignFilter, CampaignSummary, DetailedQuery, DetailedReport, DetailedRow,
    FinalStatus, FollowUpCandidate, FOLLOW_UP_AFTER_DAYS,
};

/// Report service error
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Campaign not found: {0}")]
    CampaignNotFound(Uuid),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Report service
pub struct ReportService {
    store: Arc<dyn CampaignStore>,
}

impl ReportService {
    pub fn new(store: Arc<dyn CampaignStore>) -> Self {
        Self { store }
    }

    async fn campaign(&self, campaign_id: Uuid) -> Result<Campaign, ReportError> {
        self.store
            .get(campaign_id)
            .await?
            .ok_or(ReportError::CampaignNotFound(campaign_id))
    }

    /// Counters and rates of one campaign
    pub async fn summary(&self, campaign_id: Uuid) -> Result<CampaignSummary, ReportError> {
        let campaign = self.campaign(campaign_id).await?;
        Ok(CampaignSummary::from(&campaign))
    }

    /// Summaries of the campaigns matching `filter`, newest first
    pub async fn summaries(&self, filter: &CampaignFilter) -> Result<Vec<CampaignSummary>, ReportError> {
        let campaigns = self.store.list(filter).await?;
        Ok(campaigns.iter().map(CampaignSummary::from).collect())
    }

    /// Filtered, paginated recipient rows. Replied first, then engaged, then
    /// the rest; most recently sent first within a group.
    pub async fn detailed(&self, campaign_id: Uuid, query: &DetailedQuery) -> Result<DetailedReport, ReportError> {
        let campaign = self.campaign(campaign_id).await?;

        let mut rows: Vec<DetailedRow> = campaign
            .recipients
            .iter()
            .enumerate()
            .filter(|(_, r)| query.matches(r))
            .map(|(index, r)| DetailedRow::new(index, r))
            .collect();

        rows.sort_by(|a, b| {
            a.final_status
                .sort_group()
                .cmp(&b.final_status.sort_group())
                .then_with(|| b.sent_at.cmp(&a.sent_at))
                .then_with(|| a.index.cmp(&b.index))
        });

        let page = query.normalized_page();
        let limit = query.normalized_limit();
        let total = rows.len();
        let total_pages = total.div_ceil(limit);

        let rows = rows.into_iter().skip((page - 1).saturating_mul(limit)).take(limit).collect();

        Ok(DetailedReport {
            campaign_id,
            rows,
            page,
            limit,
            total,
            total_pages,
        })
    }

    /// Follow-up suggestions as of now
    pub async fn follow_ups(&self, campaign_id: Uuid) -> Result<Vec<FollowUpCandidate>, ReportError> {
        self.follow_ups_at(campaign_id, Utc::now()).await
    }

    /// Recipients sent at least three days before `now` without a reply,
    /// excluding undeliverable and unsubscribed ones. Highest priority
    /// first, earliest send first on ties.
    pub async fn follow_ups_at(
        &self,
        campaign_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<FollowUpCandidate>, ReportError> {
        let campaign = self.campaign(campaign_id).await?;

        let mut candidates: Vec<FollowUpCandidate> = campaign
            .recipients
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.replied && !r.unsubscribed && !r.is_undeliverable())
            .filter_map(|(index, r)| {
                let sent_at = r.sent_at?;
                let days_since_sent = (now - sent_at).num_days();
                if days_since_sent < FOLLOW_UP_AFTER_DAYS {
                    return None;
                }
                Some(FollowUpCandidate {
                    index,
                    email: r.email.clone(),
                    contact_name: r.contact_name.clone(),
                    firm_name: r.firm_name.clone(),
                    state: r.state,
                    opened: r.opened,
                    clicked: r.clicked,
                    days_since_sent,
                    priority: follow_up_priority(r, days_since_sent),
                    sent_at,
                })
            })
            .collect();

        candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.sent_at.cmp(&b.sent_at)));
        Ok(candidates)
    }
}
