//! Report Handler

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{parse_id, HandlerError};
use crate::models::{
    CampaignFilter, CampaignStatus, CampaignSummary, DetailedQuery, DetailedReport, FollowUpCandidate, Reply,
    ReplyOutcome, SuppressionEntry,
};
use crate::services::{CampaignStore, EventService, ReportService};

#[derive(Debug, Deserialize)]
pub struct CampaignListQuery {
    pub client_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct CampaignListResponse {
    pub campaigns: Vec<CampaignSummary>,
    pub total: usize,
}

#[derive(Debug, Deserialize)]
pub struct RecordReplyBody {
    pub email: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Serialize)]
pub struct FollowUpResponse {
    pub campaign_id: String,
    pub candidates: Vec<FollowUpCandidate>,
}

/// Report handler
pub struct ReportHandler {
    report_service: Arc<ReportService>,
    event_service: Arc<EventService>,
    store: Arc<dyn CampaignStore>,
}

impl ReportHandler {
    pub fn new(
        report_service: Arc<ReportService>,
        event_service: Arc<EventService>,
        store: Arc<dyn CampaignStore>,
    ) -> Self {
        Self {
            report_service,
            event_service,
            store,
        }
    }

    /// `GET report/summary`
    pub async fn summary(&self, campaign_id: &str) -> Result<CampaignSummary, HandlerError> {
        Ok(self.report_service.summary(parse_id(campaign_id)?).await?)
    }

    /// `GET report/detailed`
    pub async fn detailed(&self, campaign_id: &str, query: DetailedQuery) -> Result<DetailedReport, HandlerError> {
        Ok(self.report_service.detailed(parse_id(campaign_id)?, &query).await?)
    }

    /// `GET report/followups`
    pub async fn follow_ups(&self, campaign_id: &str) -> Result<FollowUpResponse, HandlerError> {
        let id = parse_id(campaign_id)?;
        let candidates = self.report_service.follow_ups(id).await?;
        Ok(FollowUpResponse {
            campaign_id: id.to_string(),
            candidates,
        })
    }

    /// `POST reply/record`
    pub async fn record_reply(&self, campaign_id: &str, body: RecordReplyBody) -> Result<ReplyOutcome, HandlerError> {
        let id = parse_id(campaign_id)?;
        Ok(self
            .event_service
            .record_reply(id, &body.email, &body.subject, &body.body)
            .await?)
    }

    pub async fn replies(&self, campaign_id: &str) -> Result<Vec<Reply>, HandlerError> {
        let id = parse_id(campaign_id)?;
        self.report_service.summary(id).await?;
        Ok(self.event_service.replies(id).await?)
    }

    /// List campaigns
    pub async fn list_campaigns(&self, query: CampaignListQuery) -> Result<CampaignListResponse, HandlerError> {
        let status = match query.status.as_deref().map(str::to_lowercase).as_deref() {
            None | Some("") | Some("all") => None,
            Some("active") => Some(CampaignStatus::Active),
            Some("completed") => Some(CampaignStatus::Completed),
            Some(other) => return Err(HandlerError::bad_request(format!("Unknown status: {}", other))),
        };

        let filter = CampaignFilter {
            client_id: query.client_id,
            status,
            offset: query.offset.unwrap_or(0),
            limit: Some(query.limit.unwrap_or(50).clamp(1, 200)),
        };

        let total = self.store.count(&filter).await?;
        let campaigns = self.report_service.summaries(&filter).await?;
        Ok(CampaignListResponse { campaigns, total })
    }

    pub async fn delete_campaign(&self, campaign_id: &str) -> Result<(), HandlerError> {
        let id = parse_id(campaign_id)?;
        if !self.store.delete(id).await? {
            return Err(HandlerError::not_found(format!("Campaign not found: {}", id)));
        }
        tracing::info!(campaign_id = %id, "Campaign deleted");
        Ok(())
    }

    /// Suppression list
    pub async fn suppressions(&self) -> Vec<SuppressionEntry> {
        self.event_service.suppression().list().await
    }

    pub async fn suppress(&self, email: &str) -> Result<bool, HandlerError> {
        if !email.contains('@') {
            return Err(HandlerError::bad_request(format!("Invalid email address: {}", email)));
        }
        Ok(self.event_service.suppress(email).await)
    }

    pub async fn unsuppress(&self, email: &str) -> Result<(), HandlerError> {
        if !self.event_service.suppression().remove(email).await {
            return Err(HandlerError::not_found(format!("Not suppressed: {}", email)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Campaign, EmailAddress, MessageContent, RecipientInput};
    use crate::services::{MemoryCampaignStore, SuppressionList, TrackingService};

    async fn handler() -> (ReportHandler, Campaign) {
        let store: Arc<dyn CampaignStore> = Arc::new(MemoryCampaignStore::new());
        let campaign = store
            .create(Campaign::new(
                "Seed round",
                "client-1",
                "sender-1",
                EmailAddress::new("founder@startup.io"),
                MessageContent::new("Intro", "<p>Hi</p>"),
                vec![RecipientInput::new("jane@acme.vc")],
            ))
            .await
            .unwrap();
        let events = Arc::new(EventService::new(
            store.clone(),
            Arc::new(TrackingService::default()),
            Arc::new(SuppressionList::new()),
        ));
        let reports = Arc::new(ReportService::new(store.clone()));
        (ReportHandler::new(reports, events, store), campaign)
    }

    #[tokio::test]
    async fn test_not_found_and_bad_ids() {
        let (handler, _) = handler().await;
        assert_eq!(handler.summary("not-a-uuid").await.unwrap_err().status, 400);
        let missing = uuid::Uuid::now_v7().to_string();
        assert_eq!(handler.summary(&missing).await.unwrap_err().status, 404);
        assert_eq!(handler.follow_ups(&missing).await.unwrap_err().status, 404);
        assert_eq!(handler.delete_campaign(&missing).await.unwrap_err().status, 404);
    }

    #[tokio::test]
    async fn test_record_reply_and_summary() {
        let (handler, campaign) = handler().await;
        let id = campaign.id.to_string();

        let body = RecordReplyBody {
            email: "jane@acme.vc".to_string(),
            subject: "Re: Intro".to_string(),
            body: "Yes".to_string(),
        };
        handler.record_reply(&id, body).await.unwrap();
        assert_eq!(handler.replies(&id).await.unwrap().len(), 1);
        assert_eq!(handler.summary(&id).await.unwrap().replied, 1);

        let body = RecordReplyBody {
            email: "nobody@x.com".to_string(),
            subject: String::new(),
            body: String::new(),
        };
        assert_eq!(handler.record_reply(&id, body).await.unwrap_err().status, 404);
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let (handler, campaign) = handler().await;
        let query = CampaignListQuery {
            client_id: Some("client-1".to_string()),
            status: Some("active".to_string()),
            limit: None,
            offset: None,
        };
        let list = handler.list_campaigns(query).await.unwrap();
        assert_eq!(list.total, 1);

        let query = CampaignListQuery {
            client_id: None,
            status: Some("paused".to_string()),
            limit: None,
            offset: None,
        };
        assert_eq!(handler.list_campaigns(query).await.unwrap_err().status, 400);

        handler.delete_campaign(&campaign.id.to_string()).await.unwrap();
        assert_eq!(handler.summary(&campaign.id.to_string()).await.unwrap_err().status, 404);
    }

    #[tokio::test]
    async fn test_suppression_endpoints() {
        let (handler, _) = handler().await;
        assert!(handler.suppress("Jane@Acme.vc").await.unwrap());
        assert_eq!(handler.suppressions().await.len(), 1);
        handler.unsuppress("jane@acme.vc").await.unwrap();
        assert_eq!(handler.unsuppress("jane@acme.vc").await.unwrap_err().status, 404);
        assert_eq!(handler.suppress("nope").await.unwrap_err().status, 400);
    }
}
