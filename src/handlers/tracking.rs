//! Tracking Handler
//!
//! Public endpoints hit by mail clients and providers. None of them returns
//! an error response.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::models::{token_from_message_id, EventBatchReport, InboundReply, ReplyOutcome};
use crate::services::{EventService, TrackingService};

#[derive(Debug, Deserialize)]
pub struct OpenQuery {
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct ClickQuery {
    #[serde(default)]
    pub token: String,
    pub url: Option<String>,
}

/// Response for a tracking hit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackingResponse {
    /// 200 with an image body
    Pixel { content_type: String, body: Vec<u8> },
    /// 302 to `location`
    Redirect { location: String },
}

impl TrackingResponse {
    pub fn status(&self) -> u16 {
        match self {
            Self::Pixel { .. } => 200,
            Self::Redirect { .. } => 302,
        }
    }

    /// Extra response headers
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::Pixel { content_type, body } => vec![
                ("Content-Type", content_type.clone()),
                ("Content-Length", body.len().to_string()),
                ("Cache-Control", "no-cache, no-store, must-revalidate".to_string()),
            ],
            Self::Redirect { location } => vec![
                ("Location", location.clone()),
                ("Cache-Control", "no-cache".to_string()),
            ],
        }
    }
}

/// Inbound reply as posted by the mail receiver
#[derive(Debug, Deserialize)]
pub struct InboundBody {
    pub from: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default, alias = "text")]
    pub body: String,
    #[serde(default, alias = "messageToken")]
    pub message_token: Option<String>,
    /// Raw `In-Reply-To` header
    #[serde(default, alias = "In-Reply-To")]
    pub in_reply_to: Option<String>,
    /// Raw `References` header
    #[serde(default, alias = "References")]
    pub references: Option<String>,
}

impl From<InboundBody> for InboundReply {
    fn from(body: InboundBody) -> Self {
        let message_token = body
            .message_token
            .filter(|t| !t.trim().is_empty())
            .or_else(|| body.in_reply_to.as_deref().and_then(token_from_message_id))
            .or_else(|| body.references.as_deref().and_then(token_from_message_id));
        Self {
            message_token,
            from: body.from,
            subject: body.subject,
            body: body.body,
            received_at: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct InboundResponse {
    pub accepted: bool,
    #[serde(flatten)]
    pub outcome: ReplyOutcome,
}

/// Tracking handler
pub struct TrackingHandler {
    event_service: Arc<EventService>,
}

impl TrackingHandler {
    pub fn new(event_service: Arc<EventService>) -> Self {
        Self { event_service }
    }

    /// `GET /track/open?token=`
    pub async fn open(&self, query: OpenQuery) -> TrackingResponse {
        let body = self.event_service.on_open(query.token.trim()).await;
        TrackingResponse::Pixel {
            content_type: TrackingService::pixel_content_type().to_string(),
            body: body.to_vec(),
        }
    }

    /// `GET /track/click?token=&url=`
    pub async fn click(&self, query: ClickQuery) -> TrackingResponse {
        let location = self
            .event_service
            .on_click(query.token.trim(), query.url.as_deref())
            .await;
        TrackingResponse::Redirect { location }
    }

    /// Open hit from a raw query string
    pub async fn open_from_query(&self, raw_query: &str) -> TrackingResponse {
        let params = parse_query(raw_query);
        self.open(OpenQuery {
            token: params.get("token").cloned().unwrap_or_default(),
        })
        .await
    }

    /// Click hit from a raw query string; `url` is decoded exactly once
    pub async fn click_from_query(&self, raw_query: &str) -> TrackingResponse {
        let mut params = parse_query(raw_query);
        self.click(ClickQuery {
            token: params.remove("token").unwrap_or_default(),
            url: params.remove("url"),
        })
        .await
    }

    /// `POST` provider webhook with a JSON body
    pub async fn provider_webhook(&self, body: &[u8]) -> EventBatchReport {
        self.event_service.on_provider_payload(body).await
    }

    /// `POST /inbound`
    pub async fn inbound(&self, body: InboundBody) -> InboundResponse {
        let outcome = self.event_service.on_inbound_reply(body.into()).await;
        InboundResponse {
            accepted: true,
            outcome,
        }
    }
}

fn parse_query(raw_query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(raw_query.trim_start_matches('?').as_bytes())
        .into_owned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Campaign, EmailAddress, MessageContent, RecipientInput};
    use crate::services::{CampaignStore, MemoryCampaignStore, RecipientRef, SuppressionList, TrackingConfig};
    use crate::models::RecipientUpdate;
    use chrono::Utc;

    async fn handler() -> (TrackingHandler, Arc<MemoryCampaignStore>, Campaign) {
        let store = Arc::new(MemoryCampaignStore::new());
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
        store
            .update_recipient(
                RecipientRef::new(campaign.id, 0),
                RecipientUpdate::Sent { provider_message_id: None, attempts: 1 },
                Utc::now(),
            )
            .await
            .unwrap();

        let events = EventService::new(
            store.clone(),
            Arc::new(TrackingService::new(TrackingConfig::new("https://t.example.com"))),
            Arc::new(SuppressionList::new()),
        );
        (TrackingHandler::new(Arc::new(events)), store, campaign)
    }

    #[tokio::test]
    async fn test_click_from_query_decodes_once() {
        let (handler, store, campaign) = handler().await;
        let token = &campaign.recipients[0].message_token;

        let raw = format!("token={}&url=https%3A%2F%2Fdeck.io%2Fa%3Fx%3D1%26y%3D2", token);
        let response = handler.click_from_query(&raw).await;
        assert_eq!(response.status(), 302);
        assert_eq!(
            response,
            TrackingResponse::Redirect { location: "https://deck.io/a?x=1&y=2".to_string() }
        );

        let c = store.get(campaign.id).await.unwrap().unwrap();
        assert_eq!(c.counters.clicked, 1);
        assert_eq!(c.recipients[0].last_clicked_url.as_deref(), Some("https://deck.io/a?x=1&y=2"));
    }

    #[tokio::test]
    async fn test_open_never_fails() {
        let (handler, _, _) = handler().await;
        let response = handler.open_from_query("?token=unknown").await;
        assert_eq!(response.status(), 200);
        assert!(response.headers().contains(&("Content-Type", "image/gif".to_string())));

        let response = handler.open_from_query("").await;
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn test_inbound_with_in_reply_to() {
        let (handler, store, campaign) = handler().await;
        let body: InboundBody = serde_json::from_value(serde_json::json!({
            "from": "Jane <jane@acme.vc>",
            "subject": "Re: Intro",
            "text": "Sounds good",
            "In-Reply-To": format!("<{}@startup.io>", campaign.recipients[0].message_token),
        }))
        .unwrap();

        let response = handler.inbound(body).await;
        assert!(matches!(response.outcome, ReplyOutcome::Recorded { first: true, .. }));

        let c = store.get(campaign.id).await.unwrap().unwrap();
        assert!(c.recipients[0].replied);
    }

    #[tokio::test]
    async fn test_webhook_body() {
        let (handler, _, campaign) = handler().await;
        let body = format!(
            r#"[{{"messageToken":"{}","eventType":"delivered"}},{{"eventType":"open"}}]"#,
            campaign.recipients[0].message_token
        );
        let report = handler.provider_webhook(body.as_bytes()).await;
        assert_eq!(report.applied, 1);
        assert_eq!(report.malformed, 1);
    }
}
