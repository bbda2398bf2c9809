//! Event Correlator
//!
//! Maps tracking hits, provider callbacks and inbound replies back to the
//! recipient that caused them. Pixel, click and webhook paths never surface
//! an error to the caller; failures are logged and counted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use super::store::{AppliedUpdate, CampaignStore, RecipientRef, StoreError};
use super::suppression::SuppressionList;
use super::tracking::TrackingService;
use crate::models::{
    token_from_message_id, EventBatchReport, InboundReply, ProviderEvent, Reply, ReplyOutcome, RecipientUpdate,
    SkippedEvent, SuppressionReason,
};

/// Event service error
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Malformed event: {0}")]
    MalformedEvent(String),
    #[error("Unresolved token: {0}")]
    TokenUnresolved(String),
    #[error("Campaign not found: {0}")]
    CampaignNotFound(Uuid),
    #[error("Recipient {email} not found in campaign {campaign_id}")]
    RecipientNotFound { campaign_id: Uuid, email: String },
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Event service
pub struct EventService {
    store: Arc<dyn CampaignStore>,
    tracking: Arc<TrackingService>,
    suppression: Arc<SuppressionList>,
}

impl EventService {
    pub fn new(store: Arc<dyn CampaignStore>, tracking: Arc<TrackingService>, suppression: Arc<SuppressionList>) -> Self {
        Self {
            store,
            tracking,
            suppression,
        }
    }

    pub fn suppression(&self) -> &Arc<SuppressionList> {
        &self.suppression
    }

    /// Resolve a token and apply an update to its recipient
    pub async fn apply(
        &self,
        token: &str,
        update: RecipientUpdate,
        at: DateTime<Utc>,
    ) -> Result<AppliedUpdate, EventError> {
        let target = self
            .store
            .resolve_token(token)
            .await?
            .ok_or_else(|| EventError::TokenUnresolved(token.to_string()))?;
        Ok(self.store.update_recipient(target, update, at).await?)
    }

    /// Open pixel hit. Always returns the pixel bytes.
    pub async fn on_open(&self, token: &str) -> &'static [u8] {
        match self.apply(token, RecipientUpdate::Opened, Utc::now()).await {
            Ok(applied) => {
                tracing::debug!(
                    campaign_id = %applied.target.campaign_id,
                    recipient = %applied.recipient.email,
                    first = applied.effect.delta.opened,
                    "Open recorded"
                );
            }
            Err(e) => tracing::debug!(token, error = %e, "Open not attributed"),
        }
        TrackingService::pixel_bytes()
    }

    /// Click redirect hit. Always returns a redirect target.
    pub async fn on_click(&self, token: &str, destination: Option<&str>) -> String {
        let redirect = self.tracking.safe_redirect(destination);
        let update = RecipientUpdate::Clicked {
            url: destination.map(str::to_string),
        };

        match self.apply(token, update, Utc::now()).await {
            Ok(applied) => {
                tracing::debug!(
                    campaign_id = %applied.target.campaign_id,
                    recipient = %applied.recipient.email,
                    first = applied.effect.delta.clicked,
                    "Click recorded"
                );
            }
            Err(e) => tracing::debug!(token, error = %e, "Click not attributed"),
        }
        redirect
    }

    /// Raw webhook body: a JSON array of events or a single event object
    pub async fn on_provider_payload(&self, body: &[u8]) -> EventBatchReport {
        match serde_json::from_slice::<serde_json::Value>(body) {
            Ok(serde_json::Value::Array(events)) => self.on_provider_events(&events).await,
            Ok(event @ serde_json::Value::Object(_)) => self.on_provider_events(&[event]).await,
            Ok(_) | Err(_) => {
                tracing::warn!(bytes = body.len(), "Malformed provider payload");
                EventBatchReport {
                    received: 1,
                    malformed: 1,
                    skipped: vec![SkippedEvent {
                        index: 0,
                        reason: "payload is not a JSON event or array of events".to_string(),
                    }],
                    ..Default::default()
                }
            }
        }
    }

    /// Apply a batch of provider events, each independently
    pub async fn on_provider_events(&self, events: &[serde_json::Value]) -> EventBatchReport {
        let mut report = EventBatchReport {
            received: events.len(),
            ..Default::default()
        };

        for (index, raw) in events.iter().enumerate() {
            match self.on_provider_event(raw).await {
                Ok(()) => report.applied += 1,
                Err(err) => {
                    match &err {
                        EventError::MalformedEvent(reason) => {
                            tracing::warn!(index, reason = %reason, "Malformed provider event");
                            report.malformed += 1;
                        }
                        EventError::TokenUnresolved(token) => {
                            tracing::debug!(index, token = %token, "Provider event for unknown token");
                            report.unresolved += 1;
                        }
                        other => tracing::warn!(index, error = %other, "Provider event not applied"),
                    }
                    report.skipped.push(SkippedEvent {
                        index,
                        reason: err.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            received = report.received,
            applied = report.applied,
            unresolved = report.unresolved,
            malformed = report.malformed,
            "Provider events processed"
        );
        report
    }

    async fn on_provider_event(&self, raw: &serde_json::Value) -> Result<(), EventError> {
        let event = parse_event(raw)?;
        let applied = self.apply(event.token(), event.to_update(), event.occurred_at()).await?;

        if let Some(reason) = event.event_type.suppression_reason() {
            self.suppression.add(&applied.recipient.email, reason).await;
        }
        Ok(())
    }

    /// Correlate an inbound reply by message token, falling back to the
    /// sender address
    pub async fn on_inbound_reply(&self, inbound: InboundReply) -> ReplyOutcome {
        match self.correlate_reply(&inbound).await {
            Ok(Some(target)) => match self.store_reply(target, &inbound).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(from = %inbound.from, error = %e, "Failed to record reply");
                    ReplyOutcome::Unmatched
                }
            },
            Ok(None) => {
                tracing::info!(from = %inbound.from, "Inbound reply did not match any recipient");
                ReplyOutcome::Unmatched
            }
            Err(e) => {
                tracing::warn!(from = %inbound.from, error = %e, "Inbound reply lookup failed");
                ReplyOutcome::Unmatched
            }
        }
    }

    async fn correlate_reply(&self, inbound: &InboundReply) -> Result<Option<RecipientRef>, EventError> {
        if let Some(token) = inbound.message_token.as_deref().and_then(reply_token) {
            if let Some(target) = self.store.resolve_token(&token).await? {
                return Ok(Some(target));
            }
        }
        Ok(self.store.find_latest_by_email(&sender_address(&inbound.from)).await?)
    }

    async fn store_reply(&self, target: RecipientRef, inbound: &InboundReply) -> Result<ReplyOutcome, EventError> {
        let received_at = inbound.received_at.unwrap_or_else(Utc::now);
        let applied = self.store.update_recipient(target, RecipientUpdate::Replied, received_at).await?;

        let reply = Reply {
            id: Uuid::now_v7(),
            campaign_id: target.campaign_id,
            recipient_index: target.index,
            from: inbound.from.clone(),
            subject: inbound.subject.clone(),
            body: inbound.body.clone(),
            message_token: Some(applied.recipient.message_token.clone()),
            received_at,
        };
        let reply_id = reply.id;
        self.store.append_reply(reply).await?;

        let first = applied.effect.delta.replied;
        tracing::info!(
            campaign_id = %target.campaign_id,
            recipient = %applied.recipient.email,
            first,
            "Reply recorded"
        );
        Ok(ReplyOutcome::Recorded {
            reply_id,
            campaign_id: target.campaign_id,
            first,
        })
    }

    /// Record a reply logged by hand
    pub async fn record_reply(
        &self,
        campaign_id: Uuid,
        email: &str,
        subject: &str,
        body: &str,
    ) -> Result<ReplyOutcome, EventError> {
        let campaign = self
            .store
            .get(campaign_id)
            .await?
            .ok_or(EventError::CampaignNotFound(campaign_id))?;
        let index = campaign
            .find_recipient(email)
            .ok_or_else(|| EventError::RecipientNotFound {
                campaign_id,
                email: email.to_string(),
            })?;

        let inbound = InboundReply {
            message_token: None,
            from: campaign.recipients[index].email.clone(),
            subject: subject.to_string(),
            body: body.to_string(),
            received_at: None,
        };
        self.store_reply(RecipientRef::new(campaign_id, index), &inbound).await
    }

    /// Replies of one campaign
    pub async fn replies(&self, campaign_id: Uuid) -> Result<Vec<Reply>, EventError> {
        Ok(self.store.replies(campaign_id).await?)
    }

    /// Suppress an address by hand
    pub async fn suppress(&self, email: &str) -> bool {
        self.suppression.add(email, SuppressionReason::Manual).await
    }
}

fn parse_event(raw: &serde_json::Value) -> Result<ProviderEvent, EventError> {
    ProviderEvent::deserialize(raw).map_err(|e| EventError::MalformedEvent(e.to_string()))
}

/// Token from a bare token or a Message-ID style header value
fn reply_token(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else if value.contains('<') || value.contains('@') {
        token_from_message_id(value)
    } else {
        Some(value.to_string())
    }
}

/// `Jane Doe <jane@acme.vc>` -> `jane@acme.vc`
fn sender_address(from: &str) -> String {
    match (from.rfind('<'), from.rfind('>')) {
        (Some(start), Some(end)) if start < end => from[start + 1..end].trim().to_string(),
        _ => from.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Campaign, DeliveryState, EmailAddress, MessageContent, RecipientInput};
    use crate::services::report::ReportService;
    use crate::services::store::MemoryCampaignStore;
    use crate::services::tracking::TrackingConfig;
    use serde_json::json;
    use tracing_test::traced_test;

    struct Fixture {
        events: EventService,
        store: Arc<MemoryCampaignStore>,
        campaign: Campaign,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryCampaignStore::new());
        let campaign = store
            .create(Campaign::new(
                "Seed round",
                "client-1",
                "sender-1",
                EmailAddress::new("founder@startup.io"),
                MessageContent::new("Intro", "<p>Hi</p>"),
                vec![RecipientInput::new("jane@acme.vc"), RecipientInput::new("raj@fund.vc")],
            ))
            .await
            .unwrap();

        let events = EventService::new(
            store.clone(),
            Arc::new(TrackingService::new(TrackingConfig::new("https://t.example.com"))),
            Arc::new(SuppressionList::new()),
        );
        Fixture { events, store, campaign }
    }

    impl Fixture {
        fn token(&self, index: usize) -> String {
            self.campaign.recipients[index].message_token.clone()
        }

        async fn sent(&self, index: usize) {
            self.store
                .update_recipient(
                    RecipientRef::new(self.campaign.id, index),
                    RecipientUpdate::Sent { provider_message_id: None, attempts: 1 },
                    Utc::now(),
                )
                .await
                .unwrap();
        }

        async fn campaign(&self) -> Campaign {
            self.store.get(self.campaign.id).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_repeated_opens_count_once() {
        let f = fixture().await;
        f.sent(0).await;

        for _ in 0..3 {
            let pixel = f.events.on_open(&f.token(0)).await;
            assert!(pixel.starts_with(b"GIF"));
        }

        let c = f.campaign().await;
        assert_eq!(c.counters.opened, 1);
        assert_eq!(c.recipients[0].open_count, 3);
        assert_eq!(c.recipients[0].state, DeliveryState::Delivered);
    }

    #[tokio::test]
    async fn test_unknown_token_still_serves_pixel_and_redirect() {
        let f = fixture().await;
        assert!(!f.events.on_open("nope").await.is_empty());
        assert_eq!(f.events.on_click("nope", Some("https://deck.io")).await, "https://deck.io");
        assert_eq!(f.events.on_click("nope", None).await, "https://t.example.com/");
    }

    #[tokio::test]
    async fn test_click_records_url() {
        let f = fixture().await;
        f.sent(1).await;
        let redirect = f.events.on_click(&f.token(1), Some("https://deck.io/a")).await;
        assert_eq!(redirect, "https://deck.io/a");

        let c = f.campaign().await;
        assert!(c.recipients[1].clicked);
        assert_eq!(c.recipients[1].last_clicked_url.as_deref(), Some("https://deck.io/a"));
        assert_eq!(c.counters.clicked, 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_provider_batch_is_applied_per_event() {
        let f = fixture().await;
        f.sent(0).await;
        f.sent(1).await;

        let batch = vec![
            json!({"messageToken": f.token(0), "eventType": "delivered"}),
            json!({"messageToken": f.token(1), "eventType": "deferred"}),
            json!({"messageToken": "unknown", "eventType": "open"}),
            json!({"sg_message_id": format!("{}.filter0001", f.token(1)), "event": "bounce", "reason": "550"}),
        ];
        let report = f.events.on_provider_events(&batch).await;

        assert_eq!(report.received, 4);
        assert_eq!(report.applied, 2);
        assert_eq!(report.malformed, 1);
        assert_eq!(report.unresolved, 1);
        assert_eq!(report.skipped.iter().map(|s| s.index).collect::<Vec<_>>(), [1, 2]);
        assert!(logs_contain("Malformed provider event"));

        let c = f.campaign().await;
        assert_eq!(c.recipients[0].state, DeliveryState::Delivered);
        assert_eq!(c.recipients[1].state, DeliveryState::Bounced);
        assert_eq!(c.counters.bounced, 1);
        assert!(f.events.suppression().is_suppressed("raj@fund.vc").await);
    }

    #[tokio::test]
    async fn test_delivered_before_sent_is_kept() {
        let f = fixture().await;
        f.events
            .on_provider_events(&[json!({"messageToken": f.token(0), "eventType": "delivered"})])
            .await;
        f.sent(0).await;

        let c = f.campaign().await;
        assert_eq!(c.recipients[0].state, DeliveryState::Delivered);
        assert_eq!(c.counters.sent, 1);
        assert_eq!(c.counters.delivered, 1);
    }

    #[tokio::test]
    async fn test_payload_shapes() {
        let f = fixture().await;
        let single = format!(r#"{{"messageToken":"{}","eventType":"processed"}}"#, f.token(0));
        assert_eq!(f.events.on_provider_payload(single.as_bytes()).await.applied, 1);

        let report = f.events.on_provider_payload(b"not json").await;
        assert_eq!(report.malformed, 1);
        assert_eq!(report.applied, 0);
    }

    #[tokio::test]
    async fn test_processed_marks_sent_without_counting() {
        let f = fixture().await;
        let body = format!(r#"[{{"messageToken":"{}","eventType":"processed"}}]"#, f.token(0));
        assert_eq!(f.events.on_provider_payload(body.as_bytes()).await.applied, 1);

        let c = f.campaign().await;
        assert_eq!(c.recipients[0].state, DeliveryState::Sent);
        assert!(c.recipients[0].sent_at.is_none());
        assert_eq!(c.counters.sent, 0);

        // the dispatcher's record still counts the send once
        f.sent(0).await;
        assert_eq!(f.campaign().await.counters.sent, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_event_suppresses_and_skips_follow_up() {
        let f = fixture().await;
        f.sent(0).await;
        f.sent(1).await;

        let batch = vec![json!({"messageToken": f.token(0), "eventType": "unsubscribe"})];
        assert_eq!(f.events.on_provider_events(&batch).await.applied, 1);
        f.events.on_provider_events(&batch).await;

        let c = f.campaign().await;
        assert!(c.recipients[0].unsubscribed);
        assert_eq!(c.counters.unsubscribed, 1);
        assert_eq!(
            f.events.suppression().reason("jane@acme.vc").await,
            Some(SuppressionReason::Unsubscribed)
        );

        let reports = ReportService::new(f.store.clone());
        let follow_ups = reports
            .follow_ups_at(c.id, Utc::now() + chrono::Duration::days(4))
            .await
            .unwrap();
        assert_eq!(follow_ups.iter().map(|candidate| candidate.index).collect::<Vec<_>>(), [1]);
    }

    #[tokio::test]
    async fn test_dropped_after_delivered_is_ignored() {
        let f = fixture().await;
        f.sent(0).await;

        let batch = vec![
            json!({"messageToken": f.token(0), "eventType": "delivered"}),
            json!({"messageToken": f.token(0), "eventType": "dropped", "reason": "Bounced Address"}),
        ];
        assert_eq!(f.events.on_provider_events(&batch).await.applied, 2);

        let c = f.campaign().await;
        assert_eq!(c.recipients[0].state, DeliveryState::Delivered);
        assert!(c.recipients[0].error.is_none());
        assert_eq!((c.counters.delivered, c.counters.failed, c.counters.dropped), (1, 0, 0));
        assert!(!f.events.suppression().is_suppressed("jane@acme.vc").await);
    }

    #[tokio::test]
    async fn test_reply_by_message_id_header() {
        let f = fixture().await;
        f.sent(0).await;

        let outcome = f
            .events
            .on_inbound_reply(InboundReply {
                message_token: Some(format!("<{}@startup.io>", f.token(0))),
                from: "Jane <jane@acme.vc>".to_string(),
                subject: "Re: Intro".to_string(),
                body: "Let's talk".to_string(),
                received_at: None,
            })
            .await;
        assert!(matches!(outcome, ReplyOutcome::Recorded { first: true, .. }));

        let c = f.campaign().await;
        assert!(c.recipients[0].replied);
        assert_eq!(c.counters.replied, 1);
        assert_eq!(f.events.replies(c.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reply_falls_back_to_sender() {
        let f = fixture().await;
        f.sent(1).await;

        let inbound = InboundReply {
            message_token: None,
            from: "Raj <RAJ@fund.vc>".to_string(),
            subject: "Re: Intro".to_string(),
            ..Default::default()
        };
        let first = f.events.on_inbound_reply(inbound.clone()).await;
        let second = f.events.on_inbound_reply(inbound).await;
        assert!(matches!(first, ReplyOutcome::Recorded { first: true, .. }));
        assert!(matches!(second, ReplyOutcome::Recorded { first: false, .. }));

        let c = f.campaign().await;
        assert_eq!(c.counters.replied, 1);
        assert_eq!(f.events.replies(c.id).await.unwrap().len(), 2);

        let unknown = InboundReply {
            from: "stranger@else.com".to_string(),
            ..Default::default()
        };
        assert_eq!(f.events.on_inbound_reply(unknown).await, ReplyOutcome::Unmatched);
    }

    #[tokio::test]
    async fn test_record_reply() {
        let f = fixture().await;
        let outcome = f.events.record_reply(f.campaign.id, "JANE@acme.vc", "Re", "Yes").await.unwrap();
        assert!(matches!(outcome, ReplyOutcome::Recorded { first: true, .. }));

        let err = f.events.record_reply(f.campaign.id, "x@y.com", "Re", "").await.unwrap_err();
        assert!(matches!(err, EventError::RecipientNotFound { .. }));
        let err = f.events.record_reply(Uuid::now_v7(), "jane@acme.vc", "Re", "").await.unwrap_err();
        assert!(matches!(err, EventError::CampaignNotFound(_)));
    }

    #[test]
    fn test_sender_address() {
        assert_eq!(sender_address("Jane <jane@acme.vc>"), "jane@acme.vc");
        assert_eq!(sender_address(" jane@acme.vc "), "jane@acme.vc");
    }
}
