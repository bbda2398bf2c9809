//! Dispatch Service
//!
//! Entry point for sending a campaign: validates the request, charges the
//! sender's quota, persists the campaign, and runs the job in the background.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::dispatcher::{Delivery, DispatchTarget, Dispatcher};
use super::jobs::{JobError, JobStore};
use super::quota::{QuotaError, QuotaService};
use super::store::{CampaignStore, RecipientRef, StoreError};
use super::suppression::SuppressionList;
use super::tracking::TrackingService;
use super::transport::Transport;
use crate::models::{
    sort_by_priority, Campaign, DeliveryState, DeliveryStrategy, EmailAddress, JobResult, JobStatus,
    MessageContent, OutboundMessage, RecipientInput, RecipientOutcome, RecipientUpdate, RetryPolicy, SendJob,
};

/// Dispatch service error
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Quota(#[from] QuotaError),
    #[error("Campaign not found: {0}")]
    CampaignNotFound(Uuid),
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),
    #[error("Invalid request: {0}")]
    Invalid(String),
    #[error("Not configured: {0}")]
    NotConfigured(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Job store error: {0}")]
    Job(#[from] JobError),
}

/// Dispatch configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Strategy used when a request does not name one
    pub strategy: DeliveryStrategy,
    pub retry: RetryPolicy,
}

impl DispatchConfig {
    pub fn with_strategy(mut self, strategy: DeliveryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// A request to send one campaign
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub campaign_name: String,
    pub client_id: String,
    /// Quota key of the sending identity
    pub sender_id: String,
    pub from: EmailAddress,
    pub content: MessageContent,
    pub recipients: Vec<RecipientInput>,
    #[serde(default)]
    pub strategy: Option<DeliveryStrategy>,
}

impl DispatchRequest {
    pub fn new(
        campaign_name: &str,
        client_id: &str,
        sender_id: &str,
        from: EmailAddress,
        content: MessageContent,
        recipients: Vec<RecipientInput>,
    ) -> Self {
        Self {
            campaign_name: campaign_name.to_string(),
            client_id: client_id.to_string(),
            sender_id: sender_id.to_string(),
            from,
            content,
            recipients,
            strategy: None,
        }
    }

    pub fn with_strategy(mut self, strategy: DeliveryStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.recipients.is_empty() {
            return Err(DispatchError::Invalid("No recipients".to_string()));
        }
        if self.sender_id.trim().is_empty() {
            return Err(DispatchError::Invalid("Sender ID is required".to_string()));
        }
        if self.client_id.trim().is_empty() {
            return Err(DispatchError::Invalid("Client ID is required".to_string()));
        }
        if !self.from.is_valid() {
            return Err(DispatchError::Invalid(format!("Invalid from address: {}", self.from.email)));
        }
        if self.content.subject.trim().is_empty() {
            return Err(DispatchError::Invalid("Subject is required".to_string()));
        }
        if self.content.html.trim().is_empty() {
            return Err(DispatchError::Invalid("Message body is required".to_string()));
        }
        Ok(())
    }
}

/// Everything a background run needs
struct PreparedJob {
    job: SendJob,
    campaign: Campaign,
    targets: Vec<DispatchTarget>,
    strategy: DeliveryStrategy,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
}

/// Dispatch service
#[derive(Clone)]
pub struct DispatchService {
    config: DispatchConfig,
    store: Arc<dyn CampaignStore>,
    jobs: Arc<dyn JobStore>,
    quota: Arc<QuotaService>,
    tracking: Arc<TrackingService>,
    suppression: Arc<SuppressionList>,
    transport: Arc<RwLock<Option<Arc<dyn Transport>>>>,
    /// Cancellation handles of running jobs
    running: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
}

impl DispatchService {
    pub fn new(
        config: DispatchConfig,
        store: Arc<dyn CampaignStore>,
        jobs: Arc<dyn JobStore>,
        quota: Arc<QuotaService>,
        tracking: Arc<TrackingService>,
        suppression: Arc<SuppressionList>,
    ) -> Self {
        Self {
            config,
            store,
            jobs,
            quota,
            tracking,
            suppression,
            transport: Arc::new(RwLock::new(None)),
            running: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Set the transport used by jobs started from now on
    pub async fn set_transport(&self, transport: Arc<dyn Transport>) {
        tracing::info!(transport = transport.name(), "Transport configured");
        *self.transport.write().await = Some(transport);
    }

    pub async fn has_transport(&self) -> bool {
        self.transport.read().await.is_some()
    }

    async fn current_transport(&self) -> Result<Arc<dyn Transport>, DispatchError> {
        self.transport
            .read()
            .await
            .clone()
            .ok_or_else(|| DispatchError::NotConfigured("No transport configured".to_string()))
    }

    /// Start sending a campaign in the background and return the job record
    pub async fn start(&self, request: DispatchRequest) -> Result<SendJob, DispatchError> {
        let prepared = self.prepare(request).await?;
        Ok(self.spawn(prepared))
    }

    /// Send a campaign and wait for the job to finish
    pub async fn execute(&self, request: DispatchRequest) -> Result<JobResult, DispatchError> {
        let prepared = self.prepare(request).await?;
        Ok(self.run(prepared).await)
    }

    /// Start a new job for the still-pending recipients of a campaign,
    /// e.g. after a cancelled run
    pub async fn resume(
        &self,
        campaign_id: Uuid,
        strategy: Option<DeliveryStrategy>,
    ) -> Result<SendJob, DispatchError> {
        let transport = self.current_transport().await?;

        // Held until the new job is registered so only one resume wins
        let mut running = self.running.write().await;
        for job in self.jobs.for_campaign(campaign_id).await? {
            if running.contains_key(&job.id) {
                return Err(DispatchError::Invalid(format!("Job {} is still running", job.id)));
            }
        }

        let campaign = self
            .store
            .get(campaign_id)
            .await?
            .ok_or(DispatchError::CampaignNotFound(campaign_id))?;

        let targets: Vec<DispatchTarget> = campaign
            .recipients
            .iter()
            .enumerate()
            .filter(|(_, r)| r.state == DeliveryState::Pending)
            .map(|(index, r)| DispatchTarget::new(index, &r.email))
            .collect();
        if targets.is_empty() {
            return Err(DispatchError::Invalid("No pending recipients".to_string()));
        }

        let requested = request_size(targets.len())?;
        self.quota.authorize(&campaign.sender_id, requested).await?;
        self.quota.record(&campaign.sender_id, requested).await?;

        let strategy = strategy.unwrap_or(self.config.strategy);
        let prepared = self.launch(&mut running, campaign, targets, strategy, transport).await?;
        drop(running);
        Ok(self.spawn(prepared))
    }

    async fn prepare(&self, request: DispatchRequest) -> Result<PreparedJob, DispatchError> {
        request.validate()?;
        let transport = self.current_transport().await?;

        let requested = request_size(request.recipients.len())?;
        self.quota.authorize(&request.sender_id, requested).await?;

        let mut recipients = request.recipients;
        sort_by_priority(&mut recipients);

        let campaign = Campaign::new(
            &request.campaign_name,
            &request.client_id,
            &request.sender_id,
            request.from,
            request.content,
            recipients,
        );

        // Commit only once the job is certain to launch
        self.quota.record(&campaign.sender_id, requested).await?;
        let campaign = self.store.create(campaign).await?;

        let targets = campaign
            .recipients
            .iter()
            .enumerate()
            .map(|(index, r)| DispatchTarget::new(index, &r.email))
            .collect();

        let strategy = request.strategy.unwrap_or(self.config.strategy);
        let mut running = self.running.write().await;
        self.launch(&mut running, campaign, targets, strategy, transport).await
    }

    /// Persist the job record and register its cancellation handle
    async fn launch(
        &self,
        running: &mut HashMap<Uuid, CancellationToken>,
        campaign: Campaign,
        targets: Vec<DispatchTarget>,
        strategy: DeliveryStrategy,
        transport: Arc<dyn Transport>,
    ) -> Result<PreparedJob, DispatchError> {
        let job = SendJob::new(campaign.id, targets.len(), &strategy);
        self.jobs.set(job.clone()).await?;

        let cancel = CancellationToken::new();
        running.insert(job.id, cancel.clone());

        tracing::info!(
            job_id = %job.id,
            campaign_id = %campaign.id,
            sender = %campaign.sender_id,
            recipients = targets.len(),
            "Send job created"
        );

        Ok(PreparedJob {
            job,
            campaign,
            targets,
            strategy,
            transport,
            cancel,
        })
    }

    fn spawn(&self, prepared: PreparedJob) -> SendJob {
        let job = prepared.job.clone();
        let service = self.clone();
        tokio::spawn(async move {
            service.run(prepared).await;
        });
        job
    }

    async fn run(&self, prepared: PreparedJob) -> JobResult {
        let PreparedJob {
            job,
            campaign,
            targets,
            strategy,
            transport,
            cancel,
        } = prepared;

        let delivery = CampaignDelivery {
            campaign_id: campaign.id,
            from: campaign.from,
            content: campaign.content,
            store: Arc::clone(&self.store),
            tracking: Arc::clone(&self.tracking),
            suppression: Arc::clone(&self.suppression),
            transport,
        };

        let dispatcher = Dispatcher::new(Arc::clone(&self.jobs), strategy).with_retry(self.config.retry.clone());
        let result = dispatcher.dispatch(job.id, &targets, &delivery, &cancel).await;

        self.running.write().await.remove(&job.id);
        result
    }

    /// Current job record
    pub async fn job_status(&self, job_id: Uuid) -> Result<SendJob, DispatchError> {
        self.jobs.get(job_id).await?.ok_or(DispatchError::JobNotFound(job_id))
    }

    pub async fn jobs_for_campaign(&self, campaign_id: Uuid) -> Result<Vec<SendJob>, DispatchError> {
        Ok(self.jobs.for_campaign(campaign_id).await?)
    }

    /// Request cancellation. Returns `false` when the job already finished.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool, DispatchError> {
        if let Some(token) = self.running.read().await.get(&job_id) {
            tracing::info!(%job_id, "Send job cancellation requested");
            token.cancel();
            return Ok(true);
        }

        let job = self.job_status(job_id).await?;
        Ok(job.status == JobStatus::Running)
    }

    pub async fn is_running(&self, job_id: Uuid) -> bool {
        self.running.read().await.contains_key(&job_id)
    }
}

fn request_size(count: usize) -> Result<u32, DispatchError> {
    u32::try_from(count).map_err(|_| DispatchError::Invalid(format!("Too many recipients: {}", count)))
}

/// Sends one campaign's recipients through the transport
struct CampaignDelivery {
    campaign_id: Uuid,
    from: EmailAddress,
    content: MessageContent,
    store: Arc<dyn CampaignStore>,
    tracking: Arc<TrackingService>,
    suppression: Arc<SuppressionList>,
    transport: Arc<dyn Transport>,
}

impl CampaignDelivery {
    fn target(&self, index: usize) -> RecipientRef {
        RecipientRef::new(self.campaign_id, index)
    }

    async fn update(&self, index: usize, update: RecipientUpdate) {
        if let Err(e) = self.store.update_recipient(self.target(index), update, Utc::now()).await {
            tracing::warn!(campaign_id = %self.campaign_id, index, error = %e, "Failed to update recipient");
        }
    }
}

#[async_trait]
impl Delivery for CampaignDelivery {
    async fn begin(&self, target: &DispatchTarget) {
        let applied = self
            .store
            .update_recipient(self.target(target.index), RecipientUpdate::Sending, Utc::now())
            .await;

        // Issue the tracking token once, before the first attempt
        if let Ok(applied) = applied {
            if applied.recipient.tracking_token.is_none() {
                let token = self.tracking.issue_token();
                self.update(target.index, RecipientUpdate::AssignTrackingToken { token }).await;
            }
        }
    }

    async fn send_one(&self, target: &DispatchTarget) -> Result<String, String> {
        let recipient = self
            .store
            .get_recipient(self.target(target.index))
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "Recipient no longer exists".to_string())?;

        if let Some(reason) = self.suppression.reason(&recipient.email).await {
            return Err(format!("Recipient suppressed ({})", reason));
        }

        let to = recipient.address();
        if !to.is_valid() {
            return Err(format!("Invalid email address: {}", recipient.email));
        }

        let content = recipient.content.as_ref().unwrap_or(&self.content);
        let stamped = self.tracking.stamp(&content.html, &recipient);
        if stamped.newly_issued {
            self.update(
                target.index,
                RecipientUpdate::AssignTrackingToken {
                    token: stamped.tracking_token.clone(),
                },
            )
            .await;
        }

        let message = OutboundMessage {
            from: self.from.clone(),
            to,
            subject: content.subject.clone(),
            html: stamped.html,
            message_token: recipient.message_token.clone(),
        };

        self.transport
            .send(&message)
            .await
            .map(|receipt| receipt.message_id)
            .map_err(|e| e.to_string())
    }

    async fn record(&self, outcome: &RecipientOutcome) {
        let update = match &outcome.result {
            Ok(message_id) => RecipientUpdate::Sent {
                provider_message_id: Some(message_id.clone()),
                attempts: outcome.attempts,
            },
            Err(error) => RecipientUpdate::Failed {
                error: error.clone(),
                attempts: outcome.attempts,
            },
        };
        self.update(outcome.index, update).await;
    }

    async fn release(&self, target: &DispatchTarget) {
        self.update(target.index, RecipientUpdate::Released).await;
    }
}
