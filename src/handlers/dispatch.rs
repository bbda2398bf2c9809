//! Dispatch Handler

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{parse_id, HandlerError};
use crate::models::{DeliveryStrategy, EmailAddress, MessageContent, RecipientInput, RecipientError, SendJob};
use crate::services::{DispatchRequest, DispatchService};

#[derive(Debug, Deserialize)]
pub struct DispatchBody {
    pub campaign_name: String,
    pub client_id: String,
    pub sender_id: String,
    pub from_email: String,
    pub from_name: Option<String>,
    pub subject: String,
    pub html: String,
    pub recipients: Vec<RecipientInput>,
    #[serde(default)]
    pub strategy: Option<DeliveryStrategy>,
}

impl From<DispatchBody> for DispatchRequest {
    fn from(body: DispatchBody) -> Self {
        let from = match &body.from_name {
            Some(name) => EmailAddress::with_name(&body.from_email, name),
            None => EmailAddress::new(&body.from_email),
        };
        let request = DispatchRequest::new(
            &body.campaign_name,
            &body.client_id,
            &body.sender_id,
            from,
            MessageContent::new(&body.subject, &body.html),
            body.recipients,
        );
        match body.strategy {
            Some(strategy) => request.with_strategy(strategy),
            None => request,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub job_id: String,
    pub campaign_id: String,
    pub total: usize,
    pub strategy: String,
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub campaign_id: String,
    pub status: String,
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub remaining: usize,
    pub progress: f64,
    pub errors: Vec<RecipientError>,
    pub started_at: String,
    pub finished_at: Option<String>,
}

impl From<&SendJob> for JobStatusResponse {
    fn from(job: &SendJob) -> Self {
        Self {
            job_id: job.id.to_string(),
            campaign_id: job.campaign_id.to_string(),
            status: job.status.to_string(),
            total: job.total,
            sent: job.sent,
            failed: job.failed,
            remaining: job.remaining(),
            progress: job.progress(),
            errors: job.errors.clone(),
            started_at: job.started_at.to_rfc3339(),
            finished_at: job.finished_at.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: String,
    /// False when the job had already finished
    pub cancelled: bool,
}

/// Dispatch handler
pub struct DispatchHandler {
    dispatch_service: Arc<DispatchService>,
}

impl DispatchHandler {
    pub fn new(dispatch_service: Arc<DispatchService>) -> Self {
        Self { dispatch_service }
    }

    /// Start a campaign; returns once the job is queued
    pub async fn dispatch(&self, body: DispatchBody) -> Result<DispatchResponse, HandlerError> {
        let job = self.dispatch_service.start(body.into()).await?;
        Ok(DispatchResponse {
            job_id: job.id.to_string(),
            campaign_id: job.campaign_id.to_string(),
            total: job.total,
            strategy: job.strategy,
        })
    }

    /// Poll a job
    pub async fn job_status(&self, job_id: &str) -> Result<JobStatusResponse, HandlerError> {
        let job = self.dispatch_service.job_status(parse_id(job_id)?).await?;
        Ok(JobStatusResponse::from(&job))
    }

    /// Jobs started for one campaign
    pub async fn campaign_jobs(&self, campaign_id: &str) -> Result<Vec<JobStatusResponse>, HandlerError> {
        let jobs = self.dispatch_service.jobs_for_campaign(parse_id(campaign_id)?).await?;
        Ok(jobs.iter().map(JobStatusResponse::from).collect())
    }

    pub async fn cancel(&self, job_id: &str) -> Result<CancelResponse, HandlerError> {
        let id = parse_id(job_id)?;
        let cancelled = self.dispatch_service.cancel(id).await?;
        Ok(CancelResponse {
            job_id: id.to_string(),
            cancelled,
        })
    }

    /// Send the still-pending recipients of a campaign
    pub async fn resume(
        &self,
        campaign_id: &str,
        strategy: Option<DeliveryStrategy>,
    ) -> Result<DispatchResponse, HandlerError> {
        let job = self.dispatch_service.resume(parse_id(campaign_id)?, strategy).await?;
        Ok(DispatchResponse {
            job_id: job.id.to_string(),
            campaign_id: job.campaign_id.to_string(),
            total: job.total,
            strategy: job.strategy,
        })
    }
}
