//! RustReach HTTP Handlers

pub mod dispatch;
pub mod tracking;
pub mod report;

pub use dispatch::DispatchHandler;
pub use tracking::TrackingHandler;
pub use report::ReportHandler;

use serde::Serialize;
use uuid::Uuid;

use crate::services::{DispatchError, EventError, JobError, QuotaError, ReportError, StoreError};

/// Error returned by handlers, with an HTTP status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerError {
    pub status: u16,
    pub message: String,
}

impl HandlerError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.status, self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<DispatchError> for HandlerError {
    fn from(err: DispatchError) -> Self {
        let status = match &err {
            DispatchError::Quota(QuotaError::Exceeded { .. }) => 429,
            DispatchError::CampaignNotFound(_) | DispatchError::JobNotFound(_) => 404,
            DispatchError::Invalid(_) => 400,
            DispatchError::Job(JobError::NotFound(_)) => 404,
            DispatchError::NotConfigured(_) => 503,
            DispatchError::Store(_) | DispatchError::Job(_) => 500,
        };
        Self::new(status, err.to_string())
    }
}

impl From<ReportError> for HandlerError {
    fn from(err: ReportError) -> Self {
        match err {
            ReportError::CampaignNotFound(_) => Self::not_found(err.to_string()),
            ReportError::Store(_) => Self::internal(err.to_string()),
        }
    }
}

impl From<EventError> for HandlerError {
    fn from(err: EventError) -> Self {
        let status = match &err {
            EventError::CampaignNotFound(_) | EventError::RecipientNotFound { .. } | EventError::TokenUnresolved(_) => 404,
            EventError::MalformedEvent(_) => 400,
            EventError::Store(_) => 500,
        };
        Self::new(status, err.to_string())
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) | StoreError::RecipientNotFound { .. } => Self::not_found(err.to_string()),
            _ => Self::internal(err.to_string()),
        }
    }
}

/// Parse a path id
pub(crate) fn parse_id(id: &str) -> Result<Uuid, HandlerError> {
    Uuid::parse_str(id.trim()).map_err(|e| HandlerError::bad_request(format!("Invalid id '{}': {}", id, e)))
}
