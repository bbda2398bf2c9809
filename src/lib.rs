//! RustReach - Outreach Campaign Plugin for RustPress
//!
//! RustReach sends personalised outreach to a recipient list and
//! attributes engagement back to each recipient:
//!
//! - **Dispatch**: Paced background jobs, strict-sequential or batched
//! - **Quota**: Daily and weekly send limits per sender
//! - **Tracking**: Open pixel and click redirects keyed by tracking token
//! - **Webhooks**: Provider delivery, bounce, complaint and engagement events
//! - **Replies**: Inbound replies matched by message token or sender
//! - **Reports**: Summaries, detailed recipient listings and follow-up lists
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rustreach::{RustReachPlugin, DispatchRequest, EmailAddress, MessageContent, RecipientInput};
//!
//! #[tokio::main]
//! async fn main() {
//!     let plugin = RustReachPlugin::new();
//!     plugin.configure_gmail("founder@gmail.com", "app-password").await.unwrap();
//!     plugin.initialize().await.unwrap();
//!
//!     let job = plugin.dispatch_service().start(DispatchRequest::new(
//!         "Seed round",
//!         "client-1",
//!         "founder@gmail.com",
//!         EmailAddress::with_name("founder@gmail.com", "Ada"),
//!         MessageContent::new("Intro", "<p>Hi Jane, a short intro.</p>"),
//!         vec![RecipientInput::new("jane@acme.vc")],
//!     )).await.unwrap();
//!
//!     println!("Job {} queued for {} recipients", job.id, job.total);
//! }
//! ```
//!
//! ## Tracking Endpoints
//!
//! ```rust,ignore
//! async fn on_open(plugin: &rustreach::RustReachPlugin, raw_query: &str) {
//!     let response = plugin.tracking_handler().open_from_query(raw_query).await;
//!     assert_eq!(response.status(), 200);
//! }
//! ```

pub mod models;
pub mod services;
pub mod handlers;
pub mod plugin;

// Re-exports
pub use models::{
    Campaign, CampaignFilter, CampaignStatus, Recipient, RecipientInput, RecipientPriority, DeliveryState,
    EmailAddress, MessageContent, OutboundMessage,
    SendJob, JobStatus, JobResult, DeliveryStrategy, RetryPolicy,
    QuotaLimits, QuotaUsage, QuotaWindowKind,
    ProviderEvent, ProviderEventType, InboundReply, Reply, ReplyOutcome, SuppressionReason,
    CampaignSummary, DetailedQuery, DetailedReport, FollowUpCandidate,
};

pub use services::{
    CampaignStore, MemoryCampaignStore, JobStore, MemoryJobStore, FileJobStore,
    DispatchService, DispatchRequest, DispatchConfig, EventService, ReportService, QuotaService,
    TrackingService, TrackingConfig, SuppressionList, Transport, SendReceipt,
};

#[cfg(feature = "smtp")]
pub use services::{SmtpTransport, SmtpConfig, TlsMode};

pub use handlers::{DispatchHandler, TrackingHandler, ReportHandler, HandlerError};

pub use plugin::{RustReachPlugin, RustReachConfig, PluginInfo, plugin_info};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the plugin
pub fn init() -> RustReachPlugin {
    RustReachPlugin::new()
}
