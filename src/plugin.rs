//! RustReach Plugin Entry Point

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::handlers::{DispatchHandler, ReportHandler, TrackingHandler};
use crate::models::QuotaLimits;
use crate::services::{
    CampaignStore, DispatchConfig, DispatchService, EventService, FileJobStore, JobStore, MemoryCampaignStore,
    MemoryJobStore, QuotaService, ReportService, SuppressionList, TrackingConfig, TrackingService, Transport,
};
#[cfg(feature = "smtp")]
use crate::services::{SmtpConfig, SmtpTransport};

/// Plugin configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RustReachConfig {
    pub tracking: TrackingConfig,
    pub quota: QuotaLimits,
    pub dispatch: DispatchConfig,
    /// Job records survive restarts when set
    pub job_store_path: Option<PathBuf>,
    #[cfg(feature = "smtp")]
    pub smtp: Option<SmtpConfig>,
}

/// RustReach Plugin
pub struct RustReachPlugin {
    config: RustReachConfig,
    store: Arc<dyn CampaignStore>,
    quota: Arc<QuotaService>,
    suppression: Arc<SuppressionList>,
    dispatch_service: Arc<DispatchService>,
    event_service: Arc<EventService>,
    report_service: Arc<ReportService>,
    dispatch_handler: DispatchHandler,
    tracking_handler: TrackingHandler,
    report_handler: ReportHandler,
}

impl RustReachPlugin {
    /// Create a plugin with default configuration and in-memory storage
    pub fn new() -> Self {
        Self::with_config(RustReachConfig::default())
    }

    /// Create a plugin with in-memory job storage
    pub fn with_config(config: RustReachConfig) -> Self {
        Self::build(config, Arc::new(MemoryJobStore::new()))
    }

    /// Create a plugin, opening the job file when `job_store_path` is set
    pub async fn open(config: RustReachConfig) -> Result<Self, String> {
        let jobs: Arc<dyn JobStore> = match &config.job_store_path {
            Some(path) => Arc::new(FileJobStore::open(path).await.map_err(|e| e.to_string())?),
            None => Arc::new(MemoryJobStore::new()),
        };
        Ok(Self::build(config, jobs))
    }

    fn build(config: RustReachConfig, jobs: Arc<dyn JobStore>) -> Self {
        let store: Arc<dyn CampaignStore> = Arc::new(MemoryCampaignStore::new());
        let quota = Arc::new(QuotaService::new(config.quota));
        let tracking = Arc::new(TrackingService::new(config.tracking.clone()));
        let suppression = Arc::new(SuppressionList::new());

        let dispatch_service = Arc::new(DispatchService::new(
            config.dispatch.clone(),
            Arc::clone(&store),
            jobs,
            Arc::clone(&quota),
            Arc::clone(&tracking),
            Arc::clone(&suppression),
        ));
        let event_service = Arc::new(EventService::new(
            Arc::clone(&store),
            Arc::clone(&tracking),
            Arc::clone(&suppression),
        ));
        let report_service = Arc::new(ReportService::new(Arc::clone(&store)));

        let dispatch_handler = DispatchHandler::new(Arc::clone(&dispatch_service));
        let tracking_handler = TrackingHandler::new(Arc::clone(&event_service));
        let report_handler = ReportHandler::new(
            Arc::clone(&report_service),
            Arc::clone(&event_service),
            Arc::clone(&store),
        );

        Self {
            config,
            store,
            quota,
            suppression,
            dispatch_service,
            event_service,
            report_service,
            dispatch_handler,
            tracking_handler,
            report_handler,
        }
    }

    /// Initialize the plugin; connects SMTP when configured
    pub async fn initialize(&self) -> Result<(), String> {
        #[cfg(feature = "smtp")]
        {
            if let Some(smtp) = self.config.smtp.clone() {
                self.configure_smtp(smtp).await?;
            }
        }

        if !self.dispatch_service.has_transport().await {
            tracing::warn!("No transport configured; dispatch requests will be rejected");
        }
        tracing::info!(
            base_url = %self.config.tracking.base_url,
            daily = self.config.quota.daily,
            weekly = self.config.quota.weekly,
            "RustReach initialized"
        );
        Ok(())
    }

    /// Configure SMTP
    #[cfg(feature = "smtp")]
    pub async fn configure_smtp(&self, config: SmtpConfig) -> Result<(), String> {
        let transport = SmtpTransport::new(config);
        transport.connect().await.map_err(|e| e.to_string())?;
        self.set_transport(Arc::new(transport)).await;
        Ok(())
    }

    /// Configure with Gmail
    #[cfg(feature = "smtp")]
    pub async fn configure_gmail(&self, username: &str, password: &str) -> Result<(), String> {
        self.configure_smtp(SmtpConfig::gmail(username, password)).await
    }

    /// Use any transport
    pub async fn set_transport(&self, transport: Arc<dyn Transport>) {
        self.dispatch_service.set_transport(transport).await;
    }

    /// Get plugin name
    pub fn name(&self) -> &'static str {
        "RustReach"
    }

    /// Get plugin version
    pub fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Get plugin description
    pub fn description(&self) -> &'static str {
        "Outreach campaigns with engagement tracking for RustPress"
    }

    pub fn config(&self) -> &RustReachConfig {
        &self.config
    }

    // Service accessors
    pub fn store(&self) -> &Arc<dyn CampaignStore> {
        &self.store
    }

    pub fn quota(&self) -> &Arc<QuotaService> {
        &self.quota
    }

    pub fn suppression(&self) -> &Arc<SuppressionList> {
        &self.suppression
    }

    pub fn dispatch_service(&self) -> &Arc<DispatchService> {
        &self.dispatch_service
    }

    pub fn events(&self) -> &Arc<EventService> {
        &self.event_service
    }

    pub fn reports(&self) -> &Arc<ReportService> {
        &self.report_service
    }

    // Handler accessors
    pub fn dispatch_handler(&self) -> &DispatchHandler {
        &self.dispatch_handler
    }

    pub fn tracking_handler(&self) -> &TrackingHandler {
        &self.tracking_handler
    }

    pub fn report_handler(&self) -> &ReportHandler {
        &self.report_handler
    }
}

impl Default for RustReachPlugin {
    fn default() -> Self {
        Self::new()
    }
}

/// Plugin metadata for registration
pub fn plugin_info() -> PluginInfo {
    PluginInfo {
        name: "RustReach",
        version: env!("CARGO_PKG_VERSION"),
        description: "Outreach campaigns with engagement tracking for RustPress",
        author: "RustPress Team",
        homepage: "https://rustpress.dev/plugins/rustreach",
        license: "MIT",
        dependencies: vec![],
        hooks: vec![
            "outreach.dispatched",
            "outreach.sent",
            "outreach.failed",
            "outreach.delivered",
            "outreach.bounced",
            "outreach.opened",
            "outreach.clicked",
            "outreach.replied",
            "outreach.unsubscribed",
        ],
        routes: vec![
            "/track/open",
            "/track/click",
            "/inbound",
            "/webhooks/provider",
            "/api/outreach/dispatch",
            "/api/outreach/jobs/:job_id",
            "/api/outreach/jobs/:job_id/cancel",
            "/api/outreach/campaigns",
            "/api/outreach/campaigns/:campaign_id",
            "/api/outreach/campaigns/:campaign_id/jobs",
            "/api/outreach/campaigns/:campaign_id/resume",
            "/api/outreach/campaigns/:campaign_id/report/summary",
            "/api/outreach/campaigns/:campaign_id/report/detailed",
            "/api/outreach/campaigns/:campaign_id/report/followups",
            "/api/outreach/campaigns/:campaign_id/replies",
            "/api/outreach/suppressions",
        ],
    }
}

/// Plugin information
#[derive(Debug)]
pub struct PluginInfo {
    pub name: &'static str,
    pub version: &'static str,
    pub description: &'static str,
    pub author: &'static str,
    pub homepage: &'static str,
    pub license: &'static str,
    pub dependencies: Vec<&'static str>,
    pub hooks: Vec<&'static str>,
    pub routes: Vec<&'static str>,
}
