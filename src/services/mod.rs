//! RustReach Services

pub mod store;
pub mod jobs;
pub mod quota;
pub mod tracking;
pub mod suppression;
pub mod transport;
#[cfg(feature = "smtp")]
pub mod smtp;
pub mod dispatcher;
pub mod dispatch;
pub mod events;
pub mod report;

pub use store::{CampaignStore, MemoryCampaignStore, RecipientRef, StoreError};
pub use jobs::{FileJobStore, JobError, JobStore, MemoryJobStore};
pub use quota::{QuotaError, QuotaService};
pub use tracking::{TrackingConfig, TrackingService};
pub use suppression::SuppressionList;
pub use transport::{SendReceipt, Transport, TransportError};
#[cfg(feature = "smtp")]
pub use smtp::{SmtpConfig, SmtpTransport, TlsMode};
pub use dispatcher::{Delivery, DispatchTarget, Dispatcher, SendFn};
pub use dispatch::{DispatchConfig, DispatchError, DispatchRequest, DispatchService};
pub use events::{EventError, EventService};
pub use report::{ReportError, ReportService};
