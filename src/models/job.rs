//! Send Job Models

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Send job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Recipients are being attempted
    #[default]
    Running,
    /// Every recipient was attempted
    Completed,
    /// Stopped before every recipient was attempted
    Cancelled,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-recipient error kept on the job for polling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientError {
    /// Index of the recipient within the campaign
    pub index: usize,
    pub email: String,
    pub message: String,
}

/// Ephemeral execution record of one dispatch request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendJob {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub status: JobStatus,
    /// Strategy label, for display
    pub strategy: String,
    pub errors: Vec<RecipientError>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SendJob {
    pub fn new(campaign_id: Uuid, total: usize, strategy: &DeliveryStrategy) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            campaign_id,
            total,
            sent: 0,
            failed: 0,
            status: JobStatus::Running,
            strategy: strategy.to_string(),
            errors: Vec::new(),
            started_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Recipients attempted so far
    pub fn processed(&self) -> usize {
        self.sent + self.failed
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.processed())
    }

    /// Progress in [0, 1]
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.processed() as f64 / self.total as f64
        }
    }

    /// Apply a progress update. Returns `false` once the job is finished.
    pub fn apply(&mut self, progress: &JobProgress) -> bool {
        if self.status.is_finished() {
            return false;
        }

        let now = Utc::now();
        match progress {
            JobProgress::Sent => self.sent += 1,
            JobProgress::Failed { index, email, message } => {
                self.failed += 1;
                self.errors.push(RecipientError {
                    index: *index,
                    email: email.clone(),
                    message: message.clone(),
                });
            }
            JobProgress::Completed => {
                self.status = JobStatus::Completed;
                self.finished_at = Some(now);
            }
            JobProgress::Cancelled => {
                self.status = JobStatus::Cancelled;
                self.finished_at = Some(now);
            }
        }
        self.updated_at = now;
        true
    }
}

/// Incremental update to a job record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobProgress {
    Sent,
    Failed {
        index: usize,
        email: String,
        message: String,
    },
    Completed,
    Cancelled,
}

/// Outcome of one recipient within a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientOutcome {
    pub index: usize,
    pub email: String,
    pub attempts: u32,
    pub result: Result<String, String>,
}

impl RecipientOutcome {
    pub fn is_sent(&self) -> bool {
        self.result.is_ok()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.result.as_ref().ok().map(String::as_str)
    }

    pub fn error(&self) -> Option<&str> {
        self.result.as_ref().err().map(String::as_str)
    }
}

/// Final result of a dispatch run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub sent: usize,
    pub failed: usize,
    /// Outcomes in input order; cancelled runs omit unattempted recipients
    pub outcomes: Vec<RecipientOutcome>,
}

/// How a job paces its sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryStrategy {
    /// One send in flight, fixed delay between sends
    StrictSequential {
        #[serde(with = "duration_ms")]
        interval: Duration,
    },
    /// Fixed-size concurrent batches, fixed pause between batches
    BatchedConcurrent {
        batch_size: usize,
        #[serde(with = "duration_ms")]
        pause: Duration,
    },
}

impl DeliveryStrategy {
    pub fn strict_sequential() -> Self {
        Self::StrictSequential {
            interval: Duration::from_secs(60),
        }
    }

    pub fn batched_concurrent() -> Self {
        Self::BatchedConcurrent {
            batch_size: 10,
            pause: Duration::from_millis(800),
        }
    }

    /// Lower bound on wall-clock time for `count` recipients
    pub fn minimum_duration(&self, count: usize) -> Duration {
        match *self {
            Self::StrictSequential { interval } => interval * count.saturating_sub(1) as u32,
            Self::BatchedConcurrent { batch_size, pause } => {
                let batches = count.div_ceil(batch_size.max(1));
                pause * batches.saturating_sub(1) as u32
            }
        }
    }
}

impl Default for DeliveryStrategy {
    fn default() -> Self {
        Self::strict_sequential()
    }
}

impl std::fmt::Display for DeliveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StrictSequential { interval } => {
                write!(f, "strict-sequential ({}ms interval)", interval.as_millis())
            }
            Self::BatchedConcurrent { batch_size, pause } => {
                write!(f, "batched-concurrent ({} per batch, {}ms pause)", batch_size, pause.as_millis())
            }
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Retry policy for transient send failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts per recipient; 1 disables retry
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Errors to retry on
    pub retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 5_000,
            max_delay_ms: 300_000,
            multiplier: 2.0,
            retryable_errors: vec![
                "connection".to_string(),
                "timeout".to_string(),
                "temporary".to_string(),
                "rate limit".to_string(),
            ],
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Calculate delay before retry number `attempt` (0-based)
    pub fn get_delay(&self, attempt: u32) -> Duration {
        let delay = (self.initial_delay_ms as f64 * self.multiplier.powi(attempt as i32)) as u64;
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Check if error is retryable
    pub fn is_retryable(&self, error: &str) -> bool {
        let error_lower = error.to_lowercase();
        self.retryable_errors.iter().any(|e| error_lower.contains(&e.to_lowercase()))
    }

    /// Whether another attempt should follow attempt number `attempts` (1-based)
    pub fn should_retry(&self, attempts: u32, error: &str) -> bool {
        attempts < self.max_attempts && self.is_retryable(error)
    }
}
