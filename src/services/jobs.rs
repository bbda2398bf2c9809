//! Send Job Store
//!
//! Job records are written once per recipient outcome and polled by clients.
//! `FileJobStore` keeps them in a JSON file so status survives a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{JobProgress, JobStatus, SendJob};

/// Job store error
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(Uuid),
    #[error("Job already finished: {0}")]
    Finished(Uuid),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<std::io::Error> for JobError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Persistence for send jobs
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<SendJob>, JobError>;

    /// Insert or replace a job
    async fn set(&self, job: SendJob) -> Result<(), JobError>;

    /// Apply a progress update and return the new record
    async fn update(&self, id: Uuid, progress: JobProgress) -> Result<SendJob, JobError>;

    /// Jobs of one campaign, oldest first
    async fn for_campaign(&self, campaign_id: Uuid) -> Result<Vec<SendJob>, JobError>;
}

fn apply_progress(jobs: &mut HashMap<Uuid, SendJob>, id: Uuid, progress: &JobProgress) -> Result<SendJob, JobError> {
    let job = jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
    if !job.apply(progress) {
        return Err(JobError::Finished(id));
    }
    Ok(job.clone())
}

fn sorted_for_campaign(jobs: &HashMap<Uuid, SendJob>, campaign_id: Uuid) -> Vec<SendJob> {
    let mut found: Vec<SendJob> = jobs.values().filter(|j| j.campaign_id == campaign_id).cloned().collect();
    found.sort_by_key(|j| j.started_at);
    found
}

/// In-memory job store
pub struct MemoryJobStore {
    jobs: Arc<RwLock<HashMap<Uuid, SendJob>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, id: Uuid) -> Result<Option<SendJob>, JobError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn set(&self, job: SendJob) -> Result<(), JobError> {
        self.jobs.write().await.insert(job.id, job);
        Ok(())
    }

    async fn update(&self, id: Uuid, progress: JobProgress) -> Result<SendJob, JobError> {
        let mut jobs = self.jobs.write().await;
        apply_progress(&mut jobs, id, &progress)
    }

    async fn for_campaign(&self, campaign_id: Uuid) -> Result<Vec<SendJob>, JobError> {
        Ok(sorted_for_campaign(&*self.jobs.read().await, campaign_id))
    }
}

/// JSON-file job store
///
/// The whole map is rewritten through a temporary file and renamed into place
/// on every change, while the write lock is held.
pub struct FileJobStore {
    path: PathBuf,
    jobs: Arc<RwLock<HashMap<Uuid, SendJob>>>,
}

impl FileJobStore {
    /// Open or create the store at `path`. Jobs left running by a previous
    /// process are marked cancelled, since nothing will resume them.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, JobError> {
        let path = path.as_ref().to_path_buf();

        let mut jobs = HashMap::new();
        match tokio::fs::read(&path).await {
            Ok(bytes) if !bytes.is_empty() => {
                let stored: Vec<SendJob> = serde_json::from_slice(&bytes)?;
                for job in stored {
                    jobs.insert(job.id, job);
                }
            }
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let mut interrupted = 0;
        for job in jobs.values_mut() {
            if job.status == JobStatus::Running {
                job.apply(&JobProgress::Cancelled);
                interrupted += 1;
            }
        }
        if interrupted > 0 {
            tracing::warn!(path = %path.display(), interrupted, "Marked interrupted send jobs as cancelled");
        }

        let store = Self {
            path,
            jobs: Arc::new(RwLock::new(jobs)),
        };
        store.persist(&*store.jobs.read().await).await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, jobs: &HashMap<Uuid, SendJob>) -> Result<(), JobError> {
        let mut list: Vec<&SendJob> = jobs.values().collect();
        list.sort_by_key(|j| j.started_at);
        let bytes = serde_json::to_vec_pretty(&list)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn get(&self, id: Uuid) -> Result<Option<SendJob>, JobError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn set(&self, job: SendJob) -> Result<(), JobError> {
        let mut jobs = self.jobs.write().await;
        jobs.insert(job.id, job);
        self.persist(&jobs).await
    }

    async fn update(&self, id: Uuid, progress: JobProgress) -> Result<SendJob, JobError> {
        let mut jobs = self.jobs.write().await;
        let job = apply_progress(&mut jobs, id, &progress)?;
        self.persist(&jobs).await?;
        Ok(job)
    }

    async fn for_campaign(&self, campaign_id: Uuid) -> Result<Vec<SendJob>, JobError> {
        Ok(sorted_for_campaign(&*self.jobs.read().await, campaign_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeliveryStrategy;

    #[tokio::test]
    async fn test_memory_store_progress() {
        let store = MemoryJobStore::new();
        let job = SendJob::new(Uuid::now_v7(), 2, &DeliveryStrategy::default());
        let id = job.id;
        store.set(job).await.unwrap();

        store.update(id, JobProgress::Sent).await.unwrap();
        let job = store.update(id, JobProgress::Completed).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        let err = store.update(id, JobProgress::Sent).await.unwrap_err();
        assert!(matches!(err, JobError::Finished(_)));

        let err = store.update(Uuid::now_v7(), JobProgress::Sent).await.unwrap_err();
        assert!(matches!(err, JobError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_for_campaign() {
        let store = MemoryJobStore::new();
        let campaign_id = Uuid::now_v7();
        store.set(SendJob::new(campaign_id, 1, &DeliveryStrategy::default())).await.unwrap();
        store.set(SendJob::new(campaign_id, 2, &DeliveryStrategy::default())).await.unwrap();
        store.set(SendJob::new(Uuid::now_v7(), 3, &DeliveryStrategy::default())).await.unwrap();

        let jobs = store.for_campaign(campaign_id).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs[0].started_at <= jobs[1].started_at);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");

        let finished = SendJob::new(Uuid::now_v7(), 1, &DeliveryStrategy::default());
        let running = SendJob::new(Uuid::now_v7(), 5, &DeliveryStrategy::batched_concurrent());
        let (finished_id, running_id) = (finished.id, running.id);

        {
            let store = FileJobStore::open(&path).await.unwrap();
            store.set(finished).await.unwrap();
            store.set(running).await.unwrap();
            store.update(finished_id, JobProgress::Sent).await.unwrap();
            store.update(finished_id, JobProgress::Completed).await.unwrap();
            store.update(running_id, JobProgress::Sent).await.unwrap();
        }

        let store = FileJobStore::open(&path).await.unwrap();
        let job = store.get(finished_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.sent, 1);

        let job = store.get(running_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.sent, 1);
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        assert!(matches!(FileJobStore::open(&path).await, Err(JobError::Storage(_))));
    }
}
