//! Dispatcher
//!
//! Paces sends for one job. Strict-sequential keeps a single send in flight
//! with a fixed delay between sends; batched-concurrent runs fixed-size
//! batches concurrently with a pause between batches. A failing recipient
//! never aborts the job.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::jobs::JobStore;
use crate::models::{DeliveryStrategy, JobProgress, JobResult, JobStatus, RecipientOutcome, RetryPolicy};

/// One recipient handed to the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTarget {
    /// Index of the recipient within its campaign
    pub index: usize,
    pub email: String,
}

impl DispatchTarget {
    pub fn new(index: usize, email: &str) -> Self {
        Self {
            index,
            email: email.to_string(),
        }
    }
}

/// Per-recipient send hooks
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Called once before the first attempt
    async fn begin(&self, _target: &DispatchTarget) {}

    /// One attempt. Returns the provider message id or an error text.
    async fn send_one(&self, target: &DispatchTarget) -> Result<String, String>;

    /// Called once with the final outcome
    async fn record(&self, _outcome: &RecipientOutcome) {}

    /// Called instead of `record` when the run was cancelled while the
    /// target waited for a retry; the target stays unattempted
    async fn release(&self, _target: &DispatchTarget) {}
}

/// Adapts an async closure to `Delivery`
pub struct SendFn<F>(pub F);

#[async_trait]
impl<F, Fut> Delivery for SendFn<F>
where
    F: Fn(DispatchTarget) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, String>> + Send,
{
    async fn send_one(&self, target: &DispatchTarget) -> Result<String, String> {
        (self.0)(target.clone()).await
    }
}

/// Runs one job under a delivery strategy
pub struct Dispatcher {
    jobs: Arc<dyn JobStore>,
    strategy: DeliveryStrategy,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(jobs: Arc<dyn JobStore>, strategy: DeliveryStrategy) -> Self {
        Self {
            jobs,
            strategy,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn strategy(&self) -> &DeliveryStrategy {
        &self.strategy
    }

    /// Attempt every target in order. The job is completed only after the
    /// last target was attempted; a cancelled run stops at the next pause.
    pub async fn dispatch(
        &self,
        job_id: Uuid,
        targets: &[DispatchTarget],
        delivery: &dyn Delivery,
        cancel: &CancellationToken,
    ) -> JobResult {
        tracing::info!(
            %job_id,
            recipients = targets.len(),
            strategy = %self.strategy,
            "Dispatch started"
        );

        let (outcomes, cancelled) = match self.strategy {
            DeliveryStrategy::StrictSequential { interval } => {
                self.run_sequential(job_id, targets, delivery, cancel, interval).await
            }
            DeliveryStrategy::BatchedConcurrent { batch_size, pause } => {
                self.run_batched(job_id, targets, delivery, cancel, batch_size, pause).await
            }
        };

        let (status, progress) = if cancelled {
            (JobStatus::Cancelled, JobProgress::Cancelled)
        } else {
            (JobStatus::Completed, JobProgress::Completed)
        };
        if let Err(e) = self.jobs.update(job_id, progress).await {
            tracing::warn!(%job_id, error = %e, "Failed to finalize job record");
        }

        let sent = outcomes.iter().filter(|o| o.is_sent()).count();
        let failed = outcomes.len() - sent;
        tracing::info!(%job_id, %status, sent, failed, "Dispatch finished");

        JobResult {
            job_id,
            status,
            sent,
            failed,
            outcomes,
        }
    }

    async fn run_sequential(
        &self,
        job_id: Uuid,
        targets: &[DispatchTarget],
        delivery: &dyn Delivery,
        cancel: &CancellationToken,
        interval: Duration,
    ) -> (Vec<RecipientOutcome>, bool) {
        let mut outcomes = Vec::with_capacity(targets.len());

        for (position, target) in targets.iter().enumerate() {
            if position > 0 && !pause(interval, cancel).await {
                return (outcomes, true);
            }
            if cancel.is_cancelled() {
                return (outcomes, true);
            }
            match self.run_one(job_id, target, delivery, cancel).await {
                Some(outcome) => outcomes.push(outcome),
                None => return (outcomes, true),
            }
        }

        (outcomes, false)
    }

    async fn run_batched(
        &self,
        job_id: Uuid,
        targets: &[DispatchTarget],
        delivery: &dyn Delivery,
        cancel: &CancellationToken,
        batch_size: usize,
        pause_between: Duration,
    ) -> (Vec<RecipientOutcome>, bool) {
        let mut outcomes = Vec::with_capacity(targets.len());

        for (batch_no, batch) in targets.chunks(batch_size.max(1)).enumerate() {
            if batch_no > 0 && !pause(pause_between, cancel).await {
                return (outcomes, true);
            }
            if cancel.is_cancelled() {
                return (outcomes, true);
            }

            tracing::debug!(%job_id, batch = batch_no, size = batch.len(), "Sending batch");
            // join_all keeps input order
            let results = join_all(
                batch
                    .iter()
                    .map(|target| self.run_one(job_id, target, delivery, cancel)),
            )
            .await;
            let interrupted = results.iter().any(Option::is_none);
            outcomes.extend(results.into_iter().flatten());
            if interrupted {
                return (outcomes, true);
            }
        }

        (outcomes, false)
    }

    /// `None` when cancelled during a retry backoff
    async fn run_one(
        &self,
        job_id: Uuid,
        target: &DispatchTarget,
        delivery: &dyn Delivery,
        cancel: &CancellationToken,
    ) -> Option<RecipientOutcome> {
        delivery.begin(target).await;

        let mut attempts = 0;
        let result = loop {
            attempts += 1;
            match delivery.send_one(target).await {
                Ok(message_id) => break Ok(message_id),
                Err(error) => {
                    if self.retry.should_retry(attempts, &error) {
                        let delay = self.retry.get_delay(attempts - 1);
                        tracing::warn!(
                            %job_id,
                            email = %target.email,
                            attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Send failed, retrying"
                        );
                        if !pause(delay, cancel).await {
                            tracing::info!(
                                %job_id,
                                email = %target.email,
                                attempts,
                                "Retry cancelled, recipient left pending"
                            );
                            delivery.release(target).await;
                            return None;
                        }
                        continue;
                    }
                    break Err(error);
                }
            }
        };

        let outcome = RecipientOutcome {
            index: target.index,
            email: target.email.clone(),
            attempts,
            result,
        };

        match &outcome.result {
            Ok(message_id) => {
                tracing::debug!(%job_id, email = %target.email, %message_id, "Recipient sent");
            }
            Err(error) => {
                tracing::warn!(%job_id, email = %target.email, attempts, error = %error, "Recipient failed");
            }
        }

        delivery.record(&outcome).await;

        let progress = match &outcome.result {
            Ok(_) => JobProgress::Sent,
            Err(message) => JobProgress::Failed {
                index: target.index,
                email: target.email.clone(),
                message: message.clone(),
            },
        };
        if let Err(e) = self.jobs.update(job_id, progress).await {
            tracing::warn!(%job_id, error = %e, "Failed to update job record");
        }

        Some(outcome)
    }
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SendJob;
    use crate::services::jobs::MemoryJobStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;
    use tokio::time::Instant;

    fn targets(emails: &[&str]) -> Vec<DispatchTarget> {
        emails.iter().enumerate().map(|(i, e)| DispatchTarget::new(i, e)).collect()
    }

    async fn job(jobs: &Arc<MemoryJobStore>, total: usize, strategy: &DeliveryStrategy) -> Uuid {
        let job = SendJob::new(Uuid::now_v7(), total, strategy);
        let id = job.id;
        jobs.set(job).await.unwrap();
        id
    }

    /// Fails for `b@x.com`, records send instants
    #[derive(Default)]
    struct Scripted {
        sent_at: Mutex<Vec<(String, Instant)>>,
        recorded: Mutex<Vec<RecipientOutcome>>,
    }

    #[async_trait]
    impl Delivery for Scripted {
        async fn send_one(&self, target: &DispatchTarget) -> Result<String, String> {
            self.sent_at.lock().await.push((target.email.clone(), Instant::now()));
            if target.email == "b@x.com" {
                Err("550 mailbox unavailable".to_string())
            } else {
                Ok(format!("id-{}", target.index))
            }
        }

        async fn record(&self, outcome: &RecipientOutcome) {
            self.recorded.lock().await.push(outcome.clone());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_strict_sequential_spacing() {
        let jobs = Arc::new(MemoryJobStore::new());
        let strategy = DeliveryStrategy::StrictSequential { interval: Duration::from_secs(60) };
        let id = job(&jobs, 3, &strategy).await;
        let dispatcher = Dispatcher::new(jobs.clone(), strategy);
        let delivery = Scripted::default();

        let start = Instant::now();
        let result = dispatcher
            .dispatch(id, &targets(&["a@x.com", "b@x.com", "c@x.com"]), &delivery, &CancellationToken::new())
            .await;
        assert!(start.elapsed() >= Duration::from_secs(120));

        assert_eq!(result.status, JobStatus::Completed);
        assert_eq!((result.sent, result.failed), (2, 1));
        assert_eq!(result.outcomes[1].error(), Some("550 mailbox unavailable"));

        let sent_at = delivery.sent_at.lock().await;
        let order: Vec<&str> = sent_at.iter().map(|(e, _)| e.as_str()).collect();
        assert_eq!(order, ["a@x.com", "b@x.com", "c@x.com"]);
        for pair in sent_at.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= Duration::from_secs(60));
        }

        let job = jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!((job.sent, job.failed), (2, 1));
        assert_eq!(job.errors[0].email, "b@x.com");
        assert_eq!(delivery.recorded.lock().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batched_concurrent_keeps_order() {
        let jobs = Arc::new(MemoryJobStore::new());
        let strategy = DeliveryStrategy::BatchedConcurrent {
            batch_size: 2,
            pause: Duration::from_millis(800),
        };
        let id = job(&jobs, 5, &strategy).await;
        let dispatcher = Dispatcher::new(jobs.clone(), strategy);
        let delivery = Scripted::default();

        let emails = ["a@x.com", "b@x.com", "c@x.com", "d@x.com", "e@x.com"];
        let start = Instant::now();
        let result = dispatcher
            .dispatch(id, &targets(&emails), &delivery, &CancellationToken::new())
            .await;

        assert!(start.elapsed() >= Duration::from_millis(1600));
        let order: Vec<&str> = result.outcomes.iter().map(|o| o.email.as_str()).collect();
        assert_eq!(order, emails);
        assert_eq!((result.sent, result.failed), (4, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_at_next_pause() {
        let jobs = Arc::new(MemoryJobStore::new());
        let strategy = DeliveryStrategy::StrictSequential { interval: Duration::from_secs(60) };
        let id = job(&jobs, 4, &strategy).await;
        let dispatcher = Dispatcher::new(jobs.clone(), strategy);
        let cancel = CancellationToken::new();

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let delivery = Scripted::default();
                let targets = targets(&["a@x.com", "c@x.com", "d@x.com", "e@x.com"]);
                let result = dispatcher.dispatch(id, &targets, &delivery, &cancel).await;
                result
            })
        };

        tokio::time::sleep(Duration::from_secs(90)).await;
        cancel.cancel();
        let result = handle.await.unwrap();

        assert_eq!(result.status, JobStatus::Cancelled);
        assert_eq!(result.outcomes.len(), 2);
        let job = jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.remaining(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_failures() {
        let jobs = Arc::new(MemoryJobStore::new());
        let strategy = DeliveryStrategy::StrictSequential { interval: Duration::ZERO };
        let id = job(&jobs, 1, &strategy).await;
        let dispatcher = Dispatcher::new(jobs.clone(), strategy)
            .with_retry(RetryPolicy::default().with_max_attempts(3));

        let calls = Arc::new(AtomicU32::new(0));
        let delivery = {
            let calls = calls.clone();
            SendFn(move |_target: DispatchTarget| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("421 temporary failure".to_string())
                    } else {
                        Ok("accepted".to_string())
                    }
                }
            })
        };

        let result = dispatcher
            .dispatch(id, &targets(&["a@x.com"]), &delivery, &CancellationToken::new())
            .await;
        assert_eq!(result.sent, 1);
        assert_eq!(result.outcomes[0].attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_retry_backoff_releases_recipient() {
        let jobs = Arc::new(MemoryJobStore::new());
        let strategy = DeliveryStrategy::StrictSequential { interval: Duration::ZERO };
        let id = job(&jobs, 2, &strategy).await;
        let dispatcher = Dispatcher::new(jobs.clone(), strategy).with_retry(
            RetryPolicy::default()
                .with_max_attempts(5)
                .with_initial_delay(Duration::from_secs(30)),
        );

        #[derive(Default)]
        struct Transient {
            recorded: Mutex<Vec<RecipientOutcome>>,
            released: Mutex<Vec<usize>>,
        }

        #[async_trait]
        impl Delivery for Transient {
            async fn send_one(&self, _target: &DispatchTarget) -> Result<String, String> {
                Err("421 temporary failure".to_string())
            }

            async fn record(&self, outcome: &RecipientOutcome) {
                self.recorded.lock().await.push(outcome.clone());
            }

            async fn release(&self, target: &DispatchTarget) {
                self.released.lock().await.push(target.index);
            }
        }

        let delivery = Arc::new(Transient::default());
        let cancel = CancellationToken::new();
        let handle = {
            let (delivery, cancel) = (delivery.clone(), cancel.clone());
            tokio::spawn(async move {
                let targets = targets(&["a@x.com", "c@x.com"]);
                dispatcher.dispatch(id, &targets, delivery.as_ref(), &cancel).await
            })
        };

        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
        let result = handle.await.unwrap();

        assert_eq!(result.status, JobStatus::Cancelled);
        assert!(result.outcomes.is_empty());
        assert_eq!(result.failed, 0);
        assert!(delivery.recorded.lock().await.is_empty());
        assert_eq!(*delivery.released.lock().await, [0]);

        let job = jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!((job.sent, job.failed), (0, 0));
        assert!(job.errors.is_empty());
        assert_eq!(job.remaining(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let jobs = Arc::new(MemoryJobStore::new());
        let strategy = DeliveryStrategy::StrictSequential { interval: Duration::ZERO };
        let id = job(&jobs, 1, &strategy).await;
        let dispatcher = Dispatcher::new(jobs.clone(), strategy)
            .with_retry(RetryPolicy::default().with_max_attempts(3));

        let delivery = SendFn(|_target: DispatchTarget| async { Err::<String, String>("550 no such user".to_string()) });
        let result = dispatcher
            .dispatch(id, &targets(&["a@x.com"]), &delivery, &CancellationToken::new())
            .await;
        assert_eq!(result.failed, 1);
        assert_eq!(result.outcomes[0].attempts, 1);
    }
}
