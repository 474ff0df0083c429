//! Handle to one of the three named queues.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use crate::models::job::{self, payload, Job, JobType, QueueName};
use crate::models::queue::{QueueCounts, RetryDecision, Settings};
use crate::models::{DateTime, Duration, QueueError, QueueResult};
use crate::store::JobStore;

/// Result of recording a failed processing attempt.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AttemptOutcome {
    /// The job was moved to `delayed` and will be retried after `delay`.
    Retrying { attempts_made: u32, delay: Duration },

    /// Attempts are exhausted and the job is terminally `failed`.
    Failed { attempts_made: u32 },
}

/// Cheaply cloneable handle to a queue. All clones share the same closed state.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

struct Inner {
    name: QueueName,
    settings: Settings,
    store: Arc<dyn JobStore>,
    job_added: Notify,
    closed: AtomicBool,
}

impl Queue {
    pub fn new(name: QueueName, settings: Settings, store: Arc<dyn JobStore>) -> Self {
        Queue {
            inner: Arc::new(Inner {
                name,
                settings,
                store,
                job_added: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> QueueName {
        self.inner.name
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.is_closed() {
            Err(QueueError::closed(format!("Queue {} is closed", self.inner.name)))
        } else {
            Ok(())
        }
    }

    /// Validate and enqueue a new job. Nothing is written unless validation passes.
    pub async fn add(
        &self,
        subject: &str,
        job_type: JobType,
        payload: serde_json::Value,
        priority: Option<u8>,
    ) -> QueueResult<Job> {
        self.ensure_open()?;
        if job_type.queue() != self.inner.name {
            return Err(QueueError::validation(format!(
                "Invalid job type '{}' for queue '{}'",
                job_type, self.inner.name
            )));
        }
        payload::validate(job_type, &payload)?;
        let priority = job::validate_priority(priority.unwrap_or(self.inner.settings.default_priority))?;

        let job = Job::new(subject, job_type, payload, priority);
        self.inner.store.enqueue(&job).await?;
        self.inner.job_added.notify_one();
        Ok(job)
    }

    /// Claim the next job to process, if any.
    pub async fn claim(&self) -> QueueResult<Option<Job>> {
        self.ensure_open()?;
        self.inner.store.claim(self.inner.name, DateTime::now()).await
    }

    /// Completes once a job has been added through this handle since the last call, or the
    /// queue was closed.
    pub fn job_added(&self) -> Notified<'_> {
        self.inner.job_added.notified()
    }

    pub async fn update_progress(&self, job_id: &str, progress: u8) -> QueueResult<()> {
        self.inner
            .store
            .update_progress(self.inner.name, job_id, progress.min(100))
            .await
    }

    pub async fn complete(&self, job: &Job) -> QueueResult<()> {
        self.inner
            .store
            .complete(self.inner.name, &job.id, DateTime::now())
            .await
    }

    /// Record a failed attempt, then either schedule a retry or fail the job for good,
    /// according to the queue's policy.
    pub async fn fail_attempt(&self, job: &Job, error: &str) -> QueueResult<AttemptOutcome> {
        let attempts_made = job.attempts_made + 1;
        let now = DateTime::now();

        if let RetryDecision::RetryAfter(delay) = self.inner.settings.policy.after_failure(attempts_made) {
            match now.checked_plus(delay) {
                Some(run_at) => {
                    self.inner
                        .store
                        .retry_later(self.inner.name, &job.id, error, attempts_made, run_at)
                        .await?;
                    return Ok(AttemptOutcome::Retrying { attempts_made, delay });
                }
                None => warn!(
                    "[{}:{}] retry delay of {} is out of range, failing job",
                    self.inner.name, job.id, delay
                ),
            }
        }

        self.inner
            .store
            .fail(self.inner.name, &job.id, error, attempts_made, now)
            .await?;
        Ok(AttemptOutcome::Failed { attempts_made })
    }

    /// Move backed-off jobs that are due back to `waiting`.
    pub async fn promote_delayed(&self) -> QueueResult<usize> {
        let promoted = self
            .inner
            .store
            .promote_delayed(self.inner.name, DateTime::now())
            .await?;
        if !promoted.is_empty() {
            debug!("[{}] {} delayed job(s) ready for retry", self.inner.name, promoted.len());
            self.inner.job_added.notify_one();
        }
        Ok(promoted.len())
    }

    /// Delete finished jobs outside the queue's retention window.
    pub async fn prune(&self) -> QueueResult<u64> {
        self.inner
            .store
            .prune(self.inner.name, &self.inner.settings.policy.retention, DateTime::now())
            .await
    }

    /// Live job counts, read from the store.
    pub async fn counts(&self) -> QueueResult<QueueCounts> {
        self.inner.store.counts(self.inner.name).await
    }

    pub async fn job(&self, job_id: &str) -> QueueResult<Option<Job>> {
        self.inner.store.job(self.inner.name, job_id).await
    }

    pub async fn failed_jobs(&self, limit: usize) -> QueueResult<Vec<Job>> {
        self.inner.store.failed_jobs(self.inner.name, limit).await
    }

    /// Stop accepting work and release the queue in the store. Only the first call does
    /// anything.
    pub async fn close(&self) -> QueueResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.job_added.notify_waiters();
        self.inner.store.close_queue(self.inner.name).await?;
        info!("[{}] queue handle closed", self.inner.name);
        Ok(())
    }
}
