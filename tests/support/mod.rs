//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use callqueue::application::{JobContext, ProcessorError, QueueManager};
use callqueue::config::Config;
use callqueue::models::job::{Job, QueueName};
use callqueue::models::queue::{QueueCounts, Retention};
use callqueue::models::{DateTime, MetricsSnapshot, QueueError, QueueResult};
use callqueue::store::{JobStore, MemoryStore};

/// How long any eventually-true condition is waited for before a test fails.
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// In-memory store that can be switched into an outage, and counts shutdown calls.
///
/// During an outage every operation except the close calls fails with the configured
/// message, and nothing reaches the wrapped store. Closing a single queue can be made to fail
/// separately.
#[derive(Default)]
pub struct TestStore {
    inner: MemoryStore,
    outage: Mutex<Option<String>>,
    close_queue_failure: Mutex<Option<(QueueName, String)>>,
    close_calls: AtomicUsize,
    close_queue_calls: AtomicUsize,
}

impl TestStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_with(&self, msg: &str) {
        *self.outage.lock().unwrap() = Some(msg.to_owned());
    }

    pub fn recover(&self) {
        *self.outage.lock().unwrap() = None;
    }

    pub fn fail_close_queue(&self, queue: QueueName, msg: &str) {
        *self.close_queue_failure.lock().unwrap() = Some((queue, msg.to_owned()));
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn close_queue_calls(&self) -> usize {
        self.close_queue_calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> QueueResult<()> {
        match &*self.outage.lock().unwrap() {
            Some(msg) => Err(QueueError::store(msg.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl JobStore for TestStore {
    async fn enqueue(&self, job: &Job) -> QueueResult<()> {
        self.check()?;
        self.inner.enqueue(job).await
    }

    async fn claim(&self, queue: QueueName, now: DateTime) -> QueueResult<Option<Job>> {
        self.check()?;
        self.inner.claim(queue, now).await
    }

    async fn update_progress(&self, queue: QueueName, job_id: &str, progress: u8) -> QueueResult<()> {
        self.check()?;
        self.inner.update_progress(queue, job_id, progress).await
    }

    async fn complete(&self, queue: QueueName, job_id: &str, finished_at: DateTime) -> QueueResult<()> {
        self.check()?;
        self.inner.complete(queue, job_id, finished_at).await
    }

    async fn retry_later(
        &self,
        queue: QueueName,
        job_id: &str,
        error: &str,
        attempts_made: u32,
        run_at: DateTime,
    ) -> QueueResult<()> {
        self.check()?;
        self.inner.retry_later(queue, job_id, error, attempts_made, run_at).await
    }

    async fn fail(
        &self,
        queue: QueueName,
        job_id: &str,
        error: &str,
        attempts_made: u32,
        finished_at: DateTime,
    ) -> QueueResult<()> {
        self.check()?;
        self.inner.fail(queue, job_id, error, attempts_made, finished_at).await
    }

    async fn promote_delayed(&self, queue: QueueName, now: DateTime) -> QueueResult<Vec<String>> {
        self.check()?;
        self.inner.promote_delayed(queue, now).await
    }

    async fn prune(&self, queue: QueueName, retention: &Retention, now: DateTime) -> QueueResult<u64> {
        self.check()?;
        self.inner.prune(queue, retention, now).await
    }

    async fn counts(&self, queue: QueueName) -> QueueResult<QueueCounts> {
        self.check()?;
        self.inner.counts(queue).await
    }

    async fn job(&self, queue: QueueName, job_id: &str) -> QueueResult<Option<Job>> {
        self.check()?;
        self.inner.job(queue, job_id).await
    }

    async fn failed_jobs(&self, queue: QueueName, limit: usize) -> QueueResult<Vec<Job>> {
        self.check()?;
        self.inner.failed_jobs(queue, limit).await
    }

    async fn ping(&self) -> QueueResult<()> {
        self.check()?;
        self.inner.ping().await
    }

    async fn close_queue(&self, queue: QueueName) -> QueueResult<()> {
        self.close_queue_calls.fetch_add(1, Ordering::SeqCst);
        if let Some((failing, msg)) = &*self.close_queue_failure.lock().unwrap() {
            if *failing == queue {
                return Err(QueueError::store(msg.clone()));
            }
        }
        self.inner.close_queue(queue).await
    }

    async fn close(&self) -> QueueResult<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await
    }
}

/// Config with short polling, sweep and backoff intervals so retries happen quickly.
pub fn fast_config() -> Config {
    Config::from_toml(
        r#"
[worker]
poll_interval = "10ms"
delayed_check_interval = "5ms"
retention_check_interval = "1h"

[queue.calls]
backoff_delay = "10ms"

[queue.analytics]
backoff_delay = "10ms"

[queue.integrations]
backoff_delay = "10ms"
"#,
    )
    .unwrap()
}

/// Manager over a fresh `TestStore`, returned alongside the store for fault injection.
pub fn test_manager() -> (Arc<QueueManager>, Arc<TestStore>) {
    test_manager_with(&fast_config())
}

pub fn test_manager_with(config: &Config) -> (Arc<QueueManager>, Arc<TestStore>) {
    let store = TestStore::new();
    let shared: Arc<dyn JobStore> = store.clone();
    let manager = QueueManager::new(shared, config);
    (Arc::new(manager), store)
}

pub fn transcribe_payload() -> Value {
    json!({"audioUrl": "https://recordings.example.com/CA1.wav"})
}

pub fn daily_aggregation_payload() -> Value {
    json!({"date": "2025-10-01"})
}

pub fn webhook_payload() -> Value {
    json!({
        "url": "https://hooks.example.com/calls",
        "payload": {"status": "completed"},
        "eventType": "call.completed"
    })
}

/// Poll metrics until `done` holds, failing the test if it doesn't within `WAIT_TIMEOUT`.
pub async fn wait_for_metrics<F>(manager: &QueueManager, done: F) -> MetricsSnapshot
where
    F: Fn(&MetricsSnapshot) -> bool,
{
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        let snapshot = manager.get_metrics().await.unwrap();
        if done(&snapshot) {
            return snapshot;
        }
        assert!(Instant::now() < deadline, "timed out waiting for metrics, last: {:?}", snapshot);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Processor that succeeds immediately.
pub async fn succeed(_job: Job, _ctx: JobContext) -> Result<(), ProcessorError> {
    Ok(())
}

/// Processor that always fails with the same error.
pub async fn crm_unavailable(_job: Job, _ctx: JobContext) -> Result<(), ProcessorError> {
    Err(ProcessorError::from("CRM unavailable"))
}

/// Processor that fails without saying why.
pub async fn fail_silently(_job: Job, _ctx: JobContext) -> Result<(), ProcessorError> {
    Err(ProcessorError::from(""))
}

/// Processor that panics.
pub async fn crash(_job: Job, _ctx: JobContext) -> Result<(), ProcessorError> {
    panic!("decoder crashed")
}
