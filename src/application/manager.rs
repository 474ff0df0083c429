//! Defines the core queue/job application logic.
//!
//! Main struct provided is `QueueManager`, through which all job queue operations are exposed.
//! These will typically have HTTP handlers or an embedding application mapped to them.

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use log::{debug, info, warn};
use serde_json::Value;

use super::events::ConnectionLogger;
use super::metrics::{MetricsAggregator, MetricsHandle};
use super::monitor::Monitor;
use super::processor::{Processor, ProcessorRegistry};
use super::shutdown::{DrainReport, Lifecycle, ShutdownCoordinator};
use super::worker::Worker;
use super::Queue;
use crate::config::{Config, WorkerConfig};
use crate::models::job::{Job, JobHandle, QueueName};
use crate::models::{MetricsSnapshot, QueueDepths, QueueError, QueueResult};
use crate::store::{JobStore, RedisStore};

/// Payload field carrying the call a call job belongs to.
const CALL_SID_FIELD: &str = "callSid";

/// Payload field every call job type requires. Defaults to the call SID when not given.
const CONVERSATION_ID_FIELD: &str = "conversationId";

/// Job id subject used for queues whose jobs don't belong to a call.
const ANALYTICS_SUBJECT: &str = "analytics";
const INTEGRATIONS_SUBJECT: &str = "integrations";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // state behind these locks stays consistent even if a holder panicked
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns the three queues, their workers and monitors, the metrics aggregator and the store.
pub struct QueueManager {
    store: Arc<dyn JobStore>,
    calls: Queue,
    analytics: Queue,
    integrations: Queue,
    worker_config: WorkerConfig,
    metrics: MetricsHandle,
    aggregator: Mutex<Option<MetricsAggregator>>,
    monitors: Mutex<Vec<(QueueName, Monitor)>>,
    workers: Mutex<Vec<Worker>>,
    connection_logger: Mutex<Option<ConnectionLogger>>,
    coordinator: ShutdownCoordinator,
}

impl QueueManager {
    /// Build a manager over the given store and start the queue monitors. Must be called from
    /// within a tokio runtime.
    pub fn new(store: Arc<dyn JobStore>, config: &Config) -> Self {
        let connection_logger = store.connection_events().map(ConnectionLogger::start);
        let queue = |name: QueueName| Queue::new(name, config.queue_settings(name), store.clone());
        let (calls, analytics, integrations) = (
            queue(QueueName::Calls),
            queue(QueueName::Analytics),
            queue(QueueName::Integrations),
        );

        let monitors: Vec<(QueueName, Monitor)> = [&calls, &analytics, &integrations]
            .iter()
            .map(|q| (q.name(), Monitor::start(q, &config.worker)))
            .collect();

        let aggregator = MetricsAggregator::start();
        let metrics = aggregator.handle();

        QueueManager {
            store,
            calls,
            analytics,
            integrations,
            worker_config: config.worker.clone(),
            metrics,
            aggregator: Mutex::new(Some(aggregator)),
            monitors: Mutex::new(monitors),
            workers: Mutex::new(Vec::new()),
            connection_logger: Mutex::new(connection_logger),
            coordinator: ShutdownCoordinator::new(),
        }
    }

    /// Connect to Redis as configured and build a manager over it.
    pub async fn connect(config: &Config) -> QueueResult<Self> {
        let store = RedisStore::connect(&config.redis).await?;
        Ok(Self::new(Arc::new(store), config))
    }

    pub fn queue(&self, name: QueueName) -> &Queue {
        match name {
            QueueName::Calls => &self.calls,
            QueueName::Analytics => &self.analytics,
            QueueName::Integrations => &self.integrations,
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.coordinator.lifecycle()
    }

    /// Submit a post-processing job for a call.
    ///
    /// The call SID is added to the payload as `callSid`, and used as its `conversationId` when
    /// the caller didn't give one.
    pub async fn add_call_job(
        &self,
        call_sid: &str,
        job_type: &str,
        payload: Value,
        priority: Option<u8>,
    ) -> QueueResult<JobHandle> {
        if call_sid.trim().is_empty() {
            return Err(QueueError::validation("Invalid call SID: must not be empty"));
        }
        let mut payload = payload;
        if let Some(fields) = payload.as_object_mut() {
            fields
                .entry(CALL_SID_FIELD)
                .or_insert_with(|| Value::from(call_sid));
            if fields.get(CONVERSATION_ID_FIELD).map_or(true, Value::is_null) {
                fields.insert(CONVERSATION_ID_FIELD.to_owned(), Value::from(call_sid));
            }
        }
        self.submit(QueueName::Calls, call_sid, job_type, payload, priority)
            .await
    }

    pub async fn add_analytics_job(
        &self,
        job_type: &str,
        payload: Value,
        priority: Option<u8>,
    ) -> QueueResult<JobHandle> {
        self.submit(QueueName::Analytics, ANALYTICS_SUBJECT, job_type, payload, priority)
            .await
    }

    pub async fn add_integration_job(
        &self,
        job_type: &str,
        payload: Value,
        priority: Option<u8>,
    ) -> QueueResult<JobHandle> {
        self.submit(QueueName::Integrations, INTEGRATIONS_SUBJECT, job_type, payload, priority)
            .await
    }

    /// Validate, enqueue and count a job. Counters only change once the store has accepted it.
    async fn submit(
        &self,
        name: QueueName,
        subject: &str,
        job_type: &str,
        payload: Value,
        priority: Option<u8>,
    ) -> QueueResult<JobHandle> {
        let job_type = name.parse_job_type(job_type)?;
        let job = self.queue(name).add(subject, job_type, payload, priority).await?;
        self.metrics.record_added(job.job_type);
        info!("[{}:{}] added with priority {}", name, job.id, job.priority);
        Ok(job.handle())
    }

    /// Start a worker for the given queue. Concurrency defaults to the queue's setting.
    pub fn register_worker(
        &self,
        name: QueueName,
        processor: Arc<dyn Processor>,
        concurrency: Option<usize>,
    ) -> QueueResult<()> {
        let mut workers = lock(&self.workers);
        if !self.coordinator.is_running() {
            return Err(QueueError::closed("Queue manager is shutting down"));
        }
        if workers.iter().any(|w| w.queue_name() == name) {
            return Err(QueueError::conflict(format!(
                "A worker is already registered for queue {}",
                name
            )));
        }

        let queue = self.queue(name);
        let concurrency = concurrency.unwrap_or(queue.settings().concurrency);
        workers.push(Worker::start(
            queue.clone(),
            processor,
            concurrency,
            self.worker_config.poll_interval.0,
            self.metrics.clone(),
        ));
        Ok(())
    }

    /// Start one worker per queue that has a processor in the registry. Queues without one get
    /// no worker. Returns how many workers were started.
    pub fn setup_workers(&self, registry: &ProcessorRegistry) -> QueueResult<usize> {
        let queues = registry.registered();
        for name in &queues {
            if let Some(processor) = registry.get(*name) {
                self.register_worker(*name, processor.clone(), None)?;
            }
        }
        for name in QueueName::ALL.iter().filter(|q| !queues.contains(q)) {
            debug!("[{}] no processor supplied, not starting a worker", name);
        }
        Ok(queues.len())
    }

    pub fn worker_count(&self) -> usize {
        lock(&self.workers).len()
    }

    /// Queues that currently have a worker.
    pub fn worker_queues(&self) -> Vec<QueueName> {
        lock(&self.workers).iter().map(Worker::queue_name).collect()
    }

    /// Counters since startup plus live queue counts. Fails if the store can't be read.
    pub async fn get_metrics(&self) -> QueueResult<MetricsSnapshot> {
        let counters = self.metrics.counters().await?;
        let mut depths = QueueDepths::default();
        for name in QueueName::ALL.iter() {
            depths.set(*name, self.queue(*name).counts().await?);
        }

        Ok(MetricsSnapshot {
            counters,
            current_queue_counts: depths,
            workers: self.worker_count(),
        })
    }

    pub async fn job(&self, name: QueueName, job_id: &str) -> QueueResult<Job> {
        self.queue(name)
            .job(job_id)
            .await?
            .ok_or_else(|| QueueError::NoSuchJob(job_id.to_owned()))
    }

    /// Terminally failed jobs, newest first. They stay until pruned by retention.
    pub async fn failed_jobs(&self, name: QueueName, limit: usize) -> QueueResult<Vec<Job>> {
        self.queue(name).failed_jobs(limit).await
    }

    /// Check the store is reachable.
    pub async fn health(&self) -> QueueResult<()> {
        self.store.ping().await
    }

    /// Drain everything in order: workers, queues, event listeners, then the store. Calling
    /// this again, concurrently or later, waits for and reports the first call's outcome.
    pub async fn shutdown(&self) -> QueueResult<()> {
        self.coordinator.shutdown(|| self.drain()).await
    }

    async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();

        // in-flight jobs finish, nothing new is claimed
        let workers = mem::take(&mut *lock(&self.workers));
        let closed = join_all(workers.into_iter().map(|worker| async move {
            let name = worker.queue_name();
            (name, worker.close().await)
        }))
        .await;
        for (name, result) in closed {
            report.step(&format!("worker {}", name), result);
        }

        let monitors = mem::take(&mut *lock(&self.monitors));
        for (name, monitor) in monitors {
            report.step(&format!("monitor {}", name), monitor.stop().await);
        }
        for name in QueueName::ALL.iter() {
            report.step(&format!("queue {}", name), self.queue(*name).close().await);
        }

        let aggregator = lock(&self.aggregator).take();
        if let Some(aggregator) = aggregator {
            let result = aggregator.close().await.map(|counters| {
                info!(
                    "Final job counts: {} added, {} completed, {} failed",
                    counters.total_jobs_added, counters.total_jobs_completed, counters.total_jobs_failed
                )
            });
            report.step("metrics", result);
        }
        let logger = lock(&self.connection_logger).take();
        if let Some(logger) = logger {
            report.step("connection events", logger.close().await);
        }

        report.step("connection", self.store.close().await);
        if !report.is_clean() {
            warn!("Shutdown incomplete, {} step(s) failed", report.failures().len());
        }
        report
    }
}
