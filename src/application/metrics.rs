//! Job counters owned by a single task.
//!
//! Submissions and workers send outcome events over a channel and the aggregator task applies
//! them in order, so counters need no locking and no update is lost under concurrency. Sending
//! never fails the caller: if the aggregator is gone the event is logged and dropped.

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::models::job::{JobType, QueueName};
use crate::models::{JobCounters, QueueError, QueueResult};

#[derive(Debug)]
enum MetricsEvent {
    Added(JobType),
    Completed(JobType),
    Failed(JobType),
    Retried(JobType),
    Progress {
        queue: QueueName,
        job_id: String,
        progress: u8,
    },
    Snapshot(oneshot::Sender<JobCounters>),
    Close,
}

/// Cheaply cloneable sender side of the aggregator.
#[derive(Clone, Debug)]
pub struct MetricsHandle {
    tx: mpsc::UnboundedSender<MetricsEvent>,
}

impl MetricsHandle {
    fn send(&self, event: MetricsEvent) {
        if let Err(err) = self.tx.send(event) {
            debug!("Metrics aggregator closed, dropping {:?}", err.0);
        }
    }

    pub fn record_added(&self, job_type: JobType) {
        self.send(MetricsEvent::Added(job_type));
    }

    pub fn record_completed(&self, job_type: JobType) {
        self.send(MetricsEvent::Completed(job_type));
    }

    /// Record a terminal failure.
    pub fn record_failed(&self, job_type: JobType) {
        self.send(MetricsEvent::Failed(job_type));
    }

    /// Record a failed attempt that will be retried.
    pub fn record_retried(&self, job_type: JobType) {
        self.send(MetricsEvent::Retried(job_type));
    }

    pub fn record_progress(&self, queue: QueueName, job_id: &str, progress: u8) {
        self.send(MetricsEvent::Progress {
            queue,
            job_id: job_id.to_owned(),
            progress,
        });
    }

    /// Current counters. Reflects every event sent before this call.
    pub async fn counters(&self) -> QueueResult<JobCounters> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(MetricsEvent::Snapshot(tx)).is_err() {
            return Err(QueueError::closed("Metrics aggregator is closed"));
        }
        rx.await
            .map_err(|_| QueueError::closed("Metrics aggregator is closed"))
    }
}

/// The task that owns the counters.
pub struct MetricsAggregator {
    handle: MetricsHandle,
    task: JoinHandle<JobCounters>,
}

impl MetricsAggregator {
    pub fn start() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        MetricsAggregator {
            handle: MetricsHandle { tx },
            task: tokio::spawn(run(rx)),
        }
    }

    pub fn handle(&self) -> MetricsHandle {
        self.handle.clone()
    }

    /// Stop the aggregator after it has applied everything already sent, returning the final
    /// counters.
    pub async fn close(self) -> QueueResult<JobCounters> {
        self.handle.send(MetricsEvent::Close);
        self.task
            .await
            .map_err(|err| QueueError::store(format!("metrics aggregator task failed: {}", err)))
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<MetricsEvent>) -> JobCounters {
    let mut counters = JobCounters::default();
    while let Some(event) = rx.recv().await {
        match event {
            MetricsEvent::Added(job_type) => counters.record_added(job_type),
            MetricsEvent::Completed(job_type) => counters.record_completed(job_type),
            MetricsEvent::Failed(job_type) => counters.record_failed(job_type),
            MetricsEvent::Retried(job_type) => {
                debug!("{} job scheduled for retry", job_type);
                counters.record_retried()
            }
            MetricsEvent::Progress {
                queue,
                job_id,
                progress,
            } => debug!("[{}:{}] progress {}%", queue, job_id, progress),
            MetricsEvent::Snapshot(reply) => {
                if reply.send(counters.clone()).is_err() {
                    warn!("Metrics snapshot requester went away");
                }
            }
            MetricsEvent::Close => break,
        }
    }
    rx.close();
    counters
}
