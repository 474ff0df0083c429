//! Processors execute jobs. They are supplied by the embedding application.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;

use super::metrics::MetricsHandle;
use super::Queue;
use crate::models::job::{Job, QueueName};

/// Error returned by a processor. Its `Display` output is recorded as the job's `lastError`.
pub type ProcessorError = Box<dyn std::error::Error + Send + Sync>;

/// Executes jobs taken from one queue.
///
/// Returning an error (or panicking) fails the attempt; the queue's retry policy then decides
/// whether the job is retried. Metrics are recorded by the worker, never by the processor.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, job: Job, ctx: JobContext) -> Result<(), ProcessorError>;
}

/// Adapts an async closure into a `Processor`.
pub struct FnProcessor<F>(F);

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F>
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ProcessorError>> + Send + 'static,
{
    async fn process(&self, job: Job, ctx: JobContext) -> Result<(), ProcessorError> {
        (self.0)(job, ctx).await
    }
}

/// Wrap an async closure as a shareable processor.
pub fn processor_fn<F, Fut>(func: F) -> Arc<dyn Processor>
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ProcessorError>> + Send + 'static,
{
    Arc::new(FnProcessor(func))
}

/// Handed to a processor alongside its job.
#[derive(Clone)]
pub struct JobContext {
    queue: Queue,
    job_id: String,
    metrics: MetricsHandle,
}

impl JobContext {
    pub(crate) fn new(queue: Queue, job_id: String, metrics: MetricsHandle) -> Self {
        JobContext {
            queue,
            job_id,
            metrics,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn queue_name(&self) -> QueueName {
        self.queue.name()
    }

    /// Report progress (0-100, higher values are clamped). Failing to record progress is
    /// logged and otherwise ignored, it never fails the job.
    pub async fn report_progress(&self, progress: u8) {
        let progress = progress.min(100);
        match self.queue.update_progress(&self.job_id, progress).await {
            Ok(()) => self
                .metrics
                .record_progress(self.queue.name(), &self.job_id, progress),
            Err(err) => warn!(
                "[{}:{}] failed to record progress: {}",
                self.queue.name(),
                self.job_id,
                err
            ),
        }
    }
}

/// Which queues get a worker, and with what processor. A queue without a processor has no
/// worker, and jobs submitted to it wait until one is registered.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    calls: Option<Arc<dyn Processor>>,
    analytics: Option<Arc<dyn Processor>>,
    integrations: Option<Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_calls(mut self, processor: Arc<dyn Processor>) -> Self {
        self.calls = Some(processor);
        self
    }

    pub fn with_analytics(mut self, processor: Arc<dyn Processor>) -> Self {
        self.analytics = Some(processor);
        self
    }

    pub fn with_integrations(mut self, processor: Arc<dyn Processor>) -> Self {
        self.integrations = Some(processor);
        self
    }

    pub fn set(&mut self, queue: QueueName, processor: Option<Arc<dyn Processor>>) {
        match queue {
            QueueName::Calls => self.calls = processor,
            QueueName::Analytics => self.analytics = processor,
            QueueName::Integrations => self.integrations = processor,
        }
    }

    pub fn get(&self, queue: QueueName) -> Option<&Arc<dyn Processor>> {
        match queue {
            QueueName::Calls => self.calls.as_ref(),
            QueueName::Analytics => self.analytics.as_ref(),
            QueueName::Integrations => self.integrations.as_ref(),
        }
    }

    /// Queues that have a processor, in `QueueName::ALL` order.
    pub fn registered(&self) -> Vec<QueueName> {
        QueueName::ALL
            .iter()
            .copied()
            .filter(|queue| self.get(*queue).is_some())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.registered().is_empty()
    }
}

impl fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("queues", &self.registered())
            .finish()
    }
}
