//! Persistence of queue state behind an atomic-dequeue contract.
//!
//! Every job state transition is one atomic store operation, so a job is only ever `active`
//! for one worker at a time. Two implementations are provided: `RedisStore` for production
//! and `MemoryStore` for tests and single-process embedding.

mod keys;
mod memory;
mod redis_store;

pub use self::keys::QueueKeys;
pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::connection::ConnectionEvent;
use crate::models::job::{Job, QueueName};
use crate::models::queue::{QueueCounts, Retention};
use crate::models::{DateTime, QueueResult};

/// Default number of jobs returned when listing failed jobs.
pub const DEFAULT_FAILED_LIMIT: usize = 100;

/// Durable job storage shared by every queue and worker.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Insert a new job into `waiting`. Fails with `Conflict` if a job with the same id exists.
    async fn enqueue(&self, job: &Job) -> QueueResult<()>;

    /// Atomically move the highest priority waiting job to `active`, stamping its processing
    /// time. Returns `None` if nothing is waiting.
    async fn claim(&self, queue: QueueName, now: DateTime) -> QueueResult<Option<Job>>;

    /// Record processor progress (0-100) for an active job.
    async fn update_progress(&self, queue: QueueName, job_id: &str, progress: u8) -> QueueResult<()>;

    /// Move an active job to `completed`.
    async fn complete(&self, queue: QueueName, job_id: &str, finished_at: DateTime) -> QueueResult<()>;

    /// Move an active job to `delayed`, to be promoted back to `waiting` at `run_at`.
    async fn retry_later(
        &self,
        queue: QueueName,
        job_id: &str,
        error: &str,
        attempts_made: u32,
        run_at: DateTime,
    ) -> QueueResult<()>;

    /// Move an active job to `failed`. Failed jobs are never re-queued automatically.
    async fn fail(
        &self,
        queue: QueueName,
        job_id: &str,
        error: &str,
        attempts_made: u32,
        finished_at: DateTime,
    ) -> QueueResult<()>;

    /// Move every delayed job due at or before `now` back to `waiting`. Returns the ids moved.
    async fn promote_delayed(&self, queue: QueueName, now: DateTime) -> QueueResult<Vec<String>>;

    /// Delete finished jobs outside the retention window. Returns how many were removed.
    async fn prune(&self, queue: QueueName, retention: &Retention, now: DateTime) -> QueueResult<u64>;

    /// Live number of jobs in each state.
    async fn counts(&self, queue: QueueName) -> QueueResult<QueueCounts>;

    async fn job(&self, queue: QueueName, job_id: &str) -> QueueResult<Option<Job>>;

    /// Most recently failed jobs first, at most `limit` of them.
    async fn failed_jobs(&self, queue: QueueName, limit: usize) -> QueueResult<Vec<Job>>;

    /// Check the store is reachable.
    async fn ping(&self) -> QueueResult<()>;

    /// Release anything held for one queue. Called once per queue at shutdown.
    async fn close_queue(&self, queue: QueueName) -> QueueResult<()>;

    /// Release the store itself. Called once, last, at shutdown.
    async fn close(&self) -> QueueResult<()>;

    /// Connection lifecycle events, for stores that have a connection.
    fn connection_events(&self) -> Option<broadcast::Receiver<ConnectionEvent>> {
        None
    }
}

/// Score a waiting job is ordered by: higher priority first, then older first.
///
/// Fits exactly in an `f64`, so Redis sorted set scores keep full precision.
pub fn waiting_score(priority: u8, enqueued_millis: i64) -> u64 {
    const SPAN: u64 = 10_000_000_000_000;
    let age_rank = SPAN.saturating_sub(enqueued_millis.max(0) as u64);
    u64::from(priority) * SPAN + age_rank
}
