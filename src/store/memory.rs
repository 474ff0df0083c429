//! In-process implementation of `JobStore`.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use log::info;

use super::JobStore;
use crate::models::job::{Job, QueueName, State};
use crate::models::queue::{QueueCounts, Retention};
use crate::models::{DateTime, QueueError, QueueResult};

/// Ordered entry in one of the finished/delayed sets: `(millis, insertion sequence, job id)`.
type TimedEntry = (i64, u64, String);

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    waiting: BTreeSet<(Reverse<u8>, u64, String)>,
    active: HashSet<String>,
    delayed: BTreeSet<TimedEntry>,
    completed: BTreeSet<TimedEntry>,
    failed: BTreeSet<TimedEntry>,
    closed: bool,
}

impl QueueState {
    fn counts(&self) -> QueueCounts {
        QueueCounts {
            waiting: self.waiting.len() as u64,
            active: self.active.len() as u64,
            delayed: self.delayed.len() as u64,
            completed: self.completed.len() as u64,
            failed: self.failed.len() as u64,
        }
    }

    /// Take a job out of `active`, failing if it isn't there.
    fn take_active(&mut self, job_id: &str) -> QueueResult<&mut Job> {
        if !self.active.remove(job_id) {
            return Err(QueueError::NoSuchJob(job_id.to_owned()));
        }
        self.jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::NoSuchJob(job_id.to_owned()))
    }

    fn drop_entries(&mut self, entries: Vec<TimedEntry>, completed: bool) -> u64 {
        let removed = entries.len() as u64;
        for entry in entries {
            self.jobs.remove(&entry.2);
            if completed {
                self.completed.remove(&entry);
            } else {
                self.failed.remove(&entry);
            }
        }
        removed
    }
}

/// Job store holding all state in memory. Jobs don't survive a restart.
///
/// Claims are serialised by a single lock, so it gives the same single-delivery guarantee as
/// `RedisStore` within one process.
#[derive(Default)]
pub struct MemoryStore {
    queues: Mutex<HashMap<QueueName, QueueState>>,
    seq: AtomicU64,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn with_queue<T, F>(&self, queue: QueueName, func: F) -> QueueResult<T>
    where
        F: FnOnce(&mut QueueState) -> QueueResult<T>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::closed("Memory store is closed"));
        }
        let mut queues = self
            .queues
            .lock()
            .map_err(|_| QueueError::store("memory store lock poisoned"))?;
        func(queues.entry(queue).or_default())
    }

    fn with_open_queue<T, F>(&self, queue: QueueName, func: F) -> QueueResult<T>
    where
        F: FnOnce(&mut QueueState) -> QueueResult<T>,
    {
        self.with_queue(queue, |state| {
            if state.closed {
                Err(QueueError::closed(format!("Queue {} is closed", queue)))
            } else {
                func(state)
            }
        })
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue(&self, job: &Job) -> QueueResult<()> {
        let seq = self.next_seq();
        self.with_open_queue(job.queue_name, |state| {
            if state.jobs.contains_key(&job.id) {
                return Err(QueueError::conflict(format!("Job with ID {} already exists", job.id)));
            }
            state.waiting.insert((Reverse(job.priority), seq, job.id.clone()));
            state.jobs.insert(job.id.clone(), job.clone());
            Ok(())
        })
    }

    async fn claim(&self, queue: QueueName, now: DateTime) -> QueueResult<Option<Job>> {
        self.with_open_queue(queue, |state| {
            let entry = match state.waiting.iter().next() {
                Some(entry) => entry.clone(),
                None => return Ok(None),
            };
            state.waiting.remove(&entry);
            let job_id = entry.2;

            let job = state
                .jobs
                .get_mut(&job_id)
                .ok_or_else(|| QueueError::NoSuchJob(job_id.clone()))?;
            job.state = State::Active;
            job.processed_at = Some(now);
            let claimed = job.clone();
            state.active.insert(job_id);
            Ok(Some(claimed))
        })
    }

    async fn update_progress(&self, queue: QueueName, job_id: &str, progress: u8) -> QueueResult<()> {
        self.with_queue(queue, |state| {
            if !state.active.contains(job_id) {
                return Err(QueueError::NoSuchJob(job_id.to_owned()));
            }
            if let Some(job) = state.jobs.get_mut(job_id) {
                job.progress = progress;
            }
            Ok(())
        })
    }

    async fn complete(&self, queue: QueueName, job_id: &str, finished_at: DateTime) -> QueueResult<()> {
        let seq = self.next_seq();
        self.with_queue(queue, |state| {
            let job = state.take_active(job_id)?;
            job.state = State::Completed;
            job.finished_at = Some(finished_at);
            job.last_error = None;
            state
                .completed
                .insert((finished_at.timestamp_millis(), seq, job_id.to_owned()));
            Ok(())
        })
    }

    async fn retry_later(
        &self,
        queue: QueueName,
        job_id: &str,
        error: &str,
        attempts_made: u32,
        run_at: DateTime,
    ) -> QueueResult<()> {
        let seq = self.next_seq();
        self.with_queue(queue, |state| {
            let job = state.take_active(job_id)?;
            job.state = State::Delayed;
            job.attempts_made = attempts_made;
            job.last_error = Some(error.to_owned());
            state
                .delayed
                .insert((run_at.timestamp_millis(), seq, job_id.to_owned()));
            Ok(())
        })
    }

    async fn fail(
        &self,
        queue: QueueName,
        job_id: &str,
        error: &str,
        attempts_made: u32,
        finished_at: DateTime,
    ) -> QueueResult<()> {
        let seq = self.next_seq();
        self.with_queue(queue, |state| {
            let job = state.take_active(job_id)?;
            job.state = State::Failed;
            job.attempts_made = attempts_made;
            job.finished_at = Some(finished_at);
            job.last_error = Some(error.to_owned());
            state
                .failed
                .insert((finished_at.timestamp_millis(), seq, job_id.to_owned()));
            Ok(())
        })
    }

    async fn promote_delayed(&self, queue: QueueName, now: DateTime) -> QueueResult<Vec<String>> {
        let now_millis = now.timestamp_millis();
        self.with_queue(queue, |state| {
            let due: Vec<TimedEntry> = state
                .delayed
                .iter()
                .take_while(|entry| entry.0 <= now_millis)
                .cloned()
                .collect();

            let mut promoted = Vec::with_capacity(due.len());
            for entry in due {
                state.delayed.remove(&entry);
                let job_id = entry.2;
                if let Some(job) = state.jobs.get_mut(&job_id) {
                    job.state = State::Waiting;
                    let seq = self.next_seq();
                    state.waiting.insert((Reverse(job.priority), seq, job_id.clone()));
                    promoted.push(job_id);
                }
            }
            Ok(promoted)
        })
    }

    async fn prune(&self, queue: QueueName, retention: &Retention, now: DateTime) -> QueueResult<u64> {
        let completed_cutoff = now.minus(retention.completed_max_age).timestamp_millis();
        let failed_cutoff = now.minus(retention.failed_max_age).timestamp_millis();
        let max_count = retention.completed_max_count as usize;

        self.with_queue(queue, |state| {
            let expired: Vec<TimedEntry> = state
                .completed
                .iter()
                .take_while(|entry| entry.0 < completed_cutoff)
                .cloned()
                .collect();
            let mut removed = state.drop_entries(expired, true);

            let excess = state.completed.len().saturating_sub(max_count);
            let oldest: Vec<TimedEntry> = state.completed.iter().take(excess).cloned().collect();
            removed += state.drop_entries(oldest, true);

            let expired: Vec<TimedEntry> = state
                .failed
                .iter()
                .take_while(|entry| entry.0 < failed_cutoff)
                .cloned()
                .collect();
            removed += state.drop_entries(expired, false);

            Ok(removed)
        })
    }

    async fn counts(&self, queue: QueueName) -> QueueResult<QueueCounts> {
        self.with_queue(queue, |state| Ok(state.counts()))
    }

    async fn job(&self, queue: QueueName, job_id: &str) -> QueueResult<Option<Job>> {
        self.with_queue(queue, |state| Ok(state.jobs.get(job_id).cloned()))
    }

    async fn failed_jobs(&self, queue: QueueName, limit: usize) -> QueueResult<Vec<Job>> {
        self.with_queue(queue, |state| {
            Ok(state
                .failed
                .iter()
                .rev()
                .take(limit)
                .filter_map(|entry| state.jobs.get(&entry.2).cloned())
                .collect())
        })
    }

    async fn ping(&self) -> QueueResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(QueueError::closed("Memory store is closed"))
        } else {
            Ok(())
        }
    }

    async fn close_queue(&self, queue: QueueName) -> QueueResult<()> {
        self.with_queue(queue, |state| {
            if state.closed {
                return Err(QueueError::closed(format!("Queue {} already closed", queue)));
            }
            state.closed = true;
            Ok(())
        })?;
        info!("[{}] queue closed", queue);
        Ok(())
    }

    async fn close(&self) -> QueueResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(QueueError::closed("Memory store already closed"));
        }
        info!("Memory store closed");
        Ok(())
    }
}
