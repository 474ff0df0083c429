//! Worker bound to one queue: claims jobs, runs them through the queue's processor with
//! bounded concurrency, and records each outcome.

use std::any::Any;
use std::sync::Arc;
use std::time;

use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use super::metrics::MetricsHandle;
use super::processor::{JobContext, Processor};
use super::{AttemptOutcome, Queue};
use crate::connection::reconnect_delay;
use crate::models::job::{Job, QueueName};
use crate::models::{QueueError, QueueResult};

/// Recorded as `lastError` when a processor fails without saying why.
const UNKNOWN_ERROR: &str = "processor failed without an error message";

/// Handle to a running worker.
pub struct Worker {
    queue: QueueName,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Clone)]
struct WorkerState {
    queue: Queue,
    processor: Arc<dyn Processor>,
    metrics: MetricsHandle,
}

impl Worker {
    /// Start a worker claiming from `queue` with at most `concurrency` jobs in flight.
    pub fn start(
        queue: Queue,
        processor: Arc<dyn Processor>,
        concurrency: usize,
        poll_interval: time::Duration,
        metrics: MetricsHandle,
    ) -> Self {
        let concurrency = concurrency.max(1);
        let (stop, stop_rx) = watch::channel(false);
        let name = queue.name();
        let state = WorkerState {
            queue,
            processor,
            metrics,
        };
        info!("[{}] starting worker with concurrency {}", name, concurrency);

        Worker {
            queue: name,
            stop,
            task: tokio::spawn(run(state, concurrency, poll_interval, stop_rx)),
        }
    }

    pub fn queue_name(&self) -> QueueName {
        self.queue
    }

    /// Stop claiming new jobs and wait for in-flight jobs to finish. In-flight jobs are never
    /// cancelled.
    pub async fn close(self) -> QueueResult<()> {
        let _ = self.stop.send(true);
        self.task.await.map_err(|err| {
            QueueError::store(format!("[{}] worker task failed: {}", self.queue, err))
        })?;
        info!("[{}] worker closed", self.queue);
        Ok(())
    }
}

async fn run(
    state: WorkerState,
    concurrency: usize,
    poll_interval: time::Duration,
    mut stop: watch::Receiver<bool>,
) {
    let name = state.queue.name();
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut in_flight = JoinSet::new();
    let mut consecutive_errors: u32 = 0;

    loop {
        if *stop.borrow() {
            break;
        }

        // reap finished jobs so the set doesn't grow
        while let Some(Some(result)) = in_flight.join_next().now_or_never() {
            log_join_error(name, result);
        }

        let permit = tokio::select! {
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };

        match state.queue.claim().await {
            Ok(Some(job)) => {
                if consecutive_errors > 0 {
                    info!("[{}] store recovered after {} error(s)", name, consecutive_errors);
                    consecutive_errors = 0;
                }
                in_flight.spawn(process(state.clone(), job, permit));
            }
            Ok(None) => {
                drop(permit);
                tokio::select! {
                    _ = state.queue.job_added() => (),
                    _ = tokio::time::sleep(poll_interval) => (),
                    changed = stop.changed() => if changed.is_err() { break },
                }
            }
            Err(QueueError::Closed(_)) => break,
            Err(err) => {
                drop(permit);
                consecutive_errors += 1;
                let backoff = reconnect_delay(consecutive_errors);
                warn!(
                    "[{}] failed to claim job ({} consecutive), backing off {}: {}",
                    name,
                    consecutive_errors,
                    humantime::format_duration(backoff),
                    err
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => (),
                    changed = stop.changed() => if changed.is_err() { break },
                }
            }
        }
    }

    if !in_flight.is_empty() {
        info!("[{}] waiting for {} in-flight job(s)", name, in_flight.len());
    }
    while let Some(result) = in_flight.join_next().await {
        log_join_error(name, result);
    }
    debug!("[{}] worker loop exited", name);
}

fn log_join_error(queue: QueueName, result: Result<(), tokio::task::JoinError>) {
    if let Err(err) = result {
        error!("[{}] job task failed: {}", queue, err);
    }
}

/// Run one job through the processor and settle its outcome.
async fn process(state: WorkerState, job: Job, _permit: OwnedSemaphorePermit) {
    let name = state.queue.name();
    debug!("[{}:{}] processing, attempt {}", name, job.id, job.attempts_made + 1);

    let ctx = JobContext::new(state.queue.clone(), job.id.clone(), state.metrics.clone());
    let processor = state.processor.clone();
    let processor_job = job.clone();

    // own task, so a panicking processor fails the attempt instead of the worker
    let outcome = tokio::spawn(async move { processor.process(processor_job, ctx).await }).await;
    let error = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err.to_string()),
        Err(err) if err.is_panic() => Some(format!("processor panicked: {}", panic_message(err.into_panic()))),
        Err(err) => Some(err.to_string()),
    };

    match error {
        None => settle_success(&state, &job).await,
        Some(err) if err.is_empty() => settle_failure(&state, &job, UNKNOWN_ERROR).await,
        Some(err) => settle_failure(&state, &job, &err).await,
    }
}

async fn settle_success(state: &WorkerState, job: &Job) {
    let name = state.queue.name();
    match state.queue.complete(job).await {
        Ok(()) => {
            state.metrics.record_completed(job.job_type);
            info!("[{}:{}] completed", name, job.id);
        }
        Err(err) => error!("[{}:{}] failed to mark completed: {}", name, job.id, err),
    }
}

async fn settle_failure(state: &WorkerState, job: &Job, error: &str) {
    let name = state.queue.name();
    match state.queue.fail_attempt(job, error).await {
        Ok(AttemptOutcome::Retrying { attempts_made, delay }) => {
            state.metrics.record_retried(job.job_type);
            warn!(
                "[{}:{}] attempt {} failed, retrying in {}: {}",
                name, job.id, attempts_made, delay, error
            );
        }
        Ok(AttemptOutcome::Failed { attempts_made }) => {
            state.metrics.record_failed(job.job_type);
            error!(
                "[{}:{}] failed after {} attempt(s): {}",
                name, job.id, attempts_made, error
            );
        }
        Err(err) => error!(
            "[{}:{}] failed to record failed attempt ({}): {}",
            name, job.id, error, err
        ),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn panic_messages() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("kaboom"))), "kaboom");
        assert_eq!(panic_message(Box::new(42u8)), "unknown panic");
    }
}
