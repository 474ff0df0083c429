//! Strictly ordered, idempotent shutdown.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};

use log::{error, info};
use serde::Serialize;
use tokio::sync::OnceCell;

use crate::models::{QueueError, QueueResult};

/// Lifecycle of the queue system as a whole.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Running,
    Draining,
    Closed,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Lifecycle::Running => "running",
            Lifecycle::Draining => "draining",
            Lifecycle::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

/// Failures collected while draining. Every step runs regardless of earlier failures.
#[derive(Debug, Default)]
pub struct DrainReport {
    failures: Vec<String>,
}

impl DrainReport {
    /// Record the outcome of one drain step.
    pub fn step(&mut self, name: &str, result: QueueResult<()>) {
        if let Err(err) = result {
            error!("Shutdown step '{}' failed: {}", name, err);
            self.failures.push(format!("{}: {}", name, err));
        }
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Runs the drain at most once. Callers arriving while it runs wait for it and get the same
/// outcome.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    state: AtomicU8,
    outcome: OnceCell<Vec<String>>,
}

const RUNNING: u8 = 0;
const DRAINING: u8 = 1;
const CLOSED: u8 = 2;

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        ShutdownCoordinator {
            state: AtomicU8::new(RUNNING),
            outcome: OnceCell::new(),
        }
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        match self.state.load(Ordering::SeqCst) {
            RUNNING => Lifecycle::Running,
            DRAINING => Lifecycle::Draining,
            _ => Lifecycle::Closed,
        }
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle() == Lifecycle::Running
    }

    /// Run `drain` if no shutdown has started yet, otherwise wait for the one in progress.
    /// Fails if any drain step failed.
    pub async fn shutdown<F, Fut>(&self, drain: F) -> QueueResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DrainReport>,
    {
        let failures = self
            .outcome
            .get_or_init(|| async {
                self.state.store(DRAINING, Ordering::SeqCst);
                info!("Shutting down");
                let report = drain().await;
                self.state.store(CLOSED, Ordering::SeqCst);
                if report.is_clean() {
                    info!("Shutdown complete");
                } else {
                    error!("Shutdown finished with {} failed step(s)", report.failures().len());
                }
                report.failures
            })
            .await;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(QueueError::Shutdown(failures.clone()))
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn drains_once_for_concurrent_callers() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let drains = Arc::new(AtomicUsize::new(0));

        let run = |coordinator: Arc<ShutdownCoordinator>, drains: Arc<AtomicUsize>| async move {
            coordinator
                .shutdown(|| async move {
                    drains.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    DrainReport::default()
                })
                .await
        };

        let (a, b) = tokio::join!(
            run(coordinator.clone(), drains.clone()),
            run(coordinator.clone(), drains.clone())
        );
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(drains.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.lifecycle(), Lifecycle::Closed);

        // later calls are no-ops
        run(coordinator.clone(), drains.clone()).await.unwrap();
        assert_eq!(drains.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_steps_are_reported_after_all_steps_run() {
        let coordinator = ShutdownCoordinator::new();
        let result = coordinator
            .shutdown(|| async {
                let mut report = DrainReport::default();
                report.step("workers", Err(QueueError::store("worker stuck")));
                report.step("queues", Ok(()));
                report.step("connection", Err(QueueError::closed("already closed")));
                report
            })
            .await;

        match result {
            Err(QueueError::Shutdown(failures)) => {
                assert_eq!(failures, vec!["workers: worker stuck", "connection: already closed"]);
            }
            other => panic!("expected shutdown error, got {:?}", other),
        }

        // the same outcome is reported to later callers
        assert!(coordinator.shutdown(|| async { DrainReport::default() }).await.is_err());
    }
}
