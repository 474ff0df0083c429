//! Periodic background tasks that keep a queue's delayed and finished sets in shape.
use std::time;

use log::{debug, error, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::Queue;
use crate::config::WorkerConfig;
use crate::models::{QueueError, QueueResult};

const MIN_CHECK_INTERVAL: time::Duration = time::Duration::from_millis(1);

/// Sweepers running for one queue.
pub struct Monitor {
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Monitor {
    /// Start all background tasks that perform promotion/cleanup for the given queue.
    pub fn start(queue: &Queue, config: &WorkerConfig) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let handles = vec![
            start_delayed_monitor(queue.clone(), config.delayed_check_interval.0, stop_rx.clone()),
            start_retention_monitor(queue.clone(), config.retention_check_interval.0, stop_rx),
        ];
        Monitor { stop, handles }
    }

    /// Stop the sweepers and wait for them to exit.
    pub async fn stop(self) -> QueueResult<()> {
        let _ = self.stop.send(true);
        for handle in self.handles {
            if let Err(err) = handle.await {
                return Err(QueueError::store(format!("queue monitor task failed: {}", err)));
            }
        }
        Ok(())
    }
}

/// Wait for the next tick, returning false if the monitor was told to stop.
async fn tick(interval: &mut tokio::time::Interval, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = interval.tick() => !*stop.borrow(),
        _ = stop.changed() => false,
    }
}

/// Start periodic background task that moves backed-off jobs back to waiting once due.
fn start_delayed_monitor(
    queue: Queue,
    check_interval: time::Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    info!(
        "[{}] checking delayed jobs every {}",
        queue.name(),
        humantime::format_duration(check_interval)
    );
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(check_interval.max(MIN_CHECK_INTERVAL));
        while tick(&mut interval, &mut stop).await {
            if let Err(err) = queue.promote_delayed().await {
                error!("[{}] delayed job monitoring failed: {}", queue.name(), err);
            }
        }
        debug!("[{}] delayed job monitor stopped", queue.name());
    })
}

/// Start periodic background task that prunes finished jobs outside the retention window.
fn start_retention_monitor(
    queue: Queue,
    check_interval: time::Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    info!(
        "[{}] checking job retention every {}",
        queue.name(),
        humantime::format_duration(check_interval)
    );
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(check_interval.max(MIN_CHECK_INTERVAL));
        while tick(&mut interval, &mut stop).await {
            match queue.prune().await {
                Ok(0) => (),
                Ok(removed) => info!("[{}] pruned {} finished job(s)", queue.name(), removed),
                Err(err) => error!("[{}] job retention monitoring failed: {}", queue.name(), err),
            }
        }
        debug!("[{}] retention monitor stopped", queue.name());
    })
}
