//! Listener that logs connection lifecycle events.

use log::{error, info, warn};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::connection::ConnectionEvent;
use crate::models::{QueueError, QueueResult};

pub struct ConnectionLogger {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConnectionLogger {
    pub fn start(mut events: broadcast::Receiver<ConnectionEvent>) -> Self {
        let (stop, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(ConnectionEvent::Connected { attempt }) => {
                            info!("Connected to Redis (attempt {})", attempt)
                        }
                        Ok(ConnectionEvent::Error { message }) => {
                            error!("Redis connection error: {}", message)
                        }
                        Ok(ConnectionEvent::Closed) | Err(RecvError::Closed) => break,
                        Err(RecvError::Lagged(missed)) => {
                            warn!("Missed {} Redis connection event(s)", missed)
                        }
                    },
                    _ = stop_rx.changed() => break,
                }
            }
        });
        ConnectionLogger { stop, task }
    }

    pub async fn close(self) -> QueueResult<()> {
        let _ = self.stop.send(true);
        self.task
            .await
            .map_err(|err| QueueError::store(format!("connection event listener failed: {}", err)))
    }
}
