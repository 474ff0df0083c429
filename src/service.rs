//! Submission API answering every call with the `{success, data, error, timestamp, requestId}`
//! envelope. This is what webhook and HTTP collaborators talk to.

use std::str::FromStr;
use std::sync::Arc;

use log::{error, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::application::{ProcessorRegistry, QueueManager};
use crate::models::job::{Job, JobHandle, QueueName};
use crate::models::{MetricsSnapshot, QueueError, QueueResult, Response};

/// Data returned for a successfully queued call job.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallJobData {
    pub job_id: String,
    pub call_sid: String,
    pub action: String,
    pub queue_name: QueueName,
    pub priority: u8,
}

impl CallJobData {
    pub fn new(handle: JobHandle, call_sid: &str, action: &str) -> Self {
        CallJobData {
            job_id: handle.job_id,
            call_sid: call_sid.to_owned(),
            action: action.to_owned(),
            queue_name: handle.queue_name,
            priority: handle.priority,
        }
    }
}

/// Envelope for one operation, kept together with the error it was built from so callers
/// can classify the failure.
#[derive(Debug)]
pub struct Reply<T> {
    pub response: Response<T>,
    pub error: Option<QueueError>,
}

impl<T> Reply<T> {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone)]
pub struct JobService {
    manager: Arc<QueueManager>,
}

impl JobService {
    pub fn new(manager: Arc<QueueManager>) -> Self {
        JobService { manager }
    }

    pub fn manager(&self) -> &Arc<QueueManager> {
        &self.manager
    }

    /// Queue post-processing `action` (a calls job type) for a call.
    pub async fn add_call_to_queue(
        &self,
        call_sid: &str,
        action: &str,
        data: Value,
        priority: Option<u8>,
    ) -> Reply<CallJobData> {
        let result = self
            .manager
            .add_call_job(call_sid, action, data, priority)
            .await
            .map(|handle| CallJobData::new(handle, call_sid, action));
        respond(&format!("[call:{}] add {}", call_sid, action), result)
    }

    pub async fn add_analytics_job(
        &self,
        job_type: &str,
        data: Value,
        priority: Option<u8>,
    ) -> Reply<JobHandle> {
        let result = self.manager.add_analytics_job(job_type, data, priority).await;
        respond(&format!("add analytics job {}", job_type), result)
    }

    pub async fn add_integration_job(
        &self,
        job_type: &str,
        data: Value,
        priority: Option<u8>,
    ) -> Reply<JobHandle> {
        let result = self
            .manager
            .add_integration_job(job_type, data, priority)
            .await;
        respond(&format!("add integration job {}", job_type), result)
    }

    /// Start workers for whichever processors are supplied.
    pub fn setup_workers(&self, registry: &ProcessorRegistry) -> QueueResult<()> {
        self.manager.setup_workers(registry).map(|_| ())
    }

    pub async fn get_metrics(&self) -> Reply<MetricsSnapshot> {
        respond("get metrics", self.manager.get_metrics().await)
    }

    /// Terminally failed jobs of the named queue, newest first.
    pub async fn failed_jobs(&self, queue_name: &str, limit: usize) -> Reply<Vec<Job>> {
        let result = match QueueName::from_str(queue_name) {
            Ok(name) => self.manager.failed_jobs(name, limit).await,
            Err(err) => Err(err),
        };
        respond(&format!("[{}] list failed jobs", queue_name), result)
    }

    pub async fn job(&self, queue_name: &str, job_id: &str) -> Reply<Job> {
        let result = match QueueName::from_str(queue_name) {
            Ok(name) => self.manager.job(name, job_id).await,
            Err(err) => Err(err),
        };
        respond(&format!("[{}:{}] fetch job", queue_name, job_id), result)
    }

    /// Fails if any drain step failed, after every step was attempted.
    pub async fn shutdown(&self) -> QueueResult<()> {
        self.manager.shutdown().await
    }
}

/// Store and connection failures are logged as errors, everything else as warnings.
fn respond<T>(operation: &str, result: QueueResult<T>) -> Reply<T> {
    match result {
        Ok(data) => Reply {
            response: Response::ok(data),
            error: None,
        },
        Err(err) => {
            let response = Response::from(&err);
            if err.is_infrastructure() {
                error!("[request:{}] {} failed: {}", response.request_id, operation, err);
            } else {
                warn!("[request:{}] {} rejected: {}", response.request_id, operation, err);
            }
            Reply {
                response,
                error: Some(err),
            }
        }
    }
}
