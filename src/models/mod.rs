//! Data structures used throughout the application.

pub mod job;
pub mod queue;
mod datetime;
mod duration;
mod error;
mod response;

pub use self::datetime::DateTime;
pub use self::duration::Duration;
pub use self::error::{QueueError, QueueResult};
pub use self::response::Response;

use std::collections::BTreeMap;

use serde::Serialize;

use self::job::{JobType, QueueName};
use self::queue::QueueCounts;

/// In-process job counters, kept since startup. Never persisted.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounters {
    pub total_jobs_added: u64,
    pub total_jobs_completed: u64,
    pub total_jobs_failed: u64,
    pub total_jobs_retried: u64,
    pub jobs_added_by_type: BTreeMap<JobType, u64>,
    pub jobs_completed_by_type: BTreeMap<JobType, u64>,
    pub jobs_failed_by_type: BTreeMap<JobType, u64>,
}

impl JobCounters {
    pub fn record_added(&mut self, job_type: JobType) {
        self.total_jobs_added += 1;
        *self.jobs_added_by_type.entry(job_type).or_insert(0) += 1;
    }

    pub fn record_completed(&mut self, job_type: JobType) {
        self.total_jobs_completed += 1;
        *self.jobs_completed_by_type.entry(job_type).or_insert(0) += 1;
    }

    pub fn record_failed(&mut self, job_type: JobType) {
        self.total_jobs_failed += 1;
        *self.jobs_failed_by_type.entry(job_type).or_insert(0) += 1;
    }

    pub fn record_retried(&mut self) {
        self.total_jobs_retried += 1;
    }
}

/// Live job counts for each of the three queues.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct QueueDepths {
    pub calls: QueueCounts,
    pub analytics: QueueCounts,
    pub integrations: QueueCounts,
}

impl QueueDepths {
    pub fn set(&mut self, queue: QueueName, counts: QueueCounts) {
        match queue {
            QueueName::Calls => self.calls = counts,
            QueueName::Analytics => self.analytics = counts,
            QueueName::Integrations => self.integrations = counts,
        }
    }

    pub fn get(&self, queue: QueueName) -> &QueueCounts {
        match queue {
            QueueName::Calls => &self.calls,
            QueueName::Analytics => &self.analytics,
            QueueName::Integrations => &self.integrations,
        }
    }
}

/// Everything `get_metrics` reports.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    #[serde(flatten)]
    pub counters: JobCounters,
    pub current_queue_counts: QueueDepths,
    /// Number of running workers.
    pub workers: usize,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn snapshot_serialisation() {
        let mut counters = JobCounters::default();
        counters.record_added(JobType::Transcribe);
        counters.record_added(JobType::DailyAggregation);
        let snapshot = MetricsSnapshot {
            counters,
            current_queue_counts: QueueDepths::default(),
            workers: 2,
        };

        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["totalJobsAdded"], 2);
        assert_eq!(value["jobsAddedByType"]["transcribe"], 1);
        assert_eq!(value["jobsAddedByType"]["daily_aggregation"], 1);
        assert_eq!(value["currentQueueCounts"]["calls"]["waiting"], 0);
        assert_eq!(value["workers"], 2);
    }
}
