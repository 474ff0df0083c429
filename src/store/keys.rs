//! Contains definitions for Redis keys used to store queue state.

use crate::models::job::QueueName;

/// Prefix used for queue keys in Redis. Jobs of the "calls" queue are kept under keys starting
/// with "queue:calls:".
const QUEUE_PREFIX: &str = "queue:";

/// Suffix of the sorted set of jobs ready to be claimed, scored by priority then age.
const WAITING_SUFFIX: &str = ":waiting";

/// Suffix of the sorted set of jobs currently claimed by a worker, scored by claim time.
const ACTIVE_SUFFIX: &str = ":active";

/// Suffix of the sorted set of jobs backing off before a retry, scored by the time they
/// become claimable again.
const DELAYED_SUFFIX: &str = ":delayed";

/// Suffix of the sorted set of completed jobs, scored by finish time. Pruned by retention.
const COMPLETED_SUFFIX: &str = ":completed";

/// Suffix of the sorted set of terminally failed jobs, scored by finish time. Pruned by retention.
const FAILED_SUFFIX: &str = ":failed";

/// Infix for job hashes. Job "CA1-transcribe-1" on "calls" lives at "queue:calls:job:CA1-transcribe-1".
const JOB_INFIX: &str = ":job:";

/// Redis keys for one queue, with the configured namespace applied.
#[derive(Clone, Debug, PartialEq)]
pub struct QueueKeys {
    pub waiting: String,
    pub active: String,
    pub delayed: String,
    pub completed: String,
    pub failed: String,

    /// Prefix of every job hash key on this queue. Append a job id to get its key.
    pub job_prefix: String,
}

impl QueueKeys {
    /// Build keys for the given queue. An empty namespace means keys are not prefixed.
    pub fn new(key_namespace: &str, queue: QueueName) -> Self {
        let base = if key_namespace.is_empty() {
            format!("{}{}", QUEUE_PREFIX, queue)
        } else {
            format!("{}:{}{}", key_namespace, QUEUE_PREFIX, queue)
        };

        QueueKeys {
            waiting: format!("{}{}", base, WAITING_SUFFIX),
            active: format!("{}{}", base, ACTIVE_SUFFIX),
            delayed: format!("{}{}", base, DELAYED_SUFFIX),
            completed: format!("{}{}", base, COMPLETED_SUFFIX),
            failed: format!("{}{}", base, FAILED_SUFFIX),
            job_prefix: format!("{}{}", base, JOB_INFIX),
        }
    }

    pub fn job(&self, job_id: &str) -> String {
        format!("{}{}", self.job_prefix, job_id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn namespaced_keys() {
        let keys = QueueKeys::new("callqueue", QueueName::Calls);
        assert_eq!(keys.waiting, "callqueue:queue:calls:waiting");
        assert_eq!(keys.failed, "callqueue:queue:calls:failed");
        assert_eq!(keys.job("CA1-transcribe-1"), "callqueue:queue:calls:job:CA1-transcribe-1");
    }

    #[test]
    fn empty_namespace() {
        let keys = QueueKeys::new("", QueueName::Analytics);
        assert_eq!(keys.delayed, "queue:analytics:delayed");
        assert_eq!(keys.job_prefix, "queue:analytics:job:");
    }
}
