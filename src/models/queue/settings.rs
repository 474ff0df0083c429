use serde::{Deserialize, Serialize};

use crate::models::job::QueueName;
use crate::models::Duration;

/// Default number of jobs claimed at once by a queue's worker.
pub const CALLS_CONCURRENCY: usize = 5;
pub const ANALYTICS_CONCURRENCY: usize = 3;
pub const INTEGRATIONS_CONCURRENCY: usize = 5;

/// Default priorities given to jobs when the submitter doesn't specify one.
pub const CALLS_PRIORITY: u8 = 5;
pub const ANALYTICS_PRIORITY: u8 = 3;
pub const INTEGRATIONS_PRIORITY: u8 = 5;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_COMPLETED_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_COMPLETED_MAX_COUNT: u64 = 1000;
pub const DEFAULT_FAILED_MAX_AGE: Duration = Duration::from_secs(48 * 60 * 60);

/// Runtime settings for one queue: how many jobs its worker runs at once, and the policy
/// every job on it is created with.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Settings {
    pub concurrency: usize,
    pub default_priority: u8,
    pub policy: JobPolicy,
}

impl Settings {
    /// Built-in defaults for the given queue.
    pub fn defaults_for(queue: QueueName) -> Self {
        let (concurrency, default_priority) = match queue {
            QueueName::Calls => (CALLS_CONCURRENCY, CALLS_PRIORITY),
            QueueName::Analytics => (ANALYTICS_CONCURRENCY, ANALYTICS_PRIORITY),
            QueueName::Integrations => (INTEGRATIONS_CONCURRENCY, INTEGRATIONS_PRIORITY),
        };
        Settings {
            concurrency,
            default_priority,
            policy: JobPolicy::default(),
        }
    }

    /// Defaults for the given queue, with any configured overrides applied.
    pub fn for_queue(queue: QueueName, overrides: Option<&SettingsOverride>) -> Self {
        let mut settings = Self::defaults_for(queue);
        if let Some(o) = overrides {
            if let Some(concurrency) = o.concurrency {
                settings.concurrency = concurrency.max(1);
            }
            if let Some(max_attempts) = o.max_attempts {
                settings.policy.max_attempts = max_attempts.max(1);
            }
            if let Some(delay) = o.backoff_delay {
                settings.policy.backoff.base_delay = delay;
            }
            if let Some(age) = o.completed_max_age {
                settings.policy.retention.completed_max_age = age;
            }
            if let Some(count) = o.completed_max_count {
                settings.policy.retention.completed_max_count = count;
            }
            if let Some(age) = o.failed_max_age {
                settings.policy.retention.failed_max_age = age;
            }
        }
        settings
    }
}

/// Per-queue overrides read from the `[queue.<name>]` config sections. Anything left out
/// keeps its built-in default.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SettingsOverride {
    pub concurrency: Option<usize>,
    pub max_attempts: Option<u32>,
    pub backoff_delay: Option<Duration>,
    pub completed_max_age: Option<Duration>,
    pub completed_max_count: Option<u64>,
    pub failed_max_age: Option<Duration>,
}

/// Retry and retention policy applied to every job on a queue.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub retention: Retention,
}

impl Default for JobPolicy {
    fn default() -> Self {
        JobPolicy {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::exponential(DEFAULT_BACKOFF_DELAY),
            retention: Retention::default(),
        }
    }
}

impl JobPolicy {
    /// What to do with a job whose processor just failed, given the attempts made including
    /// the one that failed.
    pub fn after_failure(&self, attempts_made: u32) -> RetryDecision {
        if attempts_made >= self.max_attempts {
            RetryDecision::Fail
        } else {
            RetryDecision::RetryAfter(self.backoff.delay(attempts_made))
        }
    }
}

/// Outcome of applying a policy to a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RetryDecision {
    /// Move the job to `delayed` and make it claimable again after the given delay.
    RetryAfter(Duration),

    /// Attempts exhausted, the job is terminally failed.
    Fail,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Exponential,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    pub base_delay: Duration,
}

impl Backoff {
    pub fn exponential(base_delay: Duration) -> Self {
        Backoff {
            kind: BackoffKind::Exponential,
            base_delay,
        }
    }

    /// Delay before the next attempt after `attempts_made` failures: `base * 2^(attempts_made - 1)`.
    pub fn delay(&self, attempts_made: u32) -> Duration {
        match self.kind {
            BackoffKind::Exponential => {
                let exponent = attempts_made.saturating_sub(1).min(31);
                let base = self.base_delay.as_millis().max(0) as u64;
                Duration::from_millis(base.saturating_mul(1u64 << exponent))
            }
        }
    }
}

/// How long finished jobs stay queryable.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Retention {
    pub completed_max_age: Duration,
    pub completed_max_count: u64,
    pub failed_max_age: Duration,
}

impl Default for Retention {
    fn default() -> Self {
        Retention {
            completed_max_age: DEFAULT_COMPLETED_MAX_AGE,
            completed_max_count: DEFAULT_COMPLETED_MAX_COUNT,
            failed_max_age: DEFAULT_FAILED_MAX_AGE,
        }
    }
}
