mod settings;

pub use self::settings::{
    Backoff, BackoffKind, JobPolicy, Retention, RetryDecision, Settings, SettingsOverride,
};

use redis::{self, from_redis_value, FromRedisValue};
use serde::Serialize;

/// Live count of jobs in each state on one queue.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueCounts {
    /// Jobs not yet finished: waiting, active or delayed.
    pub fn depth(&self) -> u64 {
        self.waiting + self.active + self.delayed
    }
}

impl FromRedisValue for QueueCounts {
    fn from_redis_value(v: &redis::Value) -> redis::RedisResult<Self> {
        let (waiting, active, delayed, completed, failed): (u64, u64, u64, u64, u64) =
            from_redis_value(v)?;
        Ok(QueueCounts { waiting, active, delayed, completed, failed })
    }
}
