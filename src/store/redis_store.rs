//! Redis implementation of `JobStore`.
//!
//! Transitions that read before they write (claim, finish, promote, prune) run as Lua scripts so
//! they stay atomic on the shared multiplexed connection, where `WATCH` can't be used safely.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use log::{debug, info};
use redis::{AsyncCommands, Script};
use tokio::sync::broadcast;

use super::{waiting_score, JobStore, QueueKeys};
use crate::config::RedisConfig;
use crate::connection::{ConnectionEvent, RedisConnection};
use crate::models::job::{Job, QueueName, State};
use crate::models::queue::{QueueCounts, Retention};
use crate::models::{DateTime, QueueError, QueueResult};

/// KEYS: waiting, job hash. ARGV: id, score, then field/value pairs.
const ENQUEUE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[2]) == 1 then
  return 0
end
redis.call('HSET', KEYS[2], unpack(ARGV, 3))
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
return 1
";

/// KEYS: waiting, active. ARGV: job key prefix, now millis, now RFC3339.
const CLAIM_SCRIPT: &str = r"
local ids = redis.call('ZREVRANGE', KEYS[1], 0, 0)
if #ids == 0 then
  return false
end
local id = ids[1]
local key = ARGV[1] .. id
redis.call('ZREM', KEYS[1], id)
redis.call('ZADD', KEYS[2], ARGV[2], id)
redis.call('HSET', key, 'state', 'active', 'processed_at', ARGV[3])
return redis.call('HGETALL', key)
";

/// KEYS: active, job hash. ARGV: id, progress.
const PROGRESS_SCRIPT: &str = r"
if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  return 0
end
redis.call('HSET', KEYS[2], 'progress', ARGV[2])
return 1
";

/// KEYS: active, target set, job hash.
/// ARGV: id, score, state, attempts made or '', timestamp field or '', timestamp, error or ''.
const FINISH_SCRIPT: &str = r"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
redis.call('HSET', KEYS[3], 'state', ARGV[3])
if ARGV[4] ~= '' then
  redis.call('HSET', KEYS[3], 'attempts_made', ARGV[4])
end
if ARGV[5] ~= '' then
  redis.call('HSET', KEYS[3], ARGV[5], ARGV[6])
end
if ARGV[7] == '' then
  redis.call('HDEL', KEYS[3], 'last_error')
else
  redis.call('HSET', KEYS[3], 'last_error', ARGV[7])
end
return 1
";

/// KEYS: delayed, waiting. ARGV: job key prefix, now millis.
const PROMOTE_SCRIPT: &str = r"
local now = tonumber(ARGV[2])
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[2])
for _, id in ipairs(due) do
  local key = ARGV[1] .. id
  local priority = tonumber(redis.call('HGET', key, 'priority')) or 0
  redis.call('ZREM', KEYS[1], id)
  redis.call('ZADD', KEYS[2], string.format('%.0f', priority * 1e13 + (1e13 - now)), id)
  redis.call('HSET', key, 'state', 'waiting')
end
return due
";

/// KEYS: completed, failed. ARGV: job key prefix, completed cutoff millis, completed max count,
/// failed cutoff millis.
const PRUNE_SCRIPT: &str = r"
local removed = 0
local function drop(set, ids)
  for _, id in ipairs(ids) do
    redis.call('ZREM', set, id)
    redis.call('DEL', ARGV[1] .. id)
    removed = removed + 1
  end
end
drop(KEYS[1], redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[2]))
local excess = redis.call('ZCARD', KEYS[1]) - tonumber(ARGV[3])
if excess > 0 then
  drop(KEYS[1], redis.call('ZRANGE', KEYS[1], 0, excess - 1))
end
drop(KEYS[2], redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', '(' .. ARGV[4]))
return removed
";

struct Scripts {
    enqueue: Script,
    claim: Script,
    progress: Script,
    finish: Script,
    promote: Script,
    prune: Script,
}

impl Scripts {
    fn new() -> Self {
        Scripts {
            enqueue: Script::new(ENQUEUE_SCRIPT),
            claim: Script::new(CLAIM_SCRIPT),
            progress: Script::new(PROGRESS_SCRIPT),
            finish: Script::new(FINISH_SCRIPT),
            promote: Script::new(PROMOTE_SCRIPT),
            prune: Script::new(PRUNE_SCRIPT),
        }
    }
}

/// Where a job finishing its active state moves to.
struct Finish<'a> {
    target: &'a str,
    score: i64,
    state: State,
    attempts_made: Option<u32>,
    timestamp: Option<(&'static str, DateTime)>,
    error: Option<&'a str>,
}

/// Job store backed by the shared Redis connection.
pub struct RedisStore {
    conn: RedisConnection,
    calls: QueueKeys,
    analytics: QueueKeys,
    integrations: QueueKeys,
    scripts: Scripts,
    closed_queues: Mutex<HashSet<QueueName>>,
}

impl RedisStore {
    /// Creates a new store which uses the given namespace prefix for the keys it uses.
    /// If the given namespace is empty, then no prefix is used.
    pub fn new(conn: RedisConnection, key_namespace: &str) -> Self {
        RedisStore {
            conn,
            calls: QueueKeys::new(key_namespace, QueueName::Calls),
            analytics: QueueKeys::new(key_namespace, QueueName::Analytics),
            integrations: QueueKeys::new(key_namespace, QueueName::Integrations),
            scripts: Scripts::new(),
            closed_queues: Mutex::new(HashSet::new()),
        }
    }

    /// Connect to Redis and build a store from the given config.
    pub async fn connect(config: &RedisConfig) -> QueueResult<Self> {
        let conn = RedisConnection::connect(config).await?;
        Ok(Self::new(conn, &config.key_namespace))
    }

    pub fn keys(&self, queue: QueueName) -> &QueueKeys {
        match queue {
            QueueName::Calls => &self.calls,
            QueueName::Analytics => &self.analytics,
            QueueName::Integrations => &self.integrations,
        }
    }

    fn ensure_open(&self, queue: QueueName) -> QueueResult<()> {
        let closed = match self.closed_queues.lock() {
            Ok(closed) => closed.contains(&queue),
            Err(_) => return Err(QueueError::store("queue state lock poisoned")),
        };
        if closed {
            Err(QueueError::closed(format!("Queue {} is closed", queue)))
        } else {
            Ok(())
        }
    }

    async fn finish(&self, queue: QueueName, job_id: &str, finish: Finish<'_>) -> QueueResult<()> {
        let keys = self.keys(queue);
        let mut conn = self.conn.get().await?;

        let mut invocation = self.scripts.finish.prepare_invoke();
        invocation
            .key(&keys.active)
            .key(finish.target)
            .key(keys.job(job_id))
            .arg(job_id)
            .arg(finish.score)
            .arg(finish.state)
            .arg(finish.attempts_made.map(|n| n.to_string()).unwrap_or_default());
        match finish.timestamp {
            Some((field, dt)) => invocation.arg(field).arg(dt),
            None => invocation.arg("").arg(""),
        };
        invocation.arg(finish.error.unwrap_or(""));

        let result = invocation.invoke_async::<_, u8>(&mut conn).await;
        match self.conn.observe(&conn, result).await? {
            1 => Ok(()),
            _ => Err(QueueError::NoSuchJob(job_id.to_owned())),
        }
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn enqueue(&self, job: &Job) -> QueueResult<()> {
        self.ensure_open(job.queue_name)?;
        let keys = self.keys(job.queue_name);
        let mut conn = self.conn.get().await?;

        let mut invocation = self.scripts.enqueue.prepare_invoke();
        invocation
            .key(&keys.waiting)
            .key(keys.job(&job.id))
            .arg(&job.id)
            .arg(waiting_score(job.priority, job.created_at.timestamp_millis()));
        for (field, value) in job.to_fields() {
            invocation.arg(field).arg(value);
        }

        let result = invocation.invoke_async::<_, u8>(&mut conn).await;
        match self.conn.observe(&conn, result).await? {
            1 => {
                debug!("[{}:{}] enqueued with priority {}", job.queue_name, job.id, job.priority);
                Ok(())
            }
            _ => Err(QueueError::conflict(format!("Job with ID {} already exists", job.id))),
        }
    }

    async fn claim(&self, queue: QueueName, now: DateTime) -> QueueResult<Option<Job>> {
        self.ensure_open(queue)?;
        let keys = self.keys(queue);
        let mut conn = self.conn.get().await?;

        let result = self
            .scripts
            .claim
            .key(&keys.waiting)
            .key(&keys.active)
            .arg(&keys.job_prefix)
            .arg(now.timestamp_millis())
            .arg(now)
            .invoke_async::<_, Option<HashMap<String, String>>>(&mut conn)
            .await;

        match self.conn.observe(&conn, result).await? {
            Some(fields) => Ok(Some(Job::from_fields(&fields)?)),
            None => Ok(None),
        }
    }

    async fn update_progress(&self, queue: QueueName, job_id: &str, progress: u8) -> QueueResult<()> {
        let keys = self.keys(queue);
        let mut conn = self.conn.get().await?;

        let result = self
            .scripts
            .progress
            .key(&keys.active)
            .key(keys.job(job_id))
            .arg(job_id)
            .arg(progress)
            .invoke_async::<_, u8>(&mut conn)
            .await;
        match self.conn.observe(&conn, result).await? {
            1 => Ok(()),
            _ => Err(QueueError::NoSuchJob(job_id.to_owned())),
        }
    }

    async fn complete(&self, queue: QueueName, job_id: &str, finished_at: DateTime) -> QueueResult<()> {
        let keys = self.keys(queue);
        self.finish(
            queue,
            job_id,
            Finish {
                target: &keys.completed,
                score: finished_at.timestamp_millis(),
                state: State::Completed,
                attempts_made: None,
                timestamp: Some(("finished_at", finished_at)),
                error: None,
            },
        )
        .await
    }

    async fn retry_later(
        &self,
        queue: QueueName,
        job_id: &str,
        error: &str,
        attempts_made: u32,
        run_at: DateTime,
    ) -> QueueResult<()> {
        let keys = self.keys(queue);
        self.finish(
            queue,
            job_id,
            Finish {
                target: &keys.delayed,
                score: run_at.timestamp_millis(),
                state: State::Delayed,
                attempts_made: Some(attempts_made),
                timestamp: None,
                error: Some(error),
            },
        )
        .await
    }

    async fn fail(
        &self,
        queue: QueueName,
        job_id: &str,
        error: &str,
        attempts_made: u32,
        finished_at: DateTime,
    ) -> QueueResult<()> {
        let keys = self.keys(queue);
        self.finish(
            queue,
            job_id,
            Finish {
                target: &keys.failed,
                score: finished_at.timestamp_millis(),
                state: State::Failed,
                attempts_made: Some(attempts_made),
                timestamp: Some(("finished_at", finished_at)),
                error: Some(error),
            },
        )
        .await
    }

    async fn promote_delayed(&self, queue: QueueName, now: DateTime) -> QueueResult<Vec<String>> {
        let keys = self.keys(queue);
        let mut conn = self.conn.get().await?;

        let result = self
            .scripts
            .promote
            .key(&keys.delayed)
            .key(&keys.waiting)
            .arg(&keys.job_prefix)
            .arg(now.timestamp_millis())
            .invoke_async::<_, Vec<String>>(&mut conn)
            .await;
        self.conn.observe(&conn, result).await
    }

    async fn prune(&self, queue: QueueName, retention: &Retention, now: DateTime) -> QueueResult<u64> {
        let keys = self.keys(queue);
        let mut conn = self.conn.get().await?;

        let result = self
            .scripts
            .prune
            .key(&keys.completed)
            .key(&keys.failed)
            .arg(&keys.job_prefix)
            .arg(now.minus(retention.completed_max_age).timestamp_millis())
            .arg(retention.completed_max_count)
            .arg(now.minus(retention.failed_max_age).timestamp_millis())
            .invoke_async::<_, u64>(&mut conn)
            .await;
        self.conn.observe(&conn, result).await
    }

    async fn counts(&self, queue: QueueName) -> QueueResult<QueueCounts> {
        let keys = self.keys(queue);
        let mut conn = self.conn.get().await?;

        let result = redis::pipe()
            .atomic()
            .zcard(&keys.waiting)
            .zcard(&keys.active)
            .zcard(&keys.delayed)
            .zcard(&keys.completed)
            .zcard(&keys.failed)
            .query_async::<_, QueueCounts>(&mut conn)
            .await;
        self.conn.observe(&conn, result).await
    }

    async fn job(&self, queue: QueueName, job_id: &str) -> QueueResult<Option<Job>> {
        let mut conn = self.conn.get().await?;
        let result = conn
            .hgetall::<_, HashMap<String, String>>(self.keys(queue).job(job_id))
            .await;
        let fields = self.conn.observe(&conn, result).await?;
        if fields.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Job::from_fields(&fields)?))
        }
    }

    async fn failed_jobs(&self, queue: QueueName, limit: usize) -> QueueResult<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let keys = self.keys(queue);
        let mut conn = self.conn.get().await?;

        let result = conn
            .zrevrange::<_, Vec<String>>(&keys.failed, 0, limit as isize - 1)
            .await;
        let job_ids = self.conn.observe(&conn, result).await?;
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipeline = redis::pipe();
        for job_id in &job_ids {
            pipeline.hgetall(keys.job(job_id));
        }
        let result = pipeline
            .query_async::<_, Vec<HashMap<String, String>>>(&mut conn)
            .await;

        let rows = self.conn.observe(&conn, result).await?;

        // jobs pruned between the two calls come back empty
        rows.iter()
            .filter(|fields| !fields.is_empty())
            .map(Job::from_fields)
            .collect()
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn.get().await?;
        let result = redis::cmd("PING").query_async::<_, String>(&mut conn).await;
        match self.conn.observe(&conn, result).await?.as_str() {
            "PONG" => Ok(()),
            other => Err(QueueError::store(format!(
                "unexpected PING response from Redis: {}",
                other
            ))),
        }
    }

    async fn close_queue(&self, queue: QueueName) -> QueueResult<()> {
        match self.closed_queues.lock() {
            Ok(mut closed) => {
                if !closed.insert(queue) {
                    return Err(QueueError::closed(format!("Queue {} already closed", queue)));
                }
            }
            Err(_) => return Err(QueueError::store("queue state lock poisoned")),
        }
        info!("[{}] queue closed", queue);
        Ok(())
    }

    async fn close(&self) -> QueueResult<()> {
        self.conn.close().await
    }

    fn connection_events(&self) -> Option<broadcast::Receiver<ConnectionEvent>> {
        Some(self.conn.subscribe())
    }
}
