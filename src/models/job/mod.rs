mod field;
mod kind;
pub mod payload;
mod state;

pub use self::field::Field;
pub use self::kind::{JobType, QueueName};
pub use self::state::State;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

use crate::models::{DateTime, QueueError, QueueResult};

/// Highest priority a job can be given. Higher values are claimed first.
pub const MAX_PRIORITY: u8 = 10;

/// A unit of deferred work, as stored and as handed to processors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// `{subject}-{jobType}-{creationEpochMillis}`, unique within its queue.
    pub id: String,
    pub queue_name: QueueName,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub priority: u8,
    /// Number of failed attempts so far. Never exceeds the queue's `max_attempts`.
    pub attempts_made: u32,
    pub state: State,
    /// Last progress (0-100) reported by a processor.
    pub progress: u8,
    pub created_at: DateTime,
    pub processed_at: Option<DateTime>,
    pub finished_at: Option<DateTime>,
    pub last_error: Option<String>,
}

impl Job {
    /// Build a new `waiting` job. The id's timestamp component is strictly increasing within
    /// this process, so concurrent submissions for the same subject never collide.
    pub fn new(subject: &str, job_type: JobType, payload: serde_json::Value, priority: u8) -> Self {
        let created_millis = next_creation_millis();
        let created_at = DateTime::from_millis(created_millis).unwrap_or_else(DateTime::now);
        Job {
            id: build_id(subject, job_type, created_millis),
            queue_name: job_type.queue(),
            job_type,
            payload,
            priority,
            attempts_made: 0,
            state: State::Waiting,
            progress: 0,
            created_at,
            processed_at: None,
            finished_at: None,
            last_error: None,
        }
    }

    /// The identifying tuple returned to submitters.
    pub fn handle(&self) -> JobHandle {
        JobHandle {
            job_id: self.id.clone(),
            queue_name: self.queue_name,
            job_type: self.job_type,
            priority: self.priority,
        }
    }

    /// Flatten into `(field, value)` pairs for storage in a Redis hash.
    pub fn to_fields(&self) -> Vec<(Field, String)> {
        let mut fields = vec![
            (Field::Id, self.id.clone()),
            (Field::Queue, self.queue_name.to_string()),
            (Field::JobType, self.job_type.to_string()),
            (Field::Payload, self.payload.to_string()),
            (Field::Priority, self.priority.to_string()),
            (Field::AttemptsMade, self.attempts_made.to_string()),
            (Field::State, self.state.to_string()),
            (Field::Progress, self.progress.to_string()),
            (Field::CreatedAt, self.created_at.to_rfc3339()),
        ];
        if let Some(dt) = &self.processed_at {
            fields.push((Field::ProcessedAt, dt.to_rfc3339()));
        }
        if let Some(dt) = &self.finished_at {
            fields.push((Field::FinishedAt, dt.to_rfc3339()));
        }
        if let Some(err) = &self.last_error {
            fields.push((Field::LastError, err.clone()));
        }
        fields
    }

    /// Rebuild a job from the contents of its Redis hash.
    pub fn from_fields(map: &HashMap<String, String>) -> QueueResult<Self> {
        let get = |field: Field| -> QueueResult<&String> {
            map.get(field.as_ref()).ok_or_else(|| {
                QueueError::store(format!("Stored job is missing field '{}'", field))
            })
        };
        let corrupt = |field: Field| QueueError::store(format!("Stored job has invalid field '{}'", field));
        let optional_dt = |field: Field| -> QueueResult<Option<DateTime>> {
            match map.get(field.as_ref()) {
                Some(s) => DateTime::parse(s).map(Some).ok_or_else(|| corrupt(field)),
                None => Ok(None),
            }
        };

        Ok(Job {
            id: get(Field::Id)?.clone(),
            queue_name: QueueName::from_str(get(Field::Queue)?).map_err(|_| corrupt(Field::Queue))?,
            job_type: JobType::from_str(get(Field::JobType)?).map_err(|_| corrupt(Field::JobType))?,
            payload: serde_json::from_str(get(Field::Payload)?)?,
            priority: get(Field::Priority)?.parse().map_err(|_| corrupt(Field::Priority))?,
            attempts_made: get(Field::AttemptsMade)?.parse().map_err(|_| corrupt(Field::AttemptsMade))?,
            state: State::from_str(get(Field::State)?).map_err(|_| corrupt(Field::State))?,
            progress: match map.get(Field::Progress.as_ref()) {
                Some(p) => p.parse().map_err(|_| corrupt(Field::Progress))?,
                None => 0,
            },
            created_at: DateTime::parse(get(Field::CreatedAt)?).ok_or_else(|| corrupt(Field::CreatedAt))?,
            processed_at: optional_dt(Field::ProcessedAt)?,
            finished_at: optional_dt(Field::FinishedAt)?,
            last_error: map.get(Field::LastError.as_ref()).cloned(),
        })
    }
}

/// Returned on successful submission.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHandle {
    pub job_id: String,
    pub queue_name: QueueName,
    pub job_type: JobType,
    pub priority: u8,
}

/// Build a job id from its parts.
pub fn build_id(subject: &str, job_type: JobType, created_millis: i64) -> String {
    format!("{}-{}-{}", subject, job_type, created_millis)
}

/// Check a caller-supplied priority is in range.
pub fn validate_priority(priority: u8) -> QueueResult<u8> {
    if priority <= MAX_PRIORITY {
        Ok(priority)
    } else {
        Err(QueueError::validation(format!(
            "Invalid priority {}, must be between 0 and {}",
            priority, MAX_PRIORITY
        )))
    }
}

static LAST_CREATION_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Current epoch millis, bumped past the previous value if the clock hasn't moved on.
fn next_creation_millis() -> i64 {
    let now = DateTime::now().timestamp_millis();
    let mut last = LAST_CREATION_MILLIS.load(Ordering::Relaxed);
    loop {
        let next = if now > last { now } else { last + 1 };
        match LAST_CREATION_MILLIS.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}
