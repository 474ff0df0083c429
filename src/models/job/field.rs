use std::fmt;

use redis::{RedisWrite, ToRedisArgs};

const ID_FIELD: &str = "id";
const QUEUE_FIELD: &str = "queue";
const JOB_TYPE_FIELD: &str = "job_type";
const PAYLOAD_FIELD: &str = "payload";
const PRIORITY_FIELD: &str = "priority";
const ATTEMPTS_MADE_FIELD: &str = "attempts_made";
const STATE_FIELD: &str = "state";
const PROGRESS_FIELD: &str = "progress";
const CREATED_AT_FIELD: &str = "created_at";
const PROCESSED_AT_FIELD: &str = "processed_at";
const FINISHED_AT_FIELD: &str = "finished_at";
const LAST_ERROR_FIELD: &str = "last_error";

/// Represents a job field that's stored in a Redis hash.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Field {
    Id,
    Queue,
    JobType,
    Payload,
    Priority,
    AttemptsMade,
    State,
    Progress,
    CreatedAt,
    ProcessedAt,
    FinishedAt,
    LastError,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

impl AsRef<str> for Field {
    fn as_ref(&self) -> &str {
        match self {
            Field::Id => ID_FIELD,
            Field::Queue => QUEUE_FIELD,
            Field::JobType => JOB_TYPE_FIELD,
            Field::Payload => PAYLOAD_FIELD,
            Field::Priority => PRIORITY_FIELD,
            Field::AttemptsMade => ATTEMPTS_MADE_FIELD,
            Field::State => STATE_FIELD,
            Field::Progress => PROGRESS_FIELD,
            Field::CreatedAt => CREATED_AT_FIELD,
            Field::ProcessedAt => PROCESSED_AT_FIELD,
            Field::FinishedAt => FINISHED_AT_FIELD,
            Field::LastError => LAST_ERROR_FIELD,
        }
    }
}

impl ToRedisArgs for Field {
    fn write_redis_args<W: ?Sized + RedisWrite>(&self, out: &mut W) {
        self.as_ref().write_redis_args(out)
    }
}
