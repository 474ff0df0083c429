//! Defines the lifecycle state of a job in the store.

use std::fmt;
use std::str::FromStr;

use redis::{RedisWrite, ToRedisArgs};
use serde::{Deserialize, Serialize};

const WAITING_STATE: &str = "waiting";
const ACTIVE_STATE: &str = "active";
const COMPLETED_STATE: &str = "completed";
const FAILED_STATE: &str = "failed";
const DELAYED_STATE: &str = "delayed";

/// State of a job that exists in the store.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Job is in a queue, waiting for a worker to claim it.
    Waiting,

    /// Job has been claimed and is being processed by exactly one worker.
    Active,

    /// Processor finished successfully.
    Completed,

    /// Processor failed on every allowed attempt. Terminal, never re-queued automatically.
    Failed,

    /// Processor failed and the job is waiting out its backoff before returning to `Waiting`.
    Delayed,
}

impl State {
    /// Whether the job will never be processed again.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Failed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

impl AsRef<str> for State {
    fn as_ref(&self) -> &str {
        match self {
            State::Waiting => WAITING_STATE,
            State::Active => ACTIVE_STATE,
            State::Completed => COMPLETED_STATE,
            State::Failed => FAILED_STATE,
            State::Delayed => DELAYED_STATE,
        }
    }
}

impl FromStr for State {
    type Err = ();

    fn from_str(s: &str) -> Result<State, ()> {
        match s {
            WAITING_STATE => Ok(State::Waiting),
            ACTIVE_STATE => Ok(State::Active),
            COMPLETED_STATE => Ok(State::Completed),
            FAILED_STATE => Ok(State::Failed),
            DELAYED_STATE => Ok(State::Delayed),
            _ => Err(()),
        }
    }
}

impl ToRedisArgs for State {
    fn write_redis_args<W: ?Sized + RedisWrite>(&self, out: &mut W) {
        self.as_ref().write_redis_args(out)
    }
}
