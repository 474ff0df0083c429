//! The uniform response envelope every submission/metrics call is answered with.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{DateTime, QueueError};

/// `{success, data, error, timestamp, requestId}`. Both `data` and `error` are always present
/// in the serialised form, one of them as `null`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: DateTime,
    pub request_id: Uuid,
}

impl<T> Response<T> {
    pub fn ok(data: T) -> Self {
        Response {
            success: true,
            data: Some(data),
            error: None,
            timestamp: DateTime::now(),
            request_id: Uuid::new_v4(),
        }
    }

    pub fn err<S: Into<String>>(msg: S) -> Self {
        Response {
            success: false,
            data: None,
            error: Some(msg.into()),
            timestamp: DateTime::now(),
            request_id: Uuid::new_v4(),
        }
    }
}

impl<T> From<&QueueError> for Response<T> {
    fn from(err: &QueueError) -> Self {
        Response::err(err.to_string())
    }
}
