//! Payload contracts checked at submission time, one per job type.

use chrono::NaiveDate;
use serde_json::{Map, Value};

use super::JobType;
use crate::models::{QueueError, QueueResult};

const CUSTOMER_SYNC_ACTIONS: [&str; 3] = ["create", "update", "delete"];

/// Check that `payload` satisfies the contract for `job_type`.
///
/// Nothing is written anywhere before this passes, so a rejected payload has no side effects.
pub fn validate(job_type: JobType, payload: &Value) -> QueueResult<()> {
    let fields = match payload.as_object() {
        Some(fields) => fields,
        None => {
            return Err(QueueError::validation(format!(
                "Invalid payload for {} job: expected a JSON object",
                job_type
            )))
        }
    };
    let check = Contract { job_type, fields };

    match job_type {
        JobType::Transcribe => check.required(&["audioUrl", "conversationId"]),
        JobType::Analyze => check.required(&["conversationId", "messages"]),
        JobType::PostCallActions => check.required(&["conversationId", "conversationData"]),
        JobType::DailyAggregation => {
            check.required(&["date"])?;
            check.date("date")
        }
        JobType::SentimentAnalysis => {
            check.required(&["conversationIds"])?;
            match fields.get("conversationIds") {
                Some(Value::Array(_)) => Ok(()),
                _ => Err(check.invalid("conversationIds", "must be an array")),
            }
        }
        JobType::TrendCalculation => check.required(&["startDate", "endDate", "metric"]),
        JobType::WebhookDelivery => {
            check.required(&["url", "payload", "eventType"])?;
            match fields.get("headers") {
                None | Some(Value::Null) | Some(Value::Object(_)) => Ok(()),
                Some(_) => Err(check.invalid("headers", "must be an object")),
            }
        }
        JobType::EmailSend => {
            check.required(&["to", "subject"])?;
            if ["text", "html", "templateId"].iter().any(|f| check.present(f)) {
                Ok(())
            } else {
                Err(QueueError::validation(format!(
                    "Invalid payload for {} job: one of 'text', 'html' or 'templateId' is required",
                    job_type
                )))
            }
        }
        JobType::CustomerSync => {
            check.required(&["customerId", "action"])?;
            match fields.get("action").and_then(Value::as_str) {
                Some(action) if CUSTOMER_SYNC_ACTIONS.contains(&action) => Ok(()),
                _ => Err(check.invalid("action", "must be one of: create, update, delete")),
            }
        }
    }
}

struct Contract<'a> {
    job_type: JobType,
    fields: &'a Map<String, Value>,
}

impl<'a> Contract<'a> {
    fn present(&self, field: &str) -> bool {
        !matches!(self.fields.get(field), None | Some(Value::Null))
    }

    fn required(&self, fields: &[&str]) -> QueueResult<()> {
        match fields.iter().find(|f| !self.present(f)) {
            Some(missing) => Err(QueueError::validation(format!(
                "Invalid payload for {} job: missing required field '{}'",
                self.job_type, missing
            ))),
            None => Ok(()),
        }
    }

    fn date(&self, field: &str) -> QueueResult<()> {
        match self.fields.get(field).and_then(Value::as_str) {
            Some(s) if NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() && s.len() == 10 => Ok(()),
            _ => Err(self.invalid(field, "must be a date formatted as YYYY-MM-DD")),
        }
    }

    fn invalid(&self, field: &str, reason: &str) -> QueueError {
        QueueError::validation(format!(
            "Invalid payload for {} job: field '{}' {}",
            self.job_type, field, reason
        ))
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn rejected(job_type: JobType, payload: Value) -> String {
        validate(job_type, &payload).unwrap_err().to_string()
    }

    #[test]
    fn missing_fields_are_named() {
        let msg = rejected(JobType::Transcribe, json!({"conversationId": "c1"}));
        assert!(msg.contains("Invalid"));
        assert!(msg.contains("'audioUrl'"));

        let msg = rejected(JobType::TrendCalculation, json!({"startDate": "2025-01-01", "metric": "x"}));
        assert!(msg.contains("'endDate'"));
    }

    #[test]
    fn null_counts_as_missing() {
        let msg = rejected(JobType::Analyze, json!({"conversationId": "c1", "messages": null}));
        assert!(msg.contains("'messages'"));
    }

    #[test]
    fn non_object_payload() {
        assert!(rejected(JobType::Analyze, json!([1, 2])).contains("JSON object"));
    }

    #[test]
    fn daily_aggregation_date_format() {
        assert!(validate(JobType::DailyAggregation, &json!({"date": "2025-10-01"})).is_ok());
        assert!(rejected(JobType::DailyAggregation, json!({"date": "01/10/2025"})).contains("YYYY-MM-DD"));
        assert!(rejected(JobType::DailyAggregation, json!({"date": "2025-13-01"})).contains("YYYY-MM-DD"));
    }

    #[test]
    fn sentiment_analysis_needs_array() {
        assert!(validate(JobType::SentimentAnalysis, &json!({"conversationIds": ["a", "b"]})).is_ok());
        assert!(rejected(JobType::SentimentAnalysis, json!({"conversationIds": "a"})).contains("array"));
    }

    #[test]
    fn webhook_headers_optional() {
        let base = json!({"url": "https://hooks.example.com", "payload": {}, "eventType": "call.ended"});
        assert!(validate(JobType::WebhookDelivery, &base).is_ok());

        let mut with_headers = base.clone();
        with_headers["headers"] = json!({"X-Signature": "abc"});
        assert!(validate(JobType::WebhookDelivery, &with_headers).is_ok());

        let mut bad_headers = base;
        bad_headers["headers"] = json!("X-Signature: abc");
        assert!(rejected(JobType::WebhookDelivery, bad_headers).contains("'headers'"));
    }

    #[test]
    fn webhook_needs_event_type() {
        let msg = rejected(
            JobType::WebhookDelivery,
            json!({"url": "https://hooks.example.com", "payload": {}, "headers": {}}),
        );
        assert!(msg.contains("'eventType'"));
    }

    #[test]
    fn email_needs_a_body() {
        let msg = rejected(JobType::EmailSend, json!({"to": "a@example.com", "subject": "Hi"}));
        assert!(msg.contains("templateId"));
        assert!(validate(JobType::EmailSend, &json!({"to": "a@example.com", "subject": "Hi", "html": "<p/>"})).is_ok());
        assert!(validate(JobType::EmailSend, &json!({"to": "a@example.com", "subject": "Hi", "templateId": "t1"})).is_ok());
    }

    #[test]
    fn customer_sync_action_enum() {
        for action in CUSTOMER_SYNC_ACTIONS.iter() {
            assert!(validate(JobType::CustomerSync, &json!({"customerId": "cus_1", "action": action})).is_ok());
        }
        let msg = rejected(JobType::CustomerSync, json!({"customerId": "cus_1", "action": "merge"}));
        assert!(msg.contains("'action'"));
    }
}
