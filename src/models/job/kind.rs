//! Queue names and the job types each queue accepts.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::{QueueError, QueueResult};

/// One of the three fixed queues.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    /// Per-call post-processing: transcription, analysis, follow-up actions.
    Calls,

    /// Batch aggregation work, deprioritised relative to the other queues.
    Analytics,

    /// Outbound deliveries to third parties: webhooks, email, CRM sync.
    Integrations,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [QueueName::Calls, QueueName::Analytics, QueueName::Integrations];

    /// Job types accepted by this queue.
    pub fn job_types(self) -> &'static [JobType] {
        match self {
            QueueName::Calls => &[JobType::Transcribe, JobType::Analyze, JobType::PostCallActions],
            QueueName::Analytics => &[
                JobType::DailyAggregation,
                JobType::SentimentAnalysis,
                JobType::TrendCalculation,
            ],
            QueueName::Integrations => &[
                JobType::WebhookDelivery,
                JobType::EmailSend,
                JobType::CustomerSync,
            ],
        }
    }

    /// Parse a job type, rejecting anything this queue doesn't accept.
    pub fn parse_job_type(self, s: &str) -> QueueResult<JobType> {
        match JobType::from_str(s) {
            Ok(job_type) if job_type.queue() == self => Ok(job_type),
            _ => {
                let valid: Vec<&str> = self.job_types().iter().map(|t| t.as_ref()).collect();
                Err(QueueError::validation(format!(
                    "Invalid job type '{}' for queue '{}', expected one of: {}",
                    s,
                    self,
                    valid.join(", ")
                )))
            }
        }
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

impl AsRef<str> for QueueName {
    fn as_ref(&self) -> &str {
        match self {
            QueueName::Calls => "calls",
            QueueName::Analytics => "analytics",
            QueueName::Integrations => "integrations",
        }
    }
}

impl FromStr for QueueName {
    type Err = QueueError;

    fn from_str(s: &str) -> QueueResult<QueueName> {
        match s {
            "calls" => Ok(QueueName::Calls),
            "analytics" => Ok(QueueName::Analytics),
            "integrations" => Ok(QueueName::Integrations),
            _ => Err(QueueError::validation(format!(
                "Invalid queue name '{}', expected one of: calls, analytics, integrations",
                s
            ))),
        }
    }
}

/// Type of work a job represents. Each type belongs to exactly one queue.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Transcribe,
    Analyze,
    PostCallActions,
    DailyAggregation,
    SentimentAnalysis,
    TrendCalculation,
    WebhookDelivery,
    EmailSend,
    CustomerSync,
}

impl JobType {
    /// The queue this job type is processed on.
    pub fn queue(self) -> QueueName {
        match self {
            JobType::Transcribe | JobType::Analyze | JobType::PostCallActions => QueueName::Calls,
            JobType::DailyAggregation | JobType::SentimentAnalysis | JobType::TrendCalculation => {
                QueueName::Analytics
            }
            JobType::WebhookDelivery | JobType::EmailSend | JobType::CustomerSync => {
                QueueName::Integrations
            }
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

impl AsRef<str> for JobType {
    fn as_ref(&self) -> &str {
        match self {
            JobType::Transcribe => "transcribe",
            JobType::Analyze => "analyze",
            JobType::PostCallActions => "post_call_actions",
            JobType::DailyAggregation => "daily_aggregation",
            JobType::SentimentAnalysis => "sentiment_analysis",
            JobType::TrendCalculation => "trend_calculation",
            JobType::WebhookDelivery => "webhook_delivery",
            JobType::EmailSend => "email_send",
            JobType::CustomerSync => "customer_sync",
        }
    }
}

impl FromStr for JobType {
    type Err = ();

    fn from_str(s: &str) -> Result<JobType, ()> {
        match s {
            "transcribe" => Ok(JobType::Transcribe),
            "analyze" => Ok(JobType::Analyze),
            "post_call_actions" => Ok(JobType::PostCallActions),
            "daily_aggregation" => Ok(JobType::DailyAggregation),
            "sentiment_analysis" => Ok(JobType::SentimentAnalysis),
            "trend_calculation" => Ok(JobType::TrendCalculation),
            "webhook_delivery" => Ok(JobType::WebhookDelivery),
            "email_send" => Ok(JobType::EmailSend),
            "customer_sync" => Ok(JobType::CustomerSync),
            _ => Err(()),
        }
    }
}
