//! Jobs data model.
//!
//! A job execution is a unit of work the jobs service assigns to a thing.
//! Identifiers and documents are supplied by the service and never generated
//! locally. The request/response payloads mirror the JSON documents exchanged
//! on the jobs topics (camelCase keys, epoch-second timestamps).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Opaque job identifier assigned by the jobs service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Job document: key/value description of the work. Immutable once received.
pub type JobDocument = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Status of a job execution as tracked by the jobs service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    InProgress,
    Succeeded,
    Failed,
    TimedOut,
    Rejected,
    Removed,
    Canceled,
}

impl JobStatus {
    /// Terminal statuses remove the execution from the pending set.
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Queued | JobStatus::InProgress)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::TimedOut => "TIMED_OUT",
            JobStatus::Rejected => "REJECTED",
            JobStatus::Removed => "REMOVED",
            JobStatus::Canceled => "CANCELED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Ok(JobStatus::Queued),
            "IN_PROGRESS" => Ok(JobStatus::InProgress),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed),
            "TIMED_OUT" => Ok(JobStatus::TimedOut),
            "REJECTED" => Ok(JobStatus::Rejected),
            "REMOVED" => Ok(JobStatus::Removed),
            "CANCELED" => Ok(JobStatus::Canceled),
            other => Err(crate::error::Error::Other(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

/// Full job execution, as carried by start-next responses and
/// next-changed events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecution {
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thing_name: Option<String>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_document: Option<JobDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_details: Option<HashMap<String, String>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_seconds_option"
    )]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_seconds_option"
    )]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_seconds_option"
    )]
    pub last_updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_number: Option<i64>,
}

/// Summary entry in a pending-executions listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecutionSummary {
    pub job_id: JobId,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_seconds_option"
    )]
    pub queued_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_seconds_option"
    )]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_seconds_option"
    )]
    pub last_updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_number: Option<i64>,
}

/// Execution state returned by update responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobExecutionState {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_details: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_number: Option<i64>,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPendingJobExecutionsRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartNextPendingJobExecutionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_details: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_in_minutes: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateJobExecutionRequest {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_details: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

impl UpdateJobExecutionRequest {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            status_details: None,
            expected_version: None,
            client_token: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Responses and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPendingJobExecutionsResponse {
    #[serde(default)]
    pub in_progress_jobs: Vec<JobExecutionSummary>,
    #[serde(default)]
    pub queued_jobs: Vec<JobExecutionSummary>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_seconds_option"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

impl GetPendingJobExecutionsResponse {
    /// Total number of pending (in-progress + queued) executions.
    pub fn len(&self) -> usize {
        self.in_progress_jobs.len() + self.queued_jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Accepted response to start-next. `execution` is absent when nothing is pending.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartNextJobExecutionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<JobExecution>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_seconds_option"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateJobExecutionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<JobExecutionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_document: Option<JobDocument>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_seconds_option"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

/// Published by the service whenever the thing's next pending execution changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextJobExecutionChangedEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<JobExecution>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_seconds_option"
    )]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Payload of every `.../rejected` topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedError {
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_seconds_option"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<JobExecutionState>,
}

impl RejectedError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            timestamp: Some(Utc::now()),
            client_token: None,
            execution_state: None,
        }
    }

    /// Convert into the crate error, tagging the operation that was rejected.
    pub fn into_error(self, operation: &str) -> crate::error::Error {
        crate::error::Error::Rejected {
            operation: operation.to_string(),
            code: self.code,
            message: self.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_uses_service_spelling() {
        let s = serde_json::to_string(&JobStatus::InProgress).unwrap();
        assert_eq!(s, "\"IN_PROGRESS\"");
        assert_eq!("succeeded".parse::<JobStatus>().unwrap(), JobStatus::Succeeded);
        assert!("DONE".parse::<JobStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Rejected.is_terminal());
    }

    #[test]
    fn start_next_response_without_execution() {
        let resp: StartNextJobExecutionResponse =
            serde_json::from_value(json!({"timestamp": 1700000000, "clientToken": "abc"}))
                .unwrap();
        assert!(resp.execution.is_none());
        assert_eq!(resp.client_token.as_deref(), Some("abc"));
        assert_eq!(resp.timestamp.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn start_next_response_with_execution() {
        let resp: StartNextJobExecutionResponse = serde_json::from_value(json!({
            "execution": {
                "jobId": "firmware-42",
                "thingName": "sensor-1",
                "status": "IN_PROGRESS",
                "jobDocument": {"operation": "reboot"},
                "queuedAt": 1700000000,
                "startedAt": 1700000005,
                "versionNumber": 2,
                "executionNumber": 1
            }
        }))
        .unwrap();
        let execution = resp.execution.unwrap();
        assert_eq!(execution.job_id, JobId::from("firmware-42"));
        assert_eq!(execution.status, JobStatus::InProgress);
        assert_eq!(
            execution.job_document.unwrap().get("operation"),
            Some(&json!("reboot"))
        );
        assert!(execution.last_updated_at.is_none());
    }

    #[test]
    fn update_request_skips_empty_fields() {
        let req = UpdateJobExecutionRequest::new(JobStatus::Succeeded);
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value, json!({"status": "SUCCEEDED"}));
    }

    #[test]
    fn rejected_error_converts_to_crate_error() {
        let rejected: RejectedError = serde_json::from_value(json!({
            "code": "InvalidStateTransition",
            "message": "job already terminal"
        }))
        .unwrap();
        let err = rejected.into_error("update");
        assert_eq!(
            err.to_string(),
            "update request rejected with code 'InvalidStateTransition': job already terminal"
        );
    }

    #[test]
    fn pending_listing_counts_both_lists() {
        let resp: GetPendingJobExecutionsResponse = serde_json::from_value(json!({
            "inProgressJobs": [{"jobId": "a"}],
            "queuedJobs": [{"jobId": "b"}, {"jobId": "c"}]
        }))
        .unwrap();
        assert_eq!(resp.len(), 3);
        assert!(!resp.is_empty());
        assert!(GetPendingJobExecutionsResponse::default().is_empty());
    }
}
