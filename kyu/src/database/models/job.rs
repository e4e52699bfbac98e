//! Job database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Job database model.
/// One row per analysis request dispatched to a downstream service.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    /// Job kind name, e.g. "demucs"
    pub name: String,
    pub queue_name: String,
    /// JSON blob describing the HTTP dispatch target and body
    pub spec: String,
    /// Status: DEFERRED, QUEUED, STARTED, SUCCESS, FAILED, CANCELED
    pub status: String,
    pub depends_on: Option<String>,
    pub next_job_id: Option<String>,
    /// FIFO order among queued jobs, assigned on promotion to QUEUED
    pub queue_seq: Option<i64>,
    /// Epoch millis when the job became visible in its queue
    pub enqueued_at: Option<i64>,
    pub job_timeout_secs: i64,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub expires_at: Option<i64>,
    pub worker_name: Option<String>,
    /// JSON blob of the success result
    pub result: Option<String>,
    pub error: Option<String>,
}

impl JobDbModel {
    pub fn status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }
}

/// Job status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting on another job; invisible to workers.
    Deferred,
    /// Visible in its queue and waiting for a worker.
    Queued,
    /// Claimed by a worker.
    Started,
    Success,
    Failed,
    /// Never executed because a job it depends on did not succeed.
    Canceled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        Self::Deferred,
        Self::Queued,
        Self::Started,
        Self::Success,
        Self::Failed,
        Self::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deferred => "DEFERRED",
            Self::Queued => "QUEUED",
            Self::Started => "STARTED",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DEFERRED" => Some(Self::Deferred),
            "QUEUED" => Some(Self::Queued),
            "STARTED" => Some(Self::Started),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            "CANCELED" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_job_status_strings_agree_with_strum() {
        for status in JobStatus::ALL {
            assert_eq!(status.to_string(), status.as_str());
            assert_eq!(JobStatus::from_str(status.as_str()).unwrap(), status);
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("PENDING"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Deferred.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Started.is_terminal());
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
    }
}
