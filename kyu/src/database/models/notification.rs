//! Notification log database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One entry of a queue's notification log.
///
/// The `(millis, seq)` pair is the entry's sequence id and is unique per
/// queue.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationLogDbModel {
    pub queue_name: String,
    pub millis: i64,
    pub seq: i64,
    pub job_id: String,
    /// Outcome: success, failure, canceled
    pub outcome: String,
    pub created_at: i64,
}

/// How a job reached its terminal state.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Canceled,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}
