//! Job types shared by the queue, the workers and the router.

use chrono::{DateTime, Utc};
use rand::random;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::database::models::{JobDbModel, JobStatus};
use crate::database::time::ms_to_datetime;
use crate::{Error, Result};

/// Alphabet for job ids: digits and letters minus the look-alikes
/// `0`, `1`, `I`, `O` and `l`.
const ID_ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";
const ID_LEN: usize = 10;

/// Generate a fresh externally facing job id.
pub fn new_job_id() -> String {
    (0..ID_LEN)
        .map(|_| ID_ALPHABET[random::<u32>() as usize % ID_ALPHABET.len()] as char)
        .collect()
}

/// Request body for one analysis service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisJob {
    /// Chord recognition on the mixed audio.
    Chords { file_path: String },
    /// Source separation into stems.
    Separation { file_path: String },
    /// Spectrograms computed from the separated stems.
    Spectrograms { separated_path: String },
    /// Beat and section structure.
    Structure {
        file_path: String,
        spectrograms_path: String,
    },
    /// Lyric transcription of the vocal stem.
    Lyrics {
        file_path: String,
        language_code: String,
    },
}

impl AnalysisJob {
    /// JSON body sent to the downstream service.
    pub fn body(&self) -> serde_json::Value {
        match self {
            Self::Chords { file_path } | Self::Separation { file_path } => {
                json!({ "file_path": file_path })
            }
            Self::Spectrograms { separated_path } => json!({ "separated_path": separated_path }),
            Self::Structure {
                file_path,
                spectrograms_path,
            } => json!({ "file_path": file_path, "spectrograms_path": spectrograms_path }),
            Self::Lyrics {
                file_path,
                language_code,
            } => json!({ "file_path": file_path, "language_code": language_code }),
        }
    }
}

/// Everything a worker needs to dispatch one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiJob {
    pub job_name: String,
    /// Base URL of the service, e.g. `http://demucs-webapi:8000`.
    pub dst_api_url: String,
    pub queue_name: String,
    pub request_path: String,
    /// Queue-side limit on the whole execution.
    pub job_timeout_secs: u64,
    pub request_body: AnalysisJob,
    #[serde(default)]
    pub request_headers: BTreeMap<String, String>,
    pub request_read_timeout_secs: u64,
    pub dst_api_connect_timeout_secs: u64,
}

impl ApiJob {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.request_read_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.dst_api_connect_timeout_secs)
    }

    /// Full request URL.
    pub fn url(&self) -> String {
        let base = self.dst_api_url.trim_end_matches('/');
        if self.request_path.starts_with('/') {
            format!("{}{}", base, self.request_path)
        } else {
            format!("{}/{}", base, self.request_path)
        }
    }
}

/// Result of a successful job: where the chain continues.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    pub next_job_id: Option<String>,
}

/// Terminal outcome reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success(ChainLink),
    Failure(String),
}

/// A job as seen by the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub queue_name: String,
    pub api_job: ApiJob,
    pub status: JobStatus,
    pub depends_on: Option<String>,
    pub next_job_id: Option<String>,
    #[serde(skip)]
    pub queue_seq: Option<i64>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub worker_name: Option<String>,
    pub result: Option<ChainLink>,
    pub error: Option<String>,
}

impl Job {
    /// Build a row for insertion. Status and timestamps are resolved by the
    /// repository.
    pub(crate) fn new_db_model(
        id: String,
        api_job: &ApiJob,
        depends_on: Option<String>,
        next_job_id: Option<String>,
    ) -> Result<JobDbModel> {
        Ok(JobDbModel {
            id,
            name: api_job.job_name.clone(),
            queue_name: api_job.queue_name.clone(),
            spec: serde_json::to_string(api_job)?,
            status: JobStatus::Deferred.as_str().to_string(),
            depends_on,
            next_job_id,
            queue_seq: None,
            enqueued_at: None,
            job_timeout_secs: api_job.job_timeout_secs as i64,
            created_at: 0,
            started_at: None,
            ended_at: None,
            expires_at: None,
            worker_name: None,
            result: None,
            error: None,
        })
    }

    pub fn from_db_model(model: JobDbModel) -> Result<Self> {
        let status = JobStatus::parse(&model.status).ok_or_else(|| {
            Error::Database(format!("job {} has unknown status {}", model.id, model.status))
        })?;
        let api_job: ApiJob = serde_json::from_str(&model.spec)?;
        let result = model
            .result
            .as_deref()
            .map(serde_json::from_str::<ChainLink>)
            .transpose()?;

        Ok(Self {
            id: model.id,
            name: model.name,
            queue_name: model.queue_name,
            api_job,
            status,
            depends_on: model.depends_on,
            next_job_id: model.next_job_id,
            queue_seq: model.queue_seq,
            enqueued_at: model.enqueued_at.map(ms_to_datetime),
            created_at: ms_to_datetime(model.created_at),
            started_at: model.started_at.map(ms_to_datetime),
            ended_at: model.ended_at.map(ms_to_datetime),
            expires_at: model.expires_at.map(ms_to_datetime),
            worker_name: model.worker_name,
            result,
            error: model.error,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether retention for this job has run out at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }
}

/// Jobs changed by finishing one job.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub job: Job,
    pub promoted: Vec<Job>,
    pub canceled: Vec<Job>,
}
