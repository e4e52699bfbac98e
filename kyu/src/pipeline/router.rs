//! Job router: submits job chains and streams their progress.
//!
//! A status stream follows one chain from the job it was opened on. For each
//! job it reports the submission, queue position updates derived from the
//! queue's notification log, the job's result and then moves on to the next
//! job of the chain. The stream only observes: dropping it never affects the
//! jobs.

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::job::{ApiJob, Job};
use super::job_queue::JobQueue;
use super::notify_log::{NotificationLog, SequenceId};
use crate::database::models::{JobStatus, Outcome};
use crate::{Error, Result};

/// Status reported to stream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamStatus {
    #[serde(rename = "enqueue success")]
    EnqueueSuccess,
    #[serde(rename = "processing soon")]
    ProcessingSoon,
    #[serde(rename = "queued")]
    Queued,
    #[serde(rename = "job success")]
    JobSuccess,
    #[serde(rename = "job failed")]
    JobFailed,
    #[serde(rename = "job completed")]
    JobCompleted,
}

/// One event of a status stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusEvent {
    pub job_name: String,
    pub job_id: String,
    pub job_status: StreamStatus,
    pub queue_position: Option<i64>,
}

impl JobStatusEvent {
    fn new(job: &Job, job_status: StreamStatus, queue_position: Option<i64>) -> Self {
        Self {
            job_name: job.name.clone(),
            job_id: job.id.clone(),
            job_status,
            queue_position,
        }
    }
}

/// Router timing configuration.
#[derive(Debug, Clone)]
pub struct JobRouterConfig {
    /// Interval between result lookups once the job's log entry was seen.
    pub result_poll_interval: Duration,
    /// Lookups before giving up on a result.
    pub result_poll_attempts: u32,
    /// Interval between status checks of a deferred job.
    pub deferral_poll_interval: Duration,
    /// How long a stream waits on the log before checking whether its job
    /// ended without an entry.
    pub terminal_check_interval: Duration,
}

impl Default for JobRouterConfig {
    fn default() -> Self {
        Self {
            result_poll_interval: Duration::from_millis(100),
            result_poll_attempts: 100,
            deferral_poll_interval: Duration::from_millis(500),
            terminal_check_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Clone)]
pub struct JobRouter {
    queue: Arc<JobQueue>,
    log: Arc<NotificationLog>,
    config: JobRouterConfig,
}

impl JobRouter {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self::with_config(queue, JobRouterConfig::default())
    }

    pub fn with_config(queue: Arc<JobQueue>, config: JobRouterConfig) -> Self {
        let log = queue.notification_log().clone();
        Self { queue, log, config }
    }

    /// Submit `api_jobs` as one chain.
    pub async fn submit_jobs(&self, api_jobs: Vec<ApiJob>) -> Result<Vec<Job>> {
        self.queue.submit_chain(api_jobs).await
    }

    /// Look up a job; unknown and expired ids are errors.
    pub async fn get_job(&self, id: &str) -> Result<Job> {
        self.queue
            .get_job(id)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    /// Stream the progress of `job` and every job after it in its chain.
    ///
    /// The stream ends after `job failed` or `job completed`. An error ends
    /// it early.
    pub fn stream_job_status(
        &self,
        job: Job,
    ) -> impl Stream<Item = Result<JobStatusEvent>> + Send + use<> {
        let router = self.clone();
        async_stream::try_stream! {
            let mut current = Some(job);
            // Log position just past the previous chain job's own entry.
            let mut previous: Option<(String, SequenceId)> = None;

            while let Some(job) = current.take() {
                let position = router.queue.get_position(&job.id).await?;
                yield JobStatusEvent::new(
                    &job,
                    StreamStatus::EnqueueSuccess,
                    position.map(|p| p as i64),
                );

                let job = router.wait_until_visible(job).await?;
                let mut own_entry = None;

                if !job.is_terminal() {
                    let mut position = router
                        .queue
                        .get_position(&job.id)
                        .await?
                        .map(|p| p as i64);
                    let mut processing_soon_sent = false;
                    if position.is_none() {
                        yield JobStatusEvent::new(&job, StreamStatus::ProcessingSoon, None);
                        processing_soon_sent = true;
                    }

                    // The predecessor's entry was committed with this job's
                    // promotion and is not a completion ahead of it.
                    let mut cursor = SequenceId::from_time(job.enqueued_at.unwrap_or(job.created_at));
                    let same_queue = previous
                        .as_ref()
                        .filter(|(queue, _)| *queue == job.queue_name);
                    if let Some((_, after)) = same_queue {
                        cursor = cursor.max(*after);
                    }

                    let tail = router.log.tail(&job.queue_name, cursor);
                    futures::pin_mut!(tail);
                    let check_every = router.config.terminal_check_interval;
                    let mut next_check = Instant::now() + check_every;

                    loop {
                        let entry = match tokio::time::timeout_at(next_check, tail.next()).await {
                            Ok(Some(entry)) => entry?,
                            Ok(None) => break,
                            Err(_) => {
                                next_check = Instant::now() + check_every;
                                if router.get_job(&job.id).await?.is_terminal() {
                                    warn!(job_id = %job.id, queue = %job.queue_name, "Job ended without a log entry");
                                    break;
                                }
                                continue;
                            }
                        };
                        if entry.job_id == job.id {
                            own_entry = Some(entry.sequence_id.next());
                            break;
                        }
                        // Canceled jobs never held a place in the queue.
                        if entry.outcome == Outcome::Canceled {
                            continue;
                        }

                        let remaining = position.unwrap_or(0) - 1;
                        position = Some(remaining);
                        if remaining >= 0 {
                            yield JobStatusEvent::new(&job, StreamStatus::Queued, Some(remaining));
                        } else if !processing_soon_sent {
                            yield JobStatusEvent::new(&job, StreamStatus::ProcessingSoon, None);
                            processing_soon_sent = true;
                        }
                    }
                }

                let finished = router.wait_for_result(&job.id).await?;
                if finished.status != JobStatus::Success {
                    debug!(job_id = %finished.id, status = %finished.status, "Chain halted");
                    yield JobStatusEvent::new(&finished, StreamStatus::JobFailed, None);
                    break;
                }

                yield JobStatusEvent::new(&finished, StreamStatus::JobSuccess, None);
                previous = own_entry.map(|after| (finished.queue_name.clone(), after));

                match finished.result.as_ref().and_then(|link| link.next_job_id.clone()) {
                    Some(next_id) => current = Some(router.get_job(&next_id).await?),
                    None => {
                        yield JobStatusEvent::new(&finished, StreamStatus::JobCompleted, None);
                    }
                }
            }
        }
    }

    /// Wait while `job` is DEFERRED behind its dependency.
    async fn wait_until_visible(&self, job: Job) -> Result<Job> {
        let mut job = job;
        while job.status == JobStatus::Deferred {
            tokio::time::sleep(self.config.deferral_poll_interval).await;
            job = self.get_job(&job.id).await?;
        }
        Ok(job)
    }

    /// Poll until the job is terminal. Its log entry was already seen, so
    /// this normally returns on the first lookup.
    async fn wait_for_result(&self, id: &str) -> Result<Job> {
        for _ in 0..self.config.result_poll_attempts.max(1) {
            let job = self.get_job(id).await?;
            if job.is_terminal() {
                return Ok(job);
            }
            tokio::time::sleep(self.config.result_poll_interval).await;
        }
        Err(Error::Unavailable(format!("result of job {id} is not available")))
    }
}
