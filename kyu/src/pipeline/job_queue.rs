//! Database-backed job queue with dependency chaining.
//!
//! Jobs are stored in SQLite and claimed inside `BEGIN IMMEDIATE`
//! transactions, so any number of worker processes can share one queue file.
//! A job that depends on another one is DEFERRED (invisible to workers) until
//! the dependency succeeds; it then receives its queue sequence and becomes
//! QUEUED. A failed job cancels everything downstream of it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::job::{ApiJob, Job, JobOutcome, Settlement, new_job_id};
use super::notify_log::NotificationLog;
use crate::database::models::{JobDbModel, JobStatus};
use crate::database::repositories::{JobRepository, SettleOutcome, SettledJobs};
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Per-queue job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue_name: String,
    pub deferred: u64,
    pub queued: u64,
    pub started: u64,
    pub success: u64,
    pub failed: u64,
    pub canceled: u64,
}

impl QueueStats {
    fn add(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Deferred => self.deferred += count,
            JobStatus::Queued => self.queued += count,
            JobStatus::Started => self.started += count,
            JobStatus::Success => self.success += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Canceled => self.canceled += count,
        }
    }
}

/// The job queue service.
pub struct JobQueue {
    repo: Arc<dyn JobRepository>,
    log: Arc<NotificationLog>,
    /// Wake-up hints per queue for workers in this process.
    wakers: DashMap<String, Arc<Notify>>,
}

impl JobQueue {
    pub fn new(repo: Arc<dyn JobRepository>, log: Arc<NotificationLog>) -> Self {
        Self {
            repo,
            log,
            wakers: DashMap::new(),
        }
    }

    /// The notification log this queue publishes terminal states to.
    pub fn notification_log(&self) -> &Arc<NotificationLog> {
        &self.log
    }

    fn waker(&self, queue: &str) -> Arc<Notify> {
        self.wakers
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn wake(&self, queue: &str) {
        self.waker(queue).notify_waiters();
    }

    /// Submit one job, optionally depending on an existing job.
    pub async fn submit(&self, api_job: ApiJob, depends_on: Option<&str>) -> Result<Job> {
        let model = Job::new_db_model(
            new_job_id(),
            &api_job,
            depends_on.map(str::to_string),
            None,
        )?;
        let mut jobs = self.insert(vec![model]).await?;
        jobs.pop()
            .ok_or_else(|| Error::Database("insert returned no job".to_string()))
    }

    /// Submit a chain atomically: job *i* depends on job *i-1* and carries
    /// the id of job *i+1*.
    pub async fn submit_chain(&self, api_jobs: Vec<ApiJob>) -> Result<Vec<Job>> {
        if api_jobs.is_empty() {
            return Err(Error::validation("a job chain needs at least one job"));
        }

        let ids: Vec<String> = api_jobs.iter().map(|_| new_job_id()).collect();
        let models = api_jobs
            .iter()
            .enumerate()
            .map(|(i, api_job)| {
                let depends_on = i.checked_sub(1).map(|prev| ids[prev].clone());
                let next_job_id = ids.get(i + 1).cloned();
                Job::new_db_model(ids[i].clone(), api_job, depends_on, next_job_id)
            })
            .collect::<Result<Vec<_>>>()?;

        self.insert(models).await
    }

    async fn insert(&self, models: Vec<JobDbModel>) -> Result<Vec<Job>> {
        let inserted = self.repo.insert_jobs(&models, now_ms()).await?;
        let jobs = inserted
            .into_iter()
            .map(Job::from_db_model)
            .collect::<Result<Vec<_>>>()?;

        for job in &jobs {
            info!(
                job_id = %job.id,
                job_name = %job.name,
                queue = %job.queue_name,
                status = %job.status,
                "Submitted job"
            );
            match job.status {
                JobStatus::Queued => self.wake(&job.queue_name),
                JobStatus::Canceled => self.log.notify_appended(&job.queue_name),
                _ => {}
            }
        }

        Ok(jobs)
    }

    /// Look up a job. Unknown and expired jobs are `None`.
    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let model = match self.repo.get_job(id).await {
            Ok(model) => model,
            Err(Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let job = Job::from_db_model(model)?;
        if job.is_expired_at(Utc::now()) {
            return Ok(None);
        }
        Ok(Some(job))
    }

    /// Number of queued jobs ahead of `id` in its queue.
    ///
    /// `None` when the job is not waiting in its queue (deferred, started,
    /// finished, unknown) and when it is at the front.
    pub async fn get_position(&self, id: &str) -> Result<Option<usize>> {
        let Some(job) = self.get_job(id).await? else {
            return Ok(None);
        };
        let (JobStatus::Queued, Some(seq)) = (job.status, job.queue_seq) else {
            return Ok(None);
        };

        let ahead = self.repo.count_queued_ahead(&job.queue_name, seq).await?;
        Ok((ahead > 0).then_some(ahead as usize))
    }

    /// Claim the oldest queued job of `queue` for `worker_name`.
    pub async fn dequeue(&self, queue: &str, worker_name: &str) -> Result<Option<Job>> {
        let Some(model) = self.repo.claim_next(queue, worker_name, now_ms()).await? else {
            return Ok(None);
        };
        let job_id = model.id.clone();

        match Job::from_db_model(model) {
            Ok(job) => {
                debug!(job_id = %job.id, queue, worker = worker_name, "Claimed job");
                Ok(Some(job))
            }
            Err(e) => {
                // A row we cannot decode can never run; settle it so the
                // chain does not hang.
                warn!(job_id = %job_id, error = %e, "Claimed job is unreadable, failing it");
                self.finish(&job_id, JobOutcome::Failure(format!("unreadable job: {e}")))
                    .await?;
                Err(e)
            }
        }
    }

    /// Wait until a job may have become available in `queue`, or `timeout`.
    pub async fn wait_for_job(&self, queue: &str, timeout: Duration) {
        let waker = self.waker(queue);
        let _ = tokio::time::timeout(timeout, waker.notified()).await;
    }

    /// Record the terminal state of a started job.
    ///
    /// On success the job's dependents become QUEUED; on failure all of its
    /// transitive dependents become CANCELED. The repository commits one
    /// notification for the job and one for every canceled dependent in the
    /// same transaction; this only wakes the local readers.
    pub async fn finish(&self, job_id: &str, outcome: JobOutcome) -> Result<Settlement> {
        let settle = match &outcome {
            JobOutcome::Success(link) => SettleOutcome::Success {
                result: serde_json::to_string(link)?,
            },
            JobOutcome::Failure(error) => SettleOutcome::Failure {
                error: error.clone(),
            },
        };

        let settled = self.repo.settle(job_id, &settle, now_ms()).await?;
        let settlement = settlement_from(settled)?;

        self.log.notify_appended(&settlement.job.queue_name);
        for canceled in &settlement.canceled {
            self.log.notify_appended(&canceled.queue_name);
        }
        for promoted in &settlement.promoted {
            self.wake(&promoted.queue_name);
        }

        info!(
            job_id = %settlement.job.id,
            status = %settlement.job.status,
            promoted = settlement.promoted.len(),
            canceled = settlement.canceled.len(),
            "Job finished"
        );
        Ok(settlement)
    }

    /// Fail started jobs that outlived their timeout by more than `grace`.
    ///
    /// Covers workers that died or hung mid-job. A job the worker settles
    /// concurrently is skipped.
    pub async fn fail_overdue(&self, now: DateTime<Utc>, grace: Duration) -> Result<Vec<Settlement>> {
        let overdue = self
            .repo
            .list_overdue(now.timestamp_millis(), grace.as_millis() as i64)
            .await?;

        let mut settlements = Vec::with_capacity(overdue.len());
        for model in overdue {
            let message = format!(
                "job exceeded its timeout of {}s (worker {})",
                model.job_timeout_secs,
                model.worker_name.as_deref().unwrap_or("unknown")
            );
            match self.finish(&model.id, JobOutcome::Failure(message)).await {
                Ok(settlement) => {
                    warn!(job_id = %model.id, "Failed overdue job");
                    settlements.push(settlement);
                }
                Err(Error::InvalidStateTransition { .. }) => {
                    debug!(job_id = %model.id, "Overdue job settled concurrently");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(settlements)
    }

    /// Delete up to `batch_size` jobs whose retention expired.
    pub async fn purge_expired(&self, now: DateTime<Utc>, batch_size: u32) -> Result<u64> {
        self.repo
            .delete_expired(now.timestamp_millis(), i64::from(batch_size))
            .await
    }

    /// Job counts by status for every queue that has jobs.
    pub async fn queue_stats(&self) -> Result<Vec<QueueStats>> {
        let mut by_queue: BTreeMap<String, QueueStats> = BTreeMap::new();
        for row in self.repo.count_by_queue_and_status().await? {
            let Some(status) = JobStatus::parse(&row.status) else {
                continue;
            };
            by_queue
                .entry(row.queue_name.clone())
                .or_insert_with(|| QueueStats {
                    queue_name: row.queue_name.clone(),
                    ..Default::default()
                })
                .add(status, row.count.max(0) as u64);
        }
        Ok(by_queue.into_values().collect())
    }
}

fn settlement_from(settled: SettledJobs) -> Result<Settlement> {
    Ok(Settlement {
        job: Job::from_db_model(settled.job)?,
        promoted: settled
            .promoted
            .into_iter()
            .map(Job::from_db_model)
            .collect::<Result<_>>()?,
        canceled: settled
            .canceled
            .into_iter()
            .map(Job::from_db_model)
            .collect::<Result<_>>()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{NotificationLogDbModel, Outcome};
    use crate::database::repositories::{
        NotificationRepository, SqlxJobRepository, SqlxNotificationRepository,
    };
    use crate::database::{init_pool, run_migrations};
    use crate::pipeline::job::{AnalysisJob, ChainLink};
    use crate::pipeline::notify_log::{LogEntry, SequenceId};
    use async_trait::async_trait;
    use tempfile::TempDir;

    const TTL_MS: i64 = 60_000;

    async fn setup() -> (TempDir, JobQueue) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("queue.db").display());
        let pool = init_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let log = Arc::new(NotificationLog::new(Arc::new(
            SqlxNotificationRepository::new(pool.clone()),
        )));
        let queue = JobQueue::new(Arc::new(SqlxJobRepository::new(pool, TTL_MS)), log);
        (dir, queue)
    }

    /// Reads from SQLite but refuses every standalone append.
    struct ReadOnlyNotifications(SqlxNotificationRepository);

    #[async_trait]
    impl NotificationRepository for ReadOnlyNotifications {
        async fn append(
            &self,
            _queue: &str,
            _job_id: &str,
            _outcome: &str,
            _now: i64,
        ) -> Result<NotificationLogDbModel> {
            Err(Error::Database("disk I/O error".to_string()))
        }

        async fn read_from(
            &self,
            queue: &str,
            millis: i64,
            seq: i64,
            limit: i64,
        ) -> Result<Vec<NotificationLogDbModel>> {
            self.0.read_from(queue, millis, seq, limit).await
        }
    }

    fn api_job(name: &str, queue: &str) -> ApiJob {
        ApiJob {
            job_name: name.to_string(),
            dst_api_url: "http://127.0.0.1:9".to_string(),
            queue_name: queue.to_string(),
            request_path: "/".to_string(),
            job_timeout_secs: 30,
            request_body: AnalysisJob::Chords {
                file_path: "song.wav".to_string(),
            },
            request_headers: BTreeMap::new(),
            request_read_timeout_secs: 30,
            dst_api_connect_timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_submit_without_dependency_is_queued() {
        let (_dir, queue) = setup().await;
        let job = queue.submit(api_job("crema", "cpu"), None).await.unwrap();

        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.enqueued_at.is_some());
        assert_eq!(job.id.len(), 10);
    }

    #[tokio::test]
    async fn test_submit_with_unknown_dependency_fails() {
        let (_dir, queue) = setup().await;
        let err = queue
            .submit(api_job("crema", "cpu"), Some("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_submit_chain_links_jobs() {
        let (_dir, queue) = setup().await;
        let jobs = queue
            .submit_chain(vec![
                api_job("a", "cpu"),
                api_job("b", "gpu"),
                api_job("c", "cpu"),
            ])
            .await
            .unwrap();

        assert_eq!(jobs[0].status, JobStatus::Queued);
        assert_eq!(jobs[1].status, JobStatus::Deferred);
        assert_eq!(jobs[2].status, JobStatus::Deferred);
        assert_eq!(jobs[0].depends_on, None);
        assert_eq!(jobs[1].depends_on.as_deref(), Some(jobs[0].id.as_str()));
        assert_eq!(jobs[0].next_job_id.as_deref(), Some(jobs[1].id.as_str()));
        assert_eq!(jobs[2].next_job_id, None);
        assert!(jobs[1].enqueued_at.is_none());
    }

    #[tokio::test]
    async fn test_empty_chain_is_rejected() {
        let (_dir, queue) = setup().await;
        assert!(matches!(
            queue.submit_chain(vec![]).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_positions_count_queued_jobs_ahead() {
        let (_dir, queue) = setup().await;
        let first = queue.submit(api_job("a", "cpu"), None).await.unwrap();
        let second = queue.submit(api_job("b", "cpu"), None).await.unwrap();
        let third = queue.submit(api_job("c", "cpu"), None).await.unwrap();
        let other = queue.submit(api_job("d", "gpu"), None).await.unwrap();

        assert_eq!(queue.get_position(&first.id).await.unwrap(), None);
        assert_eq!(queue.get_position(&second.id).await.unwrap(), Some(1));
        assert_eq!(queue.get_position(&third.id).await.unwrap(), Some(2));
        assert_eq!(queue.get_position(&other.id).await.unwrap(), None);

        queue.dequeue("cpu", "w1").await.unwrap().unwrap();
        assert_eq!(queue.get_position(&first.id).await.unwrap(), None);
        assert_eq!(queue.get_position(&second.id).await.unwrap(), None);
        assert_eq!(queue.get_position(&third.id).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_dequeue_is_fifo_and_exclusive() {
        let (_dir, queue) = setup().await;
        let first = queue.submit(api_job("a", "cpu"), None).await.unwrap();
        let second = queue.submit(api_job("b", "cpu"), None).await.unwrap();

        let claimed = queue.dequeue("cpu", "w1").await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Started);
        assert_eq!(claimed.worker_name.as_deref(), Some("w1"));

        let claimed = queue.dequeue("cpu", "w2").await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);

        assert!(queue.dequeue("cpu", "w3").await.unwrap().is_none());
        assert!(queue.dequeue("gpu", "w3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_dequeue_claims_each_job_once() {
        let (_dir, queue) = setup().await;
        let queue = Arc::new(queue);
        for i in 0..20 {
            queue
                .submit(api_job(&format!("job{i}"), "cpu"), None)
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..4 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = queue.dequeue("cpu", &format!("w{w}")).await.unwrap() {
                    claimed.push(job.id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        let before = all.len();
        all.dedup();
        assert_eq!(before, 20);
        assert_eq!(all.len(), 20);
    }

    #[tokio::test]
    async fn test_success_promotes_dependent() {
        let (_dir, queue) = setup().await;
        let jobs = queue
            .submit_chain(vec![api_job("a", "cpu"), api_job("b", "gpu")])
            .await
            .unwrap();

        assert!(queue.dequeue("gpu", "w").await.unwrap().is_none());

        let a = queue.dequeue("cpu", "w").await.unwrap().unwrap();
        let settlement = queue
            .finish(
                &a.id,
                JobOutcome::Success(ChainLink {
                    next_job_id: a.next_job_id.clone(),
                }),
            )
            .await
            .unwrap();

        assert_eq!(settlement.job.status, JobStatus::Success);
        assert_eq!(
            settlement.job.result.unwrap().next_job_id.as_deref(),
            Some(jobs[1].id.as_str())
        );
        assert_eq!(settlement.promoted.len(), 1);
        assert!(settlement.canceled.is_empty());

        let b = queue.get_job(&jobs[1].id).await.unwrap().unwrap();
        assert_eq!(b.status, JobStatus::Queued);
        assert!(b.enqueued_at.is_some());
        assert_eq!(
            queue.dequeue("gpu", "w").await.unwrap().map(|j| j.id),
            Some(jobs[1].id.clone())
        );
    }

    #[tokio::test]
    async fn test_failure_cancels_all_downstream_jobs() {
        let (_dir, queue) = setup().await;
        let jobs = queue
            .submit_chain(vec![
                api_job("a", "cpu"),
                api_job("b", "gpu"),
                api_job("c", "cpu"),
                api_job("d", "gpu"),
            ])
            .await
            .unwrap();

        let a = queue.dequeue("cpu", "w").await.unwrap().unwrap();
        queue
            .finish(&a.id, JobOutcome::Success(ChainLink::default()))
            .await
            .unwrap();
        let b = queue.dequeue("gpu", "w").await.unwrap().unwrap();
        let settlement = queue
            .finish(&b.id, JobOutcome::Failure("HTTP 500".to_string()))
            .await
            .unwrap();

        assert_eq!(settlement.job.status, JobStatus::Failed);
        assert_eq!(settlement.job.error.as_deref(), Some("HTTP 500"));
        let mut canceled: Vec<_> = settlement.canceled.iter().map(|j| j.id.clone()).collect();
        canceled.sort();
        let mut expected = vec![jobs[2].id.clone(), jobs[3].id.clone()];
        expected.sort();
        assert_eq!(canceled, expected);

        for id in [&jobs[2].id, &jobs[3].id] {
            let job = queue.get_job(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Canceled);
        }
        assert!(queue.dequeue("cpu", "w").await.unwrap().is_none());
        assert!(queue.dequeue("gpu", "w").await.unwrap().is_none());

        // One entry for the failure, one per canceled dependent.
        let log = queue.notification_log();
        let gpu = log.read_from("gpu", SequenceId::default()).await.unwrap();
        let cpu = log.read_from("cpu", SequenceId::default()).await.unwrap();
        assert_eq!(gpu.len(), 2);
        assert_eq!(gpu[0].outcome, Outcome::Failure);
        assert_eq!(gpu[1].outcome, Outcome::Canceled);
        assert_eq!(cpu.len(), 2);
        assert_eq!(cpu[0].outcome, Outcome::Success);
        assert_eq!(cpu[1].outcome, Outcome::Canceled);
    }

    #[tokio::test]
    async fn test_log_entries_commit_with_the_state_change() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("queue.db").display());
        let pool = init_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let log = Arc::new(NotificationLog::new(Arc::new(ReadOnlyNotifications(
            SqlxNotificationRepository::new(pool.clone()),
        ))));
        let queue = JobQueue::new(Arc::new(SqlxJobRepository::new(pool, TTL_MS)), log);

        let jobs = queue
            .submit_chain(vec![api_job("a", "cpu"), api_job("b", "gpu")])
            .await
            .unwrap();
        let a = queue.dequeue("cpu", "w").await.unwrap().unwrap();
        queue
            .finish(&a.id, JobOutcome::Success(ChainLink::default()))
            .await
            .unwrap();
        let b = queue.dequeue("gpu", "w").await.unwrap().unwrap();
        queue
            .finish(&b.id, JobOutcome::Failure("boom".to_string()))
            .await
            .unwrap();

        // A dependent of a failed job is canceled at insert time.
        let late = queue.submit(api_job("c", "gpu"), Some(&jobs[1].id)).await.unwrap();
        assert_eq!(late.status, JobStatus::Canceled);

        let log = queue.notification_log();
        let cpu = log.read_from("cpu", SequenceId::default()).await.unwrap();
        let gpu = log.read_from("gpu", SequenceId::default()).await.unwrap();
        let entries = |entries: Vec<LogEntry>| {
            entries
                .into_iter()
                .map(|e| (e.job_id, e.outcome))
                .collect::<Vec<_>>()
        };
        assert_eq!(entries(cpu), vec![(a.id.clone(), Outcome::Success)]);
        assert_eq!(
            entries(gpu),
            vec![(b.id.clone(), Outcome::Failure), (late.id.clone(), Outcome::Canceled)]
        );
    }

    #[tokio::test]
    async fn test_finish_twice_is_rejected() {
        let (_dir, queue) = setup().await;
        queue.submit(api_job("a", "cpu"), None).await.unwrap();
        let a = queue.dequeue("cpu", "w").await.unwrap().unwrap();

        queue
            .finish(&a.id, JobOutcome::Success(ChainLink::default()))
            .await
            .unwrap();
        let err = queue
            .finish(&a.id, JobOutcome::Failure("late".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));

        let entries = queue
            .notification_log()
            .read_from("cpu", SequenceId::default())
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_dependency_states_at_submission() {
        let (_dir, queue) = setup().await;
        let ok = queue.submit(api_job("a", "cpu"), None).await.unwrap();
        let claimed = queue.dequeue("cpu", "w").await.unwrap().unwrap();
        assert_eq!(claimed.id, ok.id);

        let pending = queue.submit(api_job("b", "cpu"), Some(&ok.id)).await.unwrap();
        assert_eq!(pending.status, JobStatus::Deferred);

        queue
            .finish(&ok.id, JobOutcome::Failure("boom".to_string()))
            .await
            .unwrap();

        let late = queue.submit(api_job("c", "cpu"), Some(&ok.id)).await.unwrap();
        assert_eq!(late.status, JobStatus::Canceled);

        let after_success = {
            let d = queue.submit(api_job("d", "cpu"), None).await.unwrap();
            queue.dequeue("cpu", "w").await.unwrap().unwrap();
            queue
                .finish(&d.id, JobOutcome::Success(ChainLink::default()))
                .await
                .unwrap();
            queue.submit(api_job("e", "cpu"), Some(&d.id)).await.unwrap()
        };
        assert_eq!(after_success.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_fail_overdue_and_purge() {
        let (_dir, queue) = setup().await;
        let mut short = api_job("a", "cpu");
        short.job_timeout_secs = 0;
        queue.submit_chain(vec![short, api_job("b", "cpu")]).await.unwrap();
        let a = queue.dequeue("cpu", "w").await.unwrap().unwrap();

        let later = Utc::now() + chrono::Duration::seconds(10);
        let settlements = queue
            .fail_overdue(later, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(settlements.len(), 1);
        assert_eq!(settlements[0].job.id, a.id);
        assert_eq!(settlements[0].canceled.len(), 1);

        // Nothing left to fail.
        assert!(queue.fail_overdue(later, Duration::from_secs(1)).await.unwrap().is_empty());

        let stats = queue.queue_stats().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].failed, 1);
        assert_eq!(stats[0].canceled, 1);

        let purged = queue
            .purge_expired(Utc::now() + chrono::Duration::milliseconds(TTL_MS + 1000), 100)
            .await
            .unwrap();
        assert_eq!(purged, 2);
        assert!(queue.get_job(&a.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wait_for_job_times_out() {
        let (_dir, queue) = setup().await;
        let start = std::time::Instant::now();
        queue.wait_for_job("cpu", Duration::from_millis(30)).await;
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
