//! Job repository.

use async_trait::async_trait;
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use crate::database::begin_immediate;
use crate::database::models::{JobDbModel, JobStatus, Outcome};
use crate::database::repositories::notification::append_entry;
use crate::database::retry::retry_on_sqlite_busy;
use crate::{Error, Result};

/// Terminal state requested for a started job.
#[derive(Debug, Clone)]
pub enum SettleOutcome {
    /// JSON-encoded result payload.
    Success { result: String },
    Failure { error: String },
}

impl SettleOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Success { .. } => JobStatus::Success,
            Self::Failure { .. } => JobStatus::Failed,
        }
    }

    /// Outcome recorded in the notification log.
    pub fn log_outcome(&self) -> Outcome {
        match self {
            Self::Success { .. } => Outcome::Success,
            Self::Failure { .. } => Outcome::Failure,
        }
    }
}

/// Rows touched by settling a job.
#[derive(Debug, Clone)]
pub struct SettledJobs {
    pub job: JobDbModel,
    /// Dependents moved from DEFERRED to QUEUED.
    pub promoted: Vec<JobDbModel>,
    /// Transitive dependents canceled because the job failed.
    pub canceled: Vec<JobDbModel>,
}

/// Job count for one `(queue, status)` pair.
#[derive(Debug, Clone, FromRow)]
pub struct QueueStatusCount {
    pub queue_name: String,
    pub status: String,
    pub count: i64,
}

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get_job(&self, id: &str) -> Result<JobDbModel>;

    /// Insert jobs in one write transaction, in order.
    ///
    /// The incoming `status` is ignored: each job starts QUEUED, DEFERRED or
    /// CANCELED depending on the state of the job it depends on, which may be
    /// an earlier job of the same batch. Jobs canceled on insert get their
    /// `canceled` log entry in the same transaction.
    async fn insert_jobs(&self, jobs: &[JobDbModel], now: i64) -> Result<Vec<JobDbModel>>;

    /// Number of QUEUED jobs ahead of `queue_seq` in `queue`.
    async fn count_queued_ahead(&self, queue: &str, queue_seq: i64) -> Result<i64>;

    /// Claim the oldest QUEUED job of `queue` for `worker`.
    async fn claim_next(&self, queue: &str, worker: &str, now: i64) -> Result<Option<JobDbModel>>;

    /// Move a STARTED job to its terminal state and update its dependents.
    ///
    /// The job's log entry and one `canceled` entry per canceled dependent
    /// commit together with the state change.
    async fn settle(&self, id: &str, outcome: &SettleOutcome, now: i64) -> Result<SettledJobs>;

    /// STARTED jobs whose timeout plus `grace_ms` has elapsed at `now`.
    async fn list_overdue(&self, now: i64, grace_ms: i64) -> Result<Vec<JobDbModel>>;

    /// Delete up to `limit` jobs whose retention expired; returns the count.
    async fn delete_expired(&self, now: i64, limit: i64) -> Result<u64>;

    async fn count_by_queue_and_status(&self) -> Result<Vec<QueueStatusCount>>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
    result_ttl_ms: i64,
}

impl SqlxJobRepository {
    /// `result_ttl_ms` is how long terminal jobs stay visible after they end.
    pub fn new(pool: SqlitePool, result_ttl_ms: i64) -> Self {
        Self {
            pool,
            result_ttl_ms,
        }
    }
}

async fn next_queue_seq(conn: &mut SqliteConnection) -> Result<i64> {
    let seq: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(queue_seq), 0) + 1 FROM job")
        .fetch_one(&mut *conn)
        .await?;
    Ok(seq)
}

async fn insert_row(conn: &mut SqliteConnection, job: &JobDbModel) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO job (
            id, name, queue_name, spec, status, depends_on, next_job_id,
            queue_seq, enqueued_at, job_timeout_secs, created_at,
            started_at, ended_at, expires_at, worker_name, result, error
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&job.id)
    .bind(&job.name)
    .bind(&job.queue_name)
    .bind(&job.spec)
    .bind(&job.status)
    .bind(&job.depends_on)
    .bind(&job.next_job_id)
    .bind(job.queue_seq)
    .bind(job.enqueued_at)
    .bind(job.job_timeout_secs)
    .bind(job.created_at)
    .bind(job.started_at)
    .bind(job.ended_at)
    .bind(job.expires_at)
    .bind(&job.worker_name)
    .bind(&job.result)
    .bind(&job.error)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Cancel every job that transitively depends on `root` and has not run.
async fn cancel_dependents(
    conn: &mut SqliteConnection,
    root: &str,
    now: i64,
    expires_at: i64,
) -> Result<Vec<JobDbModel>> {
    let mut canceled = Vec::new();
    let mut frontier = vec![root.to_string()];

    while let Some(parent) = frontier.pop() {
        let children = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM job WHERE depends_on = ? AND status IN ('DEFERRED', 'QUEUED') ORDER BY created_at",
        )
        .bind(&parent)
        .fetch_all(&mut *conn)
        .await?;

        for mut child in children {
            let error = format!("dependency {parent} did not succeed");
            sqlx::query(
                r#"
                UPDATE job
                SET status = 'CANCELED', ended_at = ?, expires_at = ?, error = ?
                WHERE id = ?
                "#,
            )
            .bind(now)
            .bind(expires_at)
            .bind(&error)
            .bind(&child.id)
            .execute(&mut *conn)
            .await?;

            child.status = JobStatus::Canceled.as_str().to_string();
            child.ended_at = Some(now);
            child.expires_at = Some(expires_at);
            child.error = Some(error);
            frontier.push(child.id.clone());
            canceled.push(child);
        }
    }

    Ok(canceled)
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn get_job(&self, id: &str) -> Result<JobDbModel> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn insert_jobs(&self, jobs: &[JobDbModel], now: i64) -> Result<Vec<JobDbModel>> {
        retry_on_sqlite_busy("insert_jobs", || async {
            let mut tx = begin_immediate(&self.pool).await?;
            let mut inserted: Vec<JobDbModel> = Vec::with_capacity(jobs.len());

            for job in jobs {
                let mut job = job.clone();

                let status = match job.depends_on.as_deref() {
                    None => JobStatus::Queued,
                    Some(dep) => {
                        let dep_status = match inserted.iter().find(|j| j.id == dep) {
                            Some(earlier) => earlier.status.clone(),
                            None => sqlx::query_scalar::<_, String>(
                                "SELECT status FROM job WHERE id = ?",
                            )
                            .bind(dep)
                            .fetch_optional(&mut *tx)
                            .await?
                            .ok_or_else(|| {
                                Error::validation(format!("unknown dependency job {dep}"))
                            })?,
                        };
                        match JobStatus::parse(&dep_status) {
                            Some(JobStatus::Success) => JobStatus::Queued,
                            Some(JobStatus::Failed | JobStatus::Canceled) => JobStatus::Canceled,
                            _ => JobStatus::Deferred,
                        }
                    }
                };

                job.status = status.as_str().to_string();
                job.created_at = now;
                match status {
                    JobStatus::Queued => {
                        job.queue_seq = Some(next_queue_seq(&mut tx).await?);
                        job.enqueued_at = Some(now);
                    }
                    JobStatus::Canceled => {
                        job.ended_at = Some(now);
                        job.expires_at = Some(now + self.result_ttl_ms);
                        job.error = Some(format!(
                            "dependency {} did not succeed",
                            job.depends_on.as_deref().unwrap_or_default()
                        ));
                    }
                    _ => {}
                }

                insert_row(&mut tx, &job).await?;
                if status == JobStatus::Canceled {
                    append_entry(&mut tx, &job.queue_name, &job.id, Outcome::Canceled.as_str(), now)
                        .await?;
                }
                inserted.push(job);
            }

            tx.commit().await?;
            Ok(inserted)
        })
        .await
    }

    async fn count_queued_ahead(&self, queue: &str, queue_seq: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM job WHERE queue_name = ? AND status = 'QUEUED' AND queue_seq < ?",
        )
        .bind(queue)
        .bind(queue_seq)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn claim_next(&self, queue: &str, worker: &str, now: i64) -> Result<Option<JobDbModel>> {
        retry_on_sqlite_busy("claim_next", || async {
            let mut tx = begin_immediate(&self.pool).await?;

            let candidate = sqlx::query_as::<_, JobDbModel>(
                r#"
                SELECT * FROM job
                WHERE queue_name = ? AND status = 'QUEUED'
                ORDER BY queue_seq
                LIMIT 1
                "#,
            )
            .bind(queue)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(mut job) = candidate else {
                tx.rollback().await?;
                return Ok(None);
            };

            sqlx::query(
                r#"
                UPDATE job
                SET status = 'STARTED', started_at = ?, worker_name = ?
                WHERE id = ? AND status = 'QUEUED'
                "#,
            )
            .bind(now)
            .bind(worker)
            .bind(&job.id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            job.status = JobStatus::Started.as_str().to_string();
            job.started_at = Some(now);
            job.worker_name = Some(worker.to_string());
            Ok(Some(job))
        })
        .await
    }

    async fn settle(&self, id: &str, outcome: &SettleOutcome, now: i64) -> Result<SettledJobs> {
        retry_on_sqlite_busy("settle_job", || async {
            let mut tx = begin_immediate(&self.pool).await?;

            let mut job = sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| Error::not_found("Job", id))?;

            let target = outcome.status();
            if job.status() != Some(JobStatus::Started) {
                tx.rollback().await?;
                return Err(Error::InvalidStateTransition {
                    from: job.status.clone(),
                    to: target.as_str().to_string(),
                });
            }

            let expires_at = now + self.result_ttl_ms;
            let (result, error) = match outcome {
                SettleOutcome::Success { result } => (Some(result.clone()), None),
                SettleOutcome::Failure { error } => (None, Some(error.clone())),
            };

            sqlx::query(
                r#"
                UPDATE job
                SET status = ?, ended_at = ?, expires_at = ?, result = ?, error = ?
                WHERE id = ? AND status = 'STARTED'
                "#,
            )
            .bind(target.as_str())
            .bind(now)
            .bind(expires_at)
            .bind(&result)
            .bind(&error)
            .bind(id)
            .execute(&mut *tx)
            .await?;

            job.status = target.as_str().to_string();
            job.ended_at = Some(now);
            job.expires_at = Some(expires_at);
            job.result = result;
            job.error = error;
            append_entry(&mut tx, &job.queue_name, id, outcome.log_outcome().as_str(), now).await?;

            let mut promoted = Vec::new();
            let mut canceled = Vec::new();

            match outcome {
                SettleOutcome::Success { .. } => {
                    let dependents = sqlx::query_as::<_, JobDbModel>(
                        "SELECT * FROM job WHERE depends_on = ? AND status = 'DEFERRED' ORDER BY created_at",
                    )
                    .bind(id)
                    .fetch_all(&mut *tx)
                    .await?;

                    for mut dependent in dependents {
                        let seq = next_queue_seq(&mut tx).await?;
                        sqlx::query(
                            "UPDATE job SET status = 'QUEUED', queue_seq = ?, enqueued_at = ? WHERE id = ?",
                        )
                        .bind(seq)
                        .bind(now)
                        .bind(&dependent.id)
                        .execute(&mut *tx)
                        .await?;

                        dependent.status = JobStatus::Queued.as_str().to_string();
                        dependent.queue_seq = Some(seq);
                        dependent.enqueued_at = Some(now);
                        promoted.push(dependent);
                    }
                }
                SettleOutcome::Failure { .. } => {
                    canceled = cancel_dependents(&mut tx, id, now, expires_at).await?;
                    for dependent in &canceled {
                        append_entry(
                            &mut tx,
                            &dependent.queue_name,
                            &dependent.id,
                            Outcome::Canceled.as_str(),
                            now,
                        )
                        .await?;
                    }
                }
            }

            tx.commit().await?;
            Ok(SettledJobs {
                job,
                promoted,
                canceled,
            })
        })
        .await
    }

    async fn list_overdue(&self, now: i64, grace_ms: i64) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            r#"
            SELECT * FROM job
            WHERE status = 'STARTED'
              AND started_at IS NOT NULL
              AND started_at + job_timeout_secs * 1000 + ? < ?
            ORDER BY started_at
            "#,
        )
        .bind(grace_ms)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn delete_expired(&self, now: i64, limit: i64) -> Result<u64> {
        retry_on_sqlite_busy("delete_expired_jobs", || async {
            let result = sqlx::query(
                r#"
                DELETE FROM job WHERE id IN (
                    SELECT id FROM job
                    WHERE expires_at IS NOT NULL AND expires_at <= ?
                    LIMIT ?
                )
                "#,
            )
            .bind(now)
            .bind(limit)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn count_by_queue_and_status(&self) -> Result<Vec<QueueStatusCount>> {
        let rows = sqlx::query_as::<_, QueueStatusCount>(
            r#"
            SELECT queue_name, status, COUNT(*) AS count
            FROM job
            GROUP BY queue_name, status
            ORDER BY queue_name, status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
