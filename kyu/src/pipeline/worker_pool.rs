//! Serial queue workers.
//!
//! A worker is bound to exactly one queue and runs one job at a time: claim,
//! execute, record the terminal state, repeat. A pool runs several such
//! workers as tokio tasks; a `kyu-worker` process runs one pool.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatch::JobExecutor;
use super::job::{ChainLink, Job, JobOutcome, Settlement};
use super::job_queue::JobQueue;
use crate::Result;

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Queue the workers take jobs from.
    pub queue_name: String,
    /// Number of serial workers.
    pub concurrency: usize,
    /// How long an idle worker waits before checking the queue again.
    pub poll_interval: Duration,
    /// Prefix for worker names recorded on claimed jobs.
    pub name_prefix: String,
}

impl WorkerPoolConfig {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            concurrency: 1,
            poll_interval: Duration::from_millis(500),
            name_prefix: format!("worker-{}", std::process::id()),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }
}

/// A pool of serial workers for one queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    queue: Arc<JobQueue>,
    executor: Arc<dyn JobExecutor>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
    jobs_processed: Arc<AtomicU64>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        queue: Arc<JobQueue>,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        Self {
            config,
            queue,
            executor,
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
            jobs_processed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn the workers.
    pub fn start(&self) {
        info!(
            queue = %self.config.queue_name,
            workers = self.config.concurrency,
            "Starting worker pool"
        );

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            warn!(queue = %self.config.queue_name, "Worker pool already stopped");
            return;
        };

        for i in 0..self.config.concurrency {
            let worker = Worker {
                name: format!("{}-{}", self.config.name_prefix, i),
                queue_name: self.config.queue_name.clone(),
                poll_interval: self.config.poll_interval,
                queue: self.queue.clone(),
                executor: self.executor.clone(),
                cancellation_token: self.cancellation_token.clone(),
                jobs_processed: self.jobs_processed.clone(),
            };
            join_set.spawn(worker.run());
        }
    }

    /// Stop taking new jobs and wait for in-flight jobs to finish.
    pub async fn stop(&self) {
        info!(queue = %self.config.queue_name, "Stopping worker pool");
        self.cancellation_token.cancel();

        let join_set = self.tasks.lock().take();
        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!(
            queue = %self.config.queue_name,
            jobs = self.jobs_processed(),
            "Worker pool stopped"
        );
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Jobs settled by this pool since it started.
    pub fn jobs_processed(&self) -> u64 {
        self.jobs_processed.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}

struct Worker {
    name: String,
    queue_name: String,
    poll_interval: Duration,
    queue: Arc<JobQueue>,
    executor: Arc<dyn JobExecutor>,
    cancellation_token: CancellationToken,
    jobs_processed: Arc<AtomicU64>,
}

impl Worker {
    async fn run(self) {
        debug!(worker = %self.name, queue = %self.queue_name, "Worker started");

        while !self.cancellation_token.is_cancelled() {
            match self.queue.dequeue(&self.queue_name, &self.name).await {
                Ok(Some(job)) => {
                    // Shutdown is only observed between jobs.
                    match process_job(&self.queue, self.executor.as_ref(), job).await {
                        Ok(_) => {
                            self.jobs_processed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => error!(worker = %self.name, error = %e, "Failed to record job outcome"),
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.cancellation_token.cancelled() => break,
                        _ = self.queue.wait_for_job(&self.queue_name, self.poll_interval) => {}
                    }
                }
                Err(e) => {
                    warn!(worker = %self.name, error = %e, "Error dequeuing job");
                    tokio::select! {
                        _ = self.cancellation_token.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }

        debug!(worker = %self.name, "Worker shutting down");
    }
}

/// Execute a claimed job under its timeout and record the outcome.
pub async fn process_job(
    queue: &JobQueue,
    executor: &dyn JobExecutor,
    job: Job,
) -> Result<Settlement> {
    let timeout = job.api_job.job_timeout();
    info!(job_id = %job.id, job_name = %job.name, "Processing job");

    let outcome = match tokio::time::timeout(timeout, executor.execute(&job.api_job)).await {
        Ok(Ok(())) => JobOutcome::Success(ChainLink {
            next_job_id: job.next_job_id.clone(),
        }),
        Ok(Err(e)) => {
            warn!(job_id = %job.id, error = %e, "Job failed");
            JobOutcome::Failure(e.to_string())
        }
        Err(_) => {
            warn!(job_id = %job.id, ?timeout, "Job timed out");
            JobOutcome::Failure(format!("job timed out after {}s", timeout.as_secs()))
        }
    };

    queue.finish(&job.id, outcome).await
}
