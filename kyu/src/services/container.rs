//! Service container for dependency injection.
//!
//! The ServiceContainer owns the long-lived pieces of the gateway (database
//! pool, job queue, router, dispatcher and the workers) and manages their
//! lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::analysis::AnalysisPlanner;
use crate::config::{Settings, WorkerMode};
use crate::database::DbPool;
use crate::database::repositories::{SqlxJobRepository, SqlxNotificationRepository};
use crate::logging::LoggingConfig;
use crate::pipeline::{
    HttpDispatcher, JobQueue, JobRouter, JobSweeper, NotificationLog, SweepConfig, WorkerPool,
    WorkerPoolConfig, WorkerSupervisor,
};
use crate::Result;

/// Default shutdown timeout.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Service container holding all gateway services.
pub struct ServiceContainer {
    /// Database connection pool.
    pub pool: DbPool,
    pub settings: Arc<Settings>,
    pub queue: Arc<JobQueue>,
    pub router: JobRouter,
    pub planner: Arc<AnalysisPlanner>,
    pub dispatcher: Arc<HttpDispatcher>,
    /// Live logging configuration, when logging was initialized by the binary.
    pub logging_config: Option<Arc<LoggingConfig>>,
    sweep_config: SweepConfig,
    supervisor: parking_lot::Mutex<Option<Arc<WorkerSupervisor>>>,
    worker_pools: parking_lot::Mutex<Vec<Arc<WorkerPool>>>,
    sweeper_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    /// Cancellation token for graceful shutdown.
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Create a new service container on a migrated database pool.
    pub fn new(pool: DbPool, settings: Settings) -> Self {
        info!("Initializing service container");

        let result_ttl_ms = i64::try_from(settings.job_result_ttl_secs.saturating_mul(1000))
            .unwrap_or(i64::MAX);
        let job_repo = Arc::new(SqlxJobRepository::new(pool.clone(), result_ttl_ms));
        let log_repo = Arc::new(SqlxNotificationRepository::new(pool.clone()));

        let log = Arc::new(NotificationLog::new(log_repo));
        let queue = Arc::new(JobQueue::new(job_repo, log));
        let router = JobRouter::new(queue.clone());
        let planner = Arc::new(AnalysisPlanner::new(settings.services.clone()));

        Self {
            pool,
            settings: Arc::new(settings),
            queue,
            router,
            planner,
            dispatcher: Arc::new(HttpDispatcher::new()),
            logging_config: None,
            sweep_config: SweepConfig::default(),
            supervisor: parking_lot::Mutex::new(None),
            worker_pools: parking_lot::Mutex::new(Vec::new()),
            sweeper_handle: parking_lot::Mutex::new(None),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Set the logging configuration.
    pub fn with_logging_config(mut self, config: Arc<LoggingConfig>) -> Self {
        self.logging_config = Some(config);
        self
    }

    /// Replace the sweeper configuration.
    pub fn with_sweep_config(mut self, config: SweepConfig) -> Self {
        self.sweep_config = config;
        self
    }

    /// Start background maintenance and the workers for the configured mode.
    pub fn initialize(&self) -> Result<()> {
        info!("Initializing services");

        let sweeper = JobSweeper::new(self.sweep_config.clone(), self.queue.clone());
        *self.sweeper_handle.lock() =
            Some(sweeper.start_background_task(self.cancellation_token.child_token()));

        if let Some(logging) = &self.logging_config {
            logging.start_retention_cleanup(self.cancellation_token.child_token());
        }

        self.start_workers()?;

        info!("Services initialized");
        Ok(())
    }

    fn start_workers(&self) -> Result<()> {
        let queues = self.settings.worker_queues();
        match self.settings.worker_mode {
            WorkerMode::Process => {
                let binary = self.settings.resolve_worker_binary()?;
                let supervisor = Arc::new(WorkerSupervisor::new(
                    binary.clone(),
                    self.settings.database_url.clone(),
                ));
                // Keep the supervisor even on failure so already launched
                // processes get stopped at shutdown.
                *self.supervisor.lock() = Some(supervisor.clone());
                let launched = supervisor.launch(&queues)?;
                info!(binary = %binary.display(), launched, "Worker processes launched");
            }
            WorkerMode::InProcess => {
                let mut pools = self.worker_pools.lock();
                for workers in queues {
                    let pool = Arc::new(WorkerPool::new(
                        WorkerPoolConfig::new(&workers.queue_name).with_concurrency(workers.multiplicity),
                        self.queue.clone(),
                        self.dispatcher.clone(),
                    ));
                    pool.start();
                    pools.push(pool);
                }
            }
            WorkerMode::External => {
                info!("Workers are managed externally");
            }
        }
        Ok(())
    }

    /// Number of in-process worker pools.
    pub fn worker_pool_count(&self) -> usize {
        self.worker_pools.lock().len()
    }

    /// Shutdown all services gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Shutdown all services gracefully with a custom timeout.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down services (timeout: {:?})", timeout);

        self.cancellation_token.cancel();

        let pools: Vec<Arc<WorkerPool>> = std::mem::take(&mut *self.worker_pools.lock());
        let supervisor = self.supervisor.lock().take();
        let sweeper = self.sweeper_handle.lock().take();

        let stopped = tokio::time::timeout(timeout, async {
            for pool in &pools {
                pool.stop().await;
            }
            if let Some(supervisor) = &supervisor {
                supervisor.shutdown().await;
            }
            if let Some(handle) = sweeper
                && let Err(e) = handle.await
            {
                warn!("Sweeper task ended abnormally: {}", e);
            }
        })
        .await;

        if stopped.is_err() {
            warn!("Shutdown timeout reached, forcing shutdown");
        }

        info!("Closing database pool...");
        self.pool.close().await;

        info!("Services shut down");
        Ok(())
    }

    /// Get the cancellation token for external use.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Check if shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{init_pool, run_migrations};
    use std::collections::HashMap;

    async fn container(vars: &[(&str, &str)]) -> (tempfile::TempDir, ServiceContainer) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("kyu.db").display());
        let pool = init_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let mut vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        vars.insert("DATABASE_URL".to_string(), url);
        let settings = Settings::from_lookup(|key| vars.get(key).cloned()).unwrap();

        (dir, ServiceContainer::new(pool, settings))
    }

    #[tokio::test]
    async fn test_in_process_workers_start_and_stop() {
        let (_dir, container) = container(&[
            ("WORKER_MODE", "in-process"),
            ("GPU_WORKER_MULTIPLICITY", "2"),
        ])
        .await;

        container.initialize().unwrap();
        assert_eq!(container.worker_pool_count(), 2);
        assert!(!container.is_shutting_down());

        container
            .shutdown_with_timeout(Duration::from_secs(5))
            .await
            .unwrap();
        assert!(container.is_shutting_down());
        assert_eq!(container.worker_pool_count(), 0);
    }

    #[tokio::test]
    async fn test_external_mode_starts_no_workers() {
        let (_dir, container) = container(&[("WORKER_MODE", "external")]).await;
        container.initialize().unwrap();
        assert_eq!(container.worker_pool_count(), 0);
        container
            .shutdown_with_timeout(Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_process_mode_with_missing_binary_fails() {
        let (_dir, container) = container(&[
            ("WORKER_MODE", "process"),
            ("WORKER_BINARY", "/nonexistent/kyu-worker"),
        ])
        .await;
        assert!(container.initialize().is_err());
        container
            .shutdown_with_timeout(Duration::from_secs(5))
            .await
            .unwrap();
    }
}
