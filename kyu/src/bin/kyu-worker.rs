//! Serial worker process for one kyu job queue.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use kyu::database::repositories::{SqlxJobRepository, SqlxNotificationRepository};
use kyu::pipeline::{HttpDispatcher, JobQueue, NotificationLog, WorkerPool, WorkerPoolConfig};
use kyu::signal::shutdown_signal;
use kyu::{database, logging};

#[derive(Parser, Debug)]
#[command(name = "kyu-worker", version, about = "Run workers for one kyu job queue")]
struct Args {
    /// Queue to take jobs from, e.g. gpu_queue
    queue_name: String,

    /// Database shared with the gateway
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:kyu.db?mode=rwc")]
    database_url: String,

    /// Number of serial workers in this process
    #[arg(long, env = "KYU_WORKER_CONCURRENCY", default_value_t = 1)]
    concurrency: usize,

    /// How long an idle worker waits before polling the queue again
    #[arg(long, env = "KYU_WORKER_POLL_INTERVAL_MS", default_value_t = 500)]
    poll_interval_ms: u64,

    /// Name recorded on claimed jobs
    #[arg(long, env = "KYU_WORKER_NAME")]
    name: Option<String>,

    /// Retention of finished jobs
    #[arg(long, env = "JOB_RESULT_TTL_SECS", default_value_t = 259_200)]
    result_ttl_secs: u64,
}

async fn run(args: Args) -> anyhow::Result<()> {
    let pool = database::init_pool(&args.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", args.database_url))?;
    database::run_migrations(&pool).await?;

    let result_ttl_ms = i64::try_from(args.result_ttl_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
    let log = Arc::new(NotificationLog::new(Arc::new(SqlxNotificationRepository::new(
        pool.clone(),
    ))));
    let queue = Arc::new(JobQueue::new(
        Arc::new(SqlxJobRepository::new(pool.clone(), result_ttl_ms)),
        log,
    ));

    let name = args
        .name
        .unwrap_or_else(|| format!("{}-{}", args.queue_name, std::process::id()));
    let config = WorkerPoolConfig::new(&args.queue_name)
        .with_concurrency(args.concurrency)
        .with_poll_interval(Duration::from_millis(args.poll_interval_ms.max(10)))
        .with_name_prefix(name);
    let workers = WorkerPool::new(config, queue, Arc::new(HttpDispatcher::new()));

    workers.start();
    info!(queue = %args.queue_name, "kyu-worker running");

    let signal = shutdown_signal().await;
    workers.stop().await;
    pool.close().await;
    signal?;

    info!(jobs = workers.jobs_processed(), "kyu-worker stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    if let Err(e) = logging::init_console_logging() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("kyu-worker failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_name_is_required() {
        assert!(Args::try_parse_from(["kyu-worker"]).is_err());
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::try_parse_from([
            "kyu-worker",
            "gpu_queue",
            "--database-url",
            "sqlite:/data/jobs.db",
            "--concurrency",
            "3",
            "--poll-interval-ms",
            "250",
            "--name",
            "gpu-a",
        ])
        .unwrap();

        assert_eq!(args.queue_name, "gpu_queue");
        assert_eq!(args.database_url, "sqlite:/data/jobs.db");
        assert_eq!(args.concurrency, 3);
        assert_eq!(args.poll_interval_ms, 250);
        assert_eq!(args.name.as_deref(), Some("gpu-a"));
    }
}
