//! Job orchestration for the analysis services.
//!
//! - a database-backed job queue with dependency chaining
//! - a per-queue notification log of terminal job states
//! - serial queue workers that dispatch jobs over HTTP
//! - a router that submits chains and streams their progress
//! - supervision of worker processes and background maintenance

mod dispatch;
mod job;
mod job_queue;
mod notify_log;
mod purge;
mod router;
mod supervisor;
mod worker_pool;

pub use dispatch::{HttpDispatcher, JobExecutor};
pub use job::{AnalysisJob, ApiJob, ChainLink, Job, JobOutcome, Settlement, new_job_id};
pub use job_queue::{JobQueue, QueueStats};
pub use notify_log::{LogEntry, NotificationLog, NotificationLogConfig, SequenceId};
pub use purge::{JobSweeper, SweepConfig, SweepReport};
pub use router::{JobRouter, JobRouterConfig, JobStatusEvent, StreamStatus};
pub use supervisor::{QueueWorkers, WorkerSupervisor};
pub use worker_pool::{WorkerPool, WorkerPoolConfig, process_job};
