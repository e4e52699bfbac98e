//! Worker process supervision.
//!
//! In `process` worker mode the gateway launches `kyu-worker` processes for
//! every configured queue at boot and stops them at teardown. A stopping
//! worker first gets SIGTERM so it can finish its current job; it is killed
//! if it is still running after the stop timeout.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use tokio::process::{Child, Command};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::Result;

/// One queue and the number of worker processes serving it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueWorkers {
    pub queue_name: String,
    pub multiplicity: usize,
}

/// Ask a process to terminate. Returns false when the signal could not be
/// delivered (or is unsupported on this platform).
fn request_stop(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .and_then(|process| process.kill_with(Signal::Term))
        .unwrap_or(false)
}

async fn stop_child(child: &mut Child, stop_timeout: Duration) -> std::io::Result<std::process::ExitStatus> {
    if let Some(pid) = child.id()
        && request_stop(pid)
        && let Ok(status) = tokio::time::timeout(stop_timeout, child.wait()).await
    {
        return status;
    }
    child.start_kill()?;
    child.wait().await
}

pub struct WorkerSupervisor {
    binary: PathBuf,
    database_url: String,
    stop_timeout: Duration,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<JoinSet<()>>,
}

impl WorkerSupervisor {
    pub fn new(binary: impl Into<PathBuf>, database_url: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            database_url: database_url.into(),
            stop_timeout: Duration::from_secs(10),
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(JoinSet::new()),
        }
    }

    /// How long a worker may take to exit after SIGTERM.
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    fn spawn_child(&self, queue_name: &str, index: usize) -> Result<Child> {
        let child = Command::new(&self.binary)
            .arg(queue_name)
            .arg("--database-url")
            .arg(&self.database_url)
            .env("KYU_WORKER_NAME", format!("{queue_name}-{index}"))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }

    /// Launch `multiplicity` processes for every queue.
    ///
    /// Fails on the first process that cannot be started; processes already
    /// launched keep running and are stopped by [`shutdown`](Self::shutdown).
    pub fn launch(&self, queues: &[QueueWorkers]) -> Result<usize> {
        let mut launched = 0;
        let mut tasks = self.tasks.lock();

        for workers in queues {
            for index in 0..workers.multiplicity {
                let mut child = self.spawn_child(&workers.queue_name, index)?;
                let pid = child.id();
                info!(queue = %workers.queue_name, index, ?pid, "Launched worker process");

                let token = self.cancellation_token.clone();
                let stop_timeout = self.stop_timeout;
                let queue_name = workers.queue_name.clone();
                tasks.spawn(async move {
                    tokio::select! {
                        status = child.wait() => match status {
                            Ok(status) => warn!(queue = %queue_name, index, %status, "Worker process exited unexpectedly"),
                            Err(e) => error!(queue = %queue_name, index, error = %e, "Failed to wait on worker process"),
                        },
                        _ = token.cancelled() => match stop_child(&mut child, stop_timeout).await {
                            Ok(status) => info!(queue = %queue_name, index, %status, "Worker process stopped"),
                            Err(e) => error!(queue = %queue_name, index, error = %e, "Failed to stop worker process"),
                        },
                    }
                });
                launched += 1;
            }
        }

        Ok(launched)
    }

    /// Stop every launched process and wait for it to exit.
    pub async fn shutdown(&self) {
        self.cancellation_token.cancel();
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while tasks.join_next().await.is_some() {}
        info!("All worker processes stopped");
    }

    /// Number of supervised processes still being watched.
    pub fn running(&self) -> usize {
        self.tasks.lock().len()
    }
}
