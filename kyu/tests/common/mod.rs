//! Shared fixtures: a temporary job database and a local stand-in for the
//! analysis services.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Json, Router, extract::State, http::StatusCode, http::Uri};
use futures::{Stream, StreamExt};
use tempfile::TempDir;
use tokio::net::TcpListener;

use kyu::database::repositories::{SqlxJobRepository, SqlxNotificationRepository};
use kyu::database::{DbPool, init_pool, run_migrations};
use kyu::pipeline::{
    AnalysisJob, ApiJob, HttpDispatcher, JobQueue, JobRouter, JobRouterConfig, JobStatusEvent,
    NotificationLog, NotificationLogConfig, WorkerPool, WorkerPoolConfig,
};

/// Result retention used by the harness.
const RESULT_TTL_MS: i64 = 60 * 60 * 1000;

pub fn database_url(dir: &TempDir) -> String {
    format!("sqlite:{}?mode=rwc", dir.path().join("kyu.db").display())
}

/// Queue, log and router on a fresh database, tuned for fast tests.
pub struct Harness {
    pub dir: TempDir,
    pub pool: DbPool,
    pub queue: Arc<JobQueue>,
    pub log: Arc<NotificationLog>,
    pub router: JobRouter,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_pool(&database_url(&dir)).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let log = Arc::new(NotificationLog::with_config(
            Arc::new(SqlxNotificationRepository::new(pool.clone())),
            NotificationLogConfig {
                poll_interval: Duration::from_millis(50),
                batch_size: 100,
            },
        ));
        let queue = Arc::new(JobQueue::new(
            Arc::new(SqlxJobRepository::new(pool.clone(), RESULT_TTL_MS)),
            log.clone(),
        ));
        let router = JobRouter::with_config(
            queue.clone(),
            JobRouterConfig {
                result_poll_interval: Duration::from_millis(20),
                result_poll_attempts: 250,
                deferral_poll_interval: Duration::from_millis(50),
                terminal_check_interval: Duration::from_millis(200),
            },
        );

        Self {
            dir,
            pool,
            queue,
            log,
            router,
        }
    }

    /// A second log instance on its own pool, standing in for a worker process.
    pub async fn foreign_log(&self) -> NotificationLog {
        let pool = init_pool(&database_url(&self.dir)).await.unwrap();
        NotificationLog::with_config(
            Arc::new(SqlxNotificationRepository::new(pool)),
            NotificationLogConfig {
                poll_interval: Duration::from_millis(50),
                batch_size: 100,
            },
        )
    }

    /// Start a single-worker pool on `queue_name`.
    pub fn start_worker(&self, queue_name: &str) -> WorkerPool {
        let pool = WorkerPool::new(
            WorkerPoolConfig::new(queue_name)
                .with_poll_interval(Duration::from_millis(50))
                .with_name_prefix(format!("test-{queue_name}")),
            self.queue.clone(),
            Arc::new(HttpDispatcher::new()),
        );
        pool.start();
        pool
    }
}

/// One request received by the fake service.
#[derive(Debug, Clone)]
pub struct Call {
    pub path: String,
    pub body: serde_json::Value,
}

#[derive(Clone, Default)]
struct ServiceState {
    fail_paths: Vec<String>,
    delay: Duration,
    calls: Arc<parking_lot::Mutex<Vec<Call>>>,
}

/// Local HTTP server standing in for the analysis services.
///
/// Every POST succeeds after `delay`, except on the paths listed as failing,
/// which answer 500.
pub struct FakeService {
    pub addr: SocketAddr,
    calls: Arc<parking_lot::Mutex<Vec<Call>>>,
}

impl FakeService {
    pub async fn start(fail_paths: &[&str], delay: Duration) -> Self {
        let state = ServiceState {
            fail_paths: fail_paths.iter().map(|p| p.to_string()).collect(),
            delay,
            calls: Arc::default(),
        };
        let calls = state.calls.clone();

        let app = Router::new().fallback(handle).with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, calls }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn called_paths(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.path).collect()
    }
}

async fn handle(
    State(state): State<ServiceState>,
    uri: Uri,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    let path = uri.path().to_string();
    state.calls.lock().push(Call {
        path: path.clone(),
        body,
    });
    tokio::time::sleep(state.delay).await;
    if state.fail_paths.contains(&path) {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}

/// A chords job named `name` sent to `path` of `service`.
pub fn api_job(name: &str, queue_name: &str, service: &FakeService, path: &str) -> ApiJob {
    ApiJob {
        job_name: name.to_string(),
        dst_api_url: service.base_url(),
        queue_name: queue_name.to_string(),
        request_path: path.to_string(),
        job_timeout_secs: 10,
        request_body: AnalysisJob::Chords {
            file_path: format!("/volume/anonymous/{name}/{name}.wav"),
        },
        request_headers: BTreeMap::new(),
        request_read_timeout_secs: 10,
        dst_api_connect_timeout_secs: 2,
    }
}

/// Collect a status stream to its end.
pub async fn collect_events(
    stream: impl Stream<Item = kyu::Result<JobStatusEvent>>,
) -> Vec<JobStatusEvent> {
    tokio::time::timeout(Duration::from_secs(20), async {
        futures::pin_mut!(stream);
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event.unwrap());
        }
        events
    })
    .await
    .expect("status stream did not finish in time")
}

/// Next event of a status stream, failing the test after a while.
pub async fn next_event<S>(stream: &mut S) -> JobStatusEvent
where
    S: Stream<Item = kyu::Result<JobStatusEvent>> + Unpin,
{
    tokio::time::timeout(Duration::from_secs(10), stream.next())
        .await
        .expect("no status event in time")
        .expect("status stream ended early")
        .unwrap()
}

/// Poll until `id` is terminal.
pub async fn wait_terminal(queue: &JobQueue, id: &str) -> kyu::pipeline::Job {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let job = queue.get_job(id).await.unwrap().unwrap();
            if job.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job did not finish in time")
}
