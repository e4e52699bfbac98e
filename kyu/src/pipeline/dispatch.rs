//! Job execution: one HTTP call to an analysis service.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tracing::debug;

use super::job::ApiJob;
use crate::{Error, Result};

/// Maximum bytes of a non-2xx response body kept in the job error.
const ERROR_BODY_LIMIT: usize = 512;

/// Executes a claimed job.
///
/// Success means the downstream service accepted and completed the request.
/// Any error fails the job.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, api_job: &ApiJob) -> Result<()>;
}

/// Dispatches jobs with `reqwest`.
///
/// Connect and read timeouts are client-level settings in reqwest, so one
/// client is built and reused per distinct timeout pair.
#[derive(Default)]
pub struct HttpDispatcher {
    clients: DashMap<(Duration, Duration), reqwest::Client>,
}

impl HttpDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn client_for(&self, api_job: &ApiJob) -> Result<reqwest::Client> {
        let key = (api_job.connect_timeout(), api_job.read_timeout());
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        let client = reqwest::Client::builder()
            .connect_timeout(key.0)
            .read_timeout(key.1)
            .build()?;
        self.clients.insert(key, client.clone());
        Ok(client)
    }

    /// POST the job's body to `<dst_api_url><request_path>`.
    pub async fn route_job(&self, api_job: &ApiJob) -> Result<()> {
        let client = self.client_for(api_job)?;
        let url = api_job.url();

        let mut request = client.post(&url).json(&api_job.request_body.body());
        for (name, value) in &api_job.request_headers {
            request = request.header(name, value);
        }

        debug!(job_name = %api_job.job_name, %url, "Dispatching job");
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let mut body = response.text().await.unwrap_or_default();
        if body.len() > ERROR_BODY_LIMIT {
            let mut cut = ERROR_BODY_LIMIT;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(Error::Downstream {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl JobExecutor for HttpDispatcher {
    async fn execute(&self, api_job: &ApiJob) -> Result<()> {
        self.route_job(api_job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::job::AnalysisJob;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use std::collections::BTreeMap;
    use std::net::SocketAddr;

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn api_job(addr: SocketAddr, path: &str) -> ApiJob {
        ApiJob {
            job_name: "allin1_spectrograms".to_string(),
            dst_api_url: format!("http://{addr}"),
            queue_name: "cpu_queue".to_string(),
            request_path: path.to_string(),
            job_timeout_secs: 5,
            request_body: AnalysisJob::Spectrograms {
                separated_path: "/volume/a/song/separated".to_string(),
            },
            request_headers: BTreeMap::from([("x-trace".to_string(), "abc".to_string())]),
            request_read_timeout_secs: 5,
            dst_api_connect_timeout_secs: 1,
        }
    }

    #[tokio::test]
    async fn test_route_job_posts_body_and_headers() {
        let app = Router::new().route(
            "/spectrograms",
            post(|headers: HeaderMap, Json(body): Json<serde_json::Value>| async move {
                if headers.get("x-trace").is_some_and(|v| v == "abc")
                    && body["separated_path"] == "/volume/a/song/separated"
                {
                    StatusCode::OK
                } else {
                    StatusCode::BAD_REQUEST
                }
            }),
        );
        let addr = serve(app).await;

        HttpDispatcher::new()
            .route_job(&api_job(addr, "/spectrograms"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let app = Router::new().route(
            "/",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "model crashed") }),
        );
        let addr = serve(app).await;

        let err = HttpDispatcher::new()
            .route_job(&api_job(addr, "/"))
            .await
            .unwrap_err();
        match err {
            Error::Downstream { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "model crashed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_connection_refused_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = HttpDispatcher::new()
            .route_job(&api_job(addr, "/"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http(_)));
    }

    #[tokio::test]
    async fn test_clients_are_reused_per_timeout_pair() {
        let dispatcher = HttpDispatcher::new();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let job = api_job(addr, "/");
        dispatcher.client_for(&job).unwrap();
        dispatcher.client_for(&job).unwrap();
        assert_eq!(dispatcher.clients.len(), 1);

        let mut slower = job.clone();
        slower.request_read_timeout_secs = 60;
        dispatcher.client_for(&slower).unwrap();
        assert_eq!(dispatcher.clients.len(), 2);
    }
}
