//! API server setup and configuration.

use axum::Router;
use axum::extract::Request;
use axum::http::Response;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::analysis::AnalysisPlanner;
use crate::api::routes;
use crate::config::Settings;
use crate::database::DbPool;
use crate::error::{Error, Result};
use crate::logging::LoggingConfig;
use crate::pipeline::{JobQueue, JobRouter};
use crate::services::ServiceContainer;

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Server bind address
    pub bind_address: String,
    /// Server port
    pub port: u16,
    /// Enable CORS
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8000,
            enable_cors: true,
        }
    }
}

impl ApiServerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            bind_address: settings.bind_address.clone(),
            port: settings.port,
            ..Self::default()
        }
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server start time for uptime calculation
    pub start_time: Instant,
    pub settings: Arc<Settings>,
    pub pool: DbPool,
    pub queue: Arc<JobQueue>,
    pub router: JobRouter,
    pub planner: Arc<AnalysisPlanner>,
    /// Logging configuration for dynamic log level changes
    pub logging_config: Option<Arc<LoggingConfig>>,
    /// Fired when the server shuts down; ends open status streams.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Create application state from the service container.
    pub fn from_container(container: &ServiceContainer) -> Self {
        Self {
            start_time: Instant::now(),
            settings: container.settings.clone(),
            pool: container.pool.clone(),
            queue: container.queue.clone(),
            router: container.router.clone(),
            planner: container.planner.clone(),
            logging_config: container.logging_config.clone(),
            shutdown: CancellationToken::new(),
        }
    }
}

fn is_health_check(req: &Request) -> bool {
    req.uri().path().starts_with("/health")
}

/// Build the router with all middleware and routes.
pub fn build_router(state: AppState, config: &ApiServerConfig) -> Router {
    let mut router = routes::create_router(state);

    if config.enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        router = router.layer(cors);
    }

    let trace = TraceLayer::new_for_http()
        .make_span_with(|req: &Request| {
            if is_health_check(req) {
                Span::none()
            } else {
                tracing::info_span!("request", method = %req.method(), path = %req.uri().path())
            }
        })
        .on_request(())
        .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
            if !span.is_disabled() {
                tracing::info!(
                    parent: span,
                    status = res.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "Request finished"
                );
            }
        })
        .on_failure(|class: ServerErrorsFailureClass, latency: Duration, span: &Span| {
            if !span.is_disabled() {
                tracing::error!(
                    parent: span,
                    %class,
                    latency_ms = latency.as_millis() as u64,
                    "Request failed"
                );
            }
        });

    router.layer(trace)
}

/// API server.
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        let cancel_token = state.shutdown.clone();
        Self {
            config,
            state,
            cancel_token,
        }
    }

    /// Get the cancellation token for graceful shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Start the server and serve until the cancellation token fires.
    ///
    /// Open status streams are closed on shutdown; the jobs behind them keep
    /// running in the workers.
    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port)
            .parse()
            .map_err(|e| Error::config(format!("Invalid address: {}", e)))?;

        let router = build_router(self.state.clone(), &self.config);
        let listener = TcpListener::bind(addr).await?;

        tracing::info!("API server listening on http://{}", addr);

        let cancel_token = self.cancel_token.clone();

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                tracing::info!("API server shutting down...");
            })
            .await?;

        Ok(())
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}
