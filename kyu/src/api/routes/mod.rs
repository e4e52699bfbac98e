//! API route modules.
//!
//! Organizes routes by resource type.

pub mod analysis;
pub mod async_job;
pub mod health;
pub mod logging;

use std::convert::Infallible;
use std::time::Duration;

use axum::Router;
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::api::error::{ApiError, ApiErrorResponse};
use crate::api::server::AppState;
use crate::error::Error;
use crate::pipeline::Job;

/// SSE event name of status updates.
pub const STATUS_EVENT: &str = "job status notification";

/// SSE event name of the final event of a stream that broke off.
pub const ERROR_EVENT: &str = "error";

/// Interval between SSE keep-alive comments.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/async-job", async_job::router())
        .nest("/analysis", analysis::router())
        .nest("/health", health::router())
        .nest("/api/logging", logging::router())
        .with_state(state)
}

/// Consumer named by the request, or the anonymous consumer.
pub(crate) fn consumer_id(state: &AppState, headers: &HeaderMap) -> String {
    headers
        .get(state.settings.consumer_id_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| state.settings.anonymous_consumer_name.clone())
}

fn error_event(err: Error) -> Event {
    let api_error = ApiError::from(err);
    let body = ApiErrorResponse {
        code: api_error.code,
        message: api_error.message,
    };
    Event::default()
        .event(ERROR_EVENT)
        .json_data(&body)
        .unwrap_or_else(|_| Event::default().event(ERROR_EVENT).data(body.message))
}

/// Stream the status of `job` and the rest of its chain as SSE.
///
/// The stream ends after the terminal event, after an `error` event, or when
/// the server shuts down. A client going away only drops the stream.
pub(crate) fn status_sse(
    state: &AppState,
    job: Job,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + use<>> {
    let job_id = job.id.clone();
    let events = state.router.stream_job_status(job);
    let shutdown = state.shutdown.clone();

    let stream = async_stream::stream! {
        futures::pin_mut!(events);
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = events.next() => next,
            };

            match next {
                Some(Ok(event)) => match Event::default().event(STATUS_EVENT).json_data(&event) {
                    Ok(sse) => yield Ok(sse),
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "Failed to encode status event");
                        break;
                    }
                },
                Some(Err(e)) => {
                    warn!(job_id = %job_id, error = %e, "Status stream failed");
                    yield Ok(error_event(e));
                    break;
                }
                None => break,
            }
        }
        debug!(job_id = %job_id, "Status stream closed");
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}
