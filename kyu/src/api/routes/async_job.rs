//! Job chain routes: full analysis, re-attachment and job inspection.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use super::{consumer_id, status_sse};
use crate::analysis::{AudioFile, LyricOptions};
use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::pipeline::{Job, QueueStats};

/// Create the async job router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/process-audio/{audiofile_id}", post(process_audio))
        .route("/status", get(job_status))
        .route("/jobs/{job_id}", get(get_job))
        .route("/queues", get(queue_stats))
}

fn default_analyze_lyric() -> bool {
    true
}

fn default_language_code() -> String {
    LyricOptions::default().language_code
}

#[derive(Debug, Deserialize)]
pub struct ProcessAudioQuery {
    #[serde(rename = "is-analyze-lyric", default = "default_analyze_lyric")]
    pub is_analyze_lyric: bool,
    #[serde(rename = "language-code", default = "default_language_code")]
    pub language_code: String,
}

#[derive(Debug, Deserialize)]
pub struct JobStatusQuery {
    pub job_id: String,
}

/// A job with its current queue position.
#[derive(Debug, Serialize)]
pub struct JobSnapshot {
    #[serde(flatten)]
    pub job: Job,
    pub queue_position: Option<usize>,
}

/// Run every analysis on a stored audio file and stream the chain's progress.
async fn process_audio(
    State(state): State<AppState>,
    Path(audiofile_id): Path<String>,
    Query(query): Query<ProcessAudioQuery>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let consumer_id = consumer_id(&state, &headers);
    let audio = AudioFile::locate(
        &state.settings.consumer_volume_path,
        &consumer_id,
        &audiofile_id,
    )
    .await?;

    let lyric = LyricOptions {
        language_code: query.language_code,
    };
    let api_jobs = state
        .planner
        .plan_full(&audio, query.is_analyze_lyric, &lyric)
        .await?;

    let jobs = state.router.submit_jobs(api_jobs).await?;
    let first = jobs
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::internal("Submitted chain is empty"))?;
    tracing::info!(
        consumer = %consumer_id,
        audiofile = %audiofile_id,
        first_job = %first.id,
        "Full analysis submitted"
    );

    Ok(status_sse(&state, first))
}

/// Re-attach to a job's status stream.
async fn job_status(
    State(state): State<AppState>,
    Query(query): Query<JobStatusQuery>,
) -> ApiResult<impl IntoResponse> {
    let job = state.router.get_job(&query.job_id).await?;
    Ok(status_sse(&state, job))
}

async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobSnapshot>> {
    let job = state.router.get_job(&job_id).await?;
    let queue_position = state.queue.get_position(&job.id).await?;
    Ok(Json(JobSnapshot {
        job,
        queue_position,
    }))
}

async fn queue_stats(State(state): State<AppState>) -> ApiResult<Json<Vec<QueueStats>>> {
    Ok(Json(state.queue.queue_stats().await?))
}
