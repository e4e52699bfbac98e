//! Single-analysis routes.
//!
//! `POST /analysis/{kind}/{audiofile_id}` runs one analysis as a chain of
//! one job, with the same precondition checks as the full analysis.

use axum::{
    Router,
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::post,
};
use serde::Deserialize;

use super::{consumer_id, status_sse};
use crate::analysis::{AnalysisKind, AudioFile, LyricOptions};
use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;

/// Create the analysis router.
pub fn router() -> Router<AppState> {
    Router::new().route("/{kind}/{audiofile_id}", post(run_analysis))
}

#[derive(Debug, Default, Deserialize)]
pub struct AnalysisQuery {
    #[serde(rename = "language-code")]
    pub language_code: Option<String>,
}

async fn run_analysis(
    State(state): State<AppState>,
    Path((kind, audiofile_id)): Path<(String, String)>,
    Query(query): Query<AnalysisQuery>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let kind: AnalysisKind = kind
        .parse()
        .map_err(|_| ApiError::not_found(format!("Unknown analysis kind '{}'", kind)))?;

    let consumer_id = consumer_id(&state, &headers);
    let audio = AudioFile::locate(
        &state.settings.consumer_volume_path,
        &consumer_id,
        &audiofile_id,
    )
    .await?;

    let lyric = query
        .language_code
        .map(|language_code| LyricOptions { language_code })
        .unwrap_or_default();
    let api_jobs = state.planner.plan_chain(&audio, &[kind], &lyric).await?;

    let jobs = state.router.submit_jobs(api_jobs).await?;
    let job = jobs
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::internal("Submitted chain is empty"))?;
    tracing::info!(%kind, audiofile = %audiofile_id, job_id = %job.id, "Analysis submitted");

    Ok(status_sse(&state, job))
}
