use axum::{
    Json,
    extract::{Path, Query, State},
    response::{IntoResponse, Sse},
};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use tokio_stream::StreamExt as _;

use crate::db::JobFilter;
use crate::error::SorapoolError;
use crate::jobs::CreateJobRequest;
use crate::server::router::AppState;
use crate::stream::StreamFilter;

pub(super) async fn create_job(
    State(state): State<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, SorapoolError> {
    let job = state.jobs.create_job(request).await?;
    Ok(Json(json!({"job": job})))
}

#[derive(Debug, Deserialize)]
pub(super) struct ListJobsQuery {
    group_title: Option<String>,
    profile_id: Option<i64>,
    status: Option<String>,
    phase: Option<String>,
    keyword: Option<String>,
    #[serde(default = "default_list_limit")]
    limit: i64,
}

fn default_list_limit() -> i64 {
    50
}

pub(super) async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse, SorapoolError> {
    let jobs = state
        .jobs
        .list_jobs(JobFilter {
            group_title: query.group_title,
            profile_id: query.profile_id,
            status: query.status,
            phase: query.phase,
            keyword: query.keyword,
            limit: query.limit,
        })
        .await?;
    Ok(Json(jobs))
}

#[derive(Debug, Deserialize)]
pub(super) struct GetJobQuery {
    /// Resolve to the newest member of the retry chain by default; pass
    /// `follow_retry=false` to pin the requested row.
    #[serde(default = "default_follow_retry")]
    follow_retry: bool,
}

fn default_follow_retry() -> bool {
    true
}

pub(super) async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<GetJobQuery>,
) -> Result<impl IntoResponse, SorapoolError> {
    let job = state.jobs.get_job(id, query.follow_retry).await?;
    Ok(Json(job))
}

pub(super) async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, SorapoolError> {
    let job = state.jobs.retry_job(id).await?;
    Ok(Json(job))
}

pub(super) async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, SorapoolError> {
    let job = state.jobs.cancel_job(id).await?;
    Ok(Json(job))
}

pub(super) async fn list_job_events(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, SorapoolError> {
    let events = state.jobs.list_events(id).await?;
    Ok(Json(events))
}

pub(super) async fn retry_watermark(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, SorapoolError> {
    let job = state.jobs.retry_watermark(id).await?;
    Ok(Json(job))
}

#[derive(Debug, Deserialize)]
pub(super) struct StreamQuery {
    group_title: Option<String>,
    profile_id: Option<i64>,
    status: Option<String>,
    phase: Option<String>,
    keyword: Option<String>,
    limit: Option<i64>,
    #[serde(default = "default_with_events")]
    with_events: bool,
}

fn default_with_events() -> bool {
    true
}

pub(super) async fn stream_jobs(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    let filter = StreamFilter::build(
        query.group_title,
        query.profile_id,
        query.status,
        query.phase,
        query.keyword,
        query.limit,
        query.with_events,
    );
    let events = state
        .stream
        .subscribe(filter)
        .map(|event| Ok::<_, Infallible>(event.to_sse()));
    Sse::new(events)
}
