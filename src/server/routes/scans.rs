use axum::{
    Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::SorapoolError;
use crate::jobs::DEFAULT_GROUP;
use crate::server::router::AppState;

fn normalize_group(group_title: Option<&str>) -> String {
    group_title
        .map(str::trim)
        .filter(|group| !group.is_empty())
        .unwrap_or(DEFAULT_GROUP)
        .to_string()
}

#[derive(Debug, Deserialize)]
pub(super) struct ScanRequest {
    group_title: Option<String>,
    profile_ids: Option<Vec<i64>>,
    #[serde(default = "default_with_fallback")]
    with_fallback: bool,
}

fn default_with_fallback() -> bool {
    true
}

/// Synchronous scan of a group (blocks until the run finishes). Background
/// refreshes go through `POST /scans/refresh`.
pub(super) async fn scan_group(
    State(state): State<AppState>,
    Json(request): Json<ScanRequest>,
) -> Result<impl IntoResponse, SorapoolError> {
    let group = normalize_group(request.group_title.as_deref());
    let summary = state
        .scanner
        .scan_group(
            &group,
            request.profile_ids.as_deref(),
            request.with_fallback,
            None,
        )
        .await?;
    Ok(Json(json!({
        "run_id": summary.run_id,
        "group_title": group,
        "total": summary.total,
        "success_count": summary.success_count,
        "failed_count": summary.failed_count,
    })))
}

#[derive(Debug, Deserialize)]
pub(super) struct LatestQuery {
    group_title: Option<String>,
    #[serde(default = "default_with_fallback")]
    with_fallback: bool,
}

pub(super) async fn latest_scan(
    State(state): State<AppState>,
    Query(query): Query<LatestQuery>,
) -> Result<impl IntoResponse, SorapoolError> {
    let group = normalize_group(query.group_title.as_deref());
    match state.scanner.get_latest(&group, query.with_fallback).await? {
        Some((run, results)) => Ok(Json(json!({"run": run, "results": results}))),
        None => Err(SorapoolError::NotFound(format!(
            "分组 {group} 暂无扫描记录"
        ))),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct RefreshRequest {
    group_title: Option<String>,
    #[serde(default = "default_with_fallback")]
    with_fallback: bool,
}

pub(super) async fn start_refresh(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> Result<impl IntoResponse, SorapoolError> {
    let group = normalize_group(request.group_title.as_deref());
    let result = state
        .scanner
        .start_silent_refresh(&group, request.with_fallback)?;
    Ok(Json(result))
}

pub(super) async fn refresh_status(
    State(state): State<AppState>,
    Path(group): Path<String>,
) -> Result<impl IntoResponse, SorapoolError> {
    let group = normalize_group(Some(group.as_str()));
    match state.scanner.registry().current(&group) {
        Some(status) => Ok(Json(status)),
        None => Err(SorapoolError::NotFound(format!(
            "未找到静默更新任务：{group}"
        ))),
    }
}
