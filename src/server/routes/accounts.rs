use axum::{
    Json,
    extract::{Query, State},
    response::IntoResponse,
};
use serde::Deserialize;

use crate::error::SorapoolError;
use crate::jobs::DEFAULT_GROUP;
use crate::server::router::AppState;

#[derive(Debug, Deserialize)]
pub(super) struct WeightsQuery {
    group_title: Option<String>,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    100
}

pub(super) async fn list_weights(
    State(state): State<AppState>,
    Query(query): Query<WeightsQuery>,
) -> Result<impl IntoResponse, SorapoolError> {
    let group = query
        .group_title
        .as_deref()
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .unwrap_or(DEFAULT_GROUP);
    let weights = state.dispatch.list_weights(group, query.limit).await?;
    Ok(Json(weights))
}
