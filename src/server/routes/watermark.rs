use axum::{Json, extract::State, response::IntoResponse};
use serde::Deserialize;

use crate::error::SorapoolError;
use crate::server::router::AppState;

#[derive(Debug, Deserialize)]
pub(super) struct ParseRequest {
    share_url: String,
}

pub(super) async fn parse_link(
    State(state): State<AppState>,
    Json(request): Json<ParseRequest>,
) -> Result<impl IntoResponse, SorapoolError> {
    let parsed = state.jobs.parse_watermark_link(&request.share_url).await?;
    Ok(Json(parsed))
}
