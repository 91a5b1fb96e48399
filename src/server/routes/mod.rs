mod accounts;
mod jobs;
mod scans;
mod watermark;

use crate::server::router::AppState;
use axum::{
    Router,
    routing::{get, post},
};

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(jobs::create_job).get(jobs::list_jobs))
        .route("/jobs/stream", get(jobs::stream_jobs))
        .route("/jobs/{id}", get(jobs::get_job))
        .route("/jobs/{id}/retry", post(jobs::retry_job))
        .route("/jobs/{id}/cancel", post(jobs::cancel_job))
        .route("/jobs/{id}/events", get(jobs::list_job_events))
        .route("/jobs/{id}/watermark/retry", post(jobs::retry_watermark))
        .route("/accounts/weights", get(accounts::list_weights))
        .route("/watermark/parse", post(watermark::parse_link))
        .route("/scans", post(scans::scan_group))
        .route("/scans/latest", get(scans::latest_scan))
        .route("/scans/refresh", post(scans::start_refresh))
        .route("/scans/refresh/{group}", get(scans::refresh_status))
}
