use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Insert payload for a new job row. Retry children carry the chain fields;
/// first attempts leave them unset and the store self-roots the row.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobCreate {
    pub profile_id: i64,
    pub window_name: Option<String>,
    pub group_title: String,
    pub prompt: String,
    pub image_url: Option<String>,
    pub duration: String,
    pub aspect_ratio: String,
    pub dispatch_mode: String,
    pub dispatch_score: Option<f64>,
    pub dispatch_quantity_score: Option<f64>,
    pub dispatch_quality_score: Option<f64>,
    pub dispatch_reason: Option<String>,
    pub retry_of_job_id: Option<i64>,
    pub retry_root_job_id: Option<i64>,
    pub retry_index: i64,
}

/// Partial, idempotent job update.
///
/// Plain `Option<T>` fields follow COALESCE semantics (set when `Some`).
/// Double-`Option` fields distinguish "leave alone" (`None`) from "set or
/// clear" (`Some(None)` writes NULL), which the retry operations need to
/// erase errors and finish timestamps.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<String>,
    pub phase: Option<String>,
    /// Monotone: the store clamps against the current value.
    pub progress_pct: Option<f64>,
    /// Explicit reset used by the retry operations; bypasses the clamp.
    pub progress_reset: Option<f64>,
    pub task_id: Option<String>,
    pub generation_id: Option<String>,
    /// Write-once at the store boundary: ignored when already set.
    pub publish_url: Option<String>,
    pub publish_post_id: Option<String>,
    pub publish_permalink: Option<String>,
    pub watermark_status: Option<Option<String>>,
    pub watermark_url: Option<Option<String>>,
    pub watermark_error: Option<Option<String>>,
    pub watermark_attempts: Option<i64>,
    pub watermark_started_at: Option<Option<DateTime<Utc>>>,
    pub watermark_finished_at: Option<Option<DateTime<Utc>>>,
    pub error: Option<Option<String>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScanRunCreate {
    pub group_title: String,
    pub total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScanResultCreate {
    pub run_id: i64,
    pub profile_id: i64,
    pub window_name: Option<String>,
    pub session_status: Option<String>,
    pub account: Option<String>,
    pub account_plan: Option<String>,
    pub quota_remaining: Option<i64>,
    pub quota_total: Option<i64>,
    pub quota_reset_at: Option<DateTime<Utc>>,
    pub session_payload: Option<String>,
    pub proxy_binding: Option<String>,
    pub source: String,
    pub success: bool,
    pub error: Option<String>,
}
