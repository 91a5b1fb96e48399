use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_lowercase().as_str() {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "canceled" => Some(JobStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Queue,
    Submit,
    Progress,
    Genid,
    Publish,
    Watermark,
    Done,
}

impl JobPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            JobPhase::Queue => "queue",
            JobPhase::Submit => "submit",
            JobPhase::Progress => "progress",
            JobPhase::Genid => "genid",
            JobPhase::Publish => "publish",
            JobPhase::Watermark => "watermark",
            JobPhase::Done => "done",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_lowercase().as_str() {
            "queue" => Some(JobPhase::Queue),
            "submit" => Some(JobPhase::Submit),
            "progress" => Some(JobPhase::Progress),
            "genid" => Some(JobPhase::Genid),
            "publish" => Some(JobPhase::Publish),
            "watermark" => Some(JobPhase::Watermark),
            "done" => Some(JobPhase::Done),
            _ => None,
        }
    }

    /// The canonical phase sequence. `done` is terminal; resets happen only
    /// through the explicit retry operations, never through patches.
    pub fn transition_allowed(from: JobPhase, to: JobPhase) -> bool {
        use JobPhase::{Done, Genid, Progress, Publish, Queue, Submit, Watermark};
        from == to
            || matches!(
                (from, to),
                (Queue, Submit)
                    | (Submit, Progress)
                    | (Progress, Genid)
                    | (Genid, Publish)
                    | (Publish, Watermark)
                    | (Watermark, Done)
            )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct JobRecord {
    #[serde(rename = "job_id")]
    pub id: i64,
    pub profile_id: i64,
    pub window_name: Option<String>,
    pub group_title: String,
    pub prompt: String,
    pub image_url: Option<String>,
    pub duration: String,
    pub aspect_ratio: String,
    pub status: String,
    pub phase: String,
    pub progress_pct: f64,
    pub dispatch_mode: String,
    pub dispatch_score: Option<f64>,
    pub dispatch_quantity_score: Option<f64>,
    pub dispatch_quality_score: Option<f64>,
    pub dispatch_reason: Option<String>,
    pub task_id: Option<String>,
    pub generation_id: Option<String>,
    pub publish_url: Option<String>,
    pub publish_post_id: Option<String>,
    pub publish_permalink: Option<String>,
    pub watermark_status: Option<String>,
    pub watermark_url: Option<String>,
    pub watermark_error: Option<String>,
    pub watermark_attempts: i64,
    pub watermark_started_at: Option<DateTime<Utc>>,
    pub watermark_finished_at: Option<DateTime<Utc>>,
    pub retry_of_job_id: Option<i64>,
    pub retry_root_job_id: Option<i64>,
    pub retry_index: i64,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Set transiently when `follow_retry` resolution substituted a newer
    /// chain member for the requested job. Never persisted.
    #[sqlx(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_from_job_id: Option<i64>,
}

impl JobRecord {
    pub fn status_enum(&self) -> JobStatus {
        JobStatus::parse(&self.status).unwrap_or(JobStatus::Queued)
    }

    pub fn phase_enum(&self) -> JobPhase {
        JobPhase::parse(&self.phase).unwrap_or(JobPhase::Queue)
    }

    /// Root of this job's retry chain (self-rooted when never retried).
    pub fn root_id(&self) -> i64 {
        self.retry_root_job_id.unwrap_or(self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct JobEventRecord {
    pub id: i64,
    pub job_id: i64,
    pub phase: String,
    pub event: String,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Join of a `fail` event with its job's profile, consumed by the dispatcher
/// quality scoring.
#[derive(Debug, Clone, FromRow)]
pub struct FailEventRow {
    pub profile_id: i64,
    pub phase: String,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct ScanRunRecord {
    #[serde(rename = "run_id")]
    pub id: i64,
    pub group_title: String,
    pub total: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub fallback_applied_count: i64,
    pub scanned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, FromRow)]
pub struct ScanResultRecord {
    pub id: i64,
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
    pub scanned_at: DateTime<Utc>,

    /// Set by `GetLatest(with_fallback)` when missing fields were filled
    /// from an older successful row. Never persisted.
    #[sqlx(default)]
    #[serde(default)]
    pub fallback_applied: bool,
}

/// Listing filter for jobs (ingress listing and the stream service).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub group_title: Option<String>,
    pub profile_id: Option<i64>,
    pub status: Option<String>,
    pub phase: Option<String>,
    pub keyword: Option<String>,
    pub limit: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_graph_allows_only_forward_edges() {
        use JobPhase::*;
        assert!(JobPhase::transition_allowed(Queue, Submit));
        assert!(JobPhase::transition_allowed(Submit, Progress));
        assert!(JobPhase::transition_allowed(Progress, Genid));
        assert!(JobPhase::transition_allowed(Genid, Publish));
        assert!(JobPhase::transition_allowed(Publish, Watermark));
        assert!(JobPhase::transition_allowed(Watermark, Done));
        assert!(JobPhase::transition_allowed(Progress, Progress));

        assert!(!JobPhase::transition_allowed(Done, Queue));
        assert!(!JobPhase::transition_allowed(Genid, Submit));
        assert!(!JobPhase::transition_allowed(Queue, Publish));
    }

    #[test]
    fn status_parse_roundtrip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Canceled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert!(JobStatus::Completed.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert_eq!(JobStatus::parse("nope"), None);
    }
}
