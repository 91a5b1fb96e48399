//! Job service façade: request validation, dispatch, retry/cancel rules,
//! and the queue feeding the runner pool. All state lives in the store;
//! this layer only orchestrates.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use crate::broker::{BrokerAdapter, ProxyBinding};
use crate::config::RunnerConfig;
use crate::db::{DbActorHandle, JobCreate, JobEventRecord, JobFilter, JobPatch, JobRecord};
use crate::dispatch::DispatchService;
use crate::error::SorapoolError;
use crate::runner::{WatermarkResolver, watermark::is_fallback_candidate};
use crate::upstream;

pub const DEFAULT_GROUP: &str = "Sora";
const MAX_PROMPT_CHARS: usize = 4000;

/// What the retry chain spawn was triggered by; reflected in event names
/// (`auto_retry_new_job` vs `retry_new_job`) and reason text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryTrigger {
    Auto,
    Manual,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateJobRequest {
    pub prompt: String,
    #[serde(default)]
    pub image_url: Option<String>,
    pub duration: String,
    pub aspect_ratio: String,
    #[serde(default)]
    pub group_title: Option<String>,
    #[serde(default)]
    pub dispatch_mode: Option<String>,
    #[serde(default)]
    pub profile_id: Option<i64>,
}

/// A job row enriched with its profile's cached proxy binding.
#[derive(Debug, Clone, Serialize)]
pub struct JobOut {
    #[serde(flatten)]
    pub record: JobRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyBinding>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatermarkParseOut {
    pub share_url: String,
    pub share_id: String,
    pub watermark_url: String,
}

#[derive(Clone)]
pub struct JobService {
    db: DbActorHandle,
    dispatch: DispatchService,
    broker: BrokerAdapter,
    queue_tx: mpsc::Sender<i64>,
    runner_cfg: RunnerConfig,
    watermark_resolver: Arc<dyn WatermarkResolver>,
    watermark_retry_max: u32,
}

impl JobService {
    pub fn new(
        db: DbActorHandle,
        dispatch: DispatchService,
        broker: BrokerAdapter,
        queue_tx: mpsc::Sender<i64>,
        runner_cfg: RunnerConfig,
        watermark_resolver: Arc<dyn WatermarkResolver>,
        watermark_retry_max: u32,
    ) -> Self {
        Self {
            db,
            dispatch,
            broker,
            queue_tx,
            runner_cfg,
            watermark_resolver,
            watermark_retry_max: watermark_retry_max.min(10),
        }
    }

    pub fn db(&self) -> &DbActorHandle {
        &self.db
    }

    async fn enqueue(&self, job_id: i64) {
        // A full queue only delays pickup: the runner re-reads queued rows
        // at startup, so dropping here is acceptable backpressure.
        let _ = self.queue_tx.send(job_id).await;
    }

    fn job_out(&self, record: JobRecord) -> JobOut {
        let proxy = self.broker.cached_proxy_binding(record.profile_id);
        JobOut { record, proxy }
    }

    async fn require_job(&self, job_id: i64) -> Result<JobRecord, SorapoolError> {
        self.db
            .get_job(job_id)
            .await?
            .ok_or_else(|| SorapoolError::NotFound(format!("未找到任务：{job_id}")))
    }

    pub async fn create_job(&self, request: CreateJobRequest) -> Result<JobOut, SorapoolError> {
        let prompt = request.prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(SorapoolError::Service("提示词不能为空".to_string()));
        }
        if prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(SorapoolError::Service(
                "提示词过长（最多 4000 字符）".to_string(),
            ));
        }
        if upstream::duration_to_frames(&request.duration).is_none() {
            return Err(SorapoolError::Service(
                "时长仅支持：10s、15s、25s".to_string(),
            ));
        }
        if !upstream::is_supported_aspect_ratio(&request.aspect_ratio) {
            return Err(SorapoolError::Service(
                "比例仅支持：landscape、portrait".to_string(),
            ));
        }

        let image_url = request
            .image_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(ToString::to_string);
        let group_title = request
            .group_title
            .as_deref()
            .map(str::trim)
            .filter(|group| !group.is_empty())
            .unwrap_or(DEFAULT_GROUP)
            .to_string();

        let dispatch_mode = match request
            .dispatch_mode
            .as_deref()
            .map(str::trim)
            .map(str::to_lowercase)
            .filter(|mode| !mode.is_empty())
        {
            Some(mode) => mode,
            None if request.profile_id.is_some() => "manual".to_string(),
            None => "weighted_auto".to_string(),
        };

        let (profile_id, window_name, scores, dispatch_reason) = match dispatch_mode.as_str() {
            "manual" => {
                let profile_id = request
                    .profile_id
                    .ok_or_else(|| SorapoolError::Service("手动模式缺少窗口 ID".to_string()))?;
                let window = self
                    .broker
                    .find_window(&group_title, profile_id)
                    .await?
                    .ok_or_else(|| {
                        SorapoolError::NotFound(format!(
                            "窗口 {profile_id} 不在 {group_title} 分组中"
                        ))
                    })?;
                let name = Some(window.name)
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| format!("窗口-{profile_id}"));
                (
                    profile_id,
                    name,
                    (None, None, None),
                    format!("手动指定 profile={profile_id}"),
                )
            }
            "weighted_auto" => {
                let weight = self.dispatch.pick_best(&group_title, None).await?;
                let name = match weight.window_name.clone() {
                    Some(name) => name,
                    None => {
                        let window = self
                            .broker
                            .find_window(&group_title, weight.profile_id)
                            .await?
                            .ok_or_else(|| {
                                SorapoolError::NotFound(format!(
                                    "自动分配失败，窗口 {} 不在 {group_title} 分组中",
                                    weight.profile_id
                                ))
                            })?;
                        Some(window.name)
                            .filter(|n| !n.trim().is_empty())
                            .unwrap_or_else(|| format!("窗口-{}", weight.profile_id))
                    }
                };
                let reason = if weight.reasons.is_empty() {
                    "自动分配".to_string()
                } else {
                    weight.reasons.join(" | ")
                };
                (
                    weight.profile_id,
                    name,
                    (
                        Some(weight.score_total),
                        Some(weight.score_quantity),
                        Some(weight.score_quality),
                    ),
                    reason,
                )
            }
            _ => {
                return Err(SorapoolError::Service(
                    "dispatch_mode 必须是 manual 或 weighted_auto".to_string(),
                ));
            }
        };

        let job_id = self
            .db
            .create_job(JobCreate {
                profile_id,
                window_name: Some(window_name),
                group_title: group_title.clone(),
                prompt,
                image_url,
                duration: request.duration.trim().to_string(),
                aspect_ratio: request.aspect_ratio.trim().to_string(),
                dispatch_mode: dispatch_mode.clone(),
                dispatch_score: scores.0,
                dispatch_quantity_score: scores.1,
                dispatch_quality_score: scores.2,
                dispatch_reason: Some(dispatch_reason.clone()),
                retry_of_job_id: None,
                retry_root_job_id: None,
                retry_index: 0,
            })
            .await?;

        self.db
            .append_event(job_id, "dispatch", "select", Some(dispatch_reason))
            .await?;
        self.db
            .append_event(job_id, "queue", "queue", Some("进入队列".to_string()))
            .await?;
        self.enqueue(job_id).await;

        info!(
            job_id,
            mode = %dispatch_mode,
            group = %group_title,
            profile = profile_id,
            "job created"
        );

        let record = self.require_job(job_id).await?;
        Ok(self.job_out(record))
    }

    /// Fetch a job; with `follow_retry`, resolve to the newest member of its
    /// retry chain and mark where the resolution started.
    pub async fn get_job(&self, job_id: i64, follow_retry: bool) -> Result<JobOut, SorapoolError> {
        let row = self.require_job(job_id).await?;
        if !follow_retry {
            return Ok(self.job_out(row));
        }

        let root = row.root_id();
        match self.db.latest_by_root(root).await? {
            Some(mut latest) if latest.id != row.id => {
                latest.resolved_from_job_id = Some(job_id);
                Ok(self.job_out(latest))
            }
            _ => Ok(self.job_out(row)),
        }
    }

    pub async fn list_jobs(&self, mut filter: JobFilter) -> Result<Vec<JobOut>, SorapoolError> {
        filter.limit = filter.limit.clamp(1, 200);
        let rows = self.db.list_jobs(filter).await?;
        Ok(rows.into_iter().map(|row| self.job_out(row)).collect())
    }

    pub async fn list_events(&self, job_id: i64) -> Result<Vec<JobEventRecord>, SorapoolError> {
        self.require_job(job_id).await?;
        self.db.list_job_events(job_id).await
    }

    /// Spawn a replacement job on another profile after a heavy-load submit
    /// failure. The failed row is never mutated; retries chain through
    /// `retry_of_job_id` / `retry_root_job_id`.
    pub async fn spawn_retry_on_overload(
        &self,
        row: &JobRecord,
        trigger: RetryTrigger,
    ) -> Result<JobOut, SorapoolError> {
        if row.status_enum() != crate::db::JobStatus::Failed {
            return Err(SorapoolError::Service(
                "仅失败任务允许换号重试".to_string(),
            ));
        }
        let error_text = row.error.as_deref().unwrap_or_default();
        if row.phase != "submit" || !SorapoolError::text_is_overload(error_text) {
            return Err(SorapoolError::Service(
                "仅 submit 阶段 heavy load 允许换号重试".to_string(),
            ));
        }

        let root_job_id = row.root_id();
        let max_idx = self.db.max_retry_index(root_job_id).await?;
        let attempts_so_far = max_idx + 1;
        let max_attempts = i64::from(self.runner_cfg.heavy_load_attempt_cap());
        if attempts_so_far >= max_attempts {
            return Err(SorapoolError::Service(format!(
                "换号重试已达上限（总尝试{max_attempts}次）"
            )));
        }

        // Idempotency probe: one child per failed job, shared by the auto
        // and manual paths.
        if let Some(child) = self.db.latest_retry_child(row.id).await? {
            return Ok(self.job_out(child));
        }

        let mut exclude: Vec<i64> = self.db.retry_chain_profile_ids(root_job_id).await?;
        if row.profile_id > 0 && !exclude.contains(&row.profile_id) {
            exclude.push(row.profile_id);
        }
        exclude.sort_unstable();

        let group_title = Some(row.group_title.trim())
            .filter(|group| !group.is_empty())
            .unwrap_or(DEFAULT_GROUP)
            .to_string();
        let weight = self
            .dispatch
            .pick_best(&group_title, Some(&exclude))
            .await?;

        let window_name = match weight.window_name.clone() {
            Some(name) => name,
            None => self
                .broker
                .find_window(&group_title, weight.profile_id)
                .await?
                .map(|w| w.name)
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| format!("窗口-{}", weight.profile_id)),
        };

        let trigger_text = match trigger {
            RetryTrigger::Auto => "自动",
            RetryTrigger::Manual => "手动",
        };
        let reason_base = if weight.reasons.is_empty() {
            "自动分配".to_string()
        } else {
            weight.reasons.join(" | ")
        };
        let dispatch_reason = format!(
            "{reason_base} | heavy load {trigger_text}换号重试（from job #{} profile={}）",
            row.id, row.profile_id
        );

        let new_job_id = self
            .db
            .create_job(JobCreate {
                profile_id: weight.profile_id,
                window_name: Some(window_name),
                group_title,
                prompt: row.prompt.clone(),
                image_url: row.image_url.clone(),
                duration: row.duration.clone(),
                aspect_ratio: row.aspect_ratio.clone(),
                dispatch_mode: "weighted_auto".to_string(),
                dispatch_score: Some(weight.score_total),
                dispatch_quantity_score: Some(weight.score_quantity),
                dispatch_quality_score: Some(weight.score_quality),
                dispatch_reason: Some(dispatch_reason.clone()),
                retry_of_job_id: Some(row.id),
                retry_root_job_id: Some(root_job_id),
                retry_index: max_idx + 1,
            })
            .await?;

        let old_event = match trigger {
            RetryTrigger::Auto => "auto_retry_new_job",
            RetryTrigger::Manual => "retry_new_job",
        };
        self.db
            .append_event(
                row.id,
                &row.phase,
                old_event,
                Some(format!(
                    "heavy load {trigger_text}换号重试 -> Job #{new_job_id} profile={}",
                    weight.profile_id
                )),
            )
            .await?;
        self.db
            .append_event(new_job_id, "dispatch", "select", Some(dispatch_reason))
            .await?;
        self.db
            .append_event(new_job_id, "queue", "queue", Some("进入队列".to_string()))
            .await?;
        self.enqueue(new_job_id).await;

        info!(
            old_job_id = row.id,
            new_job_id,
            from_profile = row.profile_id,
            to_profile = weight.profile_id,
            "heavy-load retry spawned"
        );

        let record = self.require_job(new_job_id).await?;
        Ok(self.job_out(record))
    }

    /// Manual retry. Heavy-load submit failures route through the spawn
    /// path; everything else re-queues the same row in place, preserving
    /// the upstream identifiers so later phases can resume.
    pub async fn retry_job(&self, job_id: i64) -> Result<JobOut, SorapoolError> {
        let row = self.require_job(job_id).await?;
        match row.status.as_str() {
            "running" => return Err(SorapoolError::Service("任务正在执行中".to_string())),
            "completed" => {
                return Err(SorapoolError::Service("任务已完成，无需重试".to_string()));
            }
            "canceled" => {
                return Err(SorapoolError::Service("任务已取消，无法重试".to_string()));
            }
            "failed" => {}
            _ => return Err(SorapoolError::Service("任务未失败，无法重试".to_string())),
        }

        let error_text = row.error.as_deref().unwrap_or_default();
        if row.phase == "submit" && SorapoolError::text_is_overload(error_text) {
            return self.spawn_retry_on_overload(&row, RetryTrigger::Manual).await;
        }

        let mut patch = JobPatch {
            status: Some("queued".to_string()),
            error: Some(None),
            finished_at: Some(None),
            ..Default::default()
        };
        if matches!(row.phase.as_str(), "submit" | "progress") {
            patch.progress_reset = Some(0.0);
        }
        self.db.update_job(job_id, patch).await?;
        self.db
            .append_event(job_id, &row.phase, "retry", Some("手动重试".to_string()))
            .await?;
        self.enqueue(job_id).await;

        let record = self.require_job(job_id).await?;
        Ok(self.job_out(record))
    }

    /// Re-run only the watermark step of a job whose watermark failed.
    pub async fn retry_watermark(&self, job_id: i64) -> Result<JobOut, SorapoolError> {
        let row = self.require_job(job_id).await?;
        if row
            .publish_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .is_none()
        {
            return Err(SorapoolError::Service(
                "缺少分享链接，无法去水印".to_string(),
            ));
        }

        if row.watermark_status.as_deref() != Some("failed") {
            return Err(SorapoolError::Service(
                "去水印未失败，无法重试".to_string(),
            ));
        }

        self.db
            .update_job(
                job_id,
                JobPatch {
                    status: Some("queued".to_string()),
                    phase: Some("watermark".to_string()),
                    progress_pct: Some(90.0),
                    watermark_status: Some(Some("queued".to_string())),
                    watermark_url: Some(None),
                    watermark_error: Some(None),
                    watermark_attempts: Some(0),
                    watermark_started_at: Some(None),
                    watermark_finished_at: Some(None),
                    error: Some(None),
                    finished_at: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        self.db
            .append_event(job_id, "watermark", "retry", Some("手动重试".to_string()))
            .await?;
        self.enqueue(job_id).await;

        let record = self.require_job(job_id).await?;
        Ok(self.job_out(record))
    }

    /// Cancel a non-terminal job. Runners observe the flag at their next
    /// suspension point; fields set before the cancel (publish_url included)
    /// are left as they are.
    pub async fn cancel_job(&self, job_id: i64) -> Result<JobOut, SorapoolError> {
        let row = self.require_job(job_id).await?;
        if row.status_enum().is_terminal() {
            return Err(SorapoolError::Service("任务已结束，无法取消".to_string()));
        }

        self.db
            .update_job(
                job_id,
                JobPatch {
                    status: Some("canceled".to_string()),
                    error: Some(Some("任务已取消".to_string())),
                    finished_at: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await?;
        self.db
            .append_event(job_id, &row.phase, "cancel", Some("任务已取消".to_string()))
            .await?;

        let record = self.require_job(job_id).await?;
        Ok(self.job_out(record))
    }

    /// Resolve a share URL to a de-watermarked link without a job
    /// (`POST watermark/parse`).
    pub async fn parse_watermark_link(
        &self,
        share_url: &str,
    ) -> Result<WatermarkParseOut, SorapoolError> {
        let text = share_url.trim();
        if text.is_empty() {
            return Err(SorapoolError::Service("请输入 Sora 分享链接".to_string()));
        }
        let share_id = upstream::extract_share_id(text)
            .ok_or_else(|| SorapoolError::Service("无效的 Sora 分享链接".to_string()))?;
        let normalized = upstream::normalize_publish_permalink(text)
            .unwrap_or_else(|| format!("https://sora.chatgpt.com/p/{share_id}"));

        let mut last_error: Option<SorapoolError> = None;
        for _attempt in 0..=self.watermark_retry_max {
            match self.watermark_resolver.resolve(&normalized).await {
                Ok(url) if !url.trim().is_empty() => {
                    return Ok(WatermarkParseOut {
                        share_url: normalized,
                        share_id,
                        watermark_url: url,
                    });
                }
                Ok(_) => {
                    last_error = Some(SorapoolError::Service("去水印未返回链接".to_string()));
                }
                Err(err) => {
                    let fatal = !is_fallback_candidate(&err.to_string());
                    last_error = Some(err);
                    if fatal {
                        break;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| SorapoolError::Service("去水印解析失败".to_string())))
    }
}
