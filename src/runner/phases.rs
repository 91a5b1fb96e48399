use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::RunnerConfig;
use crate::db::{DbActorHandle, JobPatch, JobPhase, JobRecord};
use crate::error::{IsRetryable, SorapoolError};
use crate::jobs::{JobService, RetryTrigger};
use crate::runner::watermark::{WatermarkService, is_fallback_candidate};
use crate::runner::{SurfaceFactory, TaskPoll, VideoSurface};
use crate::upstream;

/// Progress percentage cap while the upstream is still rendering; the
/// remaining headroom belongs to publish/watermark.
const PROGRESS_CAP_PCT: f64 = 80.0;

/// Executes one job end-to-end. Phase state lives in the store; the engine
/// only decides which contract to run next, so a re-queued job resumes from
/// its persisted phase with the identifiers it already captured.
pub struct JobEngine {
    db: DbActorHandle,
    jobs: JobService,
    factory: Arc<dyn SurfaceFactory>,
    watermark: WatermarkService,
    cfg: RunnerConfig,
}

impl JobEngine {
    pub fn new(
        db: DbActorHandle,
        jobs: JobService,
        factory: Arc<dyn SurfaceFactory>,
        watermark: WatermarkService,
        cfg: RunnerConfig,
    ) -> Self {
        Self {
            db,
            jobs,
            factory,
            watermark,
            cfg,
        }
    }

    /// Entry point for the worker pool. Never panics the worker: failures
    /// are written to the store, cancellations terminate silently.
    pub async fn run(&self, job_id: i64) {
        match self.run_inner(job_id).await {
            Ok(()) => {}
            Err(SorapoolError::Canceled) => {
                info!(job_id, "job canceled, runner stopped cleanly");
            }
            Err(err) => self.handle_failure(job_id, err).await,
        }
    }

    /// Store-side cancellation flag, observed at every suspension point.
    async fn bail_if_canceled(&self, job_id: i64) -> Result<(), SorapoolError> {
        match self.db.get_job(job_id).await? {
            Some(row) if row.status == "canceled" => Err(SorapoolError::Canceled),
            Some(_) => Ok(()),
            None => Err(SorapoolError::NotFound(format!("未找到任务：{job_id}"))),
        }
    }

    async fn run_inner(&self, job_id: i64) -> Result<(), SorapoolError> {
        let Some(row) = self.db.get_job(job_id).await? else {
            return Ok(());
        };
        if row.status == "canceled" {
            return Ok(());
        }
        if row.status_enum().is_terminal() {
            warn!(job_id, status = %row.status, "terminal job reached the queue, skipping");
            return Ok(());
        }

        let mut phase = row.phase_enum();
        if phase == JobPhase::Queue {
            phase = JobPhase::Submit;
        }
        let started_at = row.started_at.unwrap_or_else(Utc::now);

        self.db
            .update_job(
                job_id,
                JobPatch {
                    status: Some("running".to_string()),
                    phase: Some(phase.as_str().to_string()),
                    started_at: Some(started_at),
                    error: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        // The watermark step announces itself; earlier phases get the
        // generic start marker.
        if phase != JobPhase::Watermark {
            self.db
                .append_event(job_id, phase.as_str(), "start", Some("开始执行".to_string()))
                .await?;
        }

        let mut task_id = row.task_id.clone();
        let mut generation_id = row.generation_id.clone();
        let mut surface: Option<Box<dyn VideoSurface>> = None;

        let outcome = self
            .drive(job_id, &row, phase, &mut task_id, &mut generation_id, &mut surface)
            .await;

        if let Some(mut surface) = surface {
            surface.close().await;
        }
        outcome
    }

    async fn attach_surface<'a>(
        &self,
        slot: &'a mut Option<Box<dyn VideoSurface>>,
        row: &JobRecord,
    ) -> Result<&'a mut Box<dyn VideoSurface>, SorapoolError> {
        if slot.is_none() {
            *slot = Some(self.factory.create(row).await?);
        }
        Ok(slot.as_mut().expect("surface just attached"))
    }

    #[allow(clippy::too_many_lines)]
    async fn drive(
        &self,
        job_id: i64,
        row: &JobRecord,
        mut phase: JobPhase,
        task_id: &mut Option<String>,
        generation_id: &mut Option<String>,
        surface_slot: &mut Option<Box<dyn VideoSurface>>,
    ) -> Result<(), SorapoolError> {
        if phase == JobPhase::Submit {
            self.bail_if_canceled(job_id).await?;
            let surface = self.attach_surface(surface_slot, row).await?;
            self.bail_if_canceled(job_id).await?;

            let tid = surface.submit(row).await?;
            *task_id = Some(tid.clone());
            self.db
                .update_job(
                    job_id,
                    JobPatch {
                        task_id: Some(tid),
                        phase: Some("progress".to_string()),
                        progress_pct: Some(5.0),
                        ..Default::default()
                    },
                )
                .await?;
            self.db
                .append_event(job_id, "submit", "finish", Some("提交完成".to_string()))
                .await?;
            self.db
                .append_event(job_id, "progress", "start", Some("开始轮询生成进度".to_string()))
                .await?;
            phase = JobPhase::Progress;
        }

        if phase == JobPhase::Progress {
            let tid = task_id
                .clone()
                .ok_or_else(|| SorapoolError::Service("缺少 task_id，无法进入进度阶段".to_string()))?;
            let surface = self.attach_surface(surface_slot, row).await?;
            self.poll_progress(job_id, surface.as_mut(), &tid).await?;
            phase = JobPhase::Genid;
        }

        if phase == JobPhase::Genid {
            let tid = task_id
                .clone()
                .ok_or_else(|| SorapoolError::Service("缺少 task_id，无法获取 genid".to_string()))?;
            self.db
                .update_job(
                    job_id,
                    JobPatch {
                        phase: Some("genid".to_string()),
                        ..Default::default()
                    },
                )
                .await?;
            self.db
                .append_event(job_id, "genid", "start", Some("开始获取 genid".to_string()))
                .await?;

            if generation_id.is_none() {
                let surface = self.attach_surface(surface_slot, row).await?;
                *generation_id = Some(
                    self.wait_generation_id(job_id, surface.as_mut(), &tid)
                        .await?,
                );
            }
            self.db
                .update_job(
                    job_id,
                    JobPatch {
                        generation_id: generation_id.clone(),
                        ..Default::default()
                    },
                )
                .await?;
            self.db
                .append_event(job_id, "genid", "finish", Some("已获取 genid".to_string()))
                .await?;
            phase = JobPhase::Publish;
        }

        if phase == JobPhase::Publish {
            let gid = generation_id
                .clone()
                .ok_or_else(|| SorapoolError::Service("缺少 genid，无法发布".to_string()))?;
            self.db
                .update_job(
                    job_id,
                    JobPatch {
                        phase: Some("publish".to_string()),
                        ..Default::default()
                    },
                )
                .await?;
            self.db
                .append_event(job_id, "publish", "start", Some("开始发布".to_string()))
                .await?;
            self.bail_if_canceled(job_id).await?;

            let surface = self.attach_surface(surface_slot, row).await?;
            let publish_url = surface.publish(row, &gid).await?;
            if !upstream::is_valid_publish_url(&publish_url) {
                return Err(SorapoolError::Service(format!(
                    "发布链接格式异常：{publish_url}"
                )));
            }

            self.db
                .update_job(
                    job_id,
                    JobPatch {
                        publish_url: Some(publish_url.clone()),
                        publish_post_id: upstream::extract_share_id(&publish_url),
                        publish_permalink: upstream::normalize_publish_permalink(&publish_url),
                        phase: Some("watermark".to_string()),
                        progress_pct: Some(90.0),
                        watermark_status: Some(Some("queued".to_string())),
                        watermark_attempts: Some(0),
                        ..Default::default()
                    },
                )
                .await?;
            self.db
                .append_event(job_id, "publish", "finish", Some("发布完成".to_string()))
                .await?;

            // The browser is no longer needed past this point.
            if let Some(mut surface) = surface_slot.take() {
                surface.close().await;
            }
            phase = JobPhase::Watermark;
        }

        if phase == JobPhase::Watermark {
            let current = self
                .db
                .get_job(job_id)
                .await?
                .ok_or_else(|| SorapoolError::NotFound(format!("未找到任务：{job_id}")))?;
            let publish_url = current
                .publish_url
                .as_deref()
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .ok_or_else(|| SorapoolError::Service("缺少分享链接，无法去水印".to_string()))?
                .to_string();
            self.bail_if_canceled(job_id).await?;

            match self.watermark.run(job_id, &publish_url).await {
                Ok(watermark_url) => {
                    self.complete_after_watermark(job_id, &watermark_url).await?;
                }
                Err(err) => {
                    let reason = err.to_string();
                    if self.watermark.fallback_on_failure() && is_fallback_candidate(&reason) {
                        self.complete_with_publish_fallback(job_id, &publish_url, &reason)
                            .await?;
                    } else {
                        return Err(err);
                    }
                }
            }
            return Ok(());
        }

        if phase == JobPhase::Done {
            self.db
                .update_job(
                    job_id,
                    JobPatch {
                        status: Some("completed".to_string()),
                        phase: Some("done".to_string()),
                        progress_pct: Some(100.0),
                        finished_at: Some(Some(Utc::now())),
                        ..Default::default()
                    },
                )
                .await?;
        }

        Ok(())
    }

    /// Poll `pending/v2` + drafts until the task completes, fails, or the
    /// phase budget runs out. Progress tracks elapsed time, capped at 80.
    async fn poll_progress(
        &self,
        job_id: i64,
        surface: &mut dyn VideoSurface,
        task_id: &str,
    ) -> Result<(), SorapoolError> {
        let budget = Duration::from_secs(self.cfg.progress_timeout_secs.max(1));
        let poll_interval = Duration::from_secs(self.cfg.progress_poll_secs.max(1));
        let started = tokio::time::Instant::now();

        loop {
            self.bail_if_canceled(job_id).await?;

            match surface.poll_task(task_id).await {
                Ok(TaskPoll::Completed) => return Ok(()),
                Ok(TaskPoll::Failed(reason)) => return Err(SorapoolError::Service(reason)),
                Ok(TaskPoll::Processing) => {}
                // Transport hiccups don't kill a 20-minute render; anything
                // the transport layer won't retry is a real failure.
                Err(err) if err.is_retryable() => {
                    warn!(job_id, %err, "progress poll failed, keeping at it");
                }
                Err(err) => return Err(err),
            }

            let elapsed = started.elapsed();
            if elapsed >= budget {
                return Err(SorapoolError::Service(format!(
                    "生成超时（{}分钟）",
                    self.cfg.progress_timeout_secs / 60
                )));
            }

            let pct =
                (elapsed.as_secs_f64() / budget.as_secs_f64() * 100.0).min(PROGRESS_CAP_PCT);
            self.db
                .update_job(
                    job_id,
                    JobPatch {
                        progress_pct: Some(pct),
                        ..Default::default()
                    },
                )
                .await?;

            tokio::time::sleep(poll_interval).await;
        }
    }

    /// The generation id shows up in the request hooks installed during
    /// submit; keep probing until the budget runs out.
    async fn wait_generation_id(
        &self,
        job_id: i64,
        surface: &mut dyn VideoSurface,
        task_id: &str,
    ) -> Result<String, SorapoolError> {
        let budget = Duration::from_secs(self.cfg.genid_timeout_secs.max(1));
        let poll_interval = Duration::from_secs(self.cfg.progress_poll_secs.max(1));
        let started = tokio::time::Instant::now();

        loop {
            self.bail_if_canceled(job_id).await?;

            if let Some(generation_id) = surface.generation_id(task_id).await? {
                return Ok(generation_id);
            }
            if started.elapsed() >= budget {
                return Err(SorapoolError::Service(
                    "20分钟内未捕获generation_id".to_string(),
                ));
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn complete_after_watermark(
        &self,
        job_id: i64,
        watermark_url: &str,
    ) -> Result<(), SorapoolError> {
        let now = Utc::now();
        self.db
            .update_job(
                job_id,
                JobPatch {
                    watermark_url: Some(Some(watermark_url.to_string())),
                    watermark_status: Some(Some("completed".to_string())),
                    watermark_finished_at: Some(Some(now)),
                    status: Some("completed".to_string()),
                    phase: Some("done".to_string()),
                    progress_pct: Some(100.0),
                    finished_at: Some(Some(now)),
                    ..Default::default()
                },
            )
            .await?;
        self.db
            .append_event(job_id, "watermark", "finish", Some("去水印完成".to_string()))
            .await?;
        info!(job_id, "job completed");
        Ok(())
    }

    /// Watermark failed but fallback is on: the job still completes, with
    /// the share URL standing in and the failure reason recorded.
    async fn complete_with_publish_fallback(
        &self,
        job_id: i64,
        publish_url: &str,
        reason: &str,
    ) -> Result<(), SorapoolError> {
        let now = Utc::now();
        self.db
            .update_job(
                job_id,
                JobPatch {
                    watermark_url: Some(Some(publish_url.to_string())),
                    watermark_status: Some(Some("fallback".to_string())),
                    watermark_error: Some(Some(reason.to_string())),
                    watermark_finished_at: Some(Some(now)),
                    status: Some("completed".to_string()),
                    phase: Some("done".to_string()),
                    progress_pct: Some(100.0),
                    error: Some(None),
                    finished_at: Some(Some(now)),
                    ..Default::default()
                },
            )
            .await?;
        self.db
            .append_event(
                job_id,
                "watermark",
                "fallback",
                Some(format!("去水印失败，回退分享链接: {reason}")),
            )
            .await?;
        info!(job_id, "job completed via watermark fallback");
        Ok(())
    }

    /// Record the failure against the phase it happened in, then run the
    /// heavy-load auto-retry policy when it applies (submit phase only).
    async fn handle_failure(&self, job_id: i64, err: SorapoolError) {
        let failed_phase = match self.db.get_job(job_id).await {
            Ok(Some(row)) => row.phase.clone(),
            _ => "submit".to_string(),
        };

        let patch = JobPatch {
            status: Some("failed".to_string()),
            error: Some(Some(err.to_string())),
            finished_at: Some(Some(Utc::now())),
            ..Default::default()
        };
        if let Err(db_err) = self.db.update_job(job_id, patch).await {
            warn!(job_id, %db_err, "failed to persist job failure");
            return;
        }
        let _ = self
            .db
            .append_event(job_id, &failed_phase, "fail", Some(err.to_string()))
            .await;

        warn!(job_id, phase = %failed_phase, %err, "job failed");

        if failed_phase == "submit" && err.is_overload() {
            let row = match self.db.get_job(job_id).await {
                Ok(Some(row)) => row,
                _ => return,
            };
            match self.jobs.spawn_retry_on_overload(&row, RetryTrigger::Auto).await {
                Ok(child) => info!(
                    job_id,
                    child_job_id = child.record.id,
                    "heavy-load auto retry spawned"
                ),
                Err(retry_err) => {
                    let _ = self
                        .db
                        .append_event(
                            job_id,
                            &failed_phase,
                            "auto_retry_giveup",
                            Some(retry_err.to_string()),
                        )
                        .await;
                }
            }
        }
    }
}
