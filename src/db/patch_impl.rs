//! JobPatch -> DbPatchable implementation.
//!
//! This sits in the `db` module because it contains SQL/table knowledge.
//! Phase-graph validation happens in the actor (it needs the current row and
//! may append an audit event); everything else is enforced here in a single
//! UPDATE so concurrent readers never observe a half-applied patch:
//! - `progress_pct` only moves forward unless the patch carries an explicit
//!   reset,
//! - `publish_url` is write-once,
//! - `updated_at` always advances.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::db::patch::JobPatch;
use crate::db::traits::DbPatchable;
use crate::error::SorapoolError;

#[async_trait]
impl DbPatchable for JobPatch {
    async fn apply_patch(&self, job_id: i64, pool: &SqlitePool) -> Result<(), SorapoolError> {
        let JobPatch {
            status,
            phase,
            progress_pct,
            progress_reset,
            task_id,
            generation_id,
            publish_url,
            publish_post_id,
            publish_permalink,
            watermark_status,
            watermark_url,
            watermark_error,
            watermark_attempts,
            watermark_started_at,
            watermark_finished_at,
            error,
            started_at,
            finished_at,
        } = self.clone();

        let updated_at = Utc::now();

        // Use the bind query API to avoid SQLx offline cache requirements.
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET
                status = COALESCE(?, status),
                phase = COALESCE(?, phase),
                progress_pct = CASE
                    WHEN ? THEN ?
                    ELSE MAX(progress_pct, COALESCE(?, progress_pct))
                END,
                task_id = COALESCE(?, task_id),
                generation_id = COALESCE(?, generation_id),
                publish_url = CASE
                    WHEN publish_url IS NOT NULL AND publish_url != '' THEN publish_url
                    ELSE COALESCE(?, publish_url)
                END,
                publish_post_id = COALESCE(?, publish_post_id),
                publish_permalink = COALESCE(?, publish_permalink),
                watermark_status = CASE WHEN ? THEN ? ELSE watermark_status END,
                watermark_url = CASE WHEN ? THEN ? ELSE watermark_url END,
                watermark_error = CASE WHEN ? THEN ? ELSE watermark_error END,
                watermark_attempts = COALESCE(?, watermark_attempts),
                watermark_started_at = CASE WHEN ? THEN ? ELSE watermark_started_at END,
                watermark_finished_at = CASE WHEN ? THEN ? ELSE watermark_finished_at END,
                error = CASE WHEN ? THEN ? ELSE error END,
                started_at = COALESCE(?, started_at),
                finished_at = CASE WHEN ? THEN ? ELSE finished_at END,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(phase)
        .bind(progress_reset.is_some())
        .bind(progress_reset)
        .bind(progress_pct)
        .bind(task_id)
        .bind(generation_id)
        .bind(publish_url)
        .bind(publish_post_id)
        .bind(publish_permalink)
        .bind(watermark_status.is_some())
        .bind(watermark_status.flatten())
        .bind(watermark_url.is_some())
        .bind(watermark_url.flatten())
        .bind(watermark_error.is_some())
        .bind(watermark_error.flatten())
        .bind(watermark_attempts)
        .bind(watermark_started_at.is_some())
        .bind(watermark_started_at.flatten())
        .bind(watermark_finished_at.is_some())
        .bind(watermark_finished_at.flatten())
        .bind(error.is_some())
        .bind(error.flatten())
        .bind(started_at)
        .bind(finished_at.is_some())
        .bind(finished_at.flatten())
        .bind(updated_at)
        .bind(job_id)
        .execute(pool)
        .await?;

        let affected = res.rows_affected();
        debug!(job_id, affected, updated_at = %updated_at, "job patch applied");

        if affected == 0 {
            return Err(SorapoolError::NotFound(format!("未找到任务：{job_id}")));
        }

        Ok(())
    }
}
