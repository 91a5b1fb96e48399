use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::{WatermarkConfig, WatermarkParseMethod};
use crate::db::{DbActorHandle, JobPatch};
use crate::error::SorapoolError;
use crate::upstream::extract_share_id;

pub const WATERMARK_DISABLED_ERROR: &str = "去水印功能已关闭";

/// Resolves a share URL to a post-processed (de-watermarked) media URL.
#[async_trait]
pub trait WatermarkResolver: Send + Sync {
    async fn resolve(&self, publish_url: &str) -> Result<String, SorapoolError>;
}

/// Production resolver: the operator-configured parse endpoint, or the
/// third-party template URL.
pub struct HttpWatermarkResolver {
    cfg: WatermarkConfig,
    http: reqwest::Client,
}

impl HttpWatermarkResolver {
    pub fn new(cfg: WatermarkConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()
            .expect("failed to build watermark http client");
        Self { cfg, http }
    }

    fn third_party_url(&self, publish_url: &str) -> Result<String, SorapoolError> {
        let share_id = extract_share_id(publish_url)
            .ok_or_else(|| SorapoolError::Service("无法解析分享链接中的 ID".to_string()))?;
        Ok(self.cfg.third_party_template.replace("{share_id}", &share_id))
    }

    async fn custom_parse(&self, publish_url: &str) -> Result<String, SorapoolError> {
        let base = self.cfg.custom_parse_url.trim().trim_end_matches('/');
        if base.is_empty() {
            return Err(SorapoolError::Service(
                "未配置去水印解析服务器地址".to_string(),
            ));
        }
        let target = format!("{base}{}", self.cfg.normalized_parse_path());

        let mut payload = json!({"url": publish_url});
        let token = self.cfg.custom_parse_token.trim();
        if !token.is_empty() {
            payload["token"] = json!(token);
        }

        let resp = self.http.post(&target).json(&payload).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SorapoolError::Service(format!(
                "解析服务状态码 {status}"
            )));
        }

        let result: Value = resp.json().await?;
        if let Some(err) = result.get("error").filter(|e| !e.is_null()) {
            let text = err.as_str().map(ToString::to_string).unwrap_or_else(|| err.to_string());
            return Err(SorapoolError::Service(text));
        }

        let link = ["download_link", "download_url", "url"]
            .iter()
            .find_map(|key| result.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .filter(|link| !link.is_empty());

        link.map(ToString::to_string)
            .ok_or_else(|| SorapoolError::Service("解析服务未返回下载链接".to_string()))
    }
}

#[async_trait]
impl WatermarkResolver for HttpWatermarkResolver {
    async fn resolve(&self, publish_url: &str) -> Result<String, SorapoolError> {
        if !self.cfg.enabled {
            return Err(SorapoolError::Service(WATERMARK_DISABLED_ERROR.to_string()));
        }
        match self.cfg.parse_method {
            WatermarkParseMethod::ThirdParty => self.third_party_url(publish_url),
            WatermarkParseMethod::Custom => self.custom_parse(publish_url).await,
        }
    }
}

/// Fallback applies to every failure except the explicit "disabled" error.
pub fn is_fallback_candidate(error_text: &str) -> bool {
    let lowered = error_text.trim();
    lowered.is_empty() || !lowered.contains(WATERMARK_DISABLED_ERROR)
}

/// The watermark step: bounded retries around the resolver, with the job's
/// watermark sub-state tracked in the store.
#[derive(Clone)]
pub struct WatermarkService {
    db: DbActorHandle,
    resolver: Arc<dyn WatermarkResolver>,
    cfg: WatermarkConfig,
}

impl WatermarkService {
    pub fn new(db: DbActorHandle, resolver: Arc<dyn WatermarkResolver>, cfg: WatermarkConfig) -> Self {
        Self { db, resolver, cfg }
    }

    pub fn fallback_on_failure(&self) -> bool {
        self.cfg.fallback_on_failure
    }

    /// Run the watermark call for a job, updating its sub-state. Returns
    /// the resolved URL, or the last error after exhausting retries.
    pub async fn run(&self, job_id: i64, publish_url: &str) -> Result<String, SorapoolError> {
        if !self.cfg.enabled {
            return Err(SorapoolError::Service(WATERMARK_DISABLED_ERROR.to_string()));
        }

        let retry_max = self.cfg.retry_cap();
        self.db
            .update_job(
                job_id,
                JobPatch {
                    phase: Some("watermark".to_string()),
                    watermark_status: Some(Some("running".to_string())),
                    watermark_started_at: Some(Some(chrono::Utc::now())),
                    watermark_error: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        self.db
            .append_event(job_id, "watermark", "start", Some("开始去水印".to_string()))
            .await?;

        let mut last_error: Option<String> = None;
        for attempt in 1..=(retry_max + 1) {
            self.db
                .update_job(
                    job_id,
                    JobPatch {
                        watermark_attempts: Some(i64::from(attempt)),
                        watermark_error: Some(None),
                        ..Default::default()
                    },
                )
                .await?;
            if attempt > 1 {
                self.db
                    .append_event(
                        job_id,
                        "watermark",
                        "retry",
                        Some(format!("重试 {}/{}", attempt - 1, retry_max)),
                    )
                    .await?;
            }

            match self.resolver.resolve(publish_url).await {
                Ok(url) if !url.trim().is_empty() => return Ok(url),
                Ok(_) => last_error = Some("去水印未返回链接".to_string()),
                Err(err) => last_error = Some(err.to_string()),
            }

            warn!(job_id, attempt, error = last_error.as_deref(), "watermark attempt failed");
            self.db
                .update_job(
                    job_id,
                    JobPatch {
                        watermark_error: Some(last_error.clone()),
                        ..Default::default()
                    },
                )
                .await?;
        }

        let reason = last_error.unwrap_or_else(|| "去水印失败".to_string());
        self.db
            .update_job(
                job_id,
                JobPatch {
                    watermark_status: Some(Some("failed".to_string())),
                    watermark_error: Some(Some(reason.clone())),
                    watermark_finished_at: Some(Some(chrono::Utc::now())),
                    ..Default::default()
                },
            )
            .await?;

        Err(SorapoolError::Service(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_error_is_never_a_fallback_candidate() {
        assert!(!is_fallback_candidate("去水印功能已关闭"));
        assert!(is_fallback_candidate("解析服务状态码 500"));
        assert!(is_fallback_candidate(""));
    }

    #[test]
    fn third_party_template_substitutes_share_id() {
        let resolver = HttpWatermarkResolver::new(WatermarkConfig {
            parse_method: WatermarkParseMethod::ThirdParty,
            ..Default::default()
        });
        let url = resolver
            .third_party_url("https://sora.chatgpt.com/p/s_deadbeef01")
            .unwrap();
        assert_eq!(url, "https://oscdn2.dyysy.com/MP4/s_deadbeef01.mp4");

        assert!(resolver.third_party_url("https://example.com/").is_err());
    }
}
