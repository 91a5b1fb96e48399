//! Production `VideoSurface`: broker open → CDP attach → upstream calls.
//!
//! Calls that must originate inside the profile (session token, `nf/create`
//! with the anti-abuse SDK token, the publish workflow) run as in-page
//! JavaScript over the debug channel. Progress polling prefers the direct
//! HTTP path with the captured token and drops back to in-page fetch when
//! Cloudflare interferes.

use async_trait::async_trait;
use serde_json::{Value, json};
use sorapool_schema::sora::CreateVideoRequest;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::broker::{BrokerAdapter, ProxyBinding};
use crate::browser::DebugSession;
use crate::config::RunnerConfig;
use crate::db::JobRecord;
use crate::error::SorapoolError;
use crate::runner::{SurfaceFactory, TaskPoll, VideoSurface};
use crate::upstream::{UpstreamHttp, duration_to_frames};

const SENTINEL_WAIT_BUDGET: Duration = Duration::from_secs(30);
const PUBLISH_STEP_ATTEMPTS: u32 = 40;
const PUBLISH_STEP_PAUSE: Duration = Duration::from_secs(3);

pub struct BrowserSurfaceFactory {
    broker: BrokerAdapter,
    http: UpstreamHttp,
    cfg: RunnerConfig,
}

impl BrowserSurfaceFactory {
    pub fn new(broker: BrokerAdapter, http: UpstreamHttp, cfg: RunnerConfig) -> Self {
        Self { broker, http, cfg }
    }
}

#[async_trait]
impl SurfaceFactory for BrowserSurfaceFactory {
    async fn create(&self, job: &JobRecord) -> Result<Box<dyn VideoSurface>, SorapoolError> {
        let profile_id = job.profile_id;

        let open_budget = Duration::from_secs(self.cfg.submit_open_overall_secs.max(1));
        let outcome = timeout(
            open_budget,
            self.broker.open_profile_with_retry(profile_id, false),
        )
        .await
        .map_err(|_| SorapoolError::Connection("打开窗口超时".to_string()))??;

        let endpoint = outcome
            .data
            .debug_endpoint()
            .ok_or_else(|| SorapoolError::Connection("未返回调试地址".to_string()))?;

        let session = DebugSession::connect(&endpoint).await?;
        session.navigate("https://sora.chatgpt.com/drafts").await?;

        let access_token = session
            .evaluate_value(GET_TOKEN_SCRIPT)
            .await
            .ok()
            .and_then(|v| v.as_str().map(ToString::to_string))
            .filter(|t| !t.trim().is_empty());

        let device_id = self.http.device_ids().get_or_create(profile_id);
        let proxy = self.broker.cached_proxy_binding(profile_id);

        debug!(
            profile_id,
            attached = outcome.attached,
            token = access_token.is_some(),
            "browser surface ready"
        );

        Ok(Box::new(BrowserVideoSurface {
            session,
            http: self.http.clone(),
            profile_id,
            proxy,
            access_token,
            device_id,
        }))
    }
}

struct BrowserVideoSurface {
    session: DebugSession,
    http: UpstreamHttp,
    profile_id: i64,
    proxy: Option<ProxyBinding>,
    access_token: Option<String>,
    device_id: String,
}

impl BrowserVideoSurface {
    async fn wait_for_sentinel_sdk(&self) -> Result<(), SorapoolError> {
        let deadline = tokio::time::Instant::now() + SENTINEL_WAIT_BUDGET;
        loop {
            let ready = self
                .session
                .evaluate_value(
                    "typeof window.SentinelSDK !== 'undefined' \
                     && typeof window.SentinelSDK.token === 'function'",
                )
                .await?
                .as_bool()
                .unwrap_or(false);
            if ready {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SorapoolError::Service(
                    "页面未加载 SentinelSDK，无法提交生成请求".to_string(),
                ));
            }
            sleep(Duration::from_secs(1)).await;
        }
    }

    /// HTTP-path poll using the captured token. Errors classify upward;
    /// Cloudflare/token failures tell the caller to use the in-page path.
    async fn http_poll(&self, task_id: &str, token: &str) -> Result<TaskPoll, SorapoolError> {
        let pending = self
            .http
            .nf_pending(self.profile_id, self.proxy.as_ref(), token)
            .await?;
        if pending
            .iter()
            .any(|item| item.get("id").and_then(Value::as_str) == Some(task_id))
        {
            return Ok(TaskPoll::Processing);
        }

        let drafts = self
            .http
            .drafts(self.profile_id, self.proxy.as_ref(), token)
            .await?;
        let Some(target) = drafts
            .items
            .iter()
            .find(|item| item.task_id.as_deref() == Some(task_id))
        else {
            return Ok(TaskPoll::Processing);
        };

        if let Some(reason) = target.failure_reason() {
            return Ok(TaskPoll::Failed(reason.to_string()));
        }
        if target.kind.as_deref() == Some("sora_content_violation") {
            return Ok(TaskPoll::Failed("内容审核未通过".to_string()));
        }
        if target.output_url().is_some() {
            return Ok(TaskPoll::Completed);
        }
        Ok(TaskPoll::Processing)
    }

    async fn in_page_poll(&self, task_id: &str, token: &str) -> Result<TaskPoll, SorapoolError> {
        let args = json!({"taskId": task_id, "accessToken": token});
        let script = format!("({POLL_SCRIPT})({args})");
        let value = self.session.evaluate_value(&script).await?;

        let state = value.get("state").and_then(Value::as_str).unwrap_or("processing");
        match state {
            "completed" => Ok(TaskPoll::Completed),
            "failed" => Ok(TaskPoll::Failed(
                value
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("生成失败")
                    .to_string(),
            )),
            _ => Ok(TaskPoll::Processing),
        }
    }
}

#[async_trait]
impl VideoSurface for BrowserVideoSurface {
    async fn submit(&mut self, job: &JobRecord) -> Result<String, SorapoolError> {
        let n_frames = duration_to_frames(&job.duration)
            .ok_or_else(|| SorapoolError::Service("时长仅支持：10s、15s、25s".to_string()))?;

        self.wait_for_sentinel_sdk().await?;

        // The in-page call sends the typed wire payload verbatim.
        let payload = CreateVideoRequest::video(
            job.prompt.clone(),
            job.aspect_ratio.clone(),
            n_frames,
        );
        let args = json!({
            "payload": payload,
            "deviceId": self.device_id,
        });
        let script = format!("({SUBMIT_SCRIPT})({args})");
        let value = self.session.evaluate_value(&script).await?;

        if let Some(error) = value.get("error").and_then(Value::as_str)
            && !error.trim().is_empty()
        {
            if SorapoolError::text_is_overload(error) {
                return Err(SorapoolError::Overload(error.to_string()));
            }
            return Err(SorapoolError::Service(error.to_string()));
        }

        if let Some(token) = value.get("access_token").and_then(Value::as_str) {
            self.access_token = Some(token.to_string());
        }

        value
            .get("task_id")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| SorapoolError::Service("提交未返回任务标识".to_string()))
    }

    async fn poll_task(&mut self, task_id: &str) -> Result<TaskPoll, SorapoolError> {
        let Some(token) = self.access_token.clone() else {
            return Err(SorapoolError::TokenAuth("缺少访问令牌".to_string()));
        };

        match self.http_poll(task_id, &token).await {
            Ok(poll) => Ok(poll),
            Err(err @ (SorapoolError::CfChallenge(_) | SorapoolError::TokenAuth(_))) => {
                warn!(profile_id = self.profile_id, %err, "http poll blocked, using in-page fetch");
                self.in_page_poll(task_id, &token).await
            }
            Err(err) => Err(err),
        }
    }

    async fn generation_id(&mut self, _task_id: &str) -> Result<Option<String>, SorapoolError> {
        Ok(self.session.captured_generation_id())
    }

    async fn publish(
        &mut self,
        job: &JobRecord,
        generation_id: &str,
    ) -> Result<String, SorapoolError> {
        // Land on the task page so the publish control is in the DOM.
        if let Some(task_id) = job.task_id.as_deref() {
            let _ = self
                .session
                .navigate(&format!("https://sora.chatgpt.com/g/{task_id}"))
                .await;
        }

        let args = json!({"genId": generation_id});
        let script = format!("({PUBLISH_STEP_SCRIPT})({args})");
        let mut button_seen = false;

        for attempt in 1..=PUBLISH_STEP_ATTEMPTS {
            let value = self.session.evaluate_value(&script).await?;

            if let Some(url) = value.get("publish_url").and_then(Value::as_str)
                && !url.trim().is_empty()
            {
                return Ok(url.trim().to_string());
            }
            if value.get("clicked").and_then(Value::as_bool) == Some(true) {
                button_seen = true;
            }
            debug!(
                profile_id = self.profile_id,
                attempt, button_seen, "publish step pending"
            );
            sleep(PUBLISH_STEP_PAUSE).await;
        }

        Err(SorapoolError::Service(if button_seen {
            "发布未返回链接".to_string()
        } else {
            "未找到发布按钮".to_string()
        }))
    }

    async fn close(&mut self) {
        // Dropping the session closes the debug channel; the window stays
        // with the broker for the next job on this profile.
        let _ = self.session.evaluate_value("void 0").await;
    }
}

const GET_TOKEN_SCRIPT: &str = r#"
(async () => {
  try {
    const resp = await fetch("https://sora.chatgpt.com/api/auth/session", {
      method: "GET",
      credentials: "include"
    });
    const text = await resp.text();
    let json = null;
    try { json = JSON.parse(text); } catch (e) {}
    return (json && json.accessToken) || null;
  } catch (e) {
    return null;
  }
})()
"#;

const SUBMIT_SCRIPT: &str = r#"
async ({payload, deviceId}) => {
  const err = (message) => ({ task_id: null, access_token: null, error: String(message).slice(0, 300) });
  try {
    const sessionResp = await fetch("https://sora.chatgpt.com/api/auth/session", {
      method: "GET",
      credentials: "include"
    });
    const sessionText = await sessionResp.text();
    let sessionJson = null;
    try { sessionJson = JSON.parse(sessionText); } catch (e) {}
    const accessToken = sessionJson?.accessToken || null;
    if (!accessToken) return err("session 中未找到 accessToken");

    const sentinelRaw = await window.SentinelSDK.token("sora_2_create_task__auto", deviceId);
    if (!sentinelRaw) return err("获取 Sentinel token 失败");

    let sentinelObj = sentinelRaw;
    if (typeof sentinelRaw === "string") {
      try { sentinelObj = JSON.parse(sentinelRaw); } catch (e) { sentinelObj = null; }
    }
    const sentinelToken = typeof sentinelRaw === "string"
      ? sentinelRaw
      : JSON.stringify(sentinelRaw);
    const finalDeviceId = sentinelObj?.id || deviceId;

    const createResp = await fetch("https://sora.chatgpt.com/backend/nf/create", {
      method: "POST",
      credentials: "include",
      headers: {
        "Authorization": `Bearer ${accessToken}`,
        "OpenAI-Sentinel-Token": sentinelToken,
        "OAI-Device-Id": finalDeviceId,
        "OAI-Language": "en-US",
        "Content-Type": "application/json"
      },
      body: JSON.stringify(payload)
    });
    const text = await createResp.text();
    let json = null;
    try { json = JSON.parse(text); } catch (e) {}
    const taskId = json?.id || json?.task_id || json?.task?.id || null;
    if (!taskId) {
      const message = json?.error?.message || json?.message || text || `nf/create 状态码 ${createResp.status}`;
      return err(message);
    }
    return { task_id: taskId, access_token: accessToken, error: null };
  } catch (e) {
    return err(e);
  }
}
"#;

const POLL_SCRIPT: &str = r#"
async ({taskId, accessToken}) => {
  const headers = {
    "Authorization": `Bearer ${accessToken}`,
    "Accept": "application/json"
  };
  const fail = (msg) => ({ state: "failed", error: String(msg) });

  try {
    const pendingResp = await fetch("https://sora.chatgpt.com/backend/nf/pending/v2", {
      method: "GET",
      credentials: "include",
      headers
    });
    const pendingText = await pendingResp.text();
    let pendingJson = null;
    try { pendingJson = JSON.parse(pendingText); } catch (e) {}
    if (pendingResp.status === 200 && Array.isArray(pendingJson)) {
      if (pendingJson.find((item) => item?.id === taskId)) {
        return { state: "processing", error: null };
      }
    }
  } catch (e) {}

  try {
    const draftsResp = await fetch("https://sora.chatgpt.com/backend/project_y/profile/drafts?limit=30", {
      method: "GET",
      credentials: "include",
      headers
    });
    const draftsText = await draftsResp.text();
    let draftsJson = null;
    try { draftsJson = JSON.parse(draftsText); } catch (e) {}
    const items = draftsJson?.items;
    if (!Array.isArray(items)) return { state: "processing", error: null };
    const target = items.find((item) => item?.task_id === taskId);
    if (!target) return { state: "processing", error: null };

    const reason = target.reason_str || target.markdown_reason_str || null;
    if (reason && String(reason).trim()) return fail(reason);
    if ((target.kind || "") === "sora_content_violation") return fail("内容审核未通过");
    if (target.url || target.downloadable_url) return { state: "completed", error: null };
    return { state: "processing", error: null };
  } catch (e) {
    return fail(e);
  }
}
"#;

const PUBLISH_STEP_SCRIPT: &str = r#"
async ({genId}) => {
  const result = { publish_url: null, clicked: false, error: null };
  try {
    const anchors = Array.from(document.querySelectorAll('a[href*="/p/s_"]'))
      .map((a) => a.getAttribute("href") || "");
    const href = anchors.find((h) => h.includes("/p/s_"));
    if (href) {
      result.publish_url = href.startsWith("http") ? href : `https://sora.chatgpt.com${href}`;
      return result;
    }

    const candidates = Array.from(document.querySelectorAll('button, [role="button"]'));
    const publishButton = candidates.find((el) => {
      const text = (el.textContent || "").trim();
      return text.includes("发布") || /publish/i.test(text);
    });
    if (!publishButton) {
      result.error = "未找到发布按钮";
      return result;
    }
    publishButton.click();
    result.clicked = true;
    return result;
  } catch (e) {
    result.error = String(e);
    return result;
  }
}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_script_is_fed_the_typed_wire_payload() {
        let payload =
            CreateVideoRequest::video("a cat surfing".to_string(), "landscape".to_string(), 450);
        let args = json!({"payload": payload, "deviceId": "dev-1"});
        let script = format!("({SUBMIT_SCRIPT})({args})");

        // The script takes the payload as an argument and posts it verbatim.
        assert!(script.contains("async ({payload, deviceId})"));
        assert!(script.contains("body: JSON.stringify(payload)"));
        assert!(script.contains(r#""kind":"video""#));
        assert!(script.contains(r#""orientation":"landscape""#));
        assert!(script.contains(r#""n_frames":450"#));
        assert!(script.contains(r#""model":"sy_8""#));
        assert!(script.contains(r#""inpaint_items":[]"#));
    }
}
