//! Wire types for the upstream Sora HTTP surface.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `GET /api/auth/session`. The `access_token` is a JWT whose payload also
/// carries the plan claim; the raw payload is kept alongside the typed
/// fields so scan results can persist it verbatim.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SessionPayload {
    #[serde(default, rename = "accessToken")]
    pub access_token: Option<String>,
    #[serde(default)]
    pub user: Option<SessionUser>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SessionUser {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl SessionPayload {
    pub fn account_label(&self) -> Option<String> {
        let user = self.user.as_ref()?;
        user.email
            .as_deref()
            .or(user.name.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
    }
}

/// `GET /backend/billing/subscriptions`.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SubscriptionPayload {
    #[serde(default)]
    pub plan: Option<SubscriptionPlan>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SubscriptionPlan {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// `GET /backend/nf/check`.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NfCheckPayload {
    #[serde(default)]
    pub rate_limit_and_credit_balance: Option<RateLimitAndCreditBalance>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RateLimitAndCreditBalance {
    #[serde(default)]
    pub estimated_num_videos_remaining: Option<i64>,
    #[serde(default)]
    pub estimated_num_purchased_videos_remaining: Option<i64>,
    #[serde(default)]
    pub access_resets_in_seconds: Option<i64>,
}

/// `POST /backend/nf/create`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateVideoRequest {
    pub kind: &'static str,
    pub prompt: String,
    pub orientation: String,
    pub size: &'static str,
    pub n_frames: u32,
    pub model: &'static str,
    pub inpaint_items: Vec<Value>,
}

impl CreateVideoRequest {
    pub fn video(prompt: String, orientation: String, n_frames: u32) -> Self {
        Self {
            kind: "video",
            prompt,
            orientation,
            size: "small",
            n_frames,
            model: "sy_8",
            inpaint_items: Vec::new(),
        }
    }
}

/// One row of `GET /backend/project_y/profile/drafts?limit=30`.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct DraftItem {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub reason_str: Option<String>,
    #[serde(default)]
    pub markdown_reason_str: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub downloadable_url: Option<String>,
}

impl DraftItem {
    /// Failure text for this draft, if the upstream recorded one.
    pub fn failure_reason(&self) -> Option<&str> {
        self.reason_str
            .as_deref()
            .or(self.markdown_reason_str.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// The downloadable output URL, once the upstream has produced one.
    pub fn output_url(&self) -> Option<&str> {
        self.url
            .as_deref()
            .or(self.downloadable_url.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct DraftsPage {
    #[serde(default)]
    pub items: Vec<DraftItem>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_account_prefers_email_over_name() {
        let session: SessionPayload = serde_json::from_value(json!({
            "accessToken": "aaa.bbb.ccc",
            "user": {"email": "a@b.c", "name": "someone"},
        }))
        .unwrap();
        assert_eq!(session.account_label().as_deref(), Some("a@b.c"));

        let no_email: SessionPayload =
            serde_json::from_value(json!({"user": {"name": " someone "}})).unwrap();
        assert_eq!(no_email.account_label().as_deref(), Some("someone"));
    }

    #[test]
    fn create_video_request_matches_the_wire_payload() {
        let req = CreateVideoRequest::video("a cat".to_string(), "landscape".to_string(), 300);
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["kind"], "video");
        assert_eq!(value["orientation"], "landscape");
        assert_eq!(value["n_frames"], 300);
        assert_eq!(value["size"], "small");
        assert_eq!(value["model"], "sy_8");
        assert_eq!(value["inpaint_items"], json!([]));
    }

    #[test]
    fn draft_reason_and_output_url() {
        let failed: DraftItem = serde_json::from_value(json!({
            "task_id": "task_1",
            "reason_str": "blocked",
        }))
        .unwrap();
        assert_eq!(failed.failure_reason(), Some("blocked"));
        assert!(failed.output_url().is_none());

        let done: DraftItem = serde_json::from_value(json!({
            "task_id": "task_1",
            "downloadable_url": "https://videos.example/x.mp4",
        }))
        .unwrap();
        assert!(done.failure_reason().is_none());
        assert_eq!(done.output_url(), Some("https://videos.example/x.mp4"));
    }
}
