//! Upstream (Sora) surface: pure helpers shared by the scanner and the job
//! runner, plus the service-side HTTP request path in `http.rs`.

pub mod http;

pub use http::{DeviceIds, UpstreamHttp};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use sorapool_schema::sora::NfCheckPayload;
use std::sync::LazyLock;

use crate::utils::jwt::decode_jwt_claims;

pub const UPSTREAM_HOST: &str = "sora.chatgpt.com";

/// Duration → frame-count mapping accepted by `nf/create`.
pub fn duration_to_frames(duration: &str) -> Option<u32> {
    match duration.trim() {
        "10s" => Some(300),
        "15s" => Some(450),
        "25s" => Some(750),
        _ => None,
    }
}

pub fn is_supported_aspect_ratio(aspect_ratio: &str) -> bool {
    matches!(aspect_ratio.trim(), "landscape" | "portrait")
}

static PUBLISH_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://sora\.chatgpt\.com/p/s_[a-zA-Z0-9_]{8,}$").expect("valid publish regex")
});

static SHARE_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/p/([a-zA-Z0-9_]+)").expect("valid share path regex"));

static SHARE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(s_[a-zA-Z0-9_]+)").expect("valid share id regex"));

/// Shape check for the shareable permalink returned by the publish phase.
pub fn is_valid_publish_url(url: &str) -> bool {
    PUBLISH_URL_RE.is_match(url.trim())
}

/// Extract the `s_…` share id from a permalink, a `/p/…` path, or a bare id.
pub fn extract_share_id(url: &str) -> Option<String> {
    let text = url.trim();
    if text.is_empty() {
        return None;
    }
    if let Some(caps) = SHARE_PATH_RE.captures(text) {
        return Some(caps[1].to_string());
    }
    SHARE_ID_RE
        .captures(text)
        .map(|caps| caps[1].to_string())
}

/// Canonicalise anything share-shaped to `https://sora.chatgpt.com/p/{id}`.
pub fn normalize_publish_permalink(publish_url: &str) -> Option<String> {
    let text = publish_url.trim();
    if text.is_empty() {
        return None;
    }
    if let Some(path) = text.strip_prefix("/p/") {
        return Some(format!("https://{UPSTREAM_HOST}/p/{path}"));
    }
    if SHARE_ID_RE
        .find(text)
        .is_some_and(|m| m.start() == 0 && m.end() == text.len())
    {
        return Some(format!("https://{UPSTREAM_HOST}/p/{text}"));
    }
    let parsed = url::Url::parse(text).ok()?;
    if matches!(parsed.scheme(), "http" | "https")
        && parsed.host_str() == Some(UPSTREAM_HOST)
        && parsed.path().starts_with("/p/")
    {
        return Some(format!("https://{UPSTREAM_HOST}{}", parsed.path()));
    }
    None
}

/// Cloudflare challenge: 403 combined with well-known body markers.
pub fn is_cf_challenge(status: Option<u16>, body: &str) -> bool {
    if status != Some(403) {
        return false;
    }
    let lowered = body.to_lowercase();
    ["just a moment", "challenge-platform", "cf-mitigated", "cloudflare"]
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// Token-auth failure: 401/403, or a payload error code / marker text.
pub fn is_token_auth_failure(status: Option<u16>, body: &str) -> bool {
    if matches!(status, Some(401) | Some(403)) {
        return true;
    }
    let lowered = body.to_lowercase();
    if let Ok(payload) = serde_json::from_str::<serde_json::Value>(body)
        && let Some(code) = payload
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|c| c.as_str())
        && matches!(
            code.trim().to_lowercase().as_str(),
            "token_expired" | "invalid_token" | "token_invalid"
        )
    {
        return true;
    }
    ["token_expired", "token expired", "invalid token", "invalid_token"]
        .iter()
        .any(|marker| lowered.contains(marker))
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuotaInfo {
    pub remaining: Option<i64>,
    pub total: Option<i64>,
    pub reset_at: Option<DateTime<Utc>>,
}

/// Quota extraction from `nf/check`: purchased videos are folded into the
/// total, and the relative reset is anchored to the current UTC time.
pub fn parse_nf_check(payload: &NfCheckPayload, now: DateTime<Utc>) -> QuotaInfo {
    let Some(rate) = payload.rate_limit_and_credit_balance.as_ref() else {
        return QuotaInfo::default();
    };

    let remaining = rate.estimated_num_videos_remaining;
    let total = match (remaining, rate.estimated_num_purchased_videos_remaining) {
        (Some(r), Some(p)) => Some(r + p),
        _ => None,
    };
    let reset_at = rate
        .access_resets_in_seconds
        .filter(|secs| *secs >= 0)
        .map(|secs| now + ChronoDuration::seconds(secs));

    QuotaInfo {
        remaining,
        total,
        reset_at,
    }
}

/// Normalise a plan token: anything containing "plus" → plus, "free" → free.
pub fn normalize_account_plan(value: &str) -> Option<&'static str> {
    let normalized = value.trim().to_lowercase();
    if normalized.is_empty() {
        return None;
    }
    if normalized.contains("plus") {
        return Some("plus");
    }
    if normalized.contains("free") {
        return Some("free");
    }
    None
}

/// Plan from the access token's auth claim, used when the subscription
/// endpoint yields nothing.
pub fn plan_from_access_token(token: &str) -> Option<&'static str> {
    let claims = decode_jwt_claims(token)?;
    let plan = claims
        .get("https://api.openai.com/auth")?
        .get("chatgpt_plan_type")?
        .as_str()?;
    normalize_account_plan(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use serde_json::json;

    #[test]
    fn duration_mapping_is_exact() {
        assert_eq!(duration_to_frames("10s"), Some(300));
        assert_eq!(duration_to_frames("15s"), Some(450));
        assert_eq!(duration_to_frames("25s"), Some(750));
        assert_eq!(duration_to_frames("30s"), None);
    }

    #[test]
    fn publish_url_shape() {
        assert!(is_valid_publish_url(
            "https://sora.chatgpt.com/p/s_deadbeefdeadbeefdeadbeefdeadbeef"
        ));
        assert!(!is_valid_publish_url("https://sora.chatgpt.com/p/s_short"));
        assert!(!is_valid_publish_url("https://example.com/p/s_deadbeef00"));
        assert!(!is_valid_publish_url(
            "https://sora.chatgpt.com/g/gen_deadbeef00"
        ));
    }

    #[test]
    fn share_id_extraction_and_permalink() {
        assert_eq!(
            extract_share_id("https://sora.chatgpt.com/p/s_abc12345?x=1").as_deref(),
            Some("s_abc12345")
        );
        assert_eq!(extract_share_id("s_abc12345").as_deref(), Some("s_abc12345"));
        assert_eq!(extract_share_id("nothing here"), None);

        assert_eq!(
            normalize_publish_permalink("/p/s_abc12345").as_deref(),
            Some("https://sora.chatgpt.com/p/s_abc12345")
        );
        assert_eq!(
            normalize_publish_permalink("s_abc12345").as_deref(),
            Some("https://sora.chatgpt.com/p/s_abc12345")
        );
        assert_eq!(
            normalize_publish_permalink("https://sora.chatgpt.com/p/s_abc12345").as_deref(),
            Some("https://sora.chatgpt.com/p/s_abc12345")
        );
        assert_eq!(normalize_publish_permalink("https://evil.com/p/s_abc12345"), None);
    }

    #[test]
    fn cf_challenge_requires_403_and_marker() {
        assert!(is_cf_challenge(Some(403), "<html>Just a moment...</html>"));
        assert!(is_cf_challenge(Some(403), "challenge-platform script"));
        assert!(!is_cf_challenge(Some(200), "just a moment"));
        assert!(!is_cf_challenge(Some(403), "plain forbidden"));
    }

    #[test]
    fn token_auth_failure_detection() {
        assert!(is_token_auth_failure(Some(401), ""));
        assert!(is_token_auth_failure(Some(403), ""));
        assert!(is_token_auth_failure(
            Some(200),
            r#"{"error": {"code": "token_expired"}}"#
        ));
        assert!(is_token_auth_failure(Some(200), "Invalid Token supplied"));
        assert!(!is_token_auth_failure(Some(200), r#"{"ok": true}"#));
    }

    #[test]
    fn quota_parsing_sums_purchased_and_anchors_reset() {
        let now = Utc::now();
        let payload: NfCheckPayload = serde_json::from_value(json!({
            "rate_limit_and_credit_balance": {
                "estimated_num_videos_remaining": 7,
                "estimated_num_purchased_videos_remaining": 3,
                "access_resets_in_seconds": 3600,
            }
        }))
        .unwrap();
        let quota = parse_nf_check(&payload, now);
        assert_eq!(quota.remaining, Some(7));
        assert_eq!(quota.total, Some(10));
        assert_eq!(quota.reset_at, Some(now + ChronoDuration::seconds(3600)));

        let empty = parse_nf_check(&NfCheckPayload::default(), now);
        assert_eq!(empty, QuotaInfo::default());
    }

    #[test]
    fn plan_claim_from_jwt_payload() {
        let claims = json!({
            "https://api.openai.com/auth": {"chatgpt_plan_type": "chatgptplusplan"}
        });
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&claims).unwrap());
        let token = format!("header.{payload}.sig");
        assert_eq!(plan_from_access_token(&token), Some("plus"));

        assert_eq!(normalize_account_plan("Free tier"), Some("free"));
        assert_eq!(normalize_account_plan("team"), None);
    }
}
