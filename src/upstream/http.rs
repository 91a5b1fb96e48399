use ahash::AHashMap;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, AUTHORIZATION, COOKIE, ORIGIN, REFERER};
use serde_json::Value;
use sorapool_schema::sora::{DraftsPage, NfCheckPayload, SessionPayload, SubscriptionPayload};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::broker::ProxyBinding;
use crate::config::UpstreamConfig;
use crate::error::SorapoolError;
use crate::upstream::{is_cf_challenge, is_token_auth_failure};

/// Stable per-profile device identifiers, kept in memory for the lifetime of
/// the process. The id doubles as the `oai-did` cookie and the device id the
/// in-page SDK receives.
#[derive(Default)]
pub struct DeviceIds {
    map: Mutex<AHashMap<i64, String>>,
}

impl DeviceIds {
    pub fn get_or_create(&self, profile_id: i64) -> String {
        let mut map = self.map.lock().expect("device id map poisoned");
        map.entry(profile_id)
            .or_insert_with(|| Uuid::new_v4().to_string())
            .clone()
    }
}

/// Service-side request path to the upstream: Bearer-authenticated requests
/// routed through the profile's bound proxy with a mobile-Safari header
/// surface. Cloudflare challenges and token failures surface as typed
/// errors so callers can fall back to the in-browser fetch path.
#[derive(Clone)]
pub struct UpstreamHttp {
    cfg: UpstreamConfig,
    device_ids: Arc<DeviceIds>,
}

impl UpstreamHttp {
    pub fn new(cfg: UpstreamConfig, device_ids: Arc<DeviceIds>) -> Self {
        Self { cfg, device_ids }
    }

    pub fn device_ids(&self) -> Arc<DeviceIds> {
        self.device_ids.clone()
    }

    fn client_for(&self, proxy: Option<&ProxyBinding>) -> Result<reqwest::Client, SorapoolError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(self.cfg.user_agent.clone())
            .timeout(Duration::from_secs(self.cfg.timeout_secs));

        if let Some(proxy_url) = proxy.and_then(ProxyBinding::proxy_url) {
            let proxy = reqwest::Proxy::all(&proxy_url)
                .map_err(|e| SorapoolError::Connection(format!("bad proxy {proxy_url}: {e}")))?;
            builder = builder.proxy(proxy);
        }

        builder
            .build()
            .map_err(|e| SorapoolError::Connection(format!("client build failed: {e}")))
    }

    fn headers(&self, profile_id: i64, access_token: &str) -> Result<HeaderMap, SorapoolError> {
        let device_id = self.device_ids.get_or_create(profile_id);
        let mut headers = HeaderMap::new();
        let origin = format!(
            "{}://{}",
            self.cfg.base_url.scheme(),
            self.cfg.base_url.host_str().unwrap_or_default()
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {access_token}"))
                .map_err(|e| SorapoolError::Internal(format!("bad bearer header: {e}")))?,
        );
        headers.insert(ORIGIN, HeaderValue::from_str(&origin).expect("valid origin"));
        headers.insert(
            REFERER,
            HeaderValue::from_str(&format!("{origin}/drafts")).expect("valid referer"),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_str(&self.cfg.accept_language)
                .unwrap_or(HeaderValue::from_static("en-US,en;q=0.9")),
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("oai-did={device_id}"))
                .expect("valid device cookie"),
        );
        Ok(headers)
    }

    /// GET a JSON document, classifying Cloudflare challenges and
    /// credential rejections.
    async fn get_json(
        &self,
        profile_id: i64,
        proxy: Option<&ProxyBinding>,
        access_token: &str,
        path: &str,
    ) -> Result<Value, SorapoolError> {
        let url = self.cfg.base_url.join(path)?;
        let client = self.client_for(proxy)?;
        let resp = client
            .get(url.clone())
            .headers(self.headers(profile_id, access_token)?)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let body = resp.text().await?;

        if is_cf_challenge(Some(status), &body) {
            return Err(SorapoolError::CfChallenge(format!("{path} 状态码 {status}")));
        }
        if is_token_auth_failure(Some(status), &body) {
            return Err(SorapoolError::TokenAuth(format!("{path} 状态码 {status}")));
        }
        if status != 200 {
            let preview: String = body.chars().take(200).collect();
            return Err(SorapoolError::Service(format!(
                "{path} 状态码 {status}: {preview}"
            )));
        }

        debug!(profile_id, path, "upstream fetch ok");
        serde_json::from_str(&body).map_err(SorapoolError::JsonError)
    }

    pub async fn fetch_session(
        &self,
        profile_id: i64,
        proxy: Option<&ProxyBinding>,
        access_token: &str,
    ) -> Result<SessionPayload, SorapoolError> {
        let value = self
            .get_json(profile_id, proxy, access_token, "/api/auth/session")
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Secondary identity source; best-effort.
    pub async fn fetch_me(
        &self,
        profile_id: i64,
        proxy: Option<&ProxyBinding>,
        access_token: &str,
    ) -> Result<Value, SorapoolError> {
        self.get_json(profile_id, proxy, access_token, "/backend/me")
            .await
    }

    pub async fn fetch_subscription(
        &self,
        profile_id: i64,
        proxy: Option<&ProxyBinding>,
        access_token: &str,
    ) -> Result<SubscriptionPayload, SorapoolError> {
        let value = self
            .get_json(
                profile_id,
                proxy,
                access_token,
                "/backend/billing/subscriptions",
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn nf_check(
        &self,
        profile_id: i64,
        proxy: Option<&ProxyBinding>,
        access_token: &str,
    ) -> Result<NfCheckPayload, SorapoolError> {
        let value = self
            .get_json(profile_id, proxy, access_token, "/backend/nf/check")
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// `nf/pending/v2`: array of in-flight task rows.
    pub async fn nf_pending(
        &self,
        profile_id: i64,
        proxy: Option<&ProxyBinding>,
        access_token: &str,
    ) -> Result<Vec<Value>, SorapoolError> {
        let value = self
            .get_json(profile_id, proxy, access_token, "/backend/nf/pending/v2")
            .await?;
        Ok(value.as_array().cloned().unwrap_or_default())
    }

    pub async fn drafts(
        &self,
        profile_id: i64,
        proxy: Option<&ProxyBinding>,
        access_token: &str,
    ) -> Result<DraftsPage, SorapoolError> {
        let value = self
            .get_json(
                profile_id,
                proxy,
                access_token,
                "/backend/project_y/profile/drafts?limit=30",
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_ids_are_stable_per_profile() {
        let ids = DeviceIds::default();
        let a1 = ids.get_or_create(1);
        let a2 = ids.get_or_create(1);
        let b = ids.get_or_create(2);
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
        assert_eq!(a1.len(), 36);
    }
}
