use backon::{ExponentialBuilder, Retryable};
use serde_json::{Value, json};
use sorapool_schema::broker::{
    BrokerEnvelope, GroupItem, OpenData, OpenedProfileItem, PagedData, ProfileListItem, code,
};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::BrokerConfig;
use crate::error::SorapoolError;

static NETWORK_RETRY_POLICY: LazyLock<ExponentialBuilder> = LazyLock::new(|| {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_millis(400))
        .with_max_times(2)
        .with_jitter()
});

const PAGE_LIMIT: u64 = 200;

/// Raw broker RPC transport. JSON-in/JSON-out over HTTP; every response is
/// a `{error: {code, message}, data}` envelope.
#[derive(Clone)]
pub struct BrokerClient {
    http: reqwest::Client,
    api_base: Url,
}

impl BrokerClient {
    pub fn new(cfg: &BrokerConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs))
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .expect("failed to build broker http client");
        Self {
            http,
            api_base: cfg.api_base.clone(),
        }
    }

    /// One RPC round-trip. Transport failures are retried briefly; a decoded
    /// envelope with a non-zero code is returned as `Api` without retrying
    /// (the open discipline handles the idempotent codes itself).
    pub async fn rpc(&self, path: &str, payload: Value) -> Result<Value, SorapoolError> {
        let url = self
            .api_base
            .join(path)
            .map_err(SorapoolError::UrlError)?;

        let resp = (|| {
            let http = self.http.clone();
            let url = url.clone();
            let payload = payload.clone();
            async move { http.post(url).json(&payload).send().await }
        })
        .retry(*NETWORK_RETRY_POLICY)
        .await
        .map_err(|e| SorapoolError::Connection(format!("{path}: {e}")))?;

        let envelope: BrokerEnvelope = resp
            .json()
            .await
            .map_err(|e| SorapoolError::Connection(format!("{path}: bad envelope: {e}")))?;

        if !envelope.is_ok() {
            debug!(
                path,
                code = envelope.error.code,
                message = %envelope.error.message,
                "broker rpc returned non-zero code"
            );
            return Err(SorapoolError::Api {
                code: envelope.error.code,
                message: envelope.error.message,
            });
        }

        Ok(envelope.data)
    }

    async fn paged<T: serde::de::DeserializeOwned + Default>(
        &self,
        path: &str,
    ) -> Result<Vec<T>, SorapoolError> {
        let mut page = 1u64;
        let mut total: Option<u64> = None;
        let mut items: Vec<T> = Vec::new();

        loop {
            let data = self
                .rpc(path, json!({"page": page, "limit": PAGE_LIMIT, "title": ""}))
                .await?;
            let paged: PagedData<T> = serde_json::from_value(data)?;
            if total.is_none() {
                total = Some(paged.total);
            }
            let page_len = paged.data.len() as u64;
            items.extend(paged.data);

            // Guard against a broken `total` causing an endless walk.
            if page_len < PAGE_LIMIT || items.len() as u64 >= total.unwrap_or(0) {
                break;
            }
            page += 1;
        }

        Ok(items)
    }

    pub async fn list_groups(&self) -> Result<Vec<GroupItem>, SorapoolError> {
        let mut groups: Vec<GroupItem> = self.paged("/api/v2/group-list").await?;
        groups.sort_by_key(|g| g.id);
        groups.dedup_by_key(|g| g.id);
        Ok(groups)
    }

    pub async fn list_profiles(&self) -> Result<Vec<ProfileListItem>, SorapoolError> {
        self.paged("/api/v2/profile-list").await
    }

    pub async fn profile_open(
        &self,
        profile_id: i64,
        headless: bool,
    ) -> Result<OpenData, SorapoolError> {
        let mut payload = json!({"profile_id": profile_id});
        if headless {
            payload["headless"] = json!(true);
        }
        let data = self.rpc("/api/v2/profile-open", payload).await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Close a profile. Code 1009 means the process is already gone, which
    /// is the state we wanted.
    pub async fn profile_close(&self, profile_id: i64) -> Result<bool, SorapoolError> {
        match self
            .rpc("/api/v2/profile-close", json!({"profile_id": profile_id}))
            .await
        {
            Ok(_) => Ok(true),
            Err(SorapoolError::Api { code: c, message })
                if c == code::PROCESS_NOT_FOUND
                    || message.to_lowercase().contains("process not found") =>
            {
                Ok(true)
            }
            Err(err) => {
                warn!(profile_id, %err, "profile-close failed, trying batch close");
                match self
                    .rpc(
                        "/api/v2/profile-close-in-batches",
                        json!({"profile_id": [profile_id]}),
                    )
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(_) => Err(err),
                }
            }
        }
    }

    /// Reset the broker-side open flag. Code 2007 (window not found) means
    /// there is nothing to reset.
    pub async fn profile_open_state_reset(&self, profile_id: i64) -> Result<bool, SorapoolError> {
        match self
            .rpc(
                "/api/v2/profile-open-state-reset",
                json!({"profile_id": profile_id}),
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(SorapoolError::Api { code: c, .. }) if c == code::WINDOW_NOT_FOUND => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Profiles with a live debug endpoint.
    ///
    /// The native-client listing is authoritative (it carries the debug
    /// port); the historical `profile-opened-list` is only a supplementary
    /// source and its entries without a debug address are discarded.
    pub async fn list_opened_profiles(&self) -> Result<Vec<OpenedProfileItem>, SorapoolError> {
        let mut items: Vec<OpenedProfileItem> = Vec::new();

        for path in [
            "/api/v2/native-client-profile-opened-list",
            "/api/v2/profile-opened-list",
        ] {
            let data = match self.rpc(path, json!({})).await {
                Ok(data) => data,
                Err(err) => {
                    debug!(path, %err, "opened-profile listing unavailable");
                    continue;
                }
            };

            let parsed: Vec<OpenedProfileItem> = match data {
                Value::Array(_) => serde_json::from_value(data).unwrap_or_default(),
                Value::Object(_) => serde_json::from_value::<PagedData<OpenedProfileItem>>(data)
                    .map(|p| p.data)
                    .unwrap_or_default(),
                _ => Vec::new(),
            };

            items.extend(
                parsed
                    .into_iter()
                    .filter(|item| item.open.debug_endpoint().is_some()),
            );

            // The native listing already reflects true open state; skip the
            // history endpoint when it produced anything.
            if !items.is_empty() && path.ends_with("native-client-profile-opened-list") {
                break;
            }
        }

        items.sort_by_key(|item| item.profile_id);
        items.dedup_by_key(|item| item.profile_id);
        Ok(items)
    }

    pub async fn opened_profile(
        &self,
        profile_id: i64,
    ) -> Result<Option<OpenedProfileItem>, SorapoolError> {
        let items = self.list_opened_profiles().await?;
        Ok(items.into_iter().find(|item| item.profile_id == profile_id))
    }
}
