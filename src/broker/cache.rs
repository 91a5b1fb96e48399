use ahash::AHashMap;
use moka::sync::Cache;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

use crate::broker::{BrokerClient, ProxyBinding};
use crate::config::BrokerConfig;
use crate::error::SorapoolError;

#[derive(Debug, Clone, Serialize)]
pub struct Window {
    pub profile_id: i64,
    pub name: String,
    #[serde(flatten)]
    pub proxy: ProxyBinding,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupWindows {
    pub id: i64,
    pub title: String,
    pub window_count: usize,
    pub windows: Vec<Window>,
}

const GROUP_WINDOWS_KEY: &str = "group-windows";

/// Process-wide broker adapter: RPC client plus read-mostly caches.
///
/// The grouped-window listing is cached for a few seconds so rapid
/// re-reads (dispatch scoring, job enrichment, scan loops) don't hammer
/// the broker; the proxy map is rebuilt under a single write lock on every
/// refresh and read lock-free-ish in between.
#[derive(Clone)]
pub struct BrokerAdapter {
    client: BrokerClient,
    cfg: BrokerConfig,
    group_windows: Cache<&'static str, Arc<Vec<GroupWindows>>>,
    proxy_map: Arc<RwLock<AHashMap<i64, ProxyBinding>>>,
}

impl BrokerAdapter {
    pub fn new(cfg: BrokerConfig) -> Self {
        let client = BrokerClient::new(&cfg);
        let group_windows = Cache::builder()
            .max_capacity(4)
            .time_to_live(Duration::from_secs(cfg.proxy_cache_ttl_secs.max(1)))
            .build();
        Self {
            client,
            cfg,
            group_windows,
            proxy_map: Arc::new(RwLock::new(AHashMap::new())),
        }
    }

    pub fn client(&self) -> &BrokerClient {
        &self.client
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.cfg
    }

    /// Groups with their windows, joined from `group-list` + `profile-list`.
    /// Refreshes the proxy-binding cache as a side effect.
    pub async fn list_group_windows(&self) -> Result<Arc<Vec<GroupWindows>>, SorapoolError> {
        if let Some(cached) = self.group_windows.get(GROUP_WINDOWS_KEY) {
            return Ok(cached);
        }

        let groups = self.client.list_groups().await?;
        let profiles = self.client.list_profiles().await?;

        let mut grouped: AHashMap<i64, GroupWindows> = groups
            .into_iter()
            .map(|g| {
                (
                    g.id,
                    GroupWindows {
                        id: g.id,
                        title: g.title,
                        window_count: 0,
                        windows: Vec::new(),
                    },
                )
            })
            .collect();

        for profile in profiles {
            if profile.profile_id <= 0 {
                continue;
            }
            let entry = grouped
                .entry(profile.group_id)
                .or_insert_with(|| GroupWindows {
                    id: profile.group_id,
                    title: profile
                        .group_name
                        .clone()
                        .map(|n| n.trim().to_string())
                        .filter(|n| !n.is_empty())
                        .unwrap_or_else(|| "未知分组".to_string()),
                    window_count: 0,
                    windows: Vec::new(),
                });
            entry.windows.push(Window {
                profile_id: profile.profile_id,
                name: profile.name,
                proxy: ProxyBinding {
                    proxy_mode: profile.proxy_mode,
                    proxy_id: profile.proxy_id,
                    proxy_type: profile.proxy_type,
                    proxy_ip: profile.proxy_ip,
                    proxy_port: profile.proxy_port,
                    real_ip: profile.real_ip,
                    proxy_local_id: None,
                },
            });
        }

        let mut result: Vec<GroupWindows> = grouped.into_values().collect();
        result.sort_by_key(|g| g.id);
        for group in &mut result {
            group.windows.sort_by_key(|w| std::cmp::Reverse(w.profile_id));
            group.window_count = group.windows.len();
        }

        // Single write lock for the whole refresh; readers see either the
        // old map or the complete new one.
        {
            let mut map = self.proxy_map.write().expect("proxy map poisoned");
            map.clear();
            for group in &result {
                for window in &group.windows {
                    map.insert(window.profile_id, window.proxy.clone());
                }
            }
            debug!(bindings = map.len(), "proxy binding cache refreshed");
        }

        let shared = Arc::new(result);
        self.group_windows.insert(GROUP_WINDOWS_KEY, shared.clone());
        Ok(shared)
    }

    /// Last known proxy binding of a profile; `None` before the first
    /// listing refresh.
    pub fn cached_proxy_binding(&self, profile_id: i64) -> Option<ProxyBinding> {
        self.proxy_map
            .read()
            .expect("proxy map poisoned")
            .get(&profile_id)
            .cloned()
    }

    pub async fn find_group(
        &self,
        group_title: &str,
    ) -> Result<Option<GroupWindows>, SorapoolError> {
        let normalized = group_title.trim().to_lowercase();
        let groups = self.list_group_windows().await?;
        Ok(groups
            .iter()
            .find(|g| g.title.trim().to_lowercase() == normalized)
            .cloned())
    }

    pub async fn find_window(
        &self,
        group_title: &str,
        profile_id: i64,
    ) -> Result<Option<Window>, SorapoolError> {
        let Some(group) = self.find_group(group_title).await? else {
            return Ok(None);
        };
        Ok(group
            .windows
            .into_iter()
            .find(|w| w.profile_id == profile_id))
    }
}
