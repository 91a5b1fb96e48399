use serde::{Deserialize, Serialize};
use url::Url;

/// Browser-broker RPC settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    /// Broker RPC base, e.g. `http://127.0.0.1:53200`.
    /// TOML: `broker.api_base`.
    #[serde(default = "default_api_base")]
    pub api_base: Url,

    /// TCP connect timeout for broker RPC, seconds.
    /// TOML: `broker.connect_timeout_secs`. Default: `10`.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Overall timeout per broker RPC, seconds.
    /// TOML: `broker.timeout_secs`. Default: `20`.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Attempts for the open-with-retry discipline.
    /// TOML: `broker.open_max_attempts`. Default: `3`.
    #[serde(default = "default_open_max_attempts")]
    pub open_max_attempts: u32,

    /// Pause between open attempts, milliseconds.
    /// TOML: `broker.open_retry_pause_ms`. Default: `1200`.
    #[serde(default = "default_open_retry_pause_ms")]
    pub open_retry_pause_ms: u64,

    /// Proxy-binding cache TTL for rapid re-reads, seconds.
    /// TOML: `broker.proxy_cache_ttl_secs`. Default: `3`.
    #[serde(default = "default_proxy_cache_ttl_secs")]
    pub proxy_cache_ttl_secs: u64,

    /// Prefer headless opens where the broker supports them.
    /// TOML: `broker.prefer_headless`. Default: `true`.
    #[serde(default = "default_prefer_headless")]
    pub prefer_headless: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            connect_timeout_secs: default_connect_timeout_secs(),
            timeout_secs: default_timeout_secs(),
            open_max_attempts: default_open_max_attempts(),
            open_retry_pause_ms: default_open_retry_pause_ms(),
            proxy_cache_ttl_secs: default_proxy_cache_ttl_secs(),
            prefer_headless: default_prefer_headless(),
        }
    }
}

fn default_api_base() -> Url {
    Url::parse("http://127.0.0.1:53200").expect("valid default broker api base")
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_open_max_attempts() -> u32 {
    3
}

fn default_open_retry_pause_ms() -> u64 {
    1200
}

fn default_proxy_cache_ttl_secs() -> u64 {
    3
}

fn default_prefer_headless() -> bool {
    true
}
