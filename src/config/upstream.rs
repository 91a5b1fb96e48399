use serde::{Deserialize, Serialize};
use url::Url;

/// Upstream Sora HTTP surface settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Upstream base, e.g. `https://sora.chatgpt.com`.
    /// TOML: `upstream.base_url`.
    #[serde(default = "default_base_url")]
    pub base_url: Url,

    /// Overall timeout per upstream request, seconds.
    /// TOML: `upstream.timeout_secs`. Default: `20`.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// User agent for the service-side (non-browser) request path. A mobile
    /// Safari string keeps the header surface consistent with the device-id
    /// cookie the in-page SDK expects.
    /// TOML: `upstream.user_agent`.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// `Accept-Language` sent on the service-side request path.
    /// TOML: `upstream.accept_language`. Default: `en-US,en;q=0.9`.
    #[serde(default = "default_accept_language")]
    pub accept_language: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            accept_language: default_accept_language(),
        }
    }
}

fn default_base_url() -> Url {
    Url::parse("https://sora.chatgpt.com").expect("valid default upstream base url")
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_2 like Mac OS X) AppleWebKit/605.1.15 \
     (KHTML, like Gecko) Version/17.2 Mobile/15E148 Safari/604.1"
        .to_string()
}

fn default_accept_language() -> String {
    "en-US,en;q=0.9".to_string()
}
