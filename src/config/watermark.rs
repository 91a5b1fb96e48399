use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkParseMethod {
    /// Operator-hosted parse endpoint (POST `{url, token?}`).
    #[default]
    Custom,
    /// Public template URL derived from the share id.
    ThirdParty,
}

/// Watermark post-processor settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WatermarkConfig {
    /// TOML: `watermark.enabled`. Default: `true`.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default)]
    pub parse_method: WatermarkParseMethod,

    /// Base URL of the custom parse server, e.g. `https://parse.example.com`.
    #[serde(default)]
    pub custom_parse_url: String,

    /// Optional token forwarded in the parse payload.
    #[serde(default)]
    pub custom_parse_token: String,

    /// Path on the custom parse server. Default: `/get-sora-link`.
    #[serde(default = "default_custom_parse_path")]
    pub custom_parse_path: String,

    /// Extra attempts after the first failure. Clamped to 0..=10.
    #[serde(default)]
    pub retry_max: u32,

    /// Complete the job with the share URL when every attempt fails.
    /// TOML: `watermark.fallback_on_failure`. Default: `true`.
    #[serde(default = "default_fallback_on_failure")]
    pub fallback_on_failure: bool,

    /// Per-call timeout, seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Template for the third-party method; `{share_id}` is substituted.
    #[serde(default = "default_third_party_template")]
    pub third_party_template: String,
}

impl WatermarkConfig {
    pub fn retry_cap(&self) -> u32 {
        self.retry_max.min(10)
    }

    pub fn normalized_parse_path(&self) -> String {
        let text = self.custom_parse_path.trim();
        if text.is_empty() {
            return default_custom_parse_path();
        }
        if text.starts_with('/') {
            text.to_string()
        } else {
            format!("/{text}")
        }
    }
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            parse_method: WatermarkParseMethod::default(),
            custom_parse_url: String::new(),
            custom_parse_token: String::new(),
            custom_parse_path: default_custom_parse_path(),
            retry_max: 0,
            fallback_on_failure: default_fallback_on_failure(),
            timeout_secs: default_timeout_secs(),
            third_party_template: default_third_party_template(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_custom_parse_path() -> String {
    "/get-sora-link".to_string()
}

fn default_fallback_on_failure() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    20
}

fn default_third_party_template() -> String {
    "https://oscdn2.dyysy.com/MP4/{share_id}.mp4".to_string()
}
