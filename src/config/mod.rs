mod basic;
mod broker;
mod dispatch;
mod runner;
mod upstream;
mod watermark;

pub use basic::BasicConfig;
pub use broker::BrokerConfig;
pub use dispatch::{
    DefaultErrorRule, DispatchConfig, ErrorRule, IgnoreRule, validate_dispatch_rules,
};
pub use runner::RunnerConfig;
pub use upstream::UpstreamConfig;
pub use watermark::{WatermarkConfig, WatermarkParseMethod};

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, sync::LazyLock};

/// Application configuration managed by Figment.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    /// Core server configuration (see `basic` table in config.toml).
    #[serde(default)]
    pub basic: BasicConfig,

    /// Browser-broker RPC settings (see `broker` table).
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Upstream HTTP surface settings (see `upstream` table).
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Weighted account dispatch settings and rules (see `dispatch` table).
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Job runner pool and phase timeouts (see `runner` table).
    #[serde(default)]
    pub runner: RunnerConfig,

    /// Watermark post-processor settings (see `watermark` table).
    #[serde(default)]
    pub watermark: WatermarkConfig,
}

const DEFAULT_CONFIG_FILE: &str = "config.toml";

impl Config {
    /// Builds a Figment that merges defaults and a config TOML file.
    pub fn figment() -> Figment {
        let figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if PathBuf::from(DEFAULT_CONFIG_FILE).is_file() {
            figment.merge(Toml::file(DEFAULT_CONFIG_FILE))
        } else {
            figment
        }
    }

    /// Loads configuration by merging defaults and `config.toml` if present.
    ///
    /// Note: this does **not** validate required fields like `basic.pool_key`.
    /// Binaries should call `Config::from_toml()` instead.
    pub fn from_optional_toml() -> Self {
        Self::figment().extract().unwrap_or_else(|err| {
            panic!("failed to extract configuration (defaults + optional config.toml): {err}")
        })
    }

    /// Loads configuration from the TOML file (with defaults) and validates
    /// required fields and rule tables.
    pub fn from_toml() -> Self {
        if !PathBuf::from(DEFAULT_CONFIG_FILE).is_file() {
            panic!("config file not found: {}", DEFAULT_CONFIG_FILE);
        }
        let cfg: Self = Self::figment().extract().unwrap_or_else(|err| {
            panic!(
                "failed to extract configuration from {}: {err}",
                DEFAULT_CONFIG_FILE
            )
        });
        if cfg.basic.pool_key.trim().is_empty() {
            panic!("basic.pool_key must be set and non-empty");
        }
        if let Err(err) = validate_dispatch_rules(&cfg.dispatch) {
            panic!("invalid dispatch rules: {err}");
        }
        cfg
    }
}

/// Global, lazily-initialized configuration instance.
pub static CONFIG: LazyLock<Config> = LazyLock::new(Config::from_optional_toml);
