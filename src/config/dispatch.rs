use serde::{Deserialize, Serialize};

/// Weighted account-dispatch settings.
///
/// The ignore/error rule tables form a small first-match evaluation DSL over
/// job fail events: ignore rules drop operator noise from the quality
/// denominator; error rules assign a penalty and an optional blocking
/// cooldown. Rule order is significant, so configurations with duplicate
/// `(phase, message_contains)` pairs are rejected at load.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Master switch for weighted auto dispatch.
    /// TOML: `dispatch.enabled`. Default: `true`.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Profiles with a known quota below this are blocked (unless the quota
    /// reset is imminent, see `quota_reset_grace_minutes`).
    #[serde(default = "default_min_quota_remaining")]
    pub min_quota_remaining: i64,

    /// Remaining-quota value that maps to a full quantity score.
    #[serde(default = "default_quota_cap")]
    pub quota_cap: i64,

    /// A quota-blocked profile stays selectable when its reset time is at
    /// most this many minutes away.
    #[serde(default = "default_quota_reset_grace_minutes")]
    pub quota_reset_grace_minutes: i64,

    /// Quantity score used when a profile's quota is unknown.
    #[serde(default = "default_unknown_quota_score")]
    pub unknown_quota_score: f64,

    /// Quality score used when a profile has no scored history.
    #[serde(default = "default_quality_score")]
    pub default_quality_score: f64,

    /// Flat bonus for profiles on the plus plan.
    #[serde(default = "default_plus_bonus")]
    pub plus_bonus: f64,

    /// Score penalty per active (queued/running) job on the profile.
    #[serde(default = "default_active_job_penalty")]
    pub active_job_penalty: f64,

    /// Half-life, in hours, of the exponential decay applied to error-rule
    /// penalties.
    #[serde(default = "default_decay_half_life_hours")]
    pub decay_half_life_hours: f64,

    /// How far back jobs and fail events are considered, hours.
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: i64,

    #[serde(default = "default_quantity_weight")]
    pub quantity_weight: f64,

    #[serde(default = "default_quality_weight")]
    pub quality_weight: f64,

    /// Fail events matching any of these are excluded from the quality
    /// denominator and carry no penalty.
    #[serde(default)]
    pub ignore_rules: Vec<IgnoreRule>,

    /// Ordered penalty rules; first match wins.
    #[serde(default)]
    pub error_rules: Vec<ErrorRule>,

    /// Applied when no error rule matches.
    #[serde(default)]
    pub default_error_rule: DefaultErrorRule,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct IgnoreRule {
    /// Restrict the rule to one phase; empty matches every phase.
    #[serde(default)]
    pub phase: Option<String>,
    pub message_contains: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorRule {
    #[serde(default)]
    pub phase: Option<String>,
    pub message_contains: String,
    #[serde(default)]
    pub penalty: f64,
    #[serde(default)]
    pub cooldown_minutes: i64,
    #[serde(default)]
    pub block_during_cooldown: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DefaultErrorRule {
    pub penalty: f64,
    pub cooldown_minutes: i64,
    pub block_during_cooldown: bool,
}

impl Default for DefaultErrorRule {
    fn default() -> Self {
        Self {
            penalty: 10.0,
            cooldown_minutes: 0,
            block_during_cooldown: false,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            min_quota_remaining: default_min_quota_remaining(),
            quota_cap: default_quota_cap(),
            quota_reset_grace_minutes: default_quota_reset_grace_minutes(),
            unknown_quota_score: default_unknown_quota_score(),
            default_quality_score: default_quality_score(),
            plus_bonus: default_plus_bonus(),
            active_job_penalty: default_active_job_penalty(),
            decay_half_life_hours: default_decay_half_life_hours(),
            lookback_hours: default_lookback_hours(),
            quantity_weight: default_quantity_weight(),
            quality_weight: default_quality_weight(),
            ignore_rules: Vec::new(),
            error_rules: Vec::new(),
            default_error_rule: DefaultErrorRule::default(),
        }
    }
}

/// Reject rule tables whose duplicate `(phase, substring)` pairs would make
/// first-match ordering non-deterministic.
pub fn validate_dispatch_rules(cfg: &DispatchConfig) -> Result<(), String> {
    let mut seen = ahash::AHashSet::new();
    for rule in &cfg.ignore_rules {
        let key = rule_key(rule.phase.as_deref(), &rule.message_contains);
        if !seen.insert(key.clone()) {
            return Err(format!("duplicate ignore rule: {key}"));
        }
    }
    let mut seen = ahash::AHashSet::new();
    for rule in &cfg.error_rules {
        let key = rule_key(rule.phase.as_deref(), &rule.message_contains);
        if !seen.insert(key.clone()) {
            return Err(format!("duplicate error rule: {key}"));
        }
    }
    Ok(())
}

fn rule_key(phase: Option<&str>, contains: &str) -> String {
    format!(
        "{}:{}",
        phase.unwrap_or("").trim().to_lowercase(),
        contains.trim().to_lowercase()
    )
}

fn default_enabled() -> bool {
    true
}

fn default_min_quota_remaining() -> i64 {
    1
}

fn default_quota_cap() -> i64 {
    30
}

fn default_quota_reset_grace_minutes() -> i64 {
    90
}

fn default_unknown_quota_score() -> f64 {
    40.0
}

fn default_quality_score() -> f64 {
    80.0
}

fn default_plus_bonus() -> f64 {
    10.0
}

fn default_active_job_penalty() -> f64 {
    20.0
}

fn default_decay_half_life_hours() -> f64 {
    24.0
}

fn default_lookback_hours() -> i64 {
    72
}

fn default_quantity_weight() -> f64 {
    0.5
}

fn default_quality_weight() -> f64 {
    0.5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_error_rules_are_rejected() {
        let mut cfg = DispatchConfig::default();
        cfg.error_rules.push(ErrorRule {
            phase: Some("publish".to_string()),
            message_contains: "限流".to_string(),
            penalty: 40.0,
            cooldown_minutes: 120,
            block_during_cooldown: true,
        });
        assert!(validate_dispatch_rules(&cfg).is_ok());

        cfg.error_rules.push(ErrorRule {
            phase: Some("Publish".to_string()),
            message_contains: "限流".to_string(),
            penalty: 5.0,
            cooldown_minutes: 0,
            block_during_cooldown: false,
        });
        assert!(validate_dispatch_rules(&cfg).is_err());
    }
}
