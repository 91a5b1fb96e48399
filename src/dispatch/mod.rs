//! Weighted account dispatch: rank a group's profiles by
//! `quantity × quality + tier bonus − active-load penalty` and pick the best
//! selectable one for a new job.
//!
//! The scoring core is pure (no IO, no locks) over a snapshot gathered from
//! the store and the broker caches; `DispatchService` does the gathering.

use ahash::AHashMap;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use tracing::debug;

use crate::broker::{BrokerAdapter, Window};
use crate::config::{DefaultErrorRule, DispatchConfig, ErrorRule};
use crate::db::{DbActorHandle, FailEventRow, ScanResultRecord};
use crate::error::SorapoolError;

#[derive(Debug, Clone, Serialize)]
pub struct AccountWeight {
    pub profile_id: i64,
    pub window_name: Option<String>,
    pub account: Option<String>,
    pub selectable: bool,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub quota_remaining: Option<i64>,
    pub quota_total: Option<i64>,
    pub score_total: f64,
    pub score_quantity: f64,
    pub score_quality: f64,
    pub success_count: i64,
    pub fail_count_non_ignored: i64,
    pub ignored_error_count: i64,
    pub last_non_ignored_error: Option<String>,
    pub last_non_ignored_error_at: Option<DateTime<Utc>>,
    pub reasons: Vec<String>,
}

/// Snapshot the pure scoring runs over.
#[derive(Debug, Default)]
pub struct DispatchInputs {
    pub windows: Vec<Window>,
    pub scan_map: AHashMap<i64, ScanResultRecord>,
    pub success_counts: AHashMap<i64, i64>,
    pub fail_events: AHashMap<i64, Vec<FailEventRow>>,
    pub active_jobs: AHashMap<i64, i64>,
    pub pending_submits: AHashMap<i64, i64>,
}

fn clamp(value: f64, lower: f64, upper: f64) -> f64 {
    value.max(lower).min(upper)
}

struct QualityMeta {
    ignored_error_count: i64,
    fail_count_non_ignored: i64,
    last_non_ignored_error: Option<String>,
    last_non_ignored_error_at: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
}

fn is_ignored_event(cfg: &DispatchConfig, phase: &str, message: &str) -> bool {
    let message_lower = message.to_lowercase();
    cfg.ignore_rules.iter().any(|rule| {
        let rule_phase = rule
            .phase
            .as_deref()
            .map(str::trim)
            .map(str::to_lowercase)
            .unwrap_or_default();
        (rule_phase.is_empty() || rule_phase == phase)
            && message_lower.contains(&rule.message_contains.to_lowercase())
    })
}

enum ResolvedRule<'a> {
    Matched(&'a ErrorRule),
    Default(&'a DefaultErrorRule),
}

impl ResolvedRule<'_> {
    fn penalty(&self) -> f64 {
        match self {
            ResolvedRule::Matched(rule) => rule.penalty,
            ResolvedRule::Default(rule) => rule.penalty,
        }
    }

    fn cooldown_minutes(&self) -> i64 {
        match self {
            ResolvedRule::Matched(rule) => rule.cooldown_minutes,
            ResolvedRule::Default(rule) => rule.cooldown_minutes,
        }
    }

    fn block_during_cooldown(&self) -> bool {
        match self {
            ResolvedRule::Matched(rule) => rule.block_during_cooldown,
            ResolvedRule::Default(rule) => rule.block_during_cooldown,
        }
    }
}

/// First matching error rule wins; otherwise the default rule applies.
fn resolve_error_rule<'a>(
    cfg: &'a DispatchConfig,
    phase: &str,
    message: &str,
) -> ResolvedRule<'a> {
    let message_lower = message.to_lowercase();
    for rule in &cfg.error_rules {
        let rule_phase = rule
            .phase
            .as_deref()
            .map(str::trim)
            .map(str::to_lowercase)
            .unwrap_or_default();
        if !rule_phase.is_empty() && rule_phase != phase {
            continue;
        }
        if message_lower.contains(&rule.message_contains.to_lowercase()) {
            return ResolvedRule::Matched(rule);
        }
    }
    ResolvedRule::Default(&cfg.default_error_rule)
}

fn quantity_score(cfg: &DispatchConfig, quota_remaining_effective: Option<i64>) -> f64 {
    match quota_remaining_effective {
        None => clamp(cfg.unknown_quota_score, 0.0, 100.0),
        Some(remaining) => {
            let cap = cfg.quota_cap.max(1) as f64;
            let ratio = clamp(remaining as f64, 0.0, cap) / cap;
            clamp(100.0 * ratio, 0.0, 100.0)
        }
    }
}

fn quality_score(
    cfg: &DispatchConfig,
    events: &[FailEventRow],
    success_count: i64,
    now: DateTime<Utc>,
) -> (f64, QualityMeta) {
    let mut meta = QualityMeta {
        ignored_error_count: 0,
        fail_count_non_ignored: 0,
        last_non_ignored_error: None,
        last_non_ignored_error_at: None,
        cooldown_until: None,
    };
    let mut total_penalty = 0.0;
    let half_life = cfg.decay_half_life_hours.max(1.0);

    for event in events {
        let phase = event.phase.trim().to_lowercase();
        let message = event
            .message
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or("(无错误信息)");

        if is_ignored_event(cfg, &phase, message) {
            meta.ignored_error_count += 1;
            continue;
        }

        meta.fail_count_non_ignored += 1;
        if meta.last_non_ignored_error.is_none() {
            meta.last_non_ignored_error = Some(message.to_string());
            meta.last_non_ignored_error_at = Some(event.created_at);
        }

        let rule = resolve_error_rule(cfg, &phase, message);
        let age_hours = (now - event.created_at).num_seconds().max(0) as f64 / 3600.0;
        let decay = 0.5_f64.powf(age_hours / half_life);
        total_penalty += rule.penalty() * decay;

        if rule.block_during_cooldown() && rule.cooldown_minutes() > 0 {
            let until = event.created_at + ChronoDuration::minutes(rule.cooldown_minutes());
            if meta.cooldown_until.is_none_or(|current| until > current) {
                meta.cooldown_until = Some(until);
            }
        }
    }

    let denominator = success_count + meta.fail_count_non_ignored;
    let base_quality = if denominator > 0 {
        100.0 * success_count as f64 / denominator as f64
    } else {
        cfg.default_quality_score
    };

    (clamp(base_quality - total_penalty, 0.0, 100.0), meta)
}

/// Pure weight computation over a snapshot. Output is sorted best-first:
/// selectable, then total score, then remaining quota, then profile id.
pub fn compute_weights(
    inputs: &DispatchInputs,
    cfg: &DispatchConfig,
    now: DateTime<Utc>,
) -> Vec<AccountWeight> {
    let empty_events: Vec<FailEventRow> = Vec::new();
    let mut weights: Vec<AccountWeight> = inputs
        .windows
        .iter()
        .map(|window| {
            let profile_id = window.profile_id;
            let scan = inputs.scan_map.get(&profile_id);
            let quota_remaining = scan.and_then(|row| row.quota_remaining);
            let quota_total = scan.and_then(|row| row.quota_total);
            let quota_reset_at = scan.and_then(|row| row.quota_reset_at);
            let account = scan.and_then(|row| row.account.clone());
            let plan = scan
                .and_then(|row| row.account_plan.as_deref())
                .map(str::to_lowercase);

            let pending = inputs
                .pending_submits
                .get(&profile_id)
                .copied()
                .unwrap_or(0);
            // Uncommitted submits are about to consume quota; don't count it
            // twice across near-simultaneous dispatches.
            let quota_effective = quota_remaining.map(|q| (q - pending).max(0));

            let score_quantity = quantity_score(cfg, quota_effective);
            let (score_quality, meta) = quality_score(
                cfg,
                inputs
                    .fail_events
                    .get(&profile_id)
                    .unwrap_or(&empty_events),
                inputs.success_counts.get(&profile_id).copied().unwrap_or(0),
                now,
            );

            let plus_bonus = if plan.as_deref() == Some("plus") {
                cfg.plus_bonus
            } else {
                0.0
            };
            let active_count = inputs.active_jobs.get(&profile_id).copied().unwrap_or(0);
            let score_total = cfg.quantity_weight * score_quantity
                + cfg.quality_weight * score_quality
                + plus_bonus
                - active_count as f64 * cfg.active_job_penalty;

            let quota_low = quota_remaining.is_some_and(|q| q < cfg.min_quota_remaining);
            let reset_near = quota_reset_at.is_some_and(|reset| {
                reset - now <= ChronoDuration::minutes(cfg.quota_reset_grace_minutes)
            });
            let blocked_by_quota = quota_low && !reset_near;
            let blocked_by_cooldown = meta.cooldown_until.is_some_and(|until| until > now);
            let selectable = cfg.enabled && !blocked_by_quota && !blocked_by_cooldown;

            let mut reasons = vec![
                format!("数量分 {score_quantity:.1}"),
                format!("质量分 {score_quality:.1}"),
            ];
            if plus_bonus > 0.0 {
                reasons.push(format!("Plus 加分 +{plus_bonus:.1}"));
            }
            if active_count > 0 {
                reasons.push(format!(
                    "活跃任务惩罚 -{:.1}",
                    active_count as f64 * cfg.active_job_penalty
                ));
            }
            if pending > 0 {
                reasons.push(format!("待确认提交 {pending}"));
            }
            if !cfg.enabled {
                reasons.push("自动分配已关闭".to_string());
            }
            if blocked_by_quota {
                reasons.push(format!(
                    "配额不足：{} < {}",
                    quota_remaining.unwrap_or(0),
                    cfg.min_quota_remaining
                ));
            }
            if blocked_by_cooldown
                && let Some(until) = meta.cooldown_until
            {
                reasons.push(format!("冷却中至 {}", until.format("%Y-%m-%d %H:%M:%S")));
            }

            AccountWeight {
                profile_id,
                window_name: Some(window.name.clone()).filter(|n| !n.trim().is_empty()),
                account,
                selectable,
                cooldown_until: meta.cooldown_until,
                quota_remaining,
                quota_total,
                score_total: (score_total * 100.0).round() / 100.0,
                score_quantity: (score_quantity * 100.0).round() / 100.0,
                score_quality: (score_quality * 100.0).round() / 100.0,
                success_count: inputs.success_counts.get(&profile_id).copied().unwrap_or(0),
                fail_count_non_ignored: meta.fail_count_non_ignored,
                ignored_error_count: meta.ignored_error_count,
                last_non_ignored_error: meta.last_non_ignored_error,
                last_non_ignored_error_at: meta.last_non_ignored_error_at,
                reasons,
            }
        })
        .collect();

    weights.sort_by(|a, b| {
        (
            b.selectable,
            b.score_total,
            b.quota_remaining.unwrap_or(-1),
            b.profile_id,
        )
            .partial_cmp(&(
                a.selectable,
                a.score_total,
                a.quota_remaining.unwrap_or(-1),
                a.profile_id,
            ))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    weights
}

/// Build the dispatch-rejection message: 无可用账号 plus the top-5 blocked
/// candidates with their leading reasons.
pub fn no_available_error(weights: &[AccountWeight]) -> SorapoolError {
    let fragments: Vec<String> = weights
        .iter()
        .take(5)
        .map(|item| {
            let reason_text = if item.reasons.is_empty() {
                "不可选".to_string()
            } else {
                item.reasons
                    .iter()
                    .take(3)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("；")
            };
            format!("profile={}({reason_text})", item.profile_id)
        })
        .collect();
    let detail = fragments.join(" | ");
    SorapoolError::Service(format!("自动分配失败：当前无可用账号。{detail}"))
}

/// Process-wide dispatcher: snapshots Store + Scanner + Broker state and
/// runs the pure scoring over it.
#[derive(Clone)]
pub struct DispatchService {
    db: DbActorHandle,
    broker: BrokerAdapter,
    cfg: DispatchConfig,
}

impl DispatchService {
    pub fn new(db: DbActorHandle, broker: BrokerAdapter, cfg: DispatchConfig) -> Self {
        Self { db, broker, cfg }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.cfg
    }

    async fn gather_inputs(&self, group_title: &str) -> Result<DispatchInputs, SorapoolError> {
        let Some(group) = self.broker.find_group(group_title).await? else {
            return Ok(DispatchInputs::default());
        };

        let now = Utc::now();
        let since = now - ChronoDuration::hours(self.cfg.lookback_hours.max(1));

        let scan_map = match self.db.latest_scan_run(group_title).await? {
            Some(run) => self
                .db
                .scan_results_by_run(run.id)
                .await?
                .into_iter()
                .map(|row| (row.profile_id, row))
                .collect(),
            None => AHashMap::new(),
        };

        let mut success_counts: AHashMap<i64, i64> = AHashMap::new();
        for job in self.db.list_jobs_since(group_title, since).await? {
            if job.profile_id > 0 && job.status == "completed" {
                *success_counts.entry(job.profile_id).or_default() += 1;
            }
        }

        let mut fail_events: AHashMap<i64, Vec<FailEventRow>> = AHashMap::new();
        for event in self.db.list_fail_events_since(group_title, since).await? {
            if event.profile_id > 0 {
                fail_events.entry(event.profile_id).or_default().push(event);
            }
        }

        Ok(DispatchInputs {
            windows: group.windows,
            scan_map,
            success_counts,
            fail_events,
            active_jobs: self.db.count_active_jobs_by_profile(group_title).await?,
            pending_submits: self.db.count_pending_submits_by_profile(group_title).await?,
        })
    }

    /// Ranked weights for a group (`GET accounts/weights`).
    pub async fn list_weights(
        &self,
        group_title: &str,
        limit: usize,
    ) -> Result<Vec<AccountWeight>, SorapoolError> {
        let inputs = self.gather_inputs(group_title).await?;
        let mut weights = compute_weights(&inputs, &self.cfg, Utc::now());
        weights.truncate(limit.clamp(1, 500));
        Ok(weights)
    }

    /// Highest-score selectable profile outside `exclude`.
    pub async fn pick_best(
        &self,
        group_title: &str,
        exclude: Option<&[i64]>,
    ) -> Result<AccountWeight, SorapoolError> {
        let inputs = self.gather_inputs(group_title).await?;
        if inputs.windows.is_empty() {
            return Err(SorapoolError::Service(
                "自动分配失败：未找到可用账号".to_string(),
            ));
        }

        let mut weights = compute_weights(&inputs, &self.cfg, Utc::now());
        if let Some(exclude) = exclude {
            weights.retain(|w| !exclude.contains(&w.profile_id));
        }

        debug!(
            group = group_title,
            candidates = weights.len(),
            "dispatch weights computed"
        );

        match weights.iter().find(|w| w.selectable) {
            Some(best) => Ok(best.clone()),
            None => Err(no_available_error(&weights)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ProxyBinding;

    fn window(profile_id: i64) -> Window {
        Window {
            profile_id,
            name: format!("win-{profile_id}"),
            proxy: ProxyBinding::default(),
        }
    }

    fn scan_row(profile_id: i64, quota: Option<i64>, plan: Option<&str>) -> ScanResultRecord {
        ScanResultRecord {
            id: profile_id,
            run_id: 1,
            profile_id,
            window_name: None,
            session_status: Some("active".to_string()),
            account: Some(format!("acct{profile_id}@example.com")),
            account_plan: plan.map(ToString::to_string),
            quota_remaining: quota,
            quota_total: quota,
            quota_reset_at: None,
            session_payload: None,
            proxy_binding: None,
            source: "api".to_string(),
            success: true,
            error: None,
            scanned_at: Utc::now(),
            fallback_applied: false,
        }
    }

    fn fail_event(phase: &str, message: &str, at: DateTime<Utc>) -> FailEventRow {
        FailEventRow {
            profile_id: 1,
            phase: phase.to_string(),
            message: Some(message.to_string()),
            created_at: at,
        }
    }

    #[test]
    fn quantity_score_caps_and_unknown() {
        let cfg = DispatchConfig::default();
        assert_eq!(quantity_score(&cfg, None), cfg.unknown_quota_score);
        assert_eq!(quantity_score(&cfg, Some(cfg.quota_cap * 2)), 100.0);
        assert_eq!(quantity_score(&cfg, Some(0)), 0.0);
        let half = quantity_score(&cfg, Some(cfg.quota_cap / 2));
        assert!(half > 0.0 && half < 100.0);
    }

    #[test]
    fn plus_bonus_and_active_penalty_shift_scores() {
        let cfg = DispatchConfig::default();
        let now = Utc::now();
        let mut inputs = DispatchInputs {
            windows: vec![window(1), window(2)],
            ..Default::default()
        };
        inputs.scan_map.insert(1, scan_row(1, Some(10), Some("plus")));
        inputs.scan_map.insert(2, scan_row(2, Some(10), Some("free")));

        let weights = compute_weights(&inputs, &cfg, now);
        assert_eq!(weights[0].profile_id, 1);
        assert!(weights[0].score_total > weights[1].score_total);
        assert!((weights[0].score_total - weights[1].score_total - cfg.plus_bonus).abs() < 1e-6);

        // An active job drags the plus profile below the free one.
        inputs.active_jobs.insert(1, 1);
        let weights = compute_weights(&inputs, &cfg, now);
        assert_eq!(weights[0].profile_id, 2);
    }

    #[test]
    fn pending_submits_reduce_effective_quota() {
        let cfg = DispatchConfig::default();
        let now = Utc::now();
        let mut inputs = DispatchInputs {
            windows: vec![window(1)],
            ..Default::default()
        };
        inputs.scan_map.insert(1, scan_row(1, Some(10), None));
        let full = compute_weights(&inputs, &cfg, now)[0].score_quantity;

        inputs.pending_submits.insert(1, 4);
        let reduced = compute_weights(&inputs, &cfg, now)[0].score_quantity;
        assert!(reduced < full);
    }

    #[test]
    fn ignore_rules_drop_operator_noise_from_quality() {
        let mut cfg = DispatchConfig::default();
        cfg.ignore_rules.push(crate::config::IgnoreRule {
            phase: Some("publish".to_string()),
            message_contains: "未找到发布按钮".to_string(),
        });
        let now = Utc::now();

        let mut inputs = DispatchInputs {
            windows: vec![window(1)],
            ..Default::default()
        };
        inputs.success_counts.insert(1, 3);
        inputs
            .fail_events
            .insert(1, vec![fail_event("publish", "发布失败：未找到发布按钮", now)]);

        let weights = compute_weights(&inputs, &cfg, now);
        assert_eq!(weights[0].ignored_error_count, 1);
        assert_eq!(weights[0].fail_count_non_ignored, 0);
        // Denominator only counts successes, so quality stays at 100.
        assert_eq!(weights[0].score_quality, 100.0);
    }

    #[test]
    fn cooldown_rule_blocks_then_releases() {
        let mut cfg = DispatchConfig::default();
        cfg.error_rules.push(ErrorRule {
            phase: Some("publish".to_string()),
            message_contains: "限流".to_string(),
            penalty: 40.0,
            cooldown_minutes: 120,
            block_during_cooldown: true,
        });

        let t0 = Utc::now();
        let mut inputs = DispatchInputs {
            windows: vec![window(1)],
            ..Default::default()
        };
        inputs
            .fail_events
            .insert(1, vec![fail_event("publish", "触发限流", t0)]);

        // 30 minutes in: still cooling down, not selectable.
        let during = compute_weights(&inputs, &cfg, t0 + ChronoDuration::minutes(30));
        assert!(!during[0].selectable);
        assert_eq!(
            during[0].cooldown_until,
            Some(t0 + ChronoDuration::minutes(120))
        );

        // 121 minutes in: released.
        let after = compute_weights(&inputs, &cfg, t0 + ChronoDuration::minutes(121));
        assert!(after[0].selectable);
    }

    #[test]
    fn quota_block_honors_reset_grace() {
        let cfg = DispatchConfig::default();
        let now = Utc::now();
        let mut inputs = DispatchInputs {
            windows: vec![window(1)],
            ..Default::default()
        };

        let mut low = scan_row(1, Some(0), None);
        low.quota_reset_at = None;
        inputs.scan_map.insert(1, low);
        let blocked = compute_weights(&inputs, &cfg, now);
        assert!(!blocked[0].selectable);

        // Reset imminent: stays selectable despite the empty quota.
        let mut resetting = scan_row(1, Some(0), None);
        resetting.quota_reset_at = Some(now + ChronoDuration::minutes(10));
        inputs.scan_map.insert(1, resetting);
        let released = compute_weights(&inputs, &cfg, now);
        assert!(released[0].selectable);
    }

    #[test]
    fn no_available_message_carries_top_reasons() {
        let mut cfg = DispatchConfig::default();
        cfg.enabled = false;
        let now = Utc::now();
        let inputs = DispatchInputs {
            windows: vec![window(1), window(2)],
            ..Default::default()
        };
        let weights = compute_weights(&inputs, &cfg, now);
        assert!(weights.iter().all(|w| !w.selectable));

        let err = no_available_error(&weights);
        let text = err.to_string();
        assert!(text.contains("无可用账号"));
        assert!(text.contains("profile="));
        assert!(text.contains("自动分配已关闭"));
    }
}
