//! Account registry & scanner: observe each profile's upstream state
//! (identity, plan, quota, cooldown inputs) and keep a bounded history of
//! scan runs per group.
//!
//! Per profile the scan attempts, in order:
//! (a) the service-side request path using the last known access token plus
//!     the profile's bound proxy and device UA;
//! (b) on a Cloudflare challenge or token rejection, and only when
//!     `with_fallback` is set, a real browser session via the broker.
//! Individual profile failures produce `success=false` rows; a run never
//! fails as a whole.

pub mod silent;

pub use silent::{RefreshRegistry, RefreshStatus};

use chrono::Utc;
use serde_json::Value;
use sorapool_schema::sora::{NfCheckPayload, SessionPayload};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::broker::{BrokerAdapter, ProxyBinding, Window};
use crate::browser::DebugSession;
use crate::db::{DbActorHandle, ScanResultCreate, ScanResultRecord, ScanRunCreate, ScanRunRecord};
use crate::error::SorapoolError;
use crate::upstream::{self, UpstreamHttp};
use crate::utils::logging::with_pretty_json_debug;

/// Scan-run history kept per group; older runs and their results are purged
/// together.
pub const MAX_SCAN_RUNS: i64 = 10;

#[derive(Debug, Clone, Copy)]
pub struct ScanRunSummary {
    pub run_id: i64,
    pub total: i64,
    pub success_count: i64,
    pub failed_count: i64,
}

#[derive(Clone)]
pub struct ScanService {
    db: DbActorHandle,
    broker: BrokerAdapter,
    upstream: UpstreamHttp,
    registry: Arc<RefreshRegistry>,
    /// Scan runs are serialized per group; cross-group runs interleave.
    active_groups: Arc<std::sync::Mutex<ahash::AHashSet<String>>>,
}

/// Releases the per-group scan slot when a run ends, however it ends.
struct GroupScanGuard {
    active_groups: Arc<std::sync::Mutex<ahash::AHashSet<String>>>,
    group_title: String,
}

impl Drop for GroupScanGuard {
    fn drop(&mut self) {
        self.active_groups
            .lock()
            .expect("active scan set poisoned")
            .remove(&self.group_title);
    }
}

struct ProfileScan {
    session_status: Option<String>,
    account: Option<String>,
    account_plan: Option<String>,
    quota: upstream::QuotaInfo,
    session_payload: Option<String>,
    source: &'static str,
}

impl ScanService {
    pub fn new(db: DbActorHandle, broker: BrokerAdapter, upstream: UpstreamHttp) -> Self {
        Self {
            db,
            broker,
            upstream,
            registry: Arc::new(RefreshRegistry::default()),
            active_groups: Arc::new(std::sync::Mutex::new(ahash::AHashSet::new())),
        }
    }

    pub fn registry(&self) -> Arc<RefreshRegistry> {
        self.registry.clone()
    }

    /// Run one scan round over a group (optionally restricted to specific
    /// profiles). Progress is streamed through `progress` when provided.
    pub async fn scan_group(
        &self,
        group_title: &str,
        profile_ids: Option<&[i64]>,
        with_fallback: bool,
        progress: Option<&watch::Sender<RefreshStatus>>,
    ) -> Result<ScanRunSummary, SorapoolError> {
        let _guard = {
            let mut active = self
                .active_groups
                .lock()
                .expect("active scan set poisoned");
            if !active.insert(group_title.to_string()) {
                return Err(SorapoolError::Service(format!(
                    "分组 {group_title} 扫描进行中，请稍后再试"
                )));
            }
            GroupScanGuard {
                active_groups: self.active_groups.clone(),
                group_title: group_title.to_string(),
            }
        };

        let Some(group) = self.broker.find_group(group_title).await? else {
            return Err(SorapoolError::NotFound(format!(
                "未找到分组：{group_title}"
            )));
        };

        let windows: Vec<Window> = group
            .windows
            .into_iter()
            .filter(|w| profile_ids.is_none_or(|ids| ids.contains(&w.profile_id)))
            .collect();
        let total = windows.len() as i64;

        let run_id = self
            .db
            .create_scan_run(ScanRunCreate {
                group_title: group_title.to_string(),
                total,
            })
            .await?;

        info!(group = group_title, run_id, total, with_fallback, "scan run started");

        let mut success_count = 0i64;
        let mut failed_count = 0i64;

        for (index, window) in windows.iter().enumerate() {
            if let Some(progress) = progress {
                progress.send_modify(|status| {
                    status.total = total;
                    status.processed = index as i64;
                    status.success_count = success_count;
                    status.failed_count = failed_count;
                    status.current_profile_id = Some(window.profile_id);
                    status.current_window_name = Some(window.name.clone());
                    status.recompute_pct();
                });
            }

            let row = self.scan_profile(run_id, group_title, window, with_fallback).await;
            if row.success {
                success_count += 1;
            } else {
                failed_count += 1;
            }
            if let Err(err) = self.db.insert_scan_result(row).await {
                warn!(profile_id = window.profile_id, %err, "scan result insert failed");
                // The row is lost but the run continues; count it as failed.
            }
        }

        self.db
            .finish_scan_run(run_id, success_count, failed_count)
            .await?;
        let pruned = self.db.prune_scan_runs(group_title, MAX_SCAN_RUNS).await?;
        if pruned > 0 {
            info!(group = group_title, pruned, "old scan runs purged");
        }

        if let Some(progress) = progress {
            progress.send_modify(|status| {
                status.processed = total;
                status.success_count = success_count;
                status.failed_count = failed_count;
                status.current_profile_id = None;
                status.current_window_name = None;
                status.run_id = Some(run_id);
                status.recompute_pct();
            });
        }

        info!(
            group = group_title,
            run_id, total, success_count, failed_count, "scan run finished"
        );

        Ok(ScanRunSummary {
            run_id,
            total,
            success_count,
            failed_count,
        })
    }

    /// One profile, one result row. Never propagates an error.
    async fn scan_profile(
        &self,
        run_id: i64,
        group_title: &str,
        window: &Window,
        with_fallback: bool,
    ) -> ScanResultCreate {
        let profile_id = window.profile_id;
        let proxy = &window.proxy;

        let prior_token = self
            .db
            .latest_good_result_for_profile(group_title, profile_id, i64::MAX)
            .await
            .ok()
            .flatten()
            .and_then(|row| row.session_payload)
            .and_then(|payload| serde_json::from_str::<SessionPayload>(&payload).ok())
            .and_then(|session| session.access_token);

        let api_attempt = match prior_token.as_deref() {
            Some(token) => self.scan_via_api(profile_id, proxy, token).await,
            None => Err(SorapoolError::TokenAuth("无可用令牌".to_string())),
        };

        let outcome = match api_attempt {
            Ok(scan) => Ok(scan),
            Err(err @ (SorapoolError::CfChallenge(_) | SorapoolError::TokenAuth(_)))
                if with_fallback =>
            {
                warn!(profile_id, %err, "api scan needs browser fallback");
                self.scan_via_browser(profile_id).await
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(scan) => ScanResultCreate {
                run_id,
                profile_id,
                window_name: Some(window.name.clone()),
                session_status: scan.session_status,
                account: scan.account,
                account_plan: scan.account_plan,
                quota_remaining: scan.quota.remaining,
                quota_total: scan.quota.total,
                quota_reset_at: scan.quota.reset_at,
                session_payload: scan.session_payload,
                proxy_binding: serde_json::to_string(proxy).ok(),
                source: scan.source.to_string(),
                success: true,
                error: None,
            },
            Err(err) => ScanResultCreate {
                run_id,
                profile_id,
                window_name: Some(window.name.clone()),
                session_status: None,
                account: None,
                account_plan: None,
                quota_remaining: None,
                quota_total: None,
                quota_reset_at: None,
                session_payload: None,
                proxy_binding: serde_json::to_string(proxy).ok(),
                source: "api".to_string(),
                success: false,
                error: Some(err.to_string()),
            },
        }
    }

    /// Service-side path: session → identity/plan → quota, all through the
    /// profile's proxy binding.
    async fn scan_via_api(
        &self,
        profile_id: i64,
        proxy: &ProxyBinding,
        access_token: &str,
    ) -> Result<ProfileScan, SorapoolError> {
        let session = self
            .upstream
            .fetch_session(profile_id, Some(proxy), access_token)
            .await?;
        with_pretty_json_debug(&session, |json| {
            tracing::debug!(profile_id, session = %json, "session payload");
        });

        // The session response may carry a fresher token than the stored one.
        let token = session
            .access_token
            .clone()
            .unwrap_or_else(|| access_token.to_string());

        let mut account = session.account_label();
        if account.is_none()
            && let Ok(me) = self.upstream.fetch_me(profile_id, Some(proxy), &token).await
        {
            account = me
                .get("email")
                .or_else(|| me.get("name"))
                .and_then(Value::as_str)
                .map(ToString::to_string);
        }

        let plan = self.resolve_plan(profile_id, proxy, &token).await;

        let quota = match self.upstream.nf_check(profile_id, Some(proxy), &token).await {
            Ok(payload) => upstream::parse_nf_check(&payload, Utc::now()),
            Err(err @ (SorapoolError::CfChallenge(_) | SorapoolError::TokenAuth(_))) => {
                return Err(err);
            }
            Err(err) => {
                warn!(profile_id, %err, "nf/check failed; quota unknown");
                upstream::QuotaInfo::default()
            }
        };

        Ok(ProfileScan {
            session_status: Some("active".to_string()),
            account,
            account_plan: plan,
            quota,
            session_payload: serde_json::to_string(&session).ok(),
            source: "api",
        })
    }

    /// Prefer the subscription endpoint's plan id/title; fall back to the
    /// access token's plan claim.
    async fn resolve_plan(
        &self,
        profile_id: i64,
        proxy: &ProxyBinding,
        token: &str,
    ) -> Option<String> {
        if let Ok(subscription) = self
            .upstream
            .fetch_subscription(profile_id, Some(proxy), token)
            .await
            && let Some(plan) = subscription.plan
        {
            for value in [plan.id.as_deref(), plan.title.as_deref()] {
                if let Some(normalized) = value.and_then(upstream::normalize_account_plan) {
                    return Some(normalized.to_string());
                }
            }
        }
        upstream::plan_from_access_token(token).map(ToString::to_string)
    }

    /// Browser fallback: open the window silently, run the session and quota
    /// fetches in-page, then close the window again.
    async fn scan_via_browser(&self, profile_id: i64) -> Result<ProfileScan, SorapoolError> {
        let outcome = self.broker.open_profile_silent(profile_id).await?;
        let endpoint = outcome
            .data
            .debug_endpoint()
            .ok_or_else(|| SorapoolError::Connection("未返回调试地址".to_string()))?;

        let result = async {
            let session = DebugSession::connect(&endpoint).await?;
            session.navigate("https://sora.chatgpt.com/drafts").await?;
            let value = session
                .evaluate_value(IN_PAGE_SCAN_SCRIPT)
                .await?;

            let session_payload: Option<SessionPayload> = value
                .get("session")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok());
            let nf_payload: Option<NfCheckPayload> = value
                .get("nf")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok());

            let Some(session_payload) = session_payload else {
                let detail = value
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("session 获取失败");
                return Err(SorapoolError::TokenAuth(detail.to_string()));
            };

            let token = session_payload.access_token.clone().unwrap_or_default();
            let plan = session_payload
                .extra
                .get("chatgpt_plan_type")
                .and_then(Value::as_str)
                .and_then(upstream::normalize_account_plan)
                .map(ToString::to_string)
                .or_else(|| upstream::plan_from_access_token(&token).map(ToString::to_string));

            let quota = nf_payload
                .map(|payload| upstream::parse_nf_check(&payload, Utc::now()))
                .unwrap_or_default();

            Ok(ProfileScan {
                session_status: Some("active".to_string()),
                account: session_payload.account_label(),
                account_plan: plan,
                quota,
                session_payload: serde_json::to_string(&session_payload).ok(),
                source: "browser",
            })
        }
        .await;

        // Silent scans never leave windows behind, even on failure.
        if !outcome.attached {
            self.broker
                .ensure_profile_closed(profile_id, Duration::from_secs(8))
                .await;
        }

        result
    }

    /// Latest complete run plus its rows; with `with_fallback`, rows missing
    /// account/plan/quota are filled from the most recent prior successful
    /// result of the same profile.
    pub async fn get_latest(
        &self,
        group_title: &str,
        with_fallback: bool,
    ) -> Result<Option<(ScanRunRecord, Vec<ScanResultRecord>)>, SorapoolError> {
        let Some(run) = self.db.latest_scan_run(group_title).await? else {
            return Ok(None);
        };
        let mut rows = self.db.scan_results_by_run(run.id).await?;

        if with_fallback {
            let mut applied = 0i64;
            for row in &mut rows {
                let missing = row.account.is_none()
                    || row.account_plan.is_none()
                    || row.quota_remaining.is_none()
                    || row.quota_reset_at.is_none();
                if !missing {
                    continue;
                }
                let Some(prior) = self
                    .db
                    .latest_good_result_for_profile(group_title, row.profile_id, run.id)
                    .await?
                else {
                    continue;
                };

                let mut touched = false;
                if row.account.is_none() && prior.account.is_some() {
                    row.account = prior.account.clone();
                    touched = true;
                }
                if row.account_plan.is_none() && prior.account_plan.is_some() {
                    row.account_plan = prior.account_plan.clone();
                    touched = true;
                }
                if row.quota_remaining.is_none() && prior.quota_remaining.is_some() {
                    row.quota_remaining = prior.quota_remaining;
                    row.quota_total = row.quota_total.or(prior.quota_total);
                    touched = true;
                }
                if row.quota_reset_at.is_none() && prior.quota_reset_at.is_some() {
                    row.quota_reset_at = prior.quota_reset_at;
                    touched = true;
                }
                if touched {
                    row.fallback_applied = true;
                    applied += 1;
                }
            }
            if applied > 0 {
                self.db.set_scan_run_fallback_count(run.id, applied).await?;
            }
        }

        Ok(Some((run, rows)))
    }
}

const IN_PAGE_SCAN_SCRIPT: &str = r#"
(async () => {
  const out = { session: null, nf: null, error: null };
  try {
    const sessionResp = await fetch("https://sora.chatgpt.com/api/auth/session", {
      method: "GET",
      credentials: "include"
    });
    out.session = await sessionResp.json().catch(() => null);
    const token = out.session && out.session.accessToken;
    if (token) {
      const nfResp = await fetch("https://sora.chatgpt.com/backend/nf/check", {
        method: "GET",
        credentials: "include",
        headers: { "Authorization": `Bearer ${token}`, "Accept": "application/json" }
      });
      out.nf = await nfResp.json().catch(() => null);
    }
  } catch (e) {
    out.error = String(e);
  }
  return out;
})()
"#;
