//! Silent-refresh handles: background scan runs with streamed progress.
//!
//! Handles live in memory only: a handle is a view over a running (or just
//! finished) scan, not a durable record. Starting a refresh for a group that
//! already has one active returns the existing handle (idempotent).

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::{error, info};

use crate::error::SorapoolError;
use crate::scanner::ScanService;

#[derive(Debug, Clone, Serialize)]
pub struct RefreshStatus {
    pub group_title: String,
    pub status: String,
    pub total: i64,
    pub processed: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub progress_pct: f64,
    pub current_profile_id: Option<i64>,
    pub current_window_name: Option<String>,
    pub run_id: Option<i64>,
    pub with_fallback: bool,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RefreshStatus {
    fn new(group_title: &str, with_fallback: bool) -> Self {
        Self {
            group_title: group_title.to_string(),
            status: "running".to_string(),
            total: 0,
            processed: 0,
            success_count: 0,
            failed_count: 0,
            progress_pct: 0.0,
            current_profile_id: None,
            current_window_name: None,
            run_id: None,
            with_fallback,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub(crate) fn recompute_pct(&mut self) {
        let total = self.total.max(1) as f64;
        let pct = (self.processed.max(0) as f64 / total) * 100.0;
        self.progress_pct = (pct.clamp(0.0, 100.0) * 100.0).round() / 100.0;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "completed" | "failed")
    }
}

/// Per-group registry of refresh handles. Serializes scans per group: at
/// most one active run per group title, cross-group runs interleave freely.
#[derive(Default)]
pub struct RefreshRegistry {
    handles: Mutex<AHashMap<String, watch::Receiver<RefreshStatus>>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshStartResult {
    pub job: RefreshStatus,
    pub reused: bool,
}

impl RefreshRegistry {
    pub fn current(&self, group_title: &str) -> Option<RefreshStatus> {
        self.handles
            .lock()
            .expect("refresh registry poisoned")
            .get(group_title)
            .map(|rx| rx.borrow().clone())
    }

    /// Subscribe to a group's live refresh progress.
    pub fn subscribe(&self, group_title: &str) -> Option<watch::Receiver<RefreshStatus>> {
        self.handles
            .lock()
            .expect("refresh registry poisoned")
            .get(group_title)
            .cloned()
    }
}

impl ScanService {
    /// Schedule a background scan for the group, returning its handle. If a
    /// run is already active for the group, that handle is returned instead
    /// of starting a second one.
    pub fn start_silent_refresh(
        &self,
        group_title: &str,
        with_fallback: bool,
    ) -> Result<RefreshStartResult, SorapoolError> {
        let registry = self.registry();
        let mut handles = registry
            .handles
            .lock()
            .expect("refresh registry poisoned");

        if let Some(existing) = handles.get(group_title) {
            let snapshot = existing.borrow().clone();
            if !snapshot.is_terminal() {
                info!(group = group_title, "reusing active silent refresh");
                return Ok(RefreshStartResult {
                    job: snapshot,
                    reused: true,
                });
            }
        }

        let (tx, rx) = watch::channel(RefreshStatus::new(group_title, with_fallback));
        handles.insert(group_title.to_string(), rx.clone());
        drop(handles);

        let service = self.clone();
        let group = group_title.to_string();
        tokio::spawn(async move {
            info!(group = %group, with_fallback, "silent refresh started");
            match service.scan_group(&group, None, with_fallback, Some(&tx)).await {
                Ok(summary) => {
                    tx.send_modify(|status| {
                        status.status = "completed".to_string();
                        status.total = summary.total;
                        status.processed = summary.total;
                        status.success_count = summary.success_count;
                        status.failed_count = summary.failed_count;
                        status.run_id = Some(summary.run_id);
                        status.current_profile_id = None;
                        status.current_window_name = None;
                        status.finished_at = Some(Utc::now());
                        status.recompute_pct();
                    });
                }
                Err(err) => {
                    error!(group = %group, %err, "silent refresh failed");
                    tx.send_modify(|status| {
                        status.status = "failed".to_string();
                        status.error = Some(err.to_string());
                        status.finished_at = Some(Utc::now());
                    });
                }
            }
        });

        Ok(RefreshStartResult {
            job: rx.borrow().clone(),
            reused: false,
        })
    }
}
