//! Shared test harness: temp sqlite databases, a mock broker RPC server,
//! and scripted surfaces / watermark resolvers for driving the runner
//! without a real browser.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::{Json, Router, extract::Path, extract::State, routing::post};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use sorapool::SorapoolError;
use sorapool::bootstrap::Services;
use sorapool::broker::BrokerAdapter;
use sorapool::config::Config;
use sorapool::db::{DbActorHandle, JobRecord, ScanResultCreate, ScanRunCreate};
use sorapool::runner::{SurfaceFactory, TaskPoll, VideoSurface, WatermarkResolver};
use sorapool::upstream::{DeviceIds, UpstreamHttp};

pub const VALID_PUBLISH_URL: &str =
    "https://sora.chatgpt.com/p/s_deadbeefdeadbeefdeadbeefdeadbeef";

pub fn temp_db_url(tag: &str) -> (String, std::path::PathBuf) {
    let tmp_dir = std::env::temp_dir();
    let mut hasher = DefaultHasher::new();
    SystemTime::now().hash(&mut hasher);
    tag.hash(&mut hasher);
    let db_path = tmp_dir.join(format!("test_{tag}_{}.sqlite", hasher.finish()));
    (
        format!("sqlite:{}", db_path.to_str().unwrap()),
        db_path,
    )
}

pub async fn cleanup_db(db_path: &std::path::Path) {
    let base = db_path.to_string_lossy().to_string();
    let _ = tokio::fs::remove_file(format!("{base}-wal")).await;
    let _ = tokio::fs::remove_file(format!("{base}-shm")).await;
    let _ = tokio::fs::remove_file(db_path).await;
}

#[derive(Clone)]
pub struct MockProfile {
    pub profile_id: i64,
    pub name: String,
    pub group_title: String,
}

pub fn mock_profile(profile_id: i64, group_title: &str) -> MockProfile {
    MockProfile {
        profile_id,
        name: format!("win-{profile_id}"),
        group_title: group_title.to_string(),
    }
}

async fn mock_rpc(
    State(profiles): State<Arc<Vec<MockProfile>>>,
    Path(cmd): Path<String>,
) -> Json<Value> {
    let ok = |data: Value| Json(json!({"error": {"code": 0, "message": "ok"}, "data": data}));
    match cmd.as_str() {
        "group-list" => {
            let mut titles: Vec<&str> = profiles.iter().map(|p| p.group_title.as_str()).collect();
            titles.sort_unstable();
            titles.dedup();
            let groups: Vec<Value> = titles
                .iter()
                .enumerate()
                .map(|(index, title)| json!({"id": index as i64 + 1, "title": title}))
                .collect();
            ok(json!({"total": groups.len(), "data": groups}))
        }
        "profile-list" => {
            let mut titles: Vec<&str> = profiles.iter().map(|p| p.group_title.as_str()).collect();
            titles.sort_unstable();
            titles.dedup();
            let rows: Vec<Value> = profiles
                .iter()
                .map(|p| {
                    let group_id =
                        titles.iter().position(|t| *t == p.group_title).unwrap_or(0) as i64 + 1;
                    json!({
                        "profile_id": p.profile_id,
                        "name": p.name,
                        "group_id": group_id,
                        "group_name": p.group_title,
                    })
                })
                .collect();
            ok(json!({"total": rows.len(), "data": rows}))
        }
        _ => ok(json!({})),
    }
}

/// Serve a minimal broker RPC on an ephemeral port; returns its base URL.
pub async fn spawn_mock_broker(profiles: Vec<MockProfile>) -> String {
    let app = Router::new()
        .route("/api/v2/{cmd}", post(mock_rpc))
        .with_state(Arc::new(profiles));
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("bind mock broker");
    let addr = listener.local_addr().expect("mock broker addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileScript {
    /// Submit, render, and publish succeed immediately.
    Happy,
    /// Submit is rejected with the upstream heavy-load marker.
    OverloadOnSubmit,
    /// The task never completes; the job sits in the progress phase.
    StallInProgress,
}

pub struct ScriptedFactory {
    scripts: HashMap<i64, ProfileScript>,
}

impl ScriptedFactory {
    pub fn new(scripts: HashMap<i64, ProfileScript>) -> Arc<Self> {
        Arc::new(Self { scripts })
    }
}

#[async_trait]
impl SurfaceFactory for ScriptedFactory {
    async fn create(&self, job: &JobRecord) -> Result<Box<dyn VideoSurface>, SorapoolError> {
        let script = self
            .scripts
            .get(&job.profile_id)
            .copied()
            .unwrap_or(ProfileScript::Happy);
        Ok(Box::new(ScriptedSurface {
            profile_id: job.profile_id,
            script,
        }))
    }
}

struct ScriptedSurface {
    profile_id: i64,
    script: ProfileScript,
}

#[async_trait]
impl VideoSurface for ScriptedSurface {
    async fn submit(&mut self, _job: &JobRecord) -> Result<String, SorapoolError> {
        match self.script {
            ProfileScript::OverloadOnSubmit => Err(SorapoolError::Overload(
                "We're under heavy load, please try again later.".to_string(),
            )),
            _ => Ok(format!("task_{}", self.profile_id)),
        }
    }

    async fn poll_task(&mut self, _task_id: &str) -> Result<TaskPoll, SorapoolError> {
        match self.script {
            ProfileScript::StallInProgress => {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(TaskPoll::Processing)
            }
            _ => Ok(TaskPoll::Completed),
        }
    }

    async fn generation_id(&mut self, _task_id: &str) -> Result<Option<String>, SorapoolError> {
        Ok(Some(format!("gen_scripted{:04}", self.profile_id)))
    }

    async fn publish(
        &mut self,
        _job: &JobRecord,
        _generation_id: &str,
    ) -> Result<String, SorapoolError> {
        Ok(VALID_PUBLISH_URL.to_string())
    }
}

pub struct OkResolver;

#[async_trait]
impl WatermarkResolver for OkResolver {
    async fn resolve(&self, _publish_url: &str) -> Result<String, SorapoolError> {
        Ok("https://cdn.example.com/MP4/s_deadbeef.mp4".to_string())
    }
}

pub struct FailingResolver;

#[async_trait]
impl WatermarkResolver for FailingResolver {
    async fn resolve(&self, _publish_url: &str) -> Result<String, SorapoolError> {
        Err(SorapoolError::Service("解析服务状态码 500".to_string()))
    }
}

/// Base test config: fast polls, mock broker endpoint.
pub fn test_config(broker_base: &str) -> Config {
    let mut cfg = Config::default();
    cfg.basic.pool_key = "test-key".to_string();
    cfg.basic.stream_poll_interval_ms = 100;
    cfg.broker.api_base = url::Url::parse(broker_base).expect("broker base");
    cfg.runner.progress_poll_secs = 1;
    cfg
}

pub async fn spawn_services(
    db: DbActorHandle,
    cfg: &Config,
    factory: Arc<dyn SurfaceFactory>,
    resolver: Arc<dyn WatermarkResolver>,
) -> Services {
    let broker = BrokerAdapter::new(cfg.broker.clone());
    let upstream = UpstreamHttp::new(cfg.upstream.clone(), Arc::new(DeviceIds::default()));
    Services::spawn_with(db, cfg, broker, upstream, factory, resolver).await
}

/// Seed one scan run so the dispatcher has quota/plan data to rank with.
pub async fn seed_scan_run(
    db: &DbActorHandle,
    group_title: &str,
    rows: &[(i64, Option<i64>, Option<&str>)],
) -> i64 {
    let run_id = db
        .create_scan_run(ScanRunCreate {
            group_title: group_title.to_string(),
            total: rows.len() as i64,
        })
        .await
        .expect("create scan run");
    for (profile_id, quota, plan) in rows {
        db.insert_scan_result(ScanResultCreate {
            run_id,
            profile_id: *profile_id,
            window_name: Some(format!("win-{profile_id}")),
            session_status: Some("active".to_string()),
            account: Some(format!("acct{profile_id}@example.com")),
            account_plan: plan.map(ToString::to_string),
            quota_remaining: *quota,
            quota_total: *quota,
            quota_reset_at: None,
            session_payload: None,
            proxy_binding: None,
            source: "api".to_string(),
            success: true,
            error: None,
        })
        .await
        .expect("insert scan result");
    }
    db.finish_scan_run(run_id, rows.len() as i64, 0)
        .await
        .expect("finish scan run");
    run_id
}

/// Poll `probe` until it returns `Some(T)` or the deadline passes.
pub async fn wait_until<T, F, Fut>(timeout: Duration, mut probe: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = probe().await {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
