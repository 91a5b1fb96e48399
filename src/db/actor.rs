use crate::db::models::{
    FailEventRow, JobEventRecord, JobFilter, JobPhase, JobRecord, ScanResultRecord, ScanRunRecord,
};
use crate::db::patch::{JobCreate, JobPatch, ScanResultCreate, ScanRunCreate};
use crate::db::schema::SQLITE_INIT;
use crate::db::traits::DbPatchable;
use crate::error::SorapoolError;
use ahash::AHashMap;
use chrono::{DateTime, Utc};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::{str::FromStr, time::Duration};
use tracing::{info, warn};

type Reply<T> = RpcReplyPort<Result<T, SorapoolError>>;

#[derive(Debug)]
pub enum DbActorMessage {
    // -- jobs ---------------------------------------------------------------
    /// Create a job row and return its id. Retry-child creation races
    /// resolve to the existing child instead of erroring.
    CreateJob(JobCreate, Reply<i64>),

    /// Partial, idempotent update. Enforces the phase graph (invalid
    /// transitions are clamped to the current phase with an audit event).
    UpdateJob(i64, JobPatch, Reply<()>),

    /// Append one phase event; returns the strictly-increasing event id.
    AppendEvent {
        job_id: i64,
        phase: String,
        event: String,
        message: Option<String>,
        reply: Reply<i64>,
    },

    GetJob(i64, Reply<Option<JobRecord>>),
    ListJobs(JobFilter, Reply<Vec<JobRecord>>),
    ListJobEvents(i64, Reply<Vec<JobEventRecord>>),

    /// Events strictly after `after_id`, ordered by id ascending.
    ListEventsSince {
        after_id: i64,
        limit: i64,
        reply: Reply<Vec<JobEventRecord>>,
    },
    LatestEventId(Reply<i64>),

    // -- retry chain --------------------------------------------------------
    LatestRetryChild(i64, Reply<Option<JobRecord>>),
    LatestByRoot(i64, Reply<Option<JobRecord>>),
    MaxRetryIndex(i64, Reply<i64>),
    RetryChainProfileIds(i64, Reply<Vec<i64>>),

    // -- dispatcher inputs --------------------------------------------------
    CountActiveJobsByProfile(String, Reply<AHashMap<i64, i64>>),
    CountPendingSubmitsByProfile(String, Reply<AHashMap<i64, i64>>),
    ListJobsSince {
        group_title: String,
        since: DateTime<Utc>,
        reply: Reply<Vec<JobRecord>>,
    },
    ListFailEventsSince {
        group_title: String,
        since: DateTime<Utc>,
        reply: Reply<Vec<FailEventRow>>,
    },

    /// Jobs still queued (startup recovery for the runner pool).
    ListQueuedJobIds(Reply<Vec<i64>>),

    // -- scan history -------------------------------------------------------
    CreateScanRun(ScanRunCreate, Reply<i64>),
    FinishScanRun {
        run_id: i64,
        success_count: i64,
        failed_count: i64,
        reply: Reply<()>,
    },
    SetScanRunFallbackCount {
        run_id: i64,
        count: i64,
        reply: Reply<()>,
    },
    InsertScanResult(ScanResultCreate, Reply<i64>),
    LatestScanRun(String, Reply<Option<ScanRunRecord>>),
    ScanResultsByRun(i64, Reply<Vec<ScanResultRecord>>),
    /// Most recent successful result for a profile from runs older than
    /// `before_run_id` (the with-fallback fill source).
    LatestGoodResultForProfile {
        group_title: String,
        profile_id: i64,
        before_run_id: i64,
        reply: Reply<Option<ScanResultRecord>>,
    },
    /// Keep the newest `keep` runs of a group; drop older runs and their
    /// results together.
    PruneScanRuns {
        group_title: String,
        keep: i64,
        reply: Reply<u64>,
    },
}

#[derive(Clone)]
pub struct DbActorHandle {
    actor: ActorRef<DbActorMessage>,
}

macro_rules! db_call {
    ($self:expr, $variant:ident $(, $arg:expr)*) => {
        ractor::call!($self.actor, DbActorMessage::$variant $(, $arg)*)
            .map_err(|e| SorapoolError::RactorError(format!(concat!("DbActor ", stringify!($variant), " RPC failed: {}"), e)))?
    };
}

impl DbActorHandle {
    pub async fn create_job(&self, create: JobCreate) -> Result<i64, SorapoolError> {
        db_call!(self, CreateJob, create)
    }

    pub async fn update_job(&self, job_id: i64, patch: JobPatch) -> Result<(), SorapoolError> {
        db_call!(self, UpdateJob, job_id, patch)
    }

    pub async fn append_event(
        &self,
        job_id: i64,
        phase: &str,
        event: &str,
        message: Option<String>,
    ) -> Result<i64, SorapoolError> {
        let phase = phase.to_string();
        let event = event.to_string();
        ractor::call!(self.actor, |reply| DbActorMessage::AppendEvent {
            job_id,
            phase,
            event,
            message,
            reply,
        })
        .map_err(|e| SorapoolError::RactorError(format!("DbActor AppendEvent RPC failed: {e}")))?
    }

    pub async fn get_job(&self, job_id: i64) -> Result<Option<JobRecord>, SorapoolError> {
        db_call!(self, GetJob, job_id)
    }

    pub async fn list_jobs(&self, filter: JobFilter) -> Result<Vec<JobRecord>, SorapoolError> {
        db_call!(self, ListJobs, filter)
    }

    pub async fn list_job_events(
        &self,
        job_id: i64,
    ) -> Result<Vec<JobEventRecord>, SorapoolError> {
        db_call!(self, ListJobEvents, job_id)
    }

    pub async fn list_events_since(
        &self,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<JobEventRecord>, SorapoolError> {
        ractor::call!(self.actor, |reply| DbActorMessage::ListEventsSince {
            after_id,
            limit,
            reply,
        })
        .map_err(|e| {
            SorapoolError::RactorError(format!("DbActor ListEventsSince RPC failed: {e}"))
        })?
    }

    pub async fn latest_event_id(&self) -> Result<i64, SorapoolError> {
        db_call!(self, LatestEventId)
    }

    pub async fn latest_retry_child(
        &self,
        job_id: i64,
    ) -> Result<Option<JobRecord>, SorapoolError> {
        db_call!(self, LatestRetryChild, job_id)
    }

    pub async fn latest_by_root(
        &self,
        root_job_id: i64,
    ) -> Result<Option<JobRecord>, SorapoolError> {
        db_call!(self, LatestByRoot, root_job_id)
    }

    pub async fn max_retry_index(&self, root_job_id: i64) -> Result<i64, SorapoolError> {
        db_call!(self, MaxRetryIndex, root_job_id)
    }

    pub async fn retry_chain_profile_ids(
        &self,
        root_job_id: i64,
    ) -> Result<Vec<i64>, SorapoolError> {
        db_call!(self, RetryChainProfileIds, root_job_id)
    }

    pub async fn count_active_jobs_by_profile(
        &self,
        group_title: &str,
    ) -> Result<AHashMap<i64, i64>, SorapoolError> {
        db_call!(self, CountActiveJobsByProfile, group_title.to_string())
    }

    pub async fn count_pending_submits_by_profile(
        &self,
        group_title: &str,
    ) -> Result<AHashMap<i64, i64>, SorapoolError> {
        db_call!(self, CountPendingSubmitsByProfile, group_title.to_string())
    }

    pub async fn list_jobs_since(
        &self,
        group_title: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, SorapoolError> {
        let group_title = group_title.to_string();
        ractor::call!(self.actor, |reply| DbActorMessage::ListJobsSince {
            group_title,
            since,
            reply,
        })
        .map_err(|e| SorapoolError::RactorError(format!("DbActor ListJobsSince RPC failed: {e}")))?
    }

    pub async fn list_fail_events_since(
        &self,
        group_title: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<FailEventRow>, SorapoolError> {
        let group_title = group_title.to_string();
        ractor::call!(self.actor, |reply| DbActorMessage::ListFailEventsSince {
            group_title,
            since,
            reply,
        })
        .map_err(|e| {
            SorapoolError::RactorError(format!("DbActor ListFailEventsSince RPC failed: {e}"))
        })?
    }

    pub async fn list_queued_job_ids(&self) -> Result<Vec<i64>, SorapoolError> {
        db_call!(self, ListQueuedJobIds)
    }

    pub async fn create_scan_run(&self, create: ScanRunCreate) -> Result<i64, SorapoolError> {
        db_call!(self, CreateScanRun, create)
    }

    pub async fn finish_scan_run(
        &self,
        run_id: i64,
        success_count: i64,
        failed_count: i64,
    ) -> Result<(), SorapoolError> {
        ractor::call!(self.actor, |reply| DbActorMessage::FinishScanRun {
            run_id,
            success_count,
            failed_count,
            reply,
        })
        .map_err(|e| SorapoolError::RactorError(format!("DbActor FinishScanRun RPC failed: {e}")))?
    }

    pub async fn set_scan_run_fallback_count(
        &self,
        run_id: i64,
        count: i64,
    ) -> Result<(), SorapoolError> {
        ractor::call!(self.actor, |reply| {
            DbActorMessage::SetScanRunFallbackCount {
                run_id,
                count,
                reply,
            }
        })
        .map_err(|e| {
            SorapoolError::RactorError(format!("DbActor SetScanRunFallbackCount RPC failed: {e}"))
        })?
    }

    pub async fn insert_scan_result(
        &self,
        create: ScanResultCreate,
    ) -> Result<i64, SorapoolError> {
        db_call!(self, InsertScanResult, create)
    }

    pub async fn latest_scan_run(
        &self,
        group_title: &str,
    ) -> Result<Option<ScanRunRecord>, SorapoolError> {
        db_call!(self, LatestScanRun, group_title.to_string())
    }

    pub async fn scan_results_by_run(
        &self,
        run_id: i64,
    ) -> Result<Vec<ScanResultRecord>, SorapoolError> {
        db_call!(self, ScanResultsByRun, run_id)
    }

    pub async fn latest_good_result_for_profile(
        &self,
        group_title: &str,
        profile_id: i64,
        before_run_id: i64,
    ) -> Result<Option<ScanResultRecord>, SorapoolError> {
        let group_title = group_title.to_string();
        ractor::call!(self.actor, |reply| {
            DbActorMessage::LatestGoodResultForProfile {
                group_title,
                profile_id,
                before_run_id,
                reply,
            }
        })
        .map_err(|e| {
            SorapoolError::RactorError(format!(
                "DbActor LatestGoodResultForProfile RPC failed: {e}"
            ))
        })?
    }

    pub async fn prune_scan_runs(
        &self,
        group_title: &str,
        keep: i64,
    ) -> Result<u64, SorapoolError> {
        let group_title = group_title.to_string();
        ractor::call!(self.actor, |reply| DbActorMessage::PruneScanRuns {
            group_title,
            keep,
            reply,
        })
        .map_err(|e| SorapoolError::RactorError(format!("DbActor PruneScanRuns RPC failed: {e}")))?
    }
}

struct DbActorState {
    pool: SqlitePool,
}

struct DbActor;

#[ractor::async_trait]
impl Actor for DbActor {
    type Msg = DbActorMessage;
    type State = DbActorState;
    type Arguments = String;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        database_url: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let connect_opts = SqliteConnectOptions::from_str(database_url.as_str())
            .map_err(|e| ActorProcessingErr::from(format!("invalid database url: {e}")))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .connect_with(connect_opts)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("db connect failed: {e}")))?;

        apply_schema(&pool)
            .await
            .map_err(|e| ActorProcessingErr::from(format!("db schema init failed: {e}")))?;

        info!("DbActor initialized");
        Ok(DbActorState { pool })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let pool = &state.pool;
        match message {
            DbActorMessage::CreateJob(create, reply) => {
                let _ = reply.send(self.create_job(pool, create).await);
            }
            DbActorMessage::UpdateJob(job_id, patch, reply) => {
                let _ = reply.send(self.update_job(pool, job_id, patch).await);
            }
            DbActorMessage::AppendEvent {
                job_id,
                phase,
                event,
                message,
                reply,
            } => {
                let _ = reply.send(self.append_event(pool, job_id, &phase, &event, message).await);
            }
            DbActorMessage::GetJob(job_id, reply) => {
                let _ = reply.send(self.get_job(pool, job_id).await);
            }
            DbActorMessage::ListJobs(filter, reply) => {
                let _ = reply.send(self.list_jobs(pool, &filter).await);
            }
            DbActorMessage::ListJobEvents(job_id, reply) => {
                let _ = reply.send(self.list_job_events(pool, job_id).await);
            }
            DbActorMessage::ListEventsSince {
                after_id,
                limit,
                reply,
            } => {
                let _ = reply.send(self.list_events_since(pool, after_id, limit).await);
            }
            DbActorMessage::LatestEventId(reply) => {
                let _ = reply.send(self.latest_event_id(pool).await);
            }
            DbActorMessage::LatestRetryChild(job_id, reply) => {
                let _ = reply.send(self.latest_retry_child(pool, job_id).await);
            }
            DbActorMessage::LatestByRoot(root_job_id, reply) => {
                let _ = reply.send(self.latest_by_root(pool, root_job_id).await);
            }
            DbActorMessage::MaxRetryIndex(root_job_id, reply) => {
                let _ = reply.send(self.max_retry_index(pool, root_job_id).await);
            }
            DbActorMessage::RetryChainProfileIds(root_job_id, reply) => {
                let _ = reply.send(self.retry_chain_profile_ids(pool, root_job_id).await);
            }
            DbActorMessage::CountActiveJobsByProfile(group_title, reply) => {
                let _ = reply.send(
                    self.count_by_profile(
                        pool,
                        &group_title,
                        "status IN ('queued', 'running')",
                    )
                    .await,
                );
            }
            DbActorMessage::CountPendingSubmitsByProfile(group_title, reply) => {
                let _ = reply.send(
                    self.count_by_profile(
                        pool,
                        &group_title,
                        "status IN ('queued', 'running') \
                         AND phase IN ('queue', 'submit') \
                         AND (task_id IS NULL OR task_id = '')",
                    )
                    .await,
                );
            }
            DbActorMessage::ListJobsSince {
                group_title,
                since,
                reply,
            } => {
                let _ = reply.send(self.list_jobs_since(pool, &group_title, since).await);
            }
            DbActorMessage::ListFailEventsSince {
                group_title,
                since,
                reply,
            } => {
                let _ = reply.send(self.list_fail_events_since(pool, &group_title, since).await);
            }
            DbActorMessage::ListQueuedJobIds(reply) => {
                let _ = reply.send(self.list_queued_job_ids(pool).await);
            }
            DbActorMessage::CreateScanRun(create, reply) => {
                let _ = reply.send(self.create_scan_run(pool, create).await);
            }
            DbActorMessage::FinishScanRun {
                run_id,
                success_count,
                failed_count,
                reply,
            } => {
                let _ = reply.send(
                    self.finish_scan_run(pool, run_id, success_count, failed_count)
                        .await,
                );
            }
            DbActorMessage::SetScanRunFallbackCount {
                run_id,
                count,
                reply,
            } => {
                let _ = reply.send(self.set_scan_run_fallback_count(pool, run_id, count).await);
            }
            DbActorMessage::InsertScanResult(create, reply) => {
                let _ = reply.send(self.insert_scan_result(pool, create).await);
            }
            DbActorMessage::LatestScanRun(group_title, reply) => {
                let _ = reply.send(self.latest_scan_run(pool, &group_title).await);
            }
            DbActorMessage::ScanResultsByRun(run_id, reply) => {
                let _ = reply.send(self.scan_results_by_run(pool, run_id).await);
            }
            DbActorMessage::LatestGoodResultForProfile {
                group_title,
                profile_id,
                before_run_id,
                reply,
            } => {
                let _ = reply.send(
                    self.latest_good_result_for_profile(
                        pool,
                        &group_title,
                        profile_id,
                        before_run_id,
                    )
                    .await,
                );
            }
            DbActorMessage::PruneScanRuns {
                group_title,
                keep,
                reply,
            } => {
                let _ = reply.send(self.prune_scan_runs(pool, &group_title, keep).await);
            }
        }
        Ok(())
    }
}

impl DbActor {
    async fn create_job(
        &self,
        pool: &SqlitePool,
        create: JobCreate,
    ) -> Result<i64, SorapoolError> {
        let now = Utc::now();
        let res = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO jobs (
                profile_id, window_name, group_title, prompt, image_url,
                duration, aspect_ratio, status, phase, progress_pct,
                dispatch_mode, dispatch_score, dispatch_quantity_score,
                dispatch_quality_score, dispatch_reason,
                retry_of_job_id, retry_root_job_id, retry_index,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, 'queued', 'queue', 0, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(create.profile_id)
        .bind(&create.window_name)
        .bind(&create.group_title)
        .bind(&create.prompt)
        .bind(&create.image_url)
        .bind(&create.duration)
        .bind(&create.aspect_ratio)
        .bind(&create.dispatch_mode)
        .bind(create.dispatch_score)
        .bind(create.dispatch_quantity_score)
        .bind(create.dispatch_quality_score)
        .bind(&create.dispatch_reason)
        .bind(create.retry_of_job_id)
        .bind(create.retry_root_job_id)
        .bind(create.retry_index)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await;

        let id = match res {
            Ok(id) => id,
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                // A concurrent retry (auto vs. manual) already created the
                // child for this parent; hand back the existing row.
                if let Some(parent_id) = create.retry_of_job_id {
                    let existing: Option<i64> = sqlx::query_scalar(
                        "SELECT id FROM jobs WHERE retry_of_job_id = ? ORDER BY id DESC LIMIT 1",
                    )
                    .bind(parent_id)
                    .fetch_optional(pool)
                    .await?;
                    if let Some(existing_id) = existing {
                        warn!(
                            parent_id,
                            existing_id, "retry child already exists, reusing"
                        );
                        return Ok(existing_id);
                    }
                }
                return Err(SorapoolError::DatabaseError(sqlx::Error::Database(db_err)));
            }
            Err(e) => return Err(e.into()),
        };

        // First attempts self-root so chain queries need no special case.
        if create.retry_root_job_id.is_none() {
            sqlx::query("UPDATE jobs SET retry_root_job_id = ? WHERE id = ?")
                .bind(id)
                .bind(id)
                .execute(pool)
                .await?;
        }

        Ok(id)
    }

    async fn update_job(
        &self,
        pool: &SqlitePool,
        job_id: i64,
        mut patch: JobPatch,
    ) -> Result<(), SorapoolError> {
        let Some(row) = self.get_job(pool, job_id).await? else {
            return Err(SorapoolError::NotFound(format!("未找到任务：{job_id}")));
        };

        if let Some(new_phase) = patch.phase.clone() {
            let current = row.phase_enum();
            let target = JobPhase::parse(&new_phase);
            let allowed =
                target.is_some_and(|target| JobPhase::transition_allowed(current, target));
            if !allowed {
                // Silent clamp to the current phase, with an audit event.
                patch.phase = None;
                self.append_event(
                    pool,
                    job_id,
                    &row.phase,
                    "phase_clamped",
                    Some(format!("忽略非法阶段跳转 {} -> {}", row.phase, new_phase)),
                )
                .await?;
            }
        }

        patch.apply_patch(job_id, pool).await
    }

    async fn append_event(
        &self,
        pool: &SqlitePool,
        job_id: i64,
        phase: &str,
        event: &str,
        message: Option<String>,
    ) -> Result<i64, SorapoolError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO job_events (job_id, phase, event, message, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(job_id)
        .bind(phase)
        .bind(event)
        .bind(message)
        .bind(Utc::now())
        .fetch_one(pool)
        .await?;
        Ok(id)
    }

    async fn get_job(
        &self,
        pool: &SqlitePool,
        job_id: i64,
    ) -> Result<Option<JobRecord>, SorapoolError> {
        let row = sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(pool)
            .await?;
        Ok(row)
    }

    async fn list_jobs(
        &self,
        pool: &SqlitePool,
        filter: &JobFilter,
    ) -> Result<Vec<JobRecord>, SorapoolError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM jobs WHERE 1=1");
        if let Some(group) = &filter.group_title {
            qb.push(" AND group_title = ").push_bind(group.clone());
        }
        if let Some(profile_id) = filter.profile_id {
            qb.push(" AND profile_id = ").push_bind(profile_id);
        }
        if let Some(status) = &filter.status {
            qb.push(" AND status = ").push_bind(status.clone());
        }
        if let Some(phase) = &filter.phase {
            qb.push(" AND phase = ").push_bind(phase.clone());
        }
        if let Some(keyword) = &filter.keyword {
            let like = format!("%{keyword}%");
            qb.push(" AND (prompt LIKE ")
                .push_bind(like.clone())
                .push(" OR window_name LIKE ")
                .push_bind(like.clone())
                .push(" OR error LIKE ")
                .push_bind(like)
                .push(")");
        }
        let limit = filter.limit.clamp(1, 500);
        qb.push(" ORDER BY id DESC LIMIT ").push_bind(limit);

        let rows = qb.build_query_as::<JobRecord>().fetch_all(pool).await?;
        Ok(rows)
    }

    async fn list_job_events(
        &self,
        pool: &SqlitePool,
        job_id: i64,
    ) -> Result<Vec<JobEventRecord>, SorapoolError> {
        let rows = sqlx::query_as::<_, JobEventRecord>(
            "SELECT * FROM job_events WHERE job_id = ? ORDER BY id",
        )
        .bind(job_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    async fn list_events_since(
        &self,
        pool: &SqlitePool,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<JobEventRecord>, SorapoolError> {
        let rows = sqlx::query_as::<_, JobEventRecord>(
            "SELECT * FROM job_events WHERE id > ? ORDER BY id LIMIT ?",
        )
        .bind(after_id)
        .bind(limit.clamp(1, 500))
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    async fn latest_event_id(&self, pool: &SqlitePool) -> Result<i64, SorapoolError> {
        let id: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(id), 0) FROM job_events")
            .fetch_one(pool)
            .await?;
        Ok(id)
    }

    async fn latest_retry_child(
        &self,
        pool: &SqlitePool,
        job_id: i64,
    ) -> Result<Option<JobRecord>, SorapoolError> {
        let row = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs WHERE retry_of_job_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(job_id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    async fn latest_by_root(
        &self,
        pool: &SqlitePool,
        root_job_id: i64,
    ) -> Result<Option<JobRecord>, SorapoolError> {
        let row = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs WHERE retry_root_job_id = ? OR id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(root_job_id)
        .bind(root_job_id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    async fn max_retry_index(
        &self,
        pool: &SqlitePool,
        root_job_id: i64,
    ) -> Result<i64, SorapoolError> {
        let idx: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(retry_index), 0) FROM jobs WHERE retry_root_job_id = ? OR id = ?",
        )
        .bind(root_job_id)
        .bind(root_job_id)
        .fetch_one(pool)
        .await?;
        Ok(idx)
    }

    async fn retry_chain_profile_ids(
        &self,
        pool: &SqlitePool,
        root_job_id: i64,
    ) -> Result<Vec<i64>, SorapoolError> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT profile_id FROM jobs WHERE retry_root_job_id = ? OR id = ?",
        )
        .bind(root_job_id)
        .bind(root_job_id)
        .fetch_all(pool)
        .await?;
        Ok(ids)
    }

    async fn count_by_profile(
        &self,
        pool: &SqlitePool,
        group_title: &str,
        condition: &str,
    ) -> Result<AHashMap<i64, i64>, SorapoolError> {
        let sql = format!(
            "SELECT profile_id, COUNT(*) FROM jobs WHERE group_title = ? AND {condition} \
             GROUP BY profile_id"
        );
        let rows: Vec<(i64, i64)> = sqlx::query_as(&sql)
            .bind(group_title)
            .fetch_all(pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    async fn list_jobs_since(
        &self,
        pool: &SqlitePool,
        group_title: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>, SorapoolError> {
        let rows = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs WHERE group_title = ? AND created_at >= ? ORDER BY id DESC",
        )
        .bind(group_title)
        .bind(since)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    async fn list_fail_events_since(
        &self,
        pool: &SqlitePool,
        group_title: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<FailEventRow>, SorapoolError> {
        let rows = sqlx::query_as::<_, FailEventRow>(
            r#"
            SELECT j.profile_id AS profile_id, e.phase AS phase,
                   e.message AS message, e.created_at AS created_at
            FROM job_events e
            JOIN jobs j ON j.id = e.job_id
            WHERE j.group_title = ? AND e.event = 'fail' AND e.created_at >= ?
            ORDER BY e.id DESC
            "#,
        )
        .bind(group_title)
        .bind(since)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    async fn list_queued_job_ids(&self, pool: &SqlitePool) -> Result<Vec<i64>, SorapoolError> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM jobs WHERE status = 'queued' ORDER BY id")
                .fetch_all(pool)
                .await?;
        Ok(ids)
    }

    async fn create_scan_run(
        &self,
        pool: &SqlitePool,
        create: ScanRunCreate,
    ) -> Result<i64, SorapoolError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO scan_runs (group_title, total, success_count, failed_count,
                                   fallback_applied_count, scanned_at)
            VALUES (?, ?, 0, 0, 0, ?)
            RETURNING id
            "#,
        )
        .bind(&create.group_title)
        .bind(create.total)
        .bind(Utc::now())
        .fetch_one(pool)
        .await?;
        Ok(id)
    }

    async fn finish_scan_run(
        &self,
        pool: &SqlitePool,
        run_id: i64,
        success_count: i64,
        failed_count: i64,
    ) -> Result<(), SorapoolError> {
        sqlx::query("UPDATE scan_runs SET success_count = ?, failed_count = ? WHERE id = ?")
            .bind(success_count)
            .bind(failed_count)
            .bind(run_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    async fn set_scan_run_fallback_count(
        &self,
        pool: &SqlitePool,
        run_id: i64,
        count: i64,
    ) -> Result<(), SorapoolError> {
        sqlx::query("UPDATE scan_runs SET fallback_applied_count = ? WHERE id = ?")
            .bind(count)
            .bind(run_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    async fn insert_scan_result(
        &self,
        pool: &SqlitePool,
        create: ScanResultCreate,
    ) -> Result<i64, SorapoolError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO scan_results (
                run_id, profile_id, window_name, session_status, account,
                account_plan, quota_remaining, quota_total, quota_reset_at,
                session_payload, proxy_binding, source, success, error, scanned_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(create.run_id)
        .bind(create.profile_id)
        .bind(&create.window_name)
        .bind(&create.session_status)
        .bind(&create.account)
        .bind(&create.account_plan)
        .bind(create.quota_remaining)
        .bind(create.quota_total)
        .bind(create.quota_reset_at)
        .bind(&create.session_payload)
        .bind(&create.proxy_binding)
        .bind(&create.source)
        .bind(create.success)
        .bind(&create.error)
        .bind(Utc::now())
        .fetch_one(pool)
        .await?;
        Ok(id)
    }

    async fn latest_scan_run(
        &self,
        pool: &SqlitePool,
        group_title: &str,
    ) -> Result<Option<ScanRunRecord>, SorapoolError> {
        let row = sqlx::query_as::<_, ScanRunRecord>(
            "SELECT * FROM scan_runs WHERE group_title = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(group_title)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    async fn scan_results_by_run(
        &self,
        pool: &SqlitePool,
        run_id: i64,
    ) -> Result<Vec<ScanResultRecord>, SorapoolError> {
        let rows = sqlx::query_as::<_, ScanResultRecord>(
            "SELECT * FROM scan_results WHERE run_id = ? ORDER BY profile_id",
        )
        .bind(run_id)
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }

    async fn latest_good_result_for_profile(
        &self,
        pool: &SqlitePool,
        group_title: &str,
        profile_id: i64,
        before_run_id: i64,
    ) -> Result<Option<ScanResultRecord>, SorapoolError> {
        let row = sqlx::query_as::<_, ScanResultRecord>(
            r#"
            SELECT r.* FROM scan_results r
            JOIN scan_runs sr ON sr.id = r.run_id
            WHERE sr.group_title = ? AND r.profile_id = ? AND r.success = 1 AND r.run_id < ?
            ORDER BY r.run_id DESC LIMIT 1
            "#,
        )
        .bind(group_title)
        .bind(profile_id)
        .bind(before_run_id)
        .fetch_optional(pool)
        .await?;
        Ok(row)
    }

    async fn prune_scan_runs(
        &self,
        pool: &SqlitePool,
        group_title: &str,
        keep: i64,
    ) -> Result<u64, SorapoolError> {
        sqlx::query(
            r#"
            DELETE FROM scan_results WHERE run_id IN (
                SELECT id FROM scan_runs WHERE group_title = ? AND id NOT IN (
                    SELECT id FROM scan_runs WHERE group_title = ? ORDER BY id DESC LIMIT ?
                )
            )
            "#,
        )
        .bind(group_title)
        .bind(group_title)
        .bind(keep)
        .execute(pool)
        .await?;

        let res = sqlx::query(
            r#"
            DELETE FROM scan_runs WHERE group_title = ? AND id NOT IN (
                SELECT id FROM scan_runs WHERE group_title = ? ORDER BY id DESC LIMIT ?
            )
            "#,
        )
        .bind(group_title)
        .bind(group_title)
        .bind(keep)
        .execute(pool)
        .await?;

        Ok(res.rows_affected())
    }
}

/// Spawn the database actor and return a cloneable handle.
pub async fn spawn(database_url: &str) -> DbActorHandle {
    let (actor, _jh) = ractor::Actor::spawn(None, DbActor, database_url.to_string())
        .await
        .expect("failed to spawn DbActor");

    DbActorHandle { actor }
}

async fn apply_schema(pool: &SqlitePool) -> Result<(), SorapoolError> {
    for stmt in SQLITE_INIT.split(';') {
        let s = stmt.trim();
        if s.is_empty() {
            continue;
        }
        sqlx::query(s).execute(pool).await?;
    }
    Ok(())
}
