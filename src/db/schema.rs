//! SQL DDL for initializing the database schema.
//! SQLite-first design; can be adapted for other RDBMS.

/// SQLite schema includes:
/// - `jobs` table (one video-generation job per row; retry chains are linked
///   rows, never in-place mutations)
/// - `job_events` table (append-only phase event log; `id` is the stream
///   replication cursor)
/// - `scan_runs` / `scan_results` tables (account scan history, bounded to
///   the most recent runs per group)
pub const SQLITE_INIT: &str = r#"
-- ---------------------------------------------------------------------------
-- Jobs
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    profile_id INTEGER NOT NULL,
    window_name TEXT NULL,
    group_title TEXT NOT NULL,
    prompt TEXT NOT NULL,
    image_url TEXT NULL,
    duration TEXT NOT NULL,
    aspect_ratio TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',
    phase TEXT NOT NULL DEFAULT 'queue',
    progress_pct REAL NOT NULL DEFAULT 0,
    dispatch_mode TEXT NOT NULL DEFAULT 'manual',
    dispatch_score REAL NULL,
    dispatch_quantity_score REAL NULL,
    dispatch_quality_score REAL NULL,
    dispatch_reason TEXT NULL,
    task_id TEXT NULL,
    generation_id TEXT NULL,
    publish_url TEXT NULL,
    publish_post_id TEXT NULL,
    publish_permalink TEXT NULL,
    watermark_status TEXT NULL,
    watermark_url TEXT NULL,
    watermark_error TEXT NULL,
    watermark_attempts INTEGER NOT NULL DEFAULT 0,
    watermark_started_at TEXT NULL,
    watermark_finished_at TEXT NULL,
    retry_of_job_id INTEGER NULL,
    retry_root_job_id INTEGER NULL,
    retry_index INTEGER NOT NULL DEFAULT 0,
    error TEXT NULL,
    started_at TEXT NULL,
    finished_at TEXT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_group ON jobs(group_title);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_profile ON jobs(profile_id);
CREATE INDEX IF NOT EXISTS idx_jobs_root ON jobs(retry_root_job_id);

-- One retry child per failed parent, and one child per (root, attempt).
CREATE UNIQUE INDEX IF NOT EXISTS uq_jobs_retry_parent
    ON jobs(retry_of_job_id) WHERE retry_of_job_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS uq_jobs_root_attempt
    ON jobs(retry_root_job_id, retry_index) WHERE retry_of_job_id IS NOT NULL;

-- ---------------------------------------------------------------------------
-- Job events (append-only, id is the streaming cursor)
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS job_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    job_id INTEGER NOT NULL,
    phase TEXT NOT NULL,
    event TEXT NOT NULL,
    message TEXT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_job_events_job ON job_events(job_id);

-- ---------------------------------------------------------------------------
-- Account scan history
-- ---------------------------------------------------------------------------
CREATE TABLE IF NOT EXISTS scan_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    group_title TEXT NOT NULL,
    total INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    failed_count INTEGER NOT NULL DEFAULT 0,
    fallback_applied_count INTEGER NOT NULL DEFAULT 0,
    scanned_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_scan_runs_group ON scan_runs(group_title);

CREATE TABLE IF NOT EXISTS scan_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    run_id INTEGER NOT NULL,
    profile_id INTEGER NOT NULL,
    window_name TEXT NULL,
    session_status TEXT NULL,
    account TEXT NULL,
    account_plan TEXT NULL,
    quota_remaining INTEGER NULL,
    quota_total INTEGER NULL,
    quota_reset_at TEXT NULL,
    session_payload TEXT NULL,
    proxy_binding TEXT NULL,
    source TEXT NOT NULL DEFAULT 'api',
    success INTEGER NOT NULL DEFAULT 0,
    error TEXT NULL,
    scanned_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_scan_results_run ON scan_results(run_id);
CREATE INDEX IF NOT EXISTS idx_scan_results_profile ON scan_results(profile_id);
"#;
