//! Live job stream: snapshot-first, then per-tick fingerprint diffs plus
//! phase events ordered by their store cursor.
//!
//! The authoritative state is the store, so the stream polls it instead of
//! fanning out in-process; subscribers that disconnect simply re-snapshot
//! on reconnect, and no per-subscriber state survives.

use ahash::{AHashMap, AHashSet};
use axum::response::sse;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::db::{DbActorHandle, JobEventRecord, JobFilter, JobRecord};
use crate::error::SorapoolError;
use crate::jobs::{JobOut, JobService};

pub const STREAM_LIMIT_MAX: i64 = 200;
const PHASE_POLL_LIMIT: i64 = 200;

#[derive(Debug, Clone, Default)]
pub struct StreamFilter {
    pub group_title: Option<String>,
    pub profile_id: Option<i64>,
    pub status: Option<String>,
    pub phase: Option<String>,
    pub keyword: Option<String>,
    pub limit: i64,
    pub with_events: bool,
}

impl StreamFilter {
    /// Normalise raw query inputs: trimmed, lowercased where the store
    /// stores lowercase, limit clamped to 1..=200.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        group_title: Option<String>,
        profile_id: Option<i64>,
        status: Option<String>,
        phase: Option<String>,
        keyword: Option<String>,
        limit: Option<i64>,
        with_events: bool,
    ) -> Self {
        let clean = |value: Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .map(ToString::to_string)
        };
        Self {
            group_title: clean(group_title),
            profile_id,
            status: clean(status).map(|s| s.to_lowercase()),
            phase: clean(phase).map(|s| s.to_lowercase()),
            keyword: clean(keyword),
            limit: limit.unwrap_or(100).clamp(1, STREAM_LIMIT_MAX),
            with_events,
        }
    }

    fn to_job_filter(&self) -> JobFilter {
        JobFilter {
            group_title: self.group_title.clone(),
            profile_id: self.profile_id,
            status: self.status.clone(),
            phase: self.phase.clone(),
            keyword: self.keyword.clone(),
            limit: self.limit,
        }
    }
}

/// The fields whose change makes a job worth re-sending.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFingerprint {
    updated_at: DateTime<Utc>,
    status: String,
    phase: String,
    progress_pct: f64,
    image_url: Option<String>,
    task_id: Option<String>,
    generation_id: Option<String>,
    publish_url: Option<String>,
    watermark_status: Option<String>,
    watermark_url: Option<String>,
    watermark_error: Option<String>,
    error: Option<String>,
}

pub fn fingerprint(job: &JobRecord) -> JobFingerprint {
    JobFingerprint {
        updated_at: job.updated_at,
        status: job.status.clone(),
        phase: job.phase.clone(),
        progress_pct: job.progress_pct,
        image_url: job.image_url.clone(),
        task_id: job.task_id.clone(),
        generation_id: job.generation_id.clone(),
        publish_url: job.publish_url.clone(),
        watermark_status: job.watermark_status.clone(),
        watermark_url: job.watermark_url.clone(),
        watermark_error: job.watermark_error.clone(),
        error: job.error.clone(),
    }
}

pub fn fingerprint_map(jobs: &[JobOut]) -> AHashMap<i64, JobFingerprint> {
    jobs.iter()
        .map(|job| (job.record.id, fingerprint(&job.record)))
        .collect()
}

/// Per-tick diff: jobs whose fingerprint changed, ids that left the visible
/// window, the new fingerprint map, and the visible-id set.
pub fn diff_jobs(
    previous: &AHashMap<i64, JobFingerprint>,
    current: &[JobOut],
) -> (Vec<JobOut>, Vec<i64>, AHashMap<i64, JobFingerprint>, AHashSet<i64>) {
    let current_map = fingerprint_map(current);
    let changed: Vec<JobOut> = current
        .iter()
        .filter(|job| previous.get(&job.record.id) != current_map.get(&job.record.id))
        .cloned()
        .collect();
    let mut removed: Vec<i64> = previous
        .keys()
        .filter(|id| !current_map.contains_key(id))
        .copied()
        .collect();
    removed.sort_unstable();
    let visible: AHashSet<i64> = current_map.keys().copied().collect();
    (changed, removed, current_map, visible)
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    Snapshot { jobs: Vec<JobOut> },
    Job(Box<JobOut>),
    Remove { job_id: i64 },
    Phase(JobEventRecord),
    Ping,
}

impl StreamEvent {
    pub fn to_sse(&self) -> sse::Event {
        match self {
            StreamEvent::Snapshot { jobs } => sse::Event::default().event("snapshot").data(
                json!({"jobs": jobs, "server_time": Utc::now()}).to_string(),
            ),
            StreamEvent::Job(job) => sse::Event::default()
                .event("job")
                .data(serde_json::to_string(job).unwrap_or_else(|_| "{}".to_string())),
            StreamEvent::Remove { job_id } => sse::Event::default()
                .event("remove")
                .data(json!({"job_id": job_id}).to_string()),
            StreamEvent::Phase(event) => sse::Event::default()
                .event("phase")
                .data(serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string())),
            StreamEvent::Ping => sse::Event::default()
                .event("ping")
                .data(json!({"server_time": Utc::now()}).to_string()),
        }
    }
}

#[derive(Clone)]
pub struct JobStreamService {
    jobs: JobService,
    db: DbActorHandle,
    poll_interval: Duration,
    ping_interval: Duration,
}

impl JobStreamService {
    pub fn new(
        jobs: JobService,
        db: DbActorHandle,
        poll_interval: Duration,
        ping_interval: Duration,
    ) -> Self {
        Self {
            jobs,
            db,
            poll_interval,
            ping_interval,
        }
    }

    async fn list(&self, filter: &StreamFilter) -> Result<Vec<JobOut>, SorapoolError> {
        self.jobs.list_jobs(filter.to_job_filter()).await
    }

    /// Phase events after `after_id` for the visible jobs; the cursor moves
    /// past every event regardless of visibility.
    async fn phase_events_since(
        &self,
        after_id: i64,
        visible: &AHashSet<i64>,
    ) -> Result<(Vec<JobEventRecord>, i64), SorapoolError> {
        let rows = self.db.list_events_since(after_id, PHASE_POLL_LIMIT).await?;
        let mut last_id = after_id;
        let mut events = Vec::new();
        for row in rows {
            last_id = last_id.max(row.id);
            if visible.contains(&row.job_id) {
                events.push(row);
            }
        }
        Ok((events, last_id))
    }

    /// Build the subscriber's event sequence. Snapshot first, then diffs per
    /// poll tick (jobs, then removes, then phase events), with an idle ping.
    /// Dropping the returned stream stops the producer task; the route layer
    /// maps each item to an SSE frame via [`StreamEvent::to_sse`].
    pub fn subscribe(&self, filter: StreamFilter) -> ReceiverStream<StreamEvent> {
        let (tx, rx) = mpsc::channel::<StreamEvent>(64);
        let service = self.clone();

        tokio::spawn(async move {
            let initial = match service.list(&filter).await {
                Ok(jobs) => jobs,
                Err(err) => {
                    warn!(%err, "stream snapshot failed");
                    return;
                }
            };
            let mut fingerprints = fingerprint_map(&initial);
            let mut last_seen = service.db.latest_event_id().await.unwrap_or(0);

            if tx
                .send(StreamEvent::Snapshot { jobs: initial })
                .await
                .is_err()
            {
                return;
            }
            let mut last_output = tokio::time::Instant::now();

            loop {
                tokio::time::sleep(service.poll_interval).await;

                let current = match service.list(&filter).await {
                    Ok(jobs) => jobs,
                    Err(err) => {
                        warn!(%err, "stream poll failed");
                        continue;
                    }
                };
                let (changed, removed, next_map, visible) = diff_jobs(&fingerprints, &current);
                fingerprints = next_map;

                let mut emitted = false;
                for job in changed {
                    if tx.send(StreamEvent::Job(Box::new(job))).await.is_err() {
                        return;
                    }
                    emitted = true;
                }
                for job_id in removed {
                    if tx.send(StreamEvent::Remove { job_id }).await.is_err() {
                        return;
                    }
                    emitted = true;
                }

                if filter.with_events {
                    match service.phase_events_since(last_seen, &visible).await {
                        Ok((events, cursor)) => {
                            last_seen = cursor;
                            for event in events {
                                if tx.send(StreamEvent::Phase(event)).await.is_err() {
                                    return;
                                }
                                emitted = true;
                            }
                        }
                        Err(err) => debug!(%err, "phase event poll failed"),
                    }
                }

                if emitted {
                    last_output = tokio::time::Instant::now();
                } else if last_output.elapsed() >= service.ping_interval {
                    if tx.send(StreamEvent::Ping).await.is_err() {
                        return;
                    }
                    last_output = tokio::time::Instant::now();
                }
            }
        });

        ReceiverStream::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::JobRecord;

    fn job(id: i64, progress: f64) -> JobOut {
        JobOut {
            record: JobRecord {
                id,
                profile_id: 1,
                window_name: None,
                group_title: "Sora".to_string(),
                prompt: "p".to_string(),
                image_url: None,
                duration: "10s".to_string(),
                aspect_ratio: "landscape".to_string(),
                status: "running".to_string(),
                phase: "progress".to_string(),
                progress_pct: progress,
                dispatch_mode: "manual".to_string(),
                dispatch_score: None,
                dispatch_quantity_score: None,
                dispatch_quality_score: None,
                dispatch_reason: None,
                task_id: None,
                generation_id: None,
                publish_url: None,
                publish_post_id: None,
                publish_permalink: None,
                watermark_status: None,
                watermark_url: None,
                watermark_error: None,
                watermark_attempts: 0,
                watermark_started_at: None,
                watermark_finished_at: None,
                retry_of_job_id: None,
                retry_root_job_id: Some(id),
                retry_index: 0,
                error: None,
                started_at: None,
                finished_at: None,
                created_at: Utc::now(),
                updated_at: Utc::now(),
                resolved_from_job_id: None,
            },
            proxy: None,
        }
    }

    #[test]
    fn diff_reports_changes_and_removals() {
        let first = vec![job(1, 10.0), job(2, 20.0)];
        let map = fingerprint_map(&first);

        // Same data: nothing changed.
        let (changed, removed, _, visible) = diff_jobs(&map, &first);
        assert!(changed.is_empty());
        assert!(removed.is_empty());
        assert_eq!(visible.len(), 2);

        // Progress moved on job 1; job 2 left the window.
        let mut second = vec![job(1, 55.0)];
        second[0].record.updated_at = Utc::now();
        let (changed, removed, next_map, visible) = diff_jobs(&map, &second);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].record.id, 1);
        assert_eq!(removed, vec![2]);
        assert!(visible.contains(&1) && !visible.contains(&2));
        assert_eq!(next_map.len(), 1);
    }

    #[test]
    fn filter_build_clamps_and_cleans() {
        let filter = StreamFilter::build(
            Some("  Sora ".to_string()),
            None,
            Some("Running".to_string()),
            Some("".to_string()),
            None,
            Some(9999),
            true,
        );
        assert_eq!(filter.group_title.as_deref(), Some("Sora"));
        assert_eq!(filter.status.as_deref(), Some("running"));
        assert_eq!(filter.phase, None);
        assert_eq!(filter.limit, STREAM_LIMIT_MAX);
    }
}
