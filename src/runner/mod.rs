//! Job runner: a bounded pool of workers consuming queued jobs from the
//! store and driving the per-job state machine.
//!
//! Layout:
//! - `phases.rs`: the state machine (submit → progress → genid → publish →
//!   watermark → done) and its failure/auto-retry semantics
//! - `surface.rs`: the production `VideoSurface` (broker open + CDP attach +
//!   upstream calls)
//! - `watermark.rs`: the watermark post-processor step

pub mod phases;
pub mod surface;
pub mod watermark;

pub use phases::JobEngine;
pub use surface::BrowserSurfaceFactory;
pub use watermark::{HttpWatermarkResolver, WatermarkResolver, WatermarkService};

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{error, info};

use crate::db::{DbActorHandle, JobRecord};
use crate::error::SorapoolError;

/// One progress observation for an upstream task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPoll {
    Processing,
    Completed,
    Failed(String),
}

/// Per-job seam to the upstream: everything the state machine needs from
/// the browser/HTTP side, with the store mutations kept out. The production
/// implementation lives in `surface.rs`; tests script their own.
#[async_trait]
pub trait VideoSurface: Send {
    /// Submit the generation request; returns the upstream task id.
    /// Overload rejections must surface as `SorapoolError::Overload`.
    async fn submit(&mut self, job: &JobRecord) -> Result<String, SorapoolError>;

    /// One poll of `pending/v2` + `drafts` for the task row.
    async fn poll_task(&mut self, task_id: &str) -> Result<TaskPoll, SorapoolError>;

    /// Probe for the captured generation id (non-blocking).
    async fn generation_id(&mut self, task_id: &str) -> Result<Option<String>, SorapoolError>;

    /// Run the publish workflow; returns the shareable URL.
    async fn publish(
        &mut self,
        job: &JobRecord,
        generation_id: &str,
    ) -> Result<String, SorapoolError>;

    /// Release browser-side resources. Default: drop is enough.
    async fn close(&mut self) {}
}

/// Creates one attached surface per job attempt (profile open + debug
/// channel connect happen here, so open failures land in the phase that
/// asked for the surface).
#[async_trait]
pub trait SurfaceFactory: Send + Sync {
    async fn create(&self, job: &JobRecord) -> Result<Box<dyn VideoSurface>, SorapoolError>;
}

/// Fixed-capacity worker pool over the queued-job channel.
pub struct RunnerPool {
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl RunnerPool {
    /// Start the workers, then re-enqueue jobs that were still `queued`
    /// when the process last stopped. Recovery runs after the workers so a
    /// backlog larger than the queue capacity drains instead of blocking
    /// startup.
    pub async fn start(
        engine: Arc<JobEngine>,
        db: DbActorHandle,
        queue_tx: mpsc::Sender<i64>,
        queue_rx: mpsc::Receiver<i64>,
        concurrency: usize,
    ) -> Self {
        let shared_rx = Arc::new(Mutex::new(queue_rx));
        let concurrency = concurrency.max(1);
        let mut workers = Vec::with_capacity(concurrency);
        for worker_id in 0..concurrency {
            let engine = engine.clone();
            let rx = shared_rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let job_id = { rx.lock().await.recv().await };
                    match job_id {
                        Some(job_id) => {
                            info!(worker_id, job_id, "runner picked up job");
                            engine.run(job_id).await;
                        }
                        None => break,
                    }
                }
                info!(worker_id, "runner worker stopped");
            }));
        }

        match db.list_queued_job_ids().await {
            Ok(ids) => {
                if !ids.is_empty() {
                    info!(count = ids.len(), "re-enqueueing queued jobs from store");
                }
                for id in ids {
                    let _ = queue_tx.send(id).await;
                }
            }
            Err(err) => error!(%err, "queued-job recovery failed"),
        }

        info!(concurrency, "runner pool started");
        Self { workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}
