//! Service wiring. Initialisation order is fixed: Store → Broker →
//! Dispatcher → Runner pool → Stream service; none of the services holds a
//! back-reference to a later one.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::broker::BrokerAdapter;
use crate::config::Config;
use crate::db::DbActorHandle;
use crate::dispatch::DispatchService;
use crate::jobs::JobService;
use crate::runner::{
    BrowserSurfaceFactory, HttpWatermarkResolver, JobEngine, RunnerPool, SurfaceFactory,
    WatermarkResolver, WatermarkService,
};
use crate::scanner::ScanService;
use crate::stream::JobStreamService;
use crate::upstream::{DeviceIds, UpstreamHttp};

pub struct Services {
    pub db: DbActorHandle,
    pub broker: BrokerAdapter,
    pub dispatch: DispatchService,
    pub scanner: ScanService,
    pub jobs: JobService,
    pub stream: JobStreamService,
    pub runner: RunnerPool,
}

impl Services {
    /// Production wiring: browser-backed surfaces and the HTTP watermark
    /// resolver.
    pub async fn spawn(db: DbActorHandle, cfg: &Config) -> Self {
        let broker = BrokerAdapter::new(cfg.broker.clone());
        let upstream = UpstreamHttp::new(cfg.upstream.clone(), Arc::new(DeviceIds::default()));
        let factory: Arc<dyn SurfaceFactory> = Arc::new(BrowserSurfaceFactory::new(
            broker.clone(),
            upstream.clone(),
            cfg.runner.clone(),
        ));
        let resolver: Arc<dyn WatermarkResolver> =
            Arc::new(HttpWatermarkResolver::new(cfg.watermark.clone()));
        Self::spawn_with(db, cfg, broker, upstream, factory, resolver).await
    }

    /// Wiring with injectable seams (tests script the surface and the
    /// watermark resolver).
    pub async fn spawn_with(
        db: DbActorHandle,
        cfg: &Config,
        broker: BrokerAdapter,
        upstream: UpstreamHttp,
        factory: Arc<dyn SurfaceFactory>,
        resolver: Arc<dyn WatermarkResolver>,
    ) -> Self {
        let dispatch = DispatchService::new(db.clone(), broker.clone(), cfg.dispatch.clone());
        let scanner = ScanService::new(db.clone(), broker.clone(), upstream);

        let (queue_tx, queue_rx) = mpsc::channel::<i64>(cfg.runner.queue_capacity.max(1));
        let jobs = JobService::new(
            db.clone(),
            dispatch.clone(),
            broker.clone(),
            queue_tx.clone(),
            cfg.runner.clone(),
            resolver.clone(),
            cfg.watermark.retry_cap(),
        );

        let watermark = WatermarkService::new(db.clone(), resolver, cfg.watermark.clone());
        let engine = Arc::new(JobEngine::new(
            db.clone(),
            jobs.clone(),
            factory,
            watermark,
            cfg.runner.clone(),
        ));
        let runner = RunnerPool::start(
            engine,
            db.clone(),
            queue_tx,
            queue_rx,
            cfg.runner.max_concurrency,
        )
        .await;

        let stream = JobStreamService::new(
            jobs.clone(),
            db.clone(),
            Duration::from_millis(cfg.basic.stream_poll_interval_ms.max(50)),
            Duration::from_secs(cfg.basic.stream_ping_interval_secs.max(1)),
        );

        Self {
            db,
            broker,
            dispatch,
            scanner,
            jobs,
            stream,
            runner,
        }
    }
}
