mod common;

use common::{
    OkResolver, ProfileScript, ScriptedFactory, cleanup_db, mock_profile, spawn_mock_broker,
    spawn_services, temp_db_url, test_config,
};
use sorapool::db::{JobCreate, JobPatch};
use sorapool::stream::{StreamEvent, StreamFilter};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;

fn queued_job(profile_id: i64) -> JobCreate {
    JobCreate {
        profile_id,
        window_name: Some(format!("win-{profile_id}")),
        group_title: "Sora".to_string(),
        prompt: "stream me".to_string(),
        image_url: None,
        duration: "10s".to_string(),
        aspect_ratio: "landscape".to_string(),
        dispatch_mode: "manual".to_string(),
        dispatch_score: None,
        dispatch_quantity_score: None,
        dispatch_quality_score: None,
        dispatch_reason: None,
        retry_of_job_id: None,
        retry_root_job_id: None,
        retry_index: 0,
    }
}

async fn next_event(
    stream: &mut tokio_stream::wrappers::ReceiverStream<StreamEvent>,
) -> StreamEvent {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("stream event within deadline")
        .expect("stream still open")
}

#[tokio::test]
async fn test_stream_emits_snapshot_first_then_diffs() {
    let (database_url, db_path) = temp_db_url("stream_diff");
    let db = sorapool::db::spawn(&database_url).await;
    let broker_base = spawn_mock_broker(vec![mock_profile(1, "Sora")]).await;
    let cfg = test_config(&broker_base);

    let factory = ScriptedFactory::new(HashMap::from([(1, ProfileScript::Happy)]));
    let services = spawn_services(db.clone(), &cfg, factory, Arc::new(OkResolver)).await;

    // Created directly in the store so the runner pool never touches it.
    let job_id = db.create_job(queued_job(1)).await.unwrap();

    let filter = StreamFilter::build(
        Some("Sora".to_string()),
        None,
        Some("queued".to_string()),
        None,
        None,
        Some(50),
        true,
    );
    let mut stream = services.stream.subscribe(filter);

    // 1. Snapshot always comes first and carries the visible job.
    match next_event(&mut stream).await {
        StreamEvent::Snapshot { jobs } => {
            assert_eq!(jobs.len(), 1);
            assert_eq!(jobs[0].record.id, job_id);
        }
        other => panic!("expected snapshot first, got {other:?}"),
    }

    // 2. A fingerprint change produces a `job` event.
    db.update_job(
        job_id,
        JobPatch {
            progress_pct: Some(55.0),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    loop {
        match next_event(&mut stream).await {
            StreamEvent::Job(job) => {
                assert_eq!(job.record.id, job_id);
                assert_eq!(job.record.progress_pct, 55.0);
                break;
            }
            StreamEvent::Ping => {}
            other => panic!("expected job diff, got {other:?}"),
        }
    }

    // 3. Phase events appended after subscription arrive in id order.
    let first = db
        .append_event(job_id, "queue", "queue", Some("进入队列".to_string()))
        .await
        .unwrap();
    let second = db
        .append_event(job_id, "submit", "start", Some("开始执行".to_string()))
        .await
        .unwrap();
    let mut seen = Vec::new();
    while seen.len() < 2 {
        match next_event(&mut stream).await {
            StreamEvent::Phase(event) => seen.push(event.id),
            StreamEvent::Job(_) | StreamEvent::Ping => {}
            other => panic!("expected phase events, got {other:?}"),
        }
    }
    assert_eq!(seen, vec![first, second]);

    // 4. Leaving the filtered window produces a `remove`.
    db.update_job(
        job_id,
        JobPatch {
            status: Some("running".to_string()),
            phase: Some("submit".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    loop {
        match next_event(&mut stream).await {
            StreamEvent::Remove { job_id: removed } => {
                assert_eq!(removed, job_id);
                break;
            }
            StreamEvent::Job(_) | StreamEvent::Phase(_) | StreamEvent::Ping => {}
            other => panic!("expected remove, got {other:?}"),
        }
    }

    cleanup_db(&db_path).await;
}

#[tokio::test]
async fn test_stream_pings_when_idle() {
    let (database_url, db_path) = temp_db_url("stream_ping");
    let db = sorapool::db::spawn(&database_url).await;
    let broker_base = spawn_mock_broker(vec![mock_profile(1, "Sora")]).await;
    let mut cfg = test_config(&broker_base);
    cfg.basic.stream_ping_interval_secs = 1;

    let factory = ScriptedFactory::new(HashMap::from([(1, ProfileScript::Happy)]));
    let services = spawn_services(db.clone(), &cfg, factory, Arc::new(OkResolver)).await;

    let filter = StreamFilter::build(None, None, None, None, None, Some(10), false);
    let mut stream = services.stream.subscribe(filter);

    match next_event(&mut stream).await {
        StreamEvent::Snapshot { jobs } => assert!(jobs.is_empty()),
        other => panic!("expected snapshot first, got {other:?}"),
    }

    // Nothing changes, so the keep-alive fires.
    match next_event(&mut stream).await {
        StreamEvent::Ping => {}
        other => panic!("expected ping, got {other:?}"),
    }

    cleanup_db(&db_path).await;
}

#[tokio::test]
async fn test_dropped_subscriber_stops_receiving() {
    let (database_url, db_path) = temp_db_url("stream_drop");
    let db = sorapool::db::spawn(&database_url).await;
    let broker_base = spawn_mock_broker(vec![mock_profile(1, "Sora")]).await;
    let cfg = test_config(&broker_base);

    let factory = ScriptedFactory::new(HashMap::from([(1, ProfileScript::Happy)]));
    let services = spawn_services(db.clone(), &cfg, factory, Arc::new(OkResolver)).await;

    let filter = StreamFilter::build(None, None, None, None, None, Some(10), false);
    let mut stream = services.stream.subscribe(filter);
    let StreamEvent::Snapshot { .. } = next_event(&mut stream).await else {
        panic!("expected snapshot");
    };
    drop(stream);

    // A fresh subscription re-snapshots; no state leaks across subscribers.
    let job_id = db.create_job(queued_job(1)).await.unwrap();
    let filter = StreamFilter::build(None, None, None, None, None, Some(10), false);
    let mut second = services.stream.subscribe(filter);
    match next_event(&mut second).await {
        StreamEvent::Snapshot { jobs } => {
            assert_eq!(jobs.len(), 1);
            assert_eq!(jobs[0].record.id, job_id);
        }
        other => panic!("expected snapshot, got {other:?}"),
    }

    cleanup_db(&db_path).await;
}
