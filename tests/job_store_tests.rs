mod common;

use common::{cleanup_db, temp_db_url};
use sorapool::db::{JobCreate, JobFilter, JobPatch, ScanRunCreate};

fn basic_create(profile_id: i64) -> JobCreate {
    JobCreate {
        profile_id,
        window_name: Some(format!("win-{profile_id}")),
        group_title: "Sora".to_string(),
        prompt: "a cat surfing".to_string(),
        image_url: None,
        duration: "10s".to_string(),
        aspect_ratio: "landscape".to_string(),
        dispatch_mode: "manual".to_string(),
        dispatch_score: None,
        dispatch_quantity_score: None,
        dispatch_quality_score: None,
        dispatch_reason: Some("手动指定".to_string()),
        retry_of_job_id: None,
        retry_root_job_id: None,
        retry_index: 0,
    }
}

#[tokio::test]
async fn test_job_store_baseline() {
    let (database_url, db_path) = temp_db_url("job_store");
    let db = sorapool::db::spawn(&database_url).await;

    // Fresh store: nothing to list.
    let empty = db
        .list_jobs(JobFilter {
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(empty.is_empty());

    let job_id = db.create_job(basic_create(1)).await.unwrap();
    assert!(job_id > 0);

    let job = db.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, "queued");
    assert_eq!(job.phase, "queue");
    assert_eq!(job.progress_pct, 0.0);
    // First attempts self-root.
    assert_eq!(job.retry_root_job_id, Some(job_id));
    assert_eq!(job.retry_index, 0);

    // Event ids are strictly increasing.
    let mut last_id = 0;
    for n in 0..5 {
        let event_id = db
            .append_event(job_id, "queue", "queue", Some(format!("event {n}")))
            .await
            .unwrap();
        assert!(event_id > last_id, "event ids must be strictly increasing");
        last_id = event_id;
    }
    let events = db.list_job_events(job_id).await.unwrap();
    assert_eq!(events.len(), 5);
    assert!(events.windows(2).all(|w| w[0].id < w[1].id));

    let since = db.list_events_since(events[1].id, 100).await.unwrap();
    assert_eq!(since.len(), 3);
    assert!(since.iter().all(|e| e.id > events[1].id));
    assert_eq!(db.latest_event_id().await.unwrap(), last_id);

    cleanup_db(&db_path).await;
}

#[tokio::test]
async fn test_progress_is_monotone_and_resettable() {
    let (database_url, db_path) = temp_db_url("progress");
    let db = sorapool::db::spawn(&database_url).await;
    let job_id = db.create_job(basic_create(1)).await.unwrap();

    db.update_job(
        job_id,
        JobPatch {
            progress_pct: Some(50.0),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // A lower value is clamped away.
    db.update_job(
        job_id,
        JobPatch {
            progress_pct: Some(30.0),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let job = db.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.progress_pct, 50.0);

    // Explicit reset (retry path) bypasses the clamp.
    db.update_job(
        job_id,
        JobPatch {
            progress_reset: Some(0.0),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let job = db.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.progress_pct, 0.0);

    cleanup_db(&db_path).await;
}

#[tokio::test]
async fn test_publish_url_is_write_once() {
    let (database_url, db_path) = temp_db_url("publish_once");
    let db = sorapool::db::spawn(&database_url).await;
    let job_id = db.create_job(basic_create(1)).await.unwrap();

    let first = "https://sora.chatgpt.com/p/s_deadbeefdeadbeefdeadbeefdeadbeef";
    db.update_job(
        job_id,
        JobPatch {
            publish_url: Some(first.to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    db.update_job(
        job_id,
        JobPatch {
            publish_url: Some("https://sora.chatgpt.com/p/s_0000000000000000".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let job = db.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.publish_url.as_deref(), Some(first));

    cleanup_db(&db_path).await;
}

#[tokio::test]
async fn test_illegal_phase_transition_is_clamped_with_audit_event() {
    let (database_url, db_path) = temp_db_url("phase_clamp");
    let db = sorapool::db::spawn(&database_url).await;
    let job_id = db.create_job(basic_create(1)).await.unwrap();

    // queue -> publish is not an edge of the phase graph.
    db.update_job(
        job_id,
        JobPatch {
            phase: Some("publish".to_string()),
            status: Some("running".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let job = db.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.phase, "queue", "phase must be clamped");
    assert_eq!(job.status, "running", "the rest of the patch still applies");

    let events = db.list_job_events(job_id).await.unwrap();
    assert!(events.iter().any(|e| e.event == "phase_clamped"));

    // A legal edge passes untouched.
    db.update_job(
        job_id,
        JobPatch {
            phase: Some("submit".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let job = db.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.phase, "submit");

    cleanup_db(&db_path).await;
}

#[tokio::test]
async fn test_retry_chain_bookkeeping_and_idempotency() {
    let (database_url, db_path) = temp_db_url("retry_chain");
    let db = sorapool::db::spawn(&database_url).await;

    let root = db.create_job(basic_create(1)).await.unwrap();

    let mut child_create = basic_create(2);
    child_create.retry_of_job_id = Some(root);
    child_create.retry_root_job_id = Some(root);
    child_create.retry_index = 1;
    let child = db.create_job(child_create.clone()).await.unwrap();
    assert_ne!(child, root);

    // A second child for the same failed parent resolves to the first one.
    let mut duplicate = child_create;
    duplicate.profile_id = 3;
    let dup = db.create_job(duplicate).await.unwrap();
    assert_eq!(dup, child, "one retry child per failed parent");

    assert_eq!(db.max_retry_index(root).await.unwrap(), 1);
    let mut chain = db.retry_chain_profile_ids(root).await.unwrap();
    chain.sort_unstable();
    assert_eq!(chain, vec![1, 2]);

    let probe = db.latest_retry_child(root).await.unwrap().unwrap();
    assert_eq!(probe.id, child);
    assert_eq!(probe.retry_of_job_id, Some(root));

    let latest = db.latest_by_root(root).await.unwrap().unwrap();
    assert_eq!(latest.id, child);

    cleanup_db(&db_path).await;
}

#[tokio::test]
async fn test_active_and_pending_submit_counts() {
    let (database_url, db_path) = temp_db_url("counts");
    let db = sorapool::db::spawn(&database_url).await;

    let a = db.create_job(basic_create(1)).await.unwrap();
    let b = db.create_job(basic_create(1)).await.unwrap();
    let c = db.create_job(basic_create(2)).await.unwrap();

    // b has been acknowledged by the upstream; it is active but no longer a
    // pending submit.
    db.update_job(
        b,
        JobPatch {
            status: Some("running".to_string()),
            phase: Some("submit".to_string()),
            task_id: Some("task_b".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    // c is terminal.
    db.update_job(
        c,
        JobPatch {
            status: Some("failed".to_string()),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    let _ = a;

    let active = db.count_active_jobs_by_profile("Sora").await.unwrap();
    assert_eq!(active.get(&1).copied(), Some(2));
    assert_eq!(active.get(&2), None);

    let pending = db.count_pending_submits_by_profile("Sora").await.unwrap();
    assert_eq!(pending.get(&1).copied(), Some(1));

    cleanup_db(&db_path).await;
}

#[tokio::test]
async fn test_list_jobs_filters_and_keyword() {
    let (database_url, db_path) = temp_db_url("list_filters");
    let db = sorapool::db::spawn(&database_url).await;

    let mut special = basic_create(1);
    special.prompt = "a red panda drumming".to_string();
    let special_id = db.create_job(special).await.unwrap();
    let plain_id = db.create_job(basic_create(2)).await.unwrap();

    let by_keyword = db
        .list_jobs(JobFilter {
            keyword: Some("panda".to_string()),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_keyword.len(), 1);
    assert_eq!(by_keyword[0].id, special_id);

    let by_profile = db
        .list_jobs(JobFilter {
            profile_id: Some(2),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_profile.len(), 1);
    assert_eq!(by_profile[0].id, plain_id);

    // Most-recent-first ordering.
    let all = db
        .list_jobs(JobFilter {
            group_title: Some("Sora".to_string()),
            limit: 10,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    assert!(all[0].id > all[1].id);

    cleanup_db(&db_path).await;
}

#[tokio::test]
async fn test_scan_run_history_is_pruned_with_results() {
    let (database_url, db_path) = temp_db_url("scan_prune");
    let db = sorapool::db::spawn(&database_url).await;

    let mut run_ids = Vec::new();
    for _ in 0..12 {
        let run_id = db
            .create_scan_run(ScanRunCreate {
                group_title: "Sora".to_string(),
                total: 1,
            })
            .await
            .unwrap();
        db.insert_scan_result(sorapool::db::ScanResultCreate {
            run_id,
            profile_id: 1,
            source: "api".to_string(),
            success: true,
            ..Default::default()
        })
        .await
        .unwrap();
        run_ids.push(run_id);
    }

    let pruned = db.prune_scan_runs("Sora", 10).await.unwrap();
    assert_eq!(pruned, 2);

    // The two oldest runs and their results are gone together.
    for old_run in &run_ids[..2] {
        assert!(db.scan_results_by_run(*old_run).await.unwrap().is_empty());
    }
    let latest = db.latest_scan_run("Sora").await.unwrap().unwrap();
    assert_eq!(latest.id, *run_ids.last().unwrap());
    assert_eq!(db.scan_results_by_run(latest.id).await.unwrap().len(), 1);

    cleanup_db(&db_path).await;
}
