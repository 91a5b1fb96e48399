mod common;

use common::{
    FailingResolver, OkResolver, ProfileScript, ScriptedFactory, VALID_PUBLISH_URL, cleanup_db,
    mock_profile, seed_scan_run, spawn_mock_broker, spawn_services, temp_db_url, test_config,
    wait_until,
};
use sorapool::jobs::CreateJobRequest;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn create_request(dispatch_mode: &str, profile_id: Option<i64>) -> CreateJobRequest {
    CreateJobRequest {
        prompt: "a lighthouse in a storm".to_string(),
        image_url: None,
        duration: "10s".to_string(),
        aspect_ratio: "landscape".to_string(),
        group_title: Some("Sora".to_string()),
        dispatch_mode: Some(dispatch_mode.to_string()),
        profile_id,
    }
}

#[tokio::test]
async fn test_happy_path_runs_all_phases_in_order() {
    let (database_url, db_path) = temp_db_url("happy_path");
    let db = sorapool::db::spawn(&database_url).await;
    let broker_base = spawn_mock_broker(vec![mock_profile(1, "Sora")]).await;
    let cfg = test_config(&broker_base);

    let factory = ScriptedFactory::new(HashMap::from([(1, ProfileScript::Happy)]));
    let services = spawn_services(db.clone(), &cfg, factory, Arc::new(OkResolver)).await;

    let created = services
        .jobs
        .create_job(create_request("manual", Some(1)))
        .await
        .unwrap();
    let job_id = created.record.id;
    // The pool may have claimed the job already; it just must not be done.
    assert!(matches!(created.record.status.as_str(), "queued" | "running"));
    assert_eq!(created.record.dispatch_mode, "manual");

    let done = wait_until(Duration::from_secs(15), || async {
        let job = db.get_job(job_id).await.unwrap().unwrap();
        (job.status == "completed").then_some(job)
    })
    .await
    .expect("job should complete");

    assert_eq!(done.phase, "done");
    assert_eq!(done.progress_pct, 100.0);
    assert_eq!(done.task_id.as_deref(), Some("task_1"));
    assert_eq!(done.generation_id.as_deref(), Some("gen_scripted0001"));
    assert_eq!(done.publish_url.as_deref(), Some(VALID_PUBLISH_URL));
    assert_eq!(done.watermark_status.as_deref(), Some("completed"));
    assert!(done.watermark_url.is_some());
    assert!(done.finished_at.is_some());
    assert_eq!(
        done.publish_post_id.as_deref(),
        Some("s_deadbeefdeadbeefdeadbeefdeadbeef")
    );

    let events = db.list_job_events(job_id).await.unwrap();
    let sequence: Vec<(String, String)> = events
        .iter()
        .map(|e| (e.phase.clone(), e.event.clone()))
        .collect();
    let expected: Vec<(String, String)> = [
        ("dispatch", "select"),
        ("queue", "queue"),
        ("submit", "start"),
        ("submit", "finish"),
        ("progress", "start"),
        ("genid", "start"),
        ("genid", "finish"),
        ("publish", "start"),
        ("publish", "finish"),
        ("watermark", "start"),
        ("watermark", "finish"),
    ]
    .iter()
    .map(|(p, e)| ((*p).to_string(), (*e).to_string()))
    .collect();
    assert_eq!(sequence, expected);
    assert!(events.windows(2).all(|w| w[0].id < w[1].id));

    cleanup_db(&db_path).await;
}

#[tokio::test]
async fn test_heavy_load_submit_spawns_retry_on_excluded_profile() {
    let (database_url, db_path) = temp_db_url("heavy_load");
    let db = sorapool::db::spawn(&database_url).await;
    let broker_base =
        spawn_mock_broker(vec![mock_profile(1, "Sora"), mock_profile(2, "Sora")]).await;
    let cfg = test_config(&broker_base);

    // Profile 1 ranks higher (more quota, plus plan) but is overloaded;
    // profile 2 takes the retry.
    seed_scan_run(&db, "Sora", &[(1, Some(10), Some("plus")), (2, Some(5), None)]).await;
    let factory = ScriptedFactory::new(HashMap::from([
        (1, ProfileScript::OverloadOnSubmit),
        (2, ProfileScript::Happy),
    ]));
    let services = spawn_services(db.clone(), &cfg, factory, Arc::new(OkResolver)).await;

    let created = services
        .jobs
        .create_job(create_request("weighted_auto", None))
        .await
        .unwrap();
    let root_id = created.record.id;
    assert_eq!(created.record.profile_id, 1, "dispatcher should rank profile 1 first");

    let child = wait_until(Duration::from_secs(15), || async {
        db.latest_retry_child(root_id).await.unwrap()
    })
    .await
    .expect("auto retry child should exist");

    assert_eq!(child.profile_id, 2);
    assert_eq!(child.retry_of_job_id, Some(root_id));
    assert_eq!(child.retry_root_job_id, Some(root_id));
    assert_eq!(child.retry_index, 1);
    assert!(
        child
            .dispatch_reason
            .as_deref()
            .unwrap_or_default()
            .contains("heavy load"),
        "child dispatch_reason should mention heavy load"
    );

    let failed_root = db.get_job(root_id).await.unwrap().unwrap();
    assert_eq!(failed_root.status, "failed");
    assert_eq!(failed_root.phase, "submit");

    let root_events = db.list_job_events(root_id).await.unwrap();
    assert!(root_events.iter().any(|e| e.event == "fail"));
    assert!(root_events.iter().any(|e| e.event == "auto_retry_new_job"));

    // The replacement runs through to completion on profile 2.
    let finished_child = wait_until(Duration::from_secs(15), || async {
        let job = db.get_job(child.id).await.unwrap().unwrap();
        (job.status == "completed").then_some(job)
    })
    .await
    .expect("retry child should complete");
    assert_eq!(finished_child.phase, "done");

    // follow_retry resolution lands on the newest chain member.
    let resolved = services.jobs.get_job(root_id, true).await.unwrap();
    assert_eq!(resolved.record.id, child.id);
    assert_eq!(resolved.record.resolved_from_job_id, Some(root_id));

    cleanup_db(&db_path).await;
}

#[tokio::test]
async fn test_heavy_load_gives_up_when_every_profile_is_excluded() {
    let (database_url, db_path) = temp_db_url("heavy_giveup");
    let db = sorapool::db::spawn(&database_url).await;
    let broker_base =
        spawn_mock_broker(vec![mock_profile(1, "Sora"), mock_profile(2, "Sora")]).await;
    let cfg = test_config(&broker_base);

    seed_scan_run(&db, "Sora", &[(1, Some(10), Some("plus")), (2, Some(5), None)]).await;
    let factory = ScriptedFactory::new(HashMap::from([
        (1, ProfileScript::OverloadOnSubmit),
        (2, ProfileScript::OverloadOnSubmit),
    ]));
    let services = spawn_services(db.clone(), &cfg, factory, Arc::new(OkResolver)).await;

    let created = services
        .jobs
        .create_job(create_request("weighted_auto", None))
        .await
        .unwrap();
    let root_id = created.record.id;

    // First retry lands on profile 2, also overloads, and the second spawn
    // attempt finds the whole group excluded.
    let giveup = wait_until(Duration::from_secs(20), || async {
        let Some(child) = db.latest_retry_child(root_id).await.unwrap() else {
            return None;
        };
        let events = db.list_job_events(child.id).await.unwrap();
        events
            .into_iter()
            .find(|e| e.event == "auto_retry_giveup")
            .map(|event| (child, event))
    })
    .await
    .expect("second spawn attempt should give up");

    let (child, giveup_event) = giveup;
    assert_eq!(child.profile_id, 2);
    assert!(
        giveup_event
            .message
            .as_deref()
            .unwrap_or_default()
            .contains("无可用账号"),
        "give-up reason should carry the no-available-account detail"
    );
    // The chain stops at two attempts: root plus one child.
    assert!(db.latest_retry_child(child.id).await.unwrap().is_none());

    cleanup_db(&db_path).await;
}

#[tokio::test]
async fn test_watermark_fallback_completes_with_publish_url() {
    let (database_url, db_path) = temp_db_url("wm_fallback");
    let db = sorapool::db::spawn(&database_url).await;
    let broker_base = spawn_mock_broker(vec![mock_profile(1, "Sora")]).await;
    let mut cfg = test_config(&broker_base);
    cfg.watermark.retry_max = 0;
    cfg.watermark.fallback_on_failure = true;

    let factory = ScriptedFactory::new(HashMap::from([(1, ProfileScript::Happy)]));
    let services = spawn_services(db.clone(), &cfg, factory, Arc::new(FailingResolver)).await;

    let created = services
        .jobs
        .create_job(create_request("manual", Some(1)))
        .await
        .unwrap();
    let job_id = created.record.id;

    let done = wait_until(Duration::from_secs(15), || async {
        let job = db.get_job(job_id).await.unwrap().unwrap();
        (job.status == "completed").then_some(job)
    })
    .await
    .expect("job should complete via fallback");

    assert_eq!(done.phase, "done");
    assert_eq!(done.watermark_status.as_deref(), Some("fallback"));
    assert_eq!(done.watermark_url, done.publish_url);
    assert!(done.watermark_error.is_some());

    let events = db.list_job_events(job_id).await.unwrap();
    assert!(
        events
            .iter()
            .any(|e| e.phase == "watermark" && e.event == "fallback")
    );

    cleanup_db(&db_path).await;
}

#[tokio::test]
async fn test_watermark_failure_without_fallback_fails_the_job() {
    let (database_url, db_path) = temp_db_url("wm_fail");
    let db = sorapool::db::spawn(&database_url).await;
    let broker_base = spawn_mock_broker(vec![mock_profile(1, "Sora")]).await;
    let mut cfg = test_config(&broker_base);
    cfg.watermark.retry_max = 0;
    cfg.watermark.fallback_on_failure = false;

    let factory = ScriptedFactory::new(HashMap::from([(1, ProfileScript::Happy)]));
    let services = spawn_services(db.clone(), &cfg, factory, Arc::new(FailingResolver)).await;

    let created = services
        .jobs
        .create_job(create_request("manual", Some(1)))
        .await
        .unwrap();
    let job_id = created.record.id;

    let failed = wait_until(Duration::from_secs(15), || async {
        let job = db.get_job(job_id).await.unwrap().unwrap();
        (job.status == "failed").then_some(job)
    })
    .await
    .expect("job should fail at the watermark phase");

    assert_eq!(failed.phase, "watermark");
    assert_eq!(failed.watermark_status.as_deref(), Some("failed"));
    // The publish result survives the failure.
    assert_eq!(failed.publish_url.as_deref(), Some(VALID_PUBLISH_URL));

    cleanup_db(&db_path).await;
}

#[tokio::test]
async fn test_cancel_mid_progress_terminates_cleanly() {
    let (database_url, db_path) = temp_db_url("cancel");
    let db = sorapool::db::spawn(&database_url).await;
    let broker_base = spawn_mock_broker(vec![mock_profile(1, "Sora")]).await;
    let cfg = test_config(&broker_base);

    let factory = ScriptedFactory::new(HashMap::from([(1, ProfileScript::StallInProgress)]));
    let services = spawn_services(db.clone(), &cfg, factory, Arc::new(OkResolver)).await;

    let created = services
        .jobs
        .create_job(create_request("manual", Some(1)))
        .await
        .unwrap();
    let job_id = created.record.id;

    // Wait until the runner is inside the progress phase.
    wait_until(Duration::from_secs(10), || async {
        let job = db.get_job(job_id).await.unwrap().unwrap();
        (job.status == "running" && job.phase == "progress").then_some(())
    })
    .await
    .expect("job should reach the progress phase");

    let canceled = services.jobs.cancel_job(job_id).await.unwrap();
    assert_eq!(canceled.record.status, "canceled");
    assert!(canceled.record.finished_at.is_some());

    let events = db.list_job_events(job_id).await.unwrap();
    assert!(
        events
            .iter()
            .any(|e| e.phase == "progress" && e.event == "cancel")
    );
    let event_count = events.len();

    // The runner observes the flag at its next suspension point and stops
    // appending; the status stays terminal.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let after = db.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(after.status, "canceled");
    assert_eq!(db.list_job_events(job_id).await.unwrap().len(), event_count);

    // Terminal jobs cannot be canceled twice.
    assert!(services.jobs.cancel_job(job_id).await.is_err());

    cleanup_db(&db_path).await;
}

#[tokio::test]
async fn test_manual_retry_rules() {
    let (database_url, db_path) = temp_db_url("retry_rules");
    let db = sorapool::db::spawn(&database_url).await;
    let broker_base = spawn_mock_broker(vec![mock_profile(1, "Sora")]).await;
    let cfg = test_config(&broker_base);

    let factory = ScriptedFactory::new(HashMap::from([(1, ProfileScript::Happy)]));
    let services = spawn_services(db.clone(), &cfg, factory, Arc::new(OkResolver)).await;

    let created = services
        .jobs
        .create_job(create_request("manual", Some(1)))
        .await
        .unwrap();
    let job_id = created.record.id;

    wait_until(Duration::from_secs(15), || async {
        let job = db.get_job(job_id).await.unwrap().unwrap();
        (job.status == "completed").then_some(())
    })
    .await
    .expect("job should complete");

    // Completed jobs are not retryable.
    let err = services.jobs.retry_job(job_id).await.unwrap_err();
    assert!(err.to_string().contains("无需重试"));

    cleanup_db(&db_path).await;
}
