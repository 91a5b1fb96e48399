mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use common::{
    OkResolver, ProfileScript, ScriptedFactory, cleanup_db, mock_profile, spawn_mock_broker,
    spawn_services, temp_db_url, test_config,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tower::util::ServiceExt;

async fn build_app(
    tag: &str,
) -> (axum::Router, sorapool::db::DbActorHandle, std::path::PathBuf) {
    let (database_url, db_path) = temp_db_url(tag);
    let db = sorapool::db::spawn(&database_url).await;
    let broker_base = spawn_mock_broker(vec![mock_profile(1, "Sora")]).await;
    let cfg = test_config(&broker_base);

    let factory = ScriptedFactory::new(HashMap::from([(1, ProfileScript::Happy)]));
    let services = spawn_services(db.clone(), &cfg, factory, Arc::new(OkResolver)).await;

    let state = sorapool::server::router::AppState {
        jobs: services.jobs.clone(),
        dispatch: services.dispatch.clone(),
        scanner: services.scanner.clone(),
        stream: services.stream.clone(),
        pool_key: Arc::from(cfg.basic.pool_key.clone()),
    };
    (
        sorapool::server::router::sorapool_router(state),
        db,
        db_path,
    )
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

#[tokio::test]
async fn test_requests_without_key_are_rejected() {
    let (app, _db, db_path) = build_app("route_auth").await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/sora/jobs")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    cleanup_db(&db_path).await;
}

#[tokio::test]
async fn test_wrong_key_is_rejected_and_right_key_lists_jobs() {
    let (app, _db, db_path) = build_app("route_key").await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/sora/jobs")
                .header(header::AUTHORIZATION, "Bearer wrong-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/sora/jobs")
                .header(header::AUTHORIZATION, "Bearer test-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!([]));

    cleanup_db(&db_path).await;
}

#[tokio::test]
async fn test_create_job_validation_errors_are_structured() {
    let (app, _db, db_path) = build_app("route_validation").await;

    let payload = json!({
        "prompt": "a fox",
        "duration": "30s",
        "aspect_ratio": "landscape",
        "profile_id": 1,
    });
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/sora/jobs")
                .header(header::AUTHORIZATION, "Bearer test-key")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "service_error");
    assert!(body["detail"].as_str().unwrap().contains("时长"));

    cleanup_db(&db_path).await;
}

#[tokio::test]
async fn test_get_unknown_job_is_404() {
    let (app, _db, db_path) = build_app("route_404").await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/sora/jobs/424242")
                .header(header::AUTHORIZATION, "Bearer test-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "not_found");

    // Unrouted paths fall through to the 404 handler.
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/na")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    cleanup_db(&db_path).await;
}

#[tokio::test]
async fn test_account_weights_rank_group_profiles() {
    let (app, db, db_path) = build_app("route_weights").await;
    common::seed_scan_run(&db, "Sora", &[(1, Some(10), Some("plus"))]).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/sora/accounts/weights?group_title=Sora")
                .header(header::AUTHORIZATION, "Bearer test-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let weights = body.as_array().expect("weights array");
    assert_eq!(weights.len(), 1);
    assert_eq!(weights[0]["profile_id"], 1);
    assert_eq!(weights[0]["selectable"], true);
    assert!(weights[0]["score_total"].as_f64().unwrap() > 0.0);

    cleanup_db(&db_path).await;
}
