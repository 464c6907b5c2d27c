//! Router-level integration tests for the worker API

use std::sync::Arc;

use alerting::AlertManager;
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::Utc;
use http_auth::ApiSecret;
use pgtemp::PgTempDB;
use results_db::ResultsDb;
use serde_json::{Value, json};
use tower::ServiceExt as _;
use types::{Package, Run};
use uuid::Uuid;
use worker_api::ApiState;

const SECRET: &str = "s3cret";

fn package(name: &str) -> Package {
    Package {
        name: name.to_owned(),
        path: format!("/nonexistent/{name}.test").into(),
        sha256sum: "deadbeef".to_owned(),
        run_delay: None,
        options: vec![],
    }
}

async fn router_for(temp_db: &PgTempDB, packages: Vec<Package>) -> (Router, ResultsDb) {
    let db = ResultsDb::connect_with_retry(&temp_db.connection_uri(), 2)
        .await
        .expect("Failed to connect to results db");
    let state = ApiState::new(
        db.clone(),
        packages,
        Arc::new(AlertManager::new("http://localhost:8080")),
        ApiSecret::new(SECRET),
    );
    (worker_api::router(state), db)
}

fn authed(worker: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{worker}:{SECRET}")))
}

fn request(method: &str, uri: &str, worker: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(worker) = worker {
        builder = builder.header(header::AUTHORIZATION, authed(worker));
    }
    let body = match body {
        Some(value) => Body::from(value.to_string()),
        None => Body::empty(),
    };
    builder.body(body).expect("Failed to build request")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read body");
    serde_json::from_slice(&bytes).expect("Failed to parse body as json")
}

fn test_payload(run_id: Uuid, name: &str, state: &str) -> Value {
    let now = Utc::now();
    json!({
        "id": Uuid::new_v4(),
        "package": "p1",
        "run_id": run_id,
        "result": {
            "name": name,
            "started_at": now,
            "finished_at": now,
            "state": state,
        },
        "logs": [],
    })
}

#[tokio::test]
async fn requests_without_the_secret_are_unauthorized() {
    //* Given
    let temp_db = PgTempDB::new();
    let (router, _db) = router_for(&temp_db, vec![package("p1")]).await;

    //* When
    let missing = router
        .clone()
        .oneshot(request("GET", "/api/tests", None, None))
        .await
        .unwrap();
    let wrong_secret = router
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/api/tests")
                .header(
                    header::AUTHORIZATION,
                    format!("Basic {}", STANDARD.encode("w1:wrong")),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    //* Then
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(missing).await;
    assert_eq!(body["status"], 401);
    assert!(body["error"].is_string());

    assert_eq!(wrong_secret.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(wrong_secret).await;
    assert_eq!(body["error"], "user w1 is unauthorized");
}

#[tokio::test]
async fn claim_is_exclusive_under_concurrency() {
    //* Given
    let temp_db = PgTempDB::new();
    let (router, db) = router_for(&temp_db, vec![package("p1")]).await;

    let run = Run::new("p1", vec![]);
    db.enqueue_run(&run).await.expect("Failed to enqueue");

    let claim_body = json!({"package_whitelist": ["p1"], "package_blacklist": []});

    //* When
    let (first, second) = tokio::join!(
        router.clone().oneshot(request(
            "POST",
            "/api/runs/claim",
            Some("w1"),
            Some(claim_body.clone()),
        )),
        router.clone().oneshot(request(
            "POST",
            "/api/runs/claim",
            Some("w2"),
            Some(claim_body),
        )),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    //* Then
    let mut statuses = [first.status(), second.status()];
    statuses.sort();
    assert_eq!(statuses, [StatusCode::OK, StatusCode::NOT_FOUND]);

    let (winner, winner_response) = if first.status() == StatusCode::OK {
        ("w1", first)
    } else {
        ("w2", second)
    };
    let claimed = body_json(winner_response).await;
    assert_eq!(claimed["id"], json!(run.id));
    assert!(!claimed["started_at"].is_null());
    assert_eq!(claimed["meta"]["runner"], winner);
}

#[tokio::test]
async fn claim_blacklist_dominates_whitelist() {
    //* Given
    let temp_db = PgTempDB::new();
    let (router, db) = router_for(&temp_db, vec![package("p1"), package("p2")]).await;

    // The p1 run is older and would otherwise be claimed first.
    let mut run_p1 = Run::new("p1", vec![]);
    run_p1.enqueued_at = Utc::now() - chrono::TimeDelta::minutes(10);
    let run_p2 = Run::new("p2", vec![]);
    db.enqueue_run(&run_p1).await.expect("Failed to enqueue");
    db.enqueue_run(&run_p2).await.expect("Failed to enqueue");

    //* When
    let response = router
        .oneshot(request(
            "POST",
            "/api/runs/claim",
            Some("w"),
            Some(json!({
                "package_whitelist": ["p1", "p2"],
                "package_blacklist": ["p1"],
            })),
        ))
        .await
        .unwrap();

    //* Then
    assert_eq!(response.status(), StatusCode::OK);
    let claimed = body_json(response).await;
    assert_eq!(claimed["id"], json!(run_p2.id));
    assert_eq!(claimed["package"], "p2");
}

#[tokio::test]
async fn claim_with_no_matching_runs_is_not_found() {
    //* Given
    let temp_db = PgTempDB::new();
    let (router, _db) = router_for(&temp_db, vec![package("p1")]).await;

    //* When
    let response = router
        .oneshot(request(
            "POST",
            "/api/runs/claim",
            Some("w1"),
            Some(json!({"package_whitelist": [], "package_blacklist": []})),
        ))
        .await
        .unwrap();

    //* Then
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["status"], 404);
    assert_eq!(body["error"], "no runs for packages: p1");
}

#[tokio::test]
async fn submitted_tests_are_echoed_and_readable() {
    //* Given
    let temp_db = PgTempDB::new();
    let (router, db) = router_for(&temp_db, vec![package("p1")]).await;

    let run = Run::new("p1", vec![]);
    db.enqueue_run(&run).await.expect("Failed to enqueue");
    db.start_run(run.id, "w1").await.expect("Failed to start");

    let payload = test_payload(run.id, "TestSubmit", "passed");

    //* When
    let submitted = router
        .clone()
        .oneshot(request(
            "POST",
            "/api/tests",
            Some("w1"),
            Some(payload.clone()),
        ))
        .await
        .unwrap();

    //* Then
    assert_eq!(submitted.status(), StatusCode::ACCEPTED);
    let echoed = body_json(submitted).await;
    assert_eq!(echoed["id"], payload["id"]);
    assert_eq!(echoed["result"]["name"], "TestSubmit");

    let fetched = router
        .clone()
        .oneshot(request(
            "GET",
            &format!("/api/tests/{}", payload["id"].as_str().unwrap()),
            Some("w1"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(fetched.status(), StatusCode::OK);

    let listed = router
        .oneshot(request("GET", "/api/tests", Some("w1"), None))
        .await
        .unwrap();
    assert_eq!(listed.status(), StatusCode::OK);
    let tests = body_json(listed).await;
    assert_eq!(tests.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn submit_against_a_finished_run_is_rejected() {
    //* Given
    let temp_db = PgTempDB::new();
    let (router, db) = router_for(&temp_db, vec![package("p1")]).await;

    let run = Run::new("p1", vec![]);
    db.enqueue_run(&run).await.expect("Failed to enqueue");
    db.start_run(run.id, "w1").await.expect("Failed to start");
    db.complete_run(run.id).await.expect("Failed to complete");

    let payload = test_payload(run.id, "TestLate", "passed");
    let test_id = payload["id"].as_str().unwrap().to_owned();

    //* When
    let response = router
        .oneshot(request("POST", "/api/tests", Some("w1"), Some(payload)))
        .await
        .unwrap();

    //* Then
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"], "cannot submit test for finished run");

    // No row was created and the run's test set stayed sealed.
    let run = db.get_run(run.id).await.expect("Failed to get run");
    assert!(run.tests.iter().all(|t| t.id.to_string() != test_id));
}

#[tokio::test]
async fn submit_with_a_malformed_body_is_a_bad_request() {
    let temp_db = PgTempDB::new();
    let (router, _db) = router_for(&temp_db, vec![package("p1")]).await;

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/tests")
                .header(header::AUTHORIZATION, authed("w1"))
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn complete_rejects_double_posts() {
    //* Given
    let temp_db = PgTempDB::new();
    let (router, db) = router_for(&temp_db, vec![package("p1")]).await;

    let run = Run::new("p1", vec![]);
    db.enqueue_run(&run).await.expect("Failed to enqueue");
    db.start_run(run.id, "w1").await.expect("Failed to start");

    //* When
    let first = router
        .clone()
        .oneshot(request(
            "POST",
            &format!("/api/runs/{}/complete", run.id),
            Some("w1"),
            None,
        ))
        .await
        .unwrap();
    let second = router
        .oneshot(request(
            "POST",
            &format!("/api/runs/{}/complete", run.id),
            Some("w1"),
            None,
        ))
        .await
        .unwrap();

    //* Then
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::BAD_REQUEST);
    let body = body_json(second).await;
    assert_eq!(body["error"], "cannot complete already finished run");
}

#[tokio::test]
async fn fail_records_the_posted_error_message() {
    //* Given
    let temp_db = PgTempDB::new();
    let (router, db) = router_for(&temp_db, vec![package("p1")]).await;

    let run = Run::new("p1", vec![]);
    db.enqueue_run(&run).await.expect("Failed to enqueue");
    db.start_run(run.id, "w1").await.expect("Failed to start");

    //* When
    let response = router
        .oneshot(request(
            "POST",
            &format!("/api/runs/{}/fail", run.id),
            Some("w1"),
            Some(json!("binary exited with status 2")),
        ))
        .await
        .unwrap();

    //* Then
    assert_eq!(response.status(), StatusCode::OK);
    let failed = db.get_run(run.id).await.expect("Failed to get run");
    assert_eq!(failed.error.as_deref(), Some("binary exited with status 2"));
    assert!(failed.finished_at.is_some());
}

#[tokio::test]
async fn run_endpoints_render_not_found_for_bad_ids() {
    let temp_db = PgTempDB::new();
    let (router, _db) = router_for(&temp_db, vec![package("p1")]).await;

    for uri in [
        "/api/runs/not-a-uuid/complete".to_owned(),
        format!("/api/runs/{}/complete", Uuid::new_v4()),
        "/api/tests/not-a-uuid".to_owned(),
    ] {
        let method = if uri.contains("/runs/") { "POST" } else { "GET" };
        let response = router
            .clone()
            .oneshot(request(method, &uri, Some("w1"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn packages_are_served_with_their_artifacts() {
    //* Given
    let temp_db = PgTempDB::new();

    let artifact_path =
        std::env::temp_dir().join(format!("proctor-test-artifact-{}", Uuid::new_v4()));
    std::fs::write(&artifact_path, b"#!/bin/true\n").expect("Failed to write artifact");

    let mut pkg = package("p1");
    pkg.path = artifact_path.clone();
    let (router, _db) = router_for(&temp_db, vec![pkg]).await;

    //* When
    let meta = router
        .clone()
        .oneshot(request("GET", "/api/packages/p1", Some("w1"), None))
        .await
        .unwrap();
    let download = router
        .clone()
        .oneshot(request("GET", "/api/packages/p1/download", Some("w1"), None))
        .await
        .unwrap();
    let unknown = router
        .oneshot(request("GET", "/api/packages/p9", Some("w1"), None))
        .await
        .unwrap();

    //* Then
    assert_eq!(meta.status(), StatusCode::OK);
    let body = body_json(meta).await;
    assert_eq!(body["name"], "p1");
    assert_eq!(body["sha256sum"], "deadbeef");

    assert_eq!(download.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(download.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"#!/bin/true\n");

    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    std::fs::remove_file(&artifact_path).ok();
}
