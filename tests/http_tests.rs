//! HTTP trigger behaviour through the full router

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use common::TestEngine;
use mirrorsentry::http::{router, AppState};
use mirrorsentry::{DaemonCommand, ExportSupervisor, MirrorState};
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

fn app_state(t: &TestEngine) -> AppState {
    AppState {
        engine: t.engine.clone(),
        supervisor: Arc::new(ExportSupervisor::new(
            DaemonCommand::new("sleep", ["30"]),
            t.engine.leases().clone(),
            Duration::from_millis(100),
            Duration::from_secs(1),
        )),
    }
}

fn post(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn json(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_post_mirror_creates_and_reports_clone_url() {
    let t = TestEngine::builder().build();

    let response = router(app_state(&t))
        .oneshot(post("/mirrors/example.com/demo.git"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json(response).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["repo_name"], "demo");
    assert_eq!(body["clone_url"], "git://localhost:9418/demo");
    assert_eq!(
        body["mirror_path"].as_str().unwrap(),
        t.dir("demo").display().to_string()
    );

    assert_eq!(t.vcs.calls()[0].url, "https://example.com/demo.git");
    let record = t.engine.store().lookup("demo").unwrap().unwrap();
    assert_eq!(record.state, MirrorState::Ready);
}

#[tokio::test]
async fn test_post_mirror_with_explicit_name() {
    let t = TestEngine::builder().build();

    let response = router(app_state(&t))
        .oneshot(post("/mirrors/github.com/yang0/autotask_autogui?name=autogui"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json(response).await;
    assert_eq!(body["repo_name"], "autogui");
    assert!(t.dir("autogui").is_dir());
}

#[tokio::test]
async fn test_post_mirror_while_lease_held_is_conflict() {
    let t = TestEngine::builder()
        .lease_wait(Duration::from_millis(50))
        .build();
    let _held = t
        .engine
        .leases()
        .acquire("demo", Duration::from_secs(1))
        .await
        .unwrap();

    let response = router(app_state(&t))
        .oneshot(post("/mirrors/example.com/demo.git"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json(response).await["status"], "error");
    assert!(t.vcs.calls().is_empty());
}

#[tokio::test]
async fn test_list_after_create() {
    let t = TestEngine::builder().build();
    let app = router(app_state(&t));

    let response = app
        .clone()
        .oneshot(post("/mirrors/example.com/listed.git"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(Request::builder().uri("/mirrors").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = json(response).await;
    assert_eq!(body["mirrors"][0]["name"], "listed");
    assert_eq!(body["mirrors"][0]["state"], "ready");
}

#[tokio::test]
async fn test_health_with_running_daemon() {
    let t = TestEngine::builder().build();
    let state = app_state(&t);
    state.supervisor.start().await.unwrap();

    let response = router(state.clone())
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["export_daemon"]["state"], "running");
    assert!(body["export_daemon"]["pid"].is_u64());

    state.supervisor.stop().await.unwrap();
}
