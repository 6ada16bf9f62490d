//! HTTP surface tests driven through the router without a listener.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use quest_runtime::api::{router, AppState};
use quest_runtime::Config;
use serde_json::{json, Value};
use tower::ServiceExt;

fn test_state(data_dir: &std::path::Path) -> Arc<AppState> {
    let config = Config {
        data_dir: data_dir.to_path_buf(),
        cli_path: "/no/such/claude-cli".to_string(),
        scheduler_enabled: false,
        ..Default::default()
    };
    Arc::new(AppState::new(config))
}

async fn json_request(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let body = match body {
        Some(json) => Body::from(serde_json::to_string(&json).unwrap()),
        None => Body::empty(),
    };
    let req = Request::builder()
        .method(method)
        .uri(path)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body_bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body_bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body_bytes).into_owned()));
    (status, json)
}

#[tokio::test]
async fn health_reports_ok() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(dir.path()));
    let (status, json) = json_request(&app, Method::GET, "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["running_processes"], 0);
    assert_eq!(json["processes"], json!([]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shell_run_returns_output_and_maps_errors() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(dir.path()));

    let (status, json) = json_request(
        &app,
        Method::POST,
        "/api/shell/run",
        Some(json!({"token": "t1", "command": "echo hi; exit 4", "working_directory": "/tmp"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["stdout"], "hi\n");
    assert_eq!(json["exit_code"], 4);

    let (status, _) = json_request(
        &app,
        Method::POST,
        "/api/shell/run",
        Some(json!({"token": "t2", "command": "true", "working_directory": "/no/such/dir/for/quest"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, json) = json_request(&app, Method::POST, "/api/shell/unknown/kill", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["signalled"], false);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn services_start_conflict_and_stop() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path());
    let app = router(Arc::clone(&state));
    let start = json!({"id": "dev", "command": "echo ready; sleep 30"});

    let (status, _) = json_request(&app, Method::POST, "/api/services", Some(start.clone())).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _) = json_request(&app, Method::POST, "/api/services", Some(start)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, json) = json_request(&app, Method::GET, "/api/services", None).await;
    assert_eq!(json["running"], json!(["dev"]));

    let (_, health) = json_request(&app, Method::GET, "/api/health", None).await;
    assert_eq!(health["running_processes"], 1);
    assert_eq!(health["processes"][0]["token"], "dev");
    assert_eq!(health["processes"][0]["kind"], "service");

    let (status, json) = json_request(&app, Method::POST, "/api/services/dev/stop", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["signalled"], true);

    for _ in 0..500 {
        if !state.services.is_running("dev") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let (_, json) = json_request(&app, Method::GET, "/api/services", None).await;
    assert_eq!(json["running"], json!([]));

    let (status, _) = json_request(&app, Method::GET, "/api/services/dev/output", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn task_crud_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(dir.path()));

    let (status, created) = json_request(
        &app,
        Method::POST,
        "/api/tasks",
        Some(json!({
            "name": "disk",
            "type": "shell",
            "command": "df -h",
            "interval_minutes": 15
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["enabled"], false);
    let id = created["id"].as_str().unwrap().to_string();

    let (status, _) = json_request(
        &app,
        Method::POST,
        "/api/tasks",
        Some(json!({"name": "bad", "type": "shell", "command": "x", "interval_minutes": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, updated) = json_request(
        &app,
        Method::PUT,
        &format!("/api/tasks/{}", id),
        Some(json!({
            "name": "status",
            "type": "prompt",
            "prompt": "Summarise the repo status",
            "context_conversation_ids": ["q1"],
            "interval_minutes": 30
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["type"], "prompt");
    assert_eq!(updated["interval_minutes"], 30);

    let (_, list) = json_request(&app, Method::GET, "/api/tasks", None).await;
    assert_eq!(list.as_array().unwrap().len(), 1);

    let (status, seen) =
        json_request(&app, Method::POST, &format!("/api/tasks/{}/seen", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(seen["has_unseen_output"], false);

    let (status, _) = json_request(&app, Method::DELETE, &format!("/api/tasks/{}", id), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = json_request(&app, Method::GET, &format!("/api/tasks/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = json_request(&app, Method::POST, "/api/tasks/missing/enable", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    assert!(dir.path().join("scheduled_tasks.json").exists());
}

#[tokio::test]
async fn conversations_are_upserted() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(dir.path()));

    let (status, _) = json_request(&app, Method::GET, "/api/conversations/q1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = json_request(
        &app,
        Method::PUT,
        "/api/conversations/q1",
        Some(json!({"working_directory": "/tmp", "session_id": "sess-1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = json_request(
        &app,
        Method::PUT,
        "/api/conversations/q1",
        Some(json!({"session_id": "sess-2"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["working_directory"], "/tmp");
    assert_eq!(json["session_id"], "sess-2");
    assert_eq!(json["messages"], json!([]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn assistant_precondition_and_spawn_failure() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(test_state(dir.path()));

    let (status, json) = json_request(&app, Method::GET, "/api/assistant/installed", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["installed"], false);

    let (status, _) = json_request(
        &app,
        Method::POST,
        "/api/assistant/q1/messages",
        Some(json!({"message": "hello"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, json) = json_request(&app, Method::POST, "/api/assistant/q1/cancel", None).await;
    assert_eq!(json["signalled"], false);
}

#[tokio::test]
async fn fs_list_rejects_files() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("README.md"), "").unwrap();
    let app = router(test_state(dir.path()));

    let path = dir.path().to_string_lossy().into_owned();
    let (status, json) = json_request(
        &app,
        Method::GET,
        &format!("/api/fs/list?path={}", path),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<_> = json
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["src", "README.md"]);

    let (status, _) = json_request(
        &app,
        Method::GET,
        &format!("/api/fs/list?path={}/README.md", path),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
