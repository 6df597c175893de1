mod common;

use axum::http::{Method, StatusCode};
use serde_json::json;

use common::{error_code, send_json, send_status, TestApp};

#[tokio::test]
async fn health_reports_ok() {
    let app = TestApp::new();
    let (status, payload) = send_json(&app.app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["status"], "ok");
    assert!(payload["version"].as_str().is_some());
}

#[tokio::test]
async fn project_bootstrap_creates_data_dir_with_gitignore() {
    let app = TestApp::new();
    app.register_project().await;

    let (status, payload) = send_json(
        &app.app,
        Method::GET,
        &format!("/project/current?directory={}", app.project_path),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["project"]["path"], app.project_path.as_str());

    let data_dir = std::path::Path::new(&app.project_path).join(".atelier");
    assert!(data_dir.is_dir());
    assert_eq!(
        std::fs::read_to_string(data_dir.join(".gitignore")).unwrap(),
        "*\n"
    );
}

#[tokio::test]
async fn registered_project_lists_first() {
    let app = TestApp::new();
    app.register_project().await;

    let (status, _) = send_json(
        &app.app,
        Method::POST,
        "/project",
        Some(json!({ "path": "/tmp/atelier-other", "data_dir": "/tmp/atelier-other/.atelier" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, payload) = send_json(&app.app, Method::GET, "/project", None).await;
    assert_eq!(status, StatusCode::OK);
    let projects = payload["projects"].as_array().unwrap();
    assert_eq!(projects.len(), 2);
    assert_eq!(projects[0]["path"], "/tmp/atelier-other");
}

#[tokio::test]
async fn project_registration_requires_a_path() {
    let app = TestApp::new();
    let (status, payload) =
        send_json(&app.app, Method::POST, "/project", Some(json!({ "path": "" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error_code(&payload), "INVALID_REQUEST");
}

#[tokio::test]
async fn current_project_without_any_registration_is_404() {
    let app = TestApp::new();
    let (status, payload) = send_json(&app.app, Method::GET, "/project/current", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&payload), "NO_PROJECTS");
}

#[tokio::test]
async fn missing_directory_param_is_rejected() {
    let app = TestApp::new();
    for path in ["/session", "/event", "/project/config", "/lsp", "/path"] {
        let (status, payload) = send_json(&app.app, Method::GET, path, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "path {path}");
        assert_eq!(error_code(&payload), "MISSING_DIRECTORY_PARAM", "path {path}");
    }
}

#[tokio::test]
async fn unregistered_directory_is_project_not_found() {
    let app = TestApp::new();
    let (status, payload) = send_json(
        &app.app,
        Method::GET,
        "/session?directory=/nowhere/to/be/found",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&payload), "PROJECT_NOT_FOUND");
}

#[tokio::test]
async fn dispose_is_idempotent_over_http() {
    let app = TestApp::new();
    app.register_project().await;
    app.create_session("warm the instance").await;

    let dispose_path = format!("/instance/dispose?directory={}", app.project_path);
    for _ in 0..2 {
        let (status, payload) = send_json(&app.app, Method::POST, &dispose_path, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload["status"], "disposed");
    }

    // Disposing an unregistered project is a 404, not a silent success.
    let (status, payload) = send_json(
        &app.app,
        Method::POST,
        "/instance/dispose?directory=/not/registered",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error_code(&payload), "PROJECT_NOT_FOUND");
}

#[tokio::test]
async fn sessions_survive_dispose_and_recreate() {
    let app = TestApp::new();
    app.register_project().await;
    let session_id = app.create_session("durable").await;

    let dispose_path = format!("/instance/dispose?directory={}", app.project_path);
    assert_eq!(
        send_status(&app.app, Method::POST, &dispose_path, None).await,
        StatusCode::OK
    );

    // A fresh instance is materialized lazily and reads the same database.
    let (status, payload) = send_json(
        &app.app,
        Method::GET,
        &format!("/session/{session_id}?directory={}", app.project_path),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["session"]["id"], session_id.as_str());
}

#[tokio::test]
async fn global_dispose_reports_disposed_paths() {
    let app = TestApp::new();
    app.register_project().await;
    app.create_session("anything").await;

    let (status, payload) = send_json(&app.app, Method::POST, "/global/dispose", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["disposed_count"], 1);
    assert_eq!(payload["projects"][0], app.project_path.as_str());
    assert_eq!(payload["status"], "all_disposed");

    let (status, payload) = send_json(&app.app, Method::POST, "/global/dispose", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["disposed_count"], 0);
}

#[tokio::test]
async fn config_endpoint_reports_providers_without_secrets() {
    let app = TestApp::with_config(
        r#"{"options":{"debug":true},"providers":{"mock":{},"acme":{"type":"openai-compatible","api_key":"sk-secret"}}}"#,
    );
    app.register_project().await;

    let (status, payload) = send_json(
        &app.app,
        Method::GET,
        &format!("/project/config?directory={}", app.project_path),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["debug"], true);
    assert_eq!(payload["configured"], true);
    let providers = payload["providers"].as_array().unwrap();
    assert_eq!(providers.len(), 2);
    assert!(!payload.to_string().contains("sk-secret"));
}

#[tokio::test]
async fn path_endpoint_reflects_the_project_layout() {
    let app = TestApp::new();
    app.register_project().await;

    let (status, payload) = send_json(
        &app.app,
        Method::GET,
        &format!("/path?directory={}", app.project_path),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload["worktree"], app.project_path.as_str());
    assert_eq!(payload["directory"], app.project_path.as_str());
    assert!(payload["config"]
        .as_str()
        .unwrap()
        .ends_with(".atelier"));
}

#[tokio::test]
async fn openapi_document_is_served() {
    let app = TestApp::new();
    let (status, payload) = send_json(&app.app, Method::GET, "/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(payload["paths"]["/event"].is_object());
    assert!(payload["paths"]["/session/{id}/prompt"].is_object());
}
