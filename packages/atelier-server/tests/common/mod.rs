#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;

use atelier_server::registry::ProjectRegistry;
use atelier_server::router::{build_router, AppState};

pub const MOCK_CONFIG: &str = r#"{"providers":{"mock":{}}}"#;

pub struct TestApp {
    pub app: Router,
    pub project_path: String,
    _data_home: TempDir,
    _project_dir: TempDir,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config("")
    }

    /// Builds a router over a scratch registry and a scratch project
    /// directory, optionally seeded with an `atelier.json`.
    pub fn with_config(config_json: &str) -> Self {
        let data_home = tempfile::tempdir().expect("create data home");
        let project_dir = tempfile::tempdir().expect("create project dir");
        if !config_json.is_empty() {
            std::fs::write(project_dir.path().join("atelier.json"), config_json)
                .expect("write project config");
        }

        let registry =
            Arc::new(ProjectRegistry::open_at(data_home.path()).expect("open registry"));
        let app = build_router(AppState::new(registry));
        let project_path = project_dir.path().to_string_lossy().to_string();

        Self {
            app,
            project_path,
            _data_home: data_home,
            _project_dir: project_dir,
        }
    }

    pub async fn register_project(&self) {
        let (status, _) = send_json(
            &self.app,
            Method::POST,
            "/project",
            Some(json!({ "path": self.project_path })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "register project");
    }

    pub async fn create_session(&self, title: &str) -> String {
        let (status, payload) = send_json(
            &self.app,
            Method::POST,
            &format!("/session?directory={}", self.project_path),
            Some(json!({ "title": title })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "create session");
        payload["session"]["id"]
            .as_str()
            .expect("session id")
            .to_string()
    }
}

pub async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(
            body.map(|value| value.to_string()).unwrap_or_default(),
        ))
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    let payload = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, payload)
}

pub async fn send_status(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> StatusCode {
    let (status, _) = send_json(app, method, path, body).await;
    status
}

pub fn error_code(payload: &Value) -> &str {
    payload["error"]["code"].as_str().unwrap_or("")
}

#[derive(Debug, Clone)]
pub struct SseRecord {
    pub event: String,
    pub data: Value,
}

/// Reads SSE records off a live response body until `stop` returns true or
/// the timeout elapses. The connection is dropped when this returns.
pub async fn collect_sse_records<F>(
    body: axum::body::Body,
    timeout: Duration,
    mut stop: F,
) -> Vec<SseRecord>
where
    F: FnMut(&[SseRecord]) -> bool,
{
    let mut body = body;
    let mut buffer = String::new();
    let mut records = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if stop(&records) {
            break;
        }
        let frame = match tokio::time::timeout_at(deadline, body.frame()).await {
            Ok(Some(Ok(frame))) => frame,
            _ => break,
        };
        let Some(chunk) = frame.data_ref() else {
            continue;
        };
        buffer.push_str(&String::from_utf8_lossy(chunk));

        while let Some(end) = buffer.find("\n\n") {
            let raw: String = buffer.drain(..end + 2).collect();
            let mut event = String::new();
            let mut data = Value::Null;
            for line in raw.lines() {
                if let Some(rest) = line.strip_prefix("event: ") {
                    event = rest.to_string();
                } else if let Some(rest) = line.strip_prefix("data: ") {
                    data = serde_json::from_str(rest).unwrap_or(Value::Null);
                }
            }
            if !event.is_empty() {
                records.push(SseRecord { event, data });
            }
        }
    }
    records
}

pub fn events_of<'a>(records: &'a [SseRecord], event: &str) -> Vec<&'a SseRecord> {
    records.iter().filter(|r| r.event == event).collect()
}
