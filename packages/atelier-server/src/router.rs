use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use futures::StreamExt;
use serde::Deserialize;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::OpenApi;

use atelier_error::{AtelierError, ErrorBody};

use crate::events;
use crate::ids;
use crate::instance::{InstanceManager, ProjectInstance};
use crate::message::{CreateMessageParams, Role};
use crate::prompt;
use crate::registry::{default_data_dir, ProjectRegistry};
use crate::router::types::*;

pub mod types;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RATE_LIMIT: i64 = 100;
const DEFAULT_RATE_BURST: i64 = 200;

pub struct AppState {
    manager: Arc<InstanceManager>,
    rate_limiter: Mutex<RateLimiter>,
}

impl AppState {
    pub fn new(registry: Arc<ProjectRegistry>) -> Self {
        Self {
            manager: Arc::new(InstanceManager::new(registry)),
            rate_limiter: Mutex::new(RateLimiter::new(DEFAULT_RATE_LIMIT, DEFAULT_RATE_BURST)),
        }
    }

    pub fn manager(&self) -> &Arc<InstanceManager> {
        &self.manager
    }

    fn registry(&self) -> &Arc<ProjectRegistry> {
        self.manager.registry()
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let router = Router::new()
        .route("/health", get(get_health))
        .route("/project", get(list_projects).post(create_project))
        .route("/project/current", get(get_current_project))
        .route("/project/config", get(get_project_config))
        .route("/project/permissions", get(list_permissions))
        .route("/project/permissions/:id/reply", post(reply_permission))
        .route("/instance/dispose", post(dispose_instance))
        .route("/global/dispose", post(dispose_all))
        .route("/session", get(list_sessions).post(create_session))
        .route("/session/status", get(get_session_status))
        .route(
            "/session/:id",
            get(get_session).put(update_session).delete(delete_session),
        )
        .route("/session/:id/abort", post(abort_session))
        .route("/session/:id/message", get(list_messages))
        .route("/session/:id/prompt", post(post_prompt))
        .route("/message/:id", get(get_message))
        .route("/event", get(get_event_stream))
        .route("/lsp", get(get_lsp_status))
        .route("/path", get(get_path))
        .route(
            "/system-prompt",
            get(get_system_prompt).put(update_system_prompt),
        )
        .route("/openapi.json", get(get_openapi))
        .with_state(shared.clone())
        .layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            rate_limit,
        ))
        .layer(axum::middleware::from_fn(request_timeout))
        .layer(CatchPanicLayer::custom(handle_panic));

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request| {
            tracing::info_span!(
                "http.request",
                method = %req.method(),
                uri = %req.uri()
            )
        })
        .on_response(|res: &Response, latency: Duration, span: &Span| {
            tracing::info!(
                parent: span,
                status = %res.status(),
                latency_ms = latency.as_millis()
            );
        });

    (router.layer(trace_layer), shared)
}

/// Disposes every live instance. Wired into the server's graceful shutdown.
pub async fn shutdown_instances(state: &Arc<AppState>) {
    let disposed = state.manager.dispose_all().await;
    tracing::info!(count = disposed.len(), "disposed all project instances");
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        list_projects,
        create_project,
        get_current_project,
        get_project_config,
        list_permissions,
        reply_permission,
        dispose_instance,
        dispose_all,
        list_sessions,
        create_session,
        get_session_status,
        get_session,
        update_session,
        delete_session,
        abort_session,
        list_messages,
        post_prompt,
        get_message,
        get_event_stream,
        get_lsp_status,
        get_path,
        get_system_prompt,
        update_system_prompt
    ),
    components(schemas(
        ErrorBody,
        HealthResponse,
        ProjectResponse,
        ProjectsResponse,
        CreateProjectRequest,
        CreateProjectResponse,
        CurrentProjectResponse,
        DisposeProjectResponse,
        DisposeAllResponse,
        ConfigResponse,
        ProviderInfo,
        PermissionsResponse,
        PermissionReplyRequest,
        PermissionReplyResponse,
        SessionResponse,
        SessionsResponse,
        TodoResponse,
        CreateSessionRequest,
        CreateSessionResponse,
        UpdateSessionRequest,
        UpdateSessionResponse,
        SessionDetailResponse,
        SessionStatusResponse,
        AbortResponse,
        MessageResponse,
        MessagesResponse,
        MessageDetailResponse,
        PromptRequest,
        PromptResponse,
        ModelSpec,
        PartInput,
        AssistantMessageInfo,
        MessageTime,
        LspStatus,
        PathResponse,
        SystemPromptResponse,
        UpdateSystemPromptRequest
    ))
)]
struct ApiDoc;

// ---------------------------------------------------------------------------
// Error plumbing
// ---------------------------------------------------------------------------

pub struct ApiError(AtelierError);

impl From<AtelierError> for ApiError {
    fn from(err: AtelierError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0.to_body())).into_response()
    }
}

fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %detail, "request handler panicked");
    ApiError(AtelierError::internal(format!("panic: {detail}"))).into_response()
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Token bucket shared across all routes.
struct RateLimiter {
    tokens: i64,
    max_tokens: i64,
    refill_per_sec: i64,
    last_ms: i64,
}

impl RateLimiter {
    fn new(rate: i64, burst: i64) -> Self {
        Self {
            tokens: burst,
            max_tokens: burst,
            refill_per_sec: rate,
            last_ms: ids::now_ms(),
        }
    }

    fn allow(&mut self) -> bool {
        let now = ids::now_ms();
        let elapsed = now.saturating_sub(self.last_ms);
        self.last_ms = now;

        self.tokens = (self.tokens + elapsed * self.refill_per_sec / 1000).min(self.max_tokens);
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }
}

async fn rate_limit(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let allowed = state
        .rate_limiter
        .lock()
        .expect("rate limiter lock poisoned")
        .allow();
    if !allowed {
        tracing::warn!(path = %req.uri().path(), "rate limit exceeded");
        return ApiError(AtelierError::RateLimitExceeded).into_response();
    }
    next.run(req).await
}

/// Default 30 s request deadline. Long-lived endpoints (the SSE stream and
/// prompt runs, which carry their own 5 minute budget) are exempt.
async fn request_timeout(req: Request, next: Next) -> Response {
    let path = req.uri().path().to_string();
    if path == "/event" || path.ends_with("/prompt") {
        return next.run(req).await;
    }
    match tokio::time::timeout(DEFAULT_REQUEST_TIMEOUT, next.run(req)).await {
        Ok(response) => response,
        Err(_) => {
            tracing::warn!(path = %path, "request timed out");
            ApiError(AtelierError::Timeout).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Shared extraction helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct DirectoryQuery {
    directory: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromptQuery {
    directory: Option<String>,
    #[serde(default)]
    stream: Option<bool>,
}

fn require_directory(directory: &Option<String>) -> Result<&str, ApiError> {
    match directory.as_deref() {
        Some(directory) if !directory.is_empty() => Ok(directory),
        _ => Err(AtelierError::MissingDirectoryParam.into()),
    }
}

async fn instance_for(
    state: &AppState,
    directory: &str,
) -> Result<Arc<ProjectInstance>, ApiError> {
    Ok(state.manager.get_or_create(directory).await?)
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, body = HealthResponse)),
    tag = "global"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ---------------------------------------------------------------------------
// Projects
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/project",
    responses(
        (status = 200, body = ProjectsResponse),
        (status = 500, body = ErrorBody)
    ),
    tag = "project"
)]
async fn list_projects(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ProjectsResponse>, ApiError> {
    let projects = state.registry().list()?;
    Ok(Json(ProjectsResponse {
        projects: projects.iter().map(project_to_response).collect(),
    }))
}

#[utoipa::path(
    post,
    path = "/project",
    request_body = CreateProjectRequest,
    responses(
        (status = 201, body = CreateProjectResponse),
        (status = 400, body = ErrorBody)
    ),
    tag = "project"
)]
async fn create_project(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<CreateProjectResponse>), ApiError> {
    if request.path.is_empty() {
        return Err(AtelierError::invalid("project path is required").into());
    }

    let data_dir = match request.data_dir {
        Some(dir) if !dir.is_empty() => dir,
        _ => default_data_dir(&request.path),
    };
    let project = state.registry().register(&request.path, &data_dir)?;
    tracing::info!(project = %project.path, "registered project");

    Ok((
        StatusCode::CREATED,
        Json(CreateProjectResponse {
            project: project_to_response(&project),
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/project/current",
    params(("directory" = Option<String>, Query, description = "Project path")),
    responses(
        (status = 200, body = CurrentProjectResponse),
        (status = 404, body = ErrorBody)
    ),
    tag = "project"
)]
async fn get_current_project(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DirectoryQuery>,
) -> Result<Json<CurrentProjectResponse>, ApiError> {
    if let Some(directory) = query.directory.as_deref().filter(|d| !d.is_empty()) {
        let project =
            state
                .registry()
                .find(directory)?
                .ok_or_else(|| AtelierError::ProjectNotFound {
                    path: directory.to_string(),
                })?;
        instance_for(&state, directory).await?;
        return Ok(Json(CurrentProjectResponse {
            project: project_to_response(&project),
        }));
    }

    let projects = state.registry().list()?;
    let current = projects.first().ok_or(AtelierError::NoProjects)?;
    Ok(Json(CurrentProjectResponse {
        project: project_to_response(current),
    }))
}

#[utoipa::path(
    get,
    path = "/project/config",
    params(("directory" = String, Query, description = "Project path")),
    responses(
        (status = 200, body = ConfigResponse),
        (status = 404, body = ErrorBody)
    ),
    tag = "project"
)]
async fn get_project_config(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DirectoryQuery>,
) -> Result<Json<ConfigResponse>, ApiError> {
    let directory = require_directory(&query.directory)?;
    let instance = instance_for(&state, directory).await?;
    Ok(Json(config_to_response(instance.config())))
}

// ---------------------------------------------------------------------------
// Instance lifecycle
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/instance/dispose",
    params(("directory" = String, Query, description = "Project path")),
    responses(
        (status = 200, body = DisposeProjectResponse),
        (status = 404, body = ErrorBody)
    ),
    tag = "project"
)]
async fn dispose_instance(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DirectoryQuery>,
) -> Result<Json<DisposeProjectResponse>, ApiError> {
    let directory = require_directory(&query.directory)?;
    if state.registry().find(directory)?.is_none() {
        return Err(AtelierError::ProjectNotFound {
            path: directory.to_string(),
        }
        .into());
    }

    state.manager.dispose_project(directory).await?;
    Ok(Json(DisposeProjectResponse {
        project_path: directory.to_string(),
        status: "disposed".to_string(),
        message: "Project instance disposed successfully".to_string(),
    }))
}

#[utoipa::path(
    post,
    path = "/global/dispose",
    responses((status = 200, body = DisposeAllResponse)),
    tag = "global"
)]
async fn dispose_all(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DisposeAllResponse>, ApiError> {
    let projects = state.manager.dispose_all().await;
    Ok(Json(DisposeAllResponse {
        disposed_count: projects.len(),
        projects,
        status: "all_disposed".to_string(),
    }))
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/session",
    params(("directory" = String, Query, description = "Project path")),
    responses(
        (status = 200, body = SessionsResponse),
        (status = 404, body = ErrorBody)
    ),
    tag = "session"
)]
async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DirectoryQuery>,
) -> Result<Json<SessionsResponse>, ApiError> {
    let directory = require_directory(&query.directory)?;
    let instance = instance_for(&state, directory).await?;
    let sessions = instance.sessions.list()?;
    Ok(Json(SessionsResponse {
        total: sessions.len(),
        sessions: sessions.iter().map(session_to_response).collect(),
    }))
}

#[utoipa::path(
    post,
    path = "/session",
    params(("directory" = String, Query, description = "Project path")),
    request_body = CreateSessionRequest,
    responses(
        (status = 201, body = CreateSessionResponse),
        (status = 400, body = ErrorBody)
    ),
    tag = "session"
)]
async fn create_session(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DirectoryQuery>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let directory = require_directory(&query.directory)?;
    if request.title.is_empty() {
        return Err(AtelierError::invalid("title is required").into());
    }

    let instance = instance_for(&state, directory).await?;
    let session = instance.sessions.create(&request.title)?;
    tracing::info!(project = %directory, session_id = %session.id, "session created");

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session: session_to_response(&session),
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/session/status",
    params(("directory" = String, Query, description = "Project path")),
    responses(
        (status = 200, body = SessionStatusResponse),
        (status = 404, body = ErrorBody)
    ),
    tag = "session"
)]
async fn get_session_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DirectoryQuery>,
) -> Result<Json<SessionStatusResponse>, ApiError> {
    let directory = require_directory(&query.directory)?;
    let instance = instance_for(&state, directory).await?;
    let sessions = instance.sessions.list()?;
    Ok(Json(SessionStatusResponse {
        total_sessions: sessions.len(),
        app_configured: instance.config().is_configured(),
        agent_ready: instance.coordinator.is_some(),
    }))
}

#[utoipa::path(
    get,
    path = "/session/{id}",
    params(
        ("directory" = String, Query, description = "Project path"),
        ("id" = String, Path, description = "Session id")
    ),
    responses(
        (status = 200, body = SessionDetailResponse),
        (status = 404, body = ErrorBody)
    ),
    tag = "session"
)]
async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<DirectoryQuery>,
) -> Result<Json<SessionDetailResponse>, ApiError> {
    let directory = require_directory(&query.directory)?;
    let instance = instance_for(&state, directory).await?;
    let session = instance.sessions.get(&session_id)?;
    Ok(Json(SessionDetailResponse {
        session: session_to_response(&session),
    }))
}

#[utoipa::path(
    put,
    path = "/session/{id}",
    params(
        ("directory" = String, Query, description = "Project path"),
        ("id" = String, Path, description = "Session id")
    ),
    request_body = UpdateSessionRequest,
    responses(
        (status = 200, body = UpdateSessionResponse),
        (status = 404, body = ErrorBody)
    ),
    tag = "session"
)]
async fn update_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<DirectoryQuery>,
    Json(request): Json<UpdateSessionRequest>,
) -> Result<Json<UpdateSessionResponse>, ApiError> {
    let directory = require_directory(&query.directory)?;
    let instance = instance_for(&state, directory).await?;

    let mut session = instance.sessions.get(&session_id)?;
    if let Some(title) = request.title.filter(|t| !t.is_empty()) {
        session.title = title;
    }
    let session = instance.sessions.save(session)?;
    Ok(Json(UpdateSessionResponse {
        session: session_to_response(&session),
    }))
}

#[utoipa::path(
    delete,
    path = "/session/{id}",
    params(
        ("directory" = String, Query, description = "Project path"),
        ("id" = String, Path, description = "Session id")
    ),
    responses(
        (status = 200, description = "Session deleted"),
        (status = 404, body = ErrorBody)
    ),
    tag = "session"
)]
async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<DirectoryQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let directory = require_directory(&query.directory)?;
    let instance = instance_for(&state, directory).await?;

    // Emit message removals before the session removal so subscribers can
    // clear their per-message state.
    instance.messages.delete_for_session(&session_id)?;
    instance.sessions.delete(&session_id)?;
    Ok(Json(
        serde_json::json!({ "message": "Session deleted successfully" }),
    ))
}

#[utoipa::path(
    post,
    path = "/session/{id}/abort",
    params(
        ("directory" = String, Query, description = "Project path"),
        ("id" = String, Path, description = "Session id")
    ),
    responses(
        (status = 200, body = AbortResponse),
        (status = 404, body = ErrorBody)
    ),
    tag = "session"
)]
async fn abort_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<DirectoryQuery>,
) -> Result<Json<AbortResponse>, ApiError> {
    let directory = require_directory(&query.directory)?;
    let instance = instance_for(&state, directory).await?;
    instance.sessions.get(&session_id)?;

    // Cancellation granularity is the whole coordinator, not one session;
    // the endpoint is session-scoped in name only.
    if let Some(coordinator) = &instance.coordinator {
        coordinator.cancel_all();
    }

    Ok(Json(AbortResponse {
        status: "aborted".to_string(),
        session_id,
    }))
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/session/{id}/message",
    params(
        ("directory" = String, Query, description = "Project path"),
        ("id" = String, Path, description = "Session id")
    ),
    responses(
        (status = 200, body = MessagesResponse),
        (status = 404, body = ErrorBody)
    ),
    tag = "message"
)]
async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<DirectoryQuery>,
) -> Result<Json<MessagesResponse>, ApiError> {
    let directory = require_directory(&query.directory)?;
    let instance = instance_for(&state, directory).await?;
    let messages = instance.messages.list(&session_id)?;
    Ok(Json(MessagesResponse {
        total: messages.len(),
        messages: messages.iter().map(message_to_response).collect(),
    }))
}

#[utoipa::path(
    get,
    path = "/message/{id}",
    params(
        ("directory" = String, Query, description = "Project path"),
        ("id" = String, Path, description = "Message id")
    ),
    responses(
        (status = 200, body = MessageDetailResponse),
        (status = 404, body = ErrorBody)
    ),
    tag = "message"
)]
async fn get_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<String>,
    Query(query): Query<DirectoryQuery>,
) -> Result<Json<MessageDetailResponse>, ApiError> {
    let directory = require_directory(&query.directory)?;
    let instance = instance_for(&state, directory).await?;
    let message = instance.messages.get(&message_id)?;
    Ok(Json(MessageDetailResponse {
        message: message_to_response(&message),
    }))
}

#[utoipa::path(
    post,
    path = "/session/{id}/prompt",
    params(
        ("directory" = String, Query, description = "Project path"),
        ("stream" = Option<bool>, Query, description = "Stream the response over SSE"),
        ("id" = String, Path, description = "Session id")
    ),
    request_body = PromptRequest,
    responses(
        (status = 200, body = PromptResponse),
        (status = 404, body = ErrorBody),
        (status = 408, body = ErrorBody)
    ),
    tag = "session"
)]
async fn post_prompt(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<PromptQuery>,
    Json(request): Json<PromptRequest>,
) -> Result<Response, ApiError> {
    let directory = require_directory(&query.directory)?;
    if request.parts.is_empty() {
        return Err(AtelierError::invalid("parts array is required").into());
    }
    let instance = instance_for(&state, directory).await?;

    // Tool-use prompts during this run resolve without a round-trip.
    instance.permissions.auto_approve_session(&session_id);

    let prompt_text = extract_prompt_text(&request.parts);

    if request.no_reply {
        let mut params = CreateMessageParams {
            role: Some(Role::User),
            parts: parts_to_content_parts(&request.parts),
            ..Default::default()
        };
        if let Some(model) = &request.model {
            params.provider = Some(model.provider_id.clone());
            params.model = Some(model.model_id.clone());
        }
        let created = instance
            .messages
            .create(&session_id, params)
            .map_err(|err| AtelierError::internal(format!("failed to create message: {err}")))?;
        return Ok(Json(message_to_prompt_response(&created)).into_response());
    }

    if query.stream.unwrap_or(false) {
        let stream = prompt::stream_prompt(instance, session_id, prompt_text)
            .map(|event| Ok::<_, Infallible>(event.into_sse()));
        return Ok(Sse::new(stream).into_response());
    }

    let assistant = prompt::run_sync_prompt(&instance, &session_id, &prompt_text).await?;
    Ok(Json(message_to_prompt_response(&assistant)).into_response())
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/event",
    params(("directory" = String, Query, description = "Project path")),
    responses(
        (status = 200, description = "SSE event stream"),
        (status = 404, body = ErrorBody)
    ),
    tag = "event"
)]
async fn get_event_stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DirectoryQuery>,
) -> Result<Response, ApiError> {
    let directory = require_directory(&query.directory)?;
    let instance = instance_for(&state, directory).await?;
    tracing::info!(project = %directory, "sse connection established");
    Ok(events::sse_response(&instance).into_response())
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/project/permissions",
    params(("directory" = String, Query, description = "Project path")),
    responses(
        (status = 200, body = PermissionsResponse),
        (status = 404, body = ErrorBody)
    ),
    tag = "permission"
)]
async fn list_permissions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DirectoryQuery>,
) -> Result<Json<PermissionsResponse>, ApiError> {
    let directory = require_directory(&query.directory)?;
    let instance = instance_for(&state, directory).await?;
    Ok(Json(PermissionsResponse {
        skip_requests: instance.permissions.skip_requests(),
        pending: instance.permissions.pending(),
    }))
}

#[utoipa::path(
    post,
    path = "/project/permissions/{id}/reply",
    params(
        ("directory" = String, Query, description = "Project path"),
        ("id" = String, Path, description = "Permission request id")
    ),
    request_body = PermissionReplyRequest,
    responses(
        (status = 200, body = PermissionReplyResponse),
        (status = 404, body = ErrorBody)
    ),
    tag = "permission"
)]
async fn reply_permission(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
    Query(query): Query<DirectoryQuery>,
    Json(request): Json<PermissionReplyRequest>,
) -> Result<Json<PermissionReplyResponse>, ApiError> {
    let directory = require_directory(&query.directory)?;
    let instance = instance_for(&state, directory).await?;

    let resolved = if request.granted {
        if request.persistent {
            instance.permissions.grant_persistent(&request_id)
        } else {
            instance.permissions.grant(&request_id)
        }
    } else {
        instance.permissions.deny(&request_id)
    };
    if !resolved {
        tracing::warn!(request_id = %request_id, "permission reply for unknown request");
    }

    Ok(Json(PermissionReplyResponse {
        status: "replied".to_string(),
        request_id,
        granted: request.granted,
    }))
}

// ---------------------------------------------------------------------------
// LSP / paths / system prompt
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/lsp",
    params(("directory" = String, Query, description = "Project path")),
    responses(
        (status = 200, body = [LspStatus]),
        (status = 404, body = ErrorBody)
    ),
    tag = "lsp"
)]
async fn get_lsp_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DirectoryQuery>,
) -> Result<Json<Vec<LspStatus>>, ApiError> {
    let directory = require_directory(&query.directory)?;
    let instance = instance_for(&state, directory).await?;
    let statuses = instance
        .lsp_clients
        .snapshot()
        .into_iter()
        .map(|client| LspStatus {
            id: client.name.clone(),
            name: client.name,
            root: directory.to_string(),
            status: client.state.as_str().to_string(),
            diagnostic_count: client.diagnostic_count,
        })
        .collect();
    Ok(Json(statuses))
}

#[utoipa::path(
    get,
    path = "/path",
    params(("directory" = String, Query, description = "Project path")),
    responses(
        (status = 200, body = PathResponse),
        (status = 404, body = ErrorBody)
    ),
    tag = "project"
)]
async fn get_path(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DirectoryQuery>,
) -> Result<Json<PathResponse>, ApiError> {
    let directory = require_directory(&query.directory)?;
    let instance = instance_for(&state, directory).await?;
    let config = instance.config();

    let home = dirs::home_dir()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default();
    let data_dir = config.data_dir().to_string_lossy().to_string();
    let working_dir = config.working_dir().to_string_lossy().to_string();

    Ok(Json(PathResponse {
        home,
        state: format!("{data_dir}/state"),
        config: data_dir,
        worktree: working_dir.clone(),
        directory: working_dir,
    }))
}

#[utoipa::path(
    get,
    path = "/system-prompt",
    params(("directory" = String, Query, description = "Project path")),
    responses(
        (status = 200, body = SystemPromptResponse),
        (status = 500, body = ErrorBody)
    ),
    tag = "agent"
)]
async fn get_system_prompt(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DirectoryQuery>,
) -> Result<Json<SystemPromptResponse>, ApiError> {
    let directory = require_directory(&query.directory)?;
    let instance = instance_for(&state, directory).await?;
    let coordinator = instance
        .coordinator
        .as_ref()
        .ok_or(AtelierError::AgentNotConfigured)?;
    Ok(Json(SystemPromptResponse {
        system_prompt: coordinator.system_prompt(),
    }))
}

#[utoipa::path(
    put,
    path = "/system-prompt",
    params(("directory" = String, Query, description = "Project path")),
    request_body = UpdateSystemPromptRequest,
    responses(
        (status = 200, body = SystemPromptResponse),
        (status = 500, body = ErrorBody)
    ),
    tag = "agent"
)]
async fn update_system_prompt(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DirectoryQuery>,
    Json(request): Json<UpdateSystemPromptRequest>,
) -> Result<Json<SystemPromptResponse>, ApiError> {
    let directory = require_directory(&query.directory)?;
    let instance = instance_for(&state, directory).await?;
    let coordinator = instance
        .coordinator
        .as_ref()
        .ok_or(AtelierError::AgentNotConfigured)?;
    coordinator.set_system_prompt(request.system_prompt);
    Ok(Json(SystemPromptResponse {
        system_prompt: coordinator.system_prompt(),
    }))
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
