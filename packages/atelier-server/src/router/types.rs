use base64::Engine;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;

use crate::config::Config;
use crate::message::{part_json, ContentPart, Message};
use crate::permission::PermissionRequest;
use crate::registry::Project;
use crate::session::{Session, Todo};

// ---------------------------------------------------------------------------
// Projects
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProjectResponse {
    pub path: String,
    pub data_dir: String,
    pub last_accessed: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProjectsResponse {
    pub projects: Vec<ProjectResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct CreateProjectRequest {
    pub path: String,
    #[serde(default)]
    pub data_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct CreateProjectResponse {
    pub project: ProjectResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct CurrentProjectResponse {
    pub project: ProjectResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct DisposeProjectResponse {
    pub project_path: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct DisposeAllResponse {
    pub disposed_count: usize,
    pub projects: Vec<String>,
    pub status: String,
}

pub fn project_to_response(project: &Project) -> ProjectResponse {
    ProjectResponse {
        path: project.path.clone(),
        data_dir: project.data_dir.clone(),
        last_accessed: project.last_accessed,
    }
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct TodoResponse {
    pub content: String,
    pub status: String,
    pub active_form: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct SessionResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    pub title: String,
    pub message_count: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_message_id: Option<String>,
    pub todos: Vec<TodoResponse>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionResponse>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct CreateSessionRequest {
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct CreateSessionResponse {
    pub session: SessionResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct UpdateSessionRequest {
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct UpdateSessionResponse {
    pub session: SessionResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct SessionDetailResponse {
    pub session: SessionResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct SessionStatusResponse {
    pub total_sessions: usize,
    pub app_configured: bool,
    pub agent_ready: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct AbortResponse {
    pub status: String,
    pub session_id: String,
}

fn todo_to_response(todo: &Todo) -> TodoResponse {
    TodoResponse {
        content: todo.content.clone(),
        status: serde_json::to_value(todo.status)
            .ok()
            .and_then(|v| v.as_str().map(ToOwned::to_owned))
            .unwrap_or_else(|| "pending".to_string()),
        active_form: todo.active_form.clone(),
    }
}

pub fn session_to_response(session: &Session) -> SessionResponse {
    SessionResponse {
        id: session.id.clone(),
        parent_session_id: session.parent_session_id.clone(),
        title: session.title.clone(),
        message_count: session.message_count,
        prompt_tokens: session.prompt_tokens,
        completion_tokens: session.completion_tokens,
        cost: session.cost,
        summary_message_id: session.summary_message_id.clone(),
        todos: session.todos.iter().map(todo_to_response).collect(),
        created_at: session.created_at,
        updated_at: session.updated_at,
    }
}

pub fn session_to_response_value(session: &Session) -> Value {
    serde_json::to_value(session_to_response(session)).unwrap_or(Value::Null)
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct MessageResponse {
    pub id: String,
    pub session_id: String,
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub is_summary_message: bool,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    pub parts: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct MessagesResponse {
    pub messages: Vec<MessageResponse>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct MessageDetailResponse {
    pub message: MessageResponse,
}

pub fn message_to_response(message: &Message) -> MessageResponse {
    MessageResponse {
        id: message.id.clone(),
        session_id: message.session_id.clone(),
        role: message.role.as_str().to_string(),
        content: message.content(),
        model: message.model.clone(),
        provider: message.provider.clone(),
        is_summary_message: message.is_summary,
        created_at: message.created_at,
        updated_at: message.updated_at,
        finished_at: message.finished_at(),
        finish_reason: message.finish_reason().map(ToOwned::to_owned),
        parts: message
            .parts
            .iter()
            .enumerate()
            .map(|(index, part)| part_json(&message.id, index, part))
            .collect(),
    }
}

pub fn message_to_response_value(message: &Message) -> Value {
    serde_json::to_value(message_to_response(message)).unwrap_or(Value::Null)
}

// ---------------------------------------------------------------------------
// Prompt (Opencode-compatible surface)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ModelSpec {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PartInput {
    Text {
        text: String,
    },
    File {
        name: String,
        /// base64 encoded
        data: String,
    },
    Agent {
        prompt: String,
        #[serde(default)]
        agent: Option<String>,
    },
    Subtask {
        prompt: String,
        agent: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct PromptRequest {
    #[serde(rename = "messageID", default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub model: Option<ModelSpec>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(rename = "noReply", default)]
    pub no_reply: bool,
    pub parts: Vec<PartInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct MessageTime {
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct AssistantMessageInfo {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub role: String,
    pub time: MessageTime,
    #[serde(rename = "modelID", default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct PromptResponse {
    pub info: AssistantMessageInfo,
    pub parts: Vec<Value>,
}

/// The prompt string handed to the agent runner: the text parts concatenated
/// in input order. File, agent, and subtask parts do not contribute.
pub fn extract_prompt_text(parts: &[PartInput]) -> String {
    let mut text = String::new();
    for part in parts {
        if let PartInput::Text { text: t } = part {
            text.push_str(t);
        }
    }
    text
}

/// Converts request parts into internal content parts. File parts with
/// invalid base64 payloads are skipped; agent and subtask parts become
/// prefixed text.
pub fn parts_to_content_parts(parts: &[PartInput]) -> Vec<ContentPart> {
    let mut out = Vec::with_capacity(parts.len());
    for part in parts {
        match part {
            PartInput::Text { text } => out.push(ContentPart::Text { text: text.clone() }),
            PartInput::File { name, data } => {
                if base64::engine::general_purpose::STANDARD
                    .decode(data)
                    .is_err()
                {
                    continue;
                }
                out.push(ContentPart::Binary {
                    path: name.clone(),
                    mime_type: detect_mime_type(name).to_string(),
                    data: data.clone(),
                });
            }
            PartInput::Agent { prompt, agent } => {
                let text = match agent {
                    Some(agent) if !agent.is_empty() => format!("[Agent: {agent}] {prompt}"),
                    _ => prompt.clone(),
                };
                out.push(ContentPart::Text { text });
            }
            PartInput::Subtask { prompt, agent } => {
                let text = if agent.is_empty() {
                    prompt.clone()
                } else {
                    format!("[Subtask: {agent}] {prompt}")
                };
                out.push(ContentPart::Text { text });
            }
        }
    }
    out
}

pub fn detect_mime_type(name: &str) -> &'static str {
    let lower = name.to_ascii_lowercase();
    match lower.rsplit('.').next() {
        Some("txt") => "text/plain",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("html") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("ts") => "application/typescript",
        Some("md") => "text/markdown",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("mp3") => "audio/mpeg",
        Some("mp4") => "video/mp4",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Response shape of the prompt endpoint. The finish part surfaces in
/// `info.finish` and `info.time.completed` rather than as a part.
pub fn message_to_prompt_response(message: &Message) -> PromptResponse {
    let info = AssistantMessageInfo {
        id: message.id.clone(),
        session_id: message.session_id.clone(),
        role: message.role.as_str().to_string(),
        time: MessageTime {
            created: message.created_at,
            completed: message.finished_at(),
        },
        model_id: message.model.clone(),
        provider_id: message.provider.clone(),
        finish: message.finish_reason().map(ToOwned::to_owned),
    };

    let mut parts = Vec::with_capacity(message.parts.len());
    for part in &message.parts {
        match part {
            ContentPart::Text { text } => parts.push(json!({ "type": "text", "text": text })),
            ContentPart::Reasoning {
                thinking,
                started_at,
                finished_at,
                ..
            } => {
                let mut data = json!({ "type": "reasoning", "text": thinking });
                if started_at.is_some() || finished_at.is_some() {
                    data["time"] = json!({
                        "created": started_at.unwrap_or(0),
                        "completed": finished_at,
                    });
                }
                parts.push(data);
            }
            ContentPart::Binary {
                path,
                mime_type,
                data,
            } => parts.push(json!({
                "type": "file",
                "name": path,
                "data": data,
                "mimeType": mime_type,
            })),
            ContentPart::ToolCall { name, input, .. } => {
                parts.push(json!({ "type": "tool", "name": name, "input": input }));
            }
            ContentPart::ToolResult {
                name,
                content,
                is_error,
                ..
            } => {
                let mut data = json!({ "type": "tool_result", "name": name });
                if *is_error {
                    data["error"] = json!(content);
                } else {
                    data["output"] = json!(content);
                }
                parts.push(data);
            }
            ContentPart::Finish { .. } => {}
            ContentPart::ImageUrl { url, detail } => {
                let mut data = json!({ "type": "image_url", "url": url });
                if let Some(detail) = detail {
                    data["detail"] = json!(detail);
                }
                parts.push(data);
            }
        }
    }

    PromptResponse { info, parts }
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct PermissionsResponse {
    pub skip_requests: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<PermissionRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct PermissionReplyRequest {
    pub granted: bool,
    #[serde(default)]
    pub persistent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct PermissionReplyResponse {
    pub status: String,
    pub request_id: String,
    pub granted: bool,
}

// ---------------------------------------------------------------------------
// Config / status / misc
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProviderInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub provider_type: String,
    pub configured: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ConfigResponse {
    pub working_dir: String,
    pub data_dir: String,
    pub debug: bool,
    pub configured: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub providers: Vec<ProviderInfo>,
}

pub fn config_to_response(config: &Config) -> ConfigResponse {
    ConfigResponse {
        working_dir: config.working_dir().to_string_lossy().to_string(),
        data_dir: config.data_dir().to_string_lossy().to_string(),
        debug: config.options.debug,
        configured: config.is_configured(),
        providers: config
            .providers
            .iter()
            .map(|(name, p)| ProviderInfo {
                name: name.clone(),
                provider_type: p
                    .provider_type
                    .clone()
                    .unwrap_or_else(|| name.clone()),
                configured: name == "mock" || p.api_key.is_some() || p.base_url.is_some(),
            })
            .collect(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct LspStatus {
    pub id: String,
    pub name: String,
    pub root: String,
    pub status: String,
    pub diagnostic_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct PathResponse {
    pub home: String,
    pub state: String,
    pub config: String,
    pub worktree: String,
    pub directory: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct SystemPromptResponse {
    pub system_prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct UpdateSystemPromptRequest {
    pub system_prompt: String,
}
