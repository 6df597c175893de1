use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
pub enum ErrorCode {
    #[serde(rename = "MISSING_DIRECTORY_PARAM")]
    MissingDirectoryParam,
    #[serde(rename = "PROJECT_NOT_FOUND")]
    ProjectNotFound,
    #[serde(rename = "NO_PROJECTS")]
    NoProjects,
    #[serde(rename = "SESSION_NOT_FOUND")]
    SessionNotFound,
    #[serde(rename = "MESSAGE_NOT_FOUND")]
    MessageNotFound,
    #[serde(rename = "APP_NOT_OPENED")]
    AppNotOpened,
    #[serde(rename = "INVALID_REQUEST")]
    InvalidRequest,
    #[serde(rename = "REQUEST_CANCELLED")]
    RequestCancelled,
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "RATE_LIMIT_EXCEEDED")]
    RateLimitExceeded,
    #[serde(rename = "INTERNAL_ERROR")]
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingDirectoryParam => "MISSING_DIRECTORY_PARAM",
            Self::ProjectNotFound => "PROJECT_NOT_FOUND",
            Self::NoProjects => "NO_PROJECTS",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::MessageNotFound => "MESSAGE_NOT_FOUND",
            Self::AppNotOpened => "APP_NOT_OPENED",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::RequestCancelled => "REQUEST_CANCELLED",
            Self::Timeout => "TIMEOUT",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::MissingDirectoryParam => 400,
            Self::ProjectNotFound => 404,
            Self::NoProjects => 404,
            Self::SessionNotFound => 404,
            Self::MessageNotFound => 404,
            Self::AppNotOpened => 409,
            Self::InvalidRequest => 400,
            Self::RequestCancelled => 408,
            Self::Timeout => 408,
            Self::RateLimitExceeded => 429,
            Self::Internal => 500,
        }
    }
}

#[derive(Debug, Error)]
pub enum AtelierError {
    #[error("directory query parameter is required")]
    MissingDirectoryParam,
    #[error("project not found: {path}")]
    ProjectNotFound { path: String },
    #[error("no projects available")]
    NoProjects,
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("message not found: {message_id}")]
    MessageNotFound { message_id: String },
    #[error("project instance not open: {path}")]
    AppNotOpened { path: String },
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("request cancelled")]
    RequestCancelled,
    #[error("request timeout")]
    Timeout,
    #[error("too many requests")]
    RateLimitExceeded,
    #[error("agent coordinator not initialized")]
    AgentNotConfigured,
    #[error("failed to load config: {message}")]
    Config { message: String },
    #[error("project store unreadable: {message}")]
    Storage { message: String },
    #[error("database error: {message}")]
    Database { message: String },
    #[error("io error: {message}")]
    Io { message: String },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl AtelierError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::MissingDirectoryParam => ErrorCode::MissingDirectoryParam,
            Self::ProjectNotFound { .. } => ErrorCode::ProjectNotFound,
            Self::NoProjects => ErrorCode::NoProjects,
            Self::SessionNotFound { .. } => ErrorCode::SessionNotFound,
            Self::MessageNotFound { .. } => ErrorCode::MessageNotFound,
            Self::AppNotOpened { .. } => ErrorCode::AppNotOpened,
            Self::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            Self::RequestCancelled => ErrorCode::RequestCancelled,
            Self::Timeout => ErrorCode::Timeout,
            Self::RateLimitExceeded => ErrorCode::RateLimitExceeded,
            Self::AgentNotConfigured
            | Self::Config { .. }
            | Self::Storage { .. }
            | Self::Database { .. }
            | Self::Io { .. }
            | Self::Internal { .. } => ErrorCode::Internal,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.error_code().status_code()
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            error: ErrorDetail {
                code: self.error_code().as_str().to_string(),
                message: self.to_string(),
            },
        }
    }
}

impl From<std::io::Error> for AtelierError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for AtelierError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal {
            message: format!("serialization failed: {err}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

impl From<&AtelierError> for ErrorBody {
    fn from(value: &AtelierError) -> Self {
        value.to_body()
    }
}

impl From<AtelierError> for ErrorBody {
    fn from(value: AtelierError) -> Self {
        value.to_body()
    }
}
