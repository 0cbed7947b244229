//! Error taxonomy shared across the Flint gateway.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    TokenInvalid,
    VerificationFailed,
    ThreadNotFound,
    AdapterNotFound,
    NoActiveRuntime,
    IdempotencyConflict,
    ProfileInvalid,
    AgentSpawnFailed,
    AgentProcessExited,
    AgentFailure,
    Timeout,
    ClientClosed,
    Store,
    Settings,
}

impl ErrorType {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::ProfileInvalid => 400,
            Self::TokenInvalid => 401,
            Self::VerificationFailed => 401,
            Self::ThreadNotFound => 404,
            Self::AdapterNotFound => 404,
            Self::NoActiveRuntime => 409,
            Self::IdempotencyConflict => 409,
            Self::AgentSpawnFailed => 500,
            Self::AgentProcessExited => 500,
            Self::AgentFailure => 500,
            Self::Timeout => 500,
            Self::ClientClosed => 500,
            Self::Store => 500,
            Self::Settings => 500,
        }
    }
}

/// JSON body returned by the HTTP surface for every error status.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{message}")]
    InvalidRequest { message: String },
    #[error("Invalid or missing bearer token.")]
    TokenInvalid,
    #[error("Webhook signature verification failed.")]
    VerificationFailed { name: String },
    #[error("Thread not found.")]
    ThreadNotFound { thread_id: String },
    #[error("No webhook adapter registered under this name.")]
    AdapterNotFound { name: String },
    #[error("No active runtime for this thread.")]
    NoActiveRuntime { thread_id: String },
    #[error("Idempotency key conflict.")]
    IdempotencyConflict,
    #[error("invalid MCP profile composition: {message}")]
    ProfileInvalid { message: String },
    #[error("failed to spawn agent process `{command}`: {message}")]
    AgentSpawnFailed { command: String, message: String },
    #[error("agent process exited{}", format_exit_code(.exit_code))]
    AgentProcessExited {
        exit_code: Option<i32>,
        stderr_tail: Option<String>,
    },
    #[error("agent error: {message}")]
    AgentFailure {
        message: String,
        details: Option<Value>,
    },
    #[error("timed out waiting for agent response to {method}")]
    Timeout { method: String },
    #[error("client closed")]
    ClientClosed,
    #[error("thread store error: {message}")]
    Store { message: String },
    #[error("settings error: {message}")]
    Settings { message: String },
}

fn format_exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with code {code}"),
        None => String::new(),
    }
}

impl GatewayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::TokenInvalid => ErrorType::TokenInvalid,
            Self::VerificationFailed { .. } => ErrorType::VerificationFailed,
            Self::ThreadNotFound { .. } => ErrorType::ThreadNotFound,
            Self::AdapterNotFound { .. } => ErrorType::AdapterNotFound,
            Self::NoActiveRuntime { .. } => ErrorType::NoActiveRuntime,
            Self::IdempotencyConflict => ErrorType::IdempotencyConflict,
            Self::ProfileInvalid { .. } => ErrorType::ProfileInvalid,
            Self::AgentSpawnFailed { .. } => ErrorType::AgentSpawnFailed,
            Self::AgentProcessExited { .. } => ErrorType::AgentProcessExited,
            Self::AgentFailure { .. } => ErrorType::AgentFailure,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::ClientClosed => ErrorType::ClientClosed,
            Self::Store { .. } => ErrorType::Store,
            Self::Settings { .. } => ErrorType::Settings,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.error_type().status_code()
    }

    pub fn to_body(&self) -> ErrorBody {
        let details = match self {
            Self::AgentProcessExited { stderr_tail, .. } => stderr_tail
                .as_ref()
                .map(|tail| Value::String(tail.clone())),
            Self::AgentFailure { details, .. } => details.clone(),
            _ => None,
        };
        ErrorBody {
            error: self.to_string(),
            details,
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Store {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_taxonomy() {
        assert_eq!(
            GatewayError::InvalidRequest {
                message: "bad".into()
            }
            .status_code(),
            400
        );
        assert_eq!(
            GatewayError::ThreadNotFound {
                thread_id: "t".into()
            }
            .status_code(),
            404
        );
        assert_eq!(GatewayError::IdempotencyConflict.status_code(), 409);
        assert_eq!(
            GatewayError::AgentFailure {
                message: "boom".into(),
                details: None
            }
            .status_code(),
            500
        );
    }

    #[test]
    fn exit_error_carries_stderr_in_details() {
        let err = GatewayError::AgentProcessExited {
            exit_code: Some(2),
            stderr_tail: Some("panic: oh no".into()),
        };
        let body = err.to_body();
        assert_eq!(body.error, "agent process exited with code 2");
        assert_eq!(body.details, Some(Value::String("panic: oh no".into())));
    }
}
