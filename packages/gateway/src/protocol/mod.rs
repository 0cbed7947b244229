//! The Agent Protocol: a line-delimited JSON-RPC dialect with typed items
//! and reverse approval requests, spoken with each agent child over stdio.

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

pub mod framing;
pub mod mock;
pub mod peer;
pub mod translate;

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "initialized";
pub const METHOD_THREAD_START: &str = "thread/start";
pub const METHOD_THREAD_RESUME: &str = "thread/resume";
pub const METHOD_TURN_START: &str = "turn/start";
pub const METHOD_TURN_INTERRUPT: &str = "turn/interrupt";

pub const METHOD_COMMAND_APPROVAL: &str = "item/commandExecution/requestApproval";
pub const METHOD_FILE_APPROVAL: &str = "item/fileChange/requestApproval";

/// Synthetic notification emitted when a child's stdout line is not JSON.
pub const METHOD_INVALID_STDOUT: &str = "_flint/invalidStdout";
/// Synthetic notification emitted when the child exits.
pub const METHOD_AGENT_EXITED: &str = "_flint/agentExited";

/// Per-method call deadline. Handshake and state queries are quick; turn
/// starts only cover the acknowledgement, not the streamed turn itself.
pub fn request_timeout(method: &str) -> Duration {
    match method {
        METHOD_INITIALIZE => Duration::from_secs(10),
        METHOD_THREAD_START | METHOD_THREAD_RESUME => Duration::from_secs(20),
        METHOD_TURN_START => Duration::from_secs(15),
        METHOD_TURN_INTERRUPT => Duration::from_secs(10),
        _ => Duration::from_secs(30),
    }
}

/// How the gateway answers reverse approval requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    #[default]
    Accept,
    Decline,
}

impl ApprovalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Decline => "decline",
        }
    }
}

/// A notification received from (or synthesized on behalf of) the agent.
#[derive(Debug, Clone)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

/// The uniform event stream every agent dialect is translated into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Text {
        delta: String,
    },
    Reasoning {
        delta: String,
    },
    ToolStart {
        id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    ToolEnd {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        is_error: bool,
    },
    Activity,
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Value>,
    },
    Error {
        message: String,
    },
}

impl AgentEvent {
    /// SSE event name for this variant.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Reasoning { .. } => "reasoning",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolEnd { .. } => "tool_end",
            Self::Activity => "activity",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}
