//! Providers the gateway can drive, plus the per-provider mapping from
//! thread options onto Agent Protocol wire params.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use utoipa::ToSchema;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    #[default]
    Claude,
    Codex,
    Mock,
}

impl ProviderId {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "claude" => Some(Self::Claude),
            "codex" => Some(Self::Codex),
            "mock" => Some(Self::Mock),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Mock => "mock",
        }
    }

    /// Hint list fed to reset-command provider matching.
    pub fn hints() -> Vec<String> {
        [Self::Claude, Self::Codex, Self::Mock]
            .iter()
            .map(|provider| provider.as_str().to_string())
            .collect()
    }

    pub fn default_command(&self) -> Vec<String> {
        match self {
            Self::Claude => vec!["claude-agent".to_string(), "--stdio".to_string()],
            Self::Codex => vec!["codex".to_string(), "agent".to_string()],
            Self::Mock => Vec::new(),
        }
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options resolved for a thread before it is started or resumed.
#[derive(Debug, Clone, Default)]
pub struct ThreadOptions {
    pub model: Option<String>,
    pub cwd: Option<String>,
    pub system_prompt: Option<String>,
    pub system_prompt_append: Option<String>,
    pub mcp_servers: Map<String, Value>,
    pub approval_policy: Option<String>,
    pub sandbox_mode: Option<String>,
}

/// `thread/start` params for a provider. Codex gets its own field names and
/// a dotted-key `config` for MCP servers; other providers receive the
/// options as-is and never see `approvalPolicy`/`sandbox`.
pub fn thread_start_params(provider: ProviderId, options: &ThreadOptions) -> Value {
    let mut params = Map::new();
    if let Some(model) = &options.model {
        params.insert("model".to_string(), json!(model));
    }
    if let Some(cwd) = &options.cwd {
        params.insert("cwd".to_string(), json!(cwd));
    }
    apply_provider_fields(provider, options, &mut params);
    Value::Object(params)
}

/// `thread/resume` params: same shape as start plus the agent's thread id.
pub fn thread_resume_params(
    provider: ProviderId,
    provider_thread_id: &str,
    options: &ThreadOptions,
) -> Value {
    let mut params = match thread_start_params(provider, options) {
        Value::Object(params) => params,
        _ => Map::new(),
    };
    params.insert("threadId".to_string(), json!(provider_thread_id));
    Value::Object(params)
}

pub fn turn_start_params(
    provider_thread_id: &str,
    text: &str,
    model: Option<&str>,
    config: Option<&Map<String, Value>>,
) -> Value {
    let mut params = Map::new();
    params.insert("threadId".to_string(), json!(provider_thread_id));
    params.insert(
        "input".to_string(),
        json!([{"type": "text", "text": text}]),
    );
    if let Some(model) = model {
        params.insert("model".to_string(), json!(model));
    }
    if let Some(config) = config {
        params.insert("config".to_string(), Value::Object(config.clone()));
    }
    Value::Object(params)
}

fn apply_provider_fields(provider: ProviderId, options: &ThreadOptions, params: &mut Map<String, Value>) {
    match provider {
        ProviderId::Codex => {
            if let Some(system_prompt) = &options.system_prompt {
                params.insert("baseInstructions".to_string(), json!(system_prompt));
            }
            if let Some(append) = &options.system_prompt_append {
                params.insert("developerInstructions".to_string(), json!(append));
            }
            if !options.mcp_servers.is_empty() {
                params.insert(
                    "config".to_string(),
                    Value::Object(flatten_codex_mcp_servers(&options.mcp_servers)),
                );
            }
            if let Some(approval_policy) = &options.approval_policy {
                params.insert("approvalPolicy".to_string(), json!(approval_policy));
            }
            if let Some(sandbox_mode) = &options.sandbox_mode {
                params.insert("sandbox".to_string(), json!(sandbox_mode));
            }
        }
        ProviderId::Claude | ProviderId::Mock => {
            if let Some(system_prompt) = &options.system_prompt {
                params.insert("systemPrompt".to_string(), json!(system_prompt));
            }
            if let Some(append) = &options.system_prompt_append {
                params.insert("systemPromptAppend".to_string(), json!(append));
            }
            if !options.mcp_servers.is_empty() {
                params.insert(
                    "mcpServers".to_string(),
                    Value::Object(options.mcp_servers.clone()),
                );
            }
        }
    }
}

/// Flattens `{alias -> config}` into dotted `mcp_servers.{alias}.{key}`
/// entries the Codex config surface understands.
fn flatten_codex_mcp_servers(servers: &Map<String, Value>) -> Map<String, Value> {
    let mut flat = Map::new();
    for (alias, config) in servers {
        let Some(config) = config.as_object() else {
            continue;
        };
        for (key, value) in config {
            let mapped = match key.as_str() {
                "headers" => "http_headers",
                "envHeaders" => "env_http_headers",
                "bearerTokenEnvVar" => "bearer_token_env_var",
                other => other,
            };
            flat.insert(format!("mcp_servers.{alias}.{mapped}"), value.clone());
        }
    }
    flat
}
