//! Settings file plus environment overlay.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use flint_error::GatewayError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identity::IdentityLinks;
use crate::idempotency::DEFAULT_TTL_MS;
use crate::inbound::RoutingMode;
use crate::lifecycle::SessionConfig;
use crate::mcp::{resolve_server_env_refs, substitute_value, McpProfile};
use crate::protocol::peer::SpawnSpec;
use crate::protocol::ApprovalDecision;
use crate::provider::ProviderId;

pub const DEFAULT_PORT: u16 = 8788;

const CODEX_APPROVAL_POLICIES: &[&str] = &["untrusted", "on-failure", "on-request", "never"];
const CODEX_SANDBOX_MODES: &[&str] = &["read-only", "workspace-write", "danger-full-access"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodexConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_mode: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCommand {
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_memory_command")]
    pub command: Vec<String>,
}

fn default_memory_command() -> Vec<String> {
    vec!["flint-memory".to_string(), "serve".to_string()]
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: default_memory_command(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub default_mcp_profile_ids: Vec<String>,
    #[serde(default)]
    pub mcp_profiles: HashMap<String, McpProfile>,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub codex: CodexConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderCommand>,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_decision: Option<ApprovalDecision>,
}

fn settings_error(message: impl Into<String>) -> GatewayError {
    GatewayError::Settings {
        message: message.into(),
    }
}

/// Loads the settings file, applying `${NAME}` substitution. A missing
/// variable aborts the load except inside MCP server configs, where only
/// the offending server is dropped.
pub fn load_settings<F>(path: &Path, lookup: &F) -> Result<Settings, GatewayError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Settings::default()),
        Err(err) => {
            return Err(settings_error(format!(
                "failed to read {}: {err}",
                path.display()
            )))
        }
    };

    let value: Value = serde_json::from_str(&raw)
        .map_err(|err| settings_error(format!("invalid JSON in {}: {err}", path.display())))?;
    let substituted = substitute_settings(value, lookup)?;
    serde_json::from_value(substituted)
        .map_err(|err| settings_error(format!("invalid settings in {}: {err}", path.display())))
}

fn substitute_settings<F>(value: Value, lookup: &F) -> Result<Value, GatewayError>
where
    F: Fn(&str) -> Option<String>,
{
    let Value::Object(mut root) = value else {
        return Err(settings_error("settings file must hold a JSON object"));
    };

    let profiles = root.remove("mcpProfiles");
    let mut substituted = match substitute_value(&Value::Object(root), lookup) {
        Ok(Value::Object(object)) => object,
        Ok(_) => Map::new(),
        Err(variable) => {
            return Err(settings_error(format!(
                "env var {variable} referenced by settings is missing or empty"
            )))
        }
    };

    if let Some(Value::Object(profiles)) = profiles {
        let mut resolved_profiles = Map::new();
        for (id, profile) in profiles {
            let Value::Object(mut profile) = profile else {
                return Err(settings_error(format!("mcpProfiles.{id} must be an object")));
            };
            let servers = profile.remove("servers");
            let mut resolved = match substitute_value(&Value::Object(profile), lookup) {
                Ok(Value::Object(object)) => object,
                Ok(_) => Map::new(),
                Err(variable) => {
                    return Err(settings_error(format!(
                        "env var {variable} referenced by mcpProfiles.{id} is missing or empty"
                    )))
                }
            };
            if let Some(Value::Object(servers)) = servers {
                resolved.insert(
                    "servers".to_string(),
                    Value::Object(resolve_server_env_refs(&servers, lookup)),
                );
            }
            resolved_profiles.insert(id, Value::Object(resolved));
        }
        substituted.insert("mcpProfiles".to_string(), Value::Object(resolved_profiles));
    }

    Ok(Value::Object(substituted))
}

/// Everything the gateway needs at runtime, resolved from the settings file
/// and the `FLINT_GATEWAY_*` environment. Injected, never global.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub port: u16,
    pub default_provider: ProviderId,
    pub default_model: Option<String>,
    pub default_routing_mode: RoutingMode,
    pub store_path: PathBuf,
    pub idempotency_ttl_ms: i64,
    pub identity_links: IdentityLinks,
    pub memory_enabled: bool,
    pub approval_decision: ApprovalDecision,
    /// Invalid Codex config is deferred: requests are accepted and only
    /// Codex-provider turns fail until it is corrected.
    pub codex_config_error: Option<String>,
    pub settings: Settings,
}

impl GatewayOptions {
    pub fn from_env() -> Result<Self, GatewayError> {
        Self::resolve(&|name: &str| std::env::var(name).ok())
    }

    pub fn resolve<F>(lookup: &F) -> Result<Self, GatewayError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let settings_path = lookup("FLINT_GATEWAY_USER_SETTINGS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(default_settings_path);
        let mut settings = load_settings(&settings_path, lookup)?;

        // Legacy knob: a bare idle timeout without any reset config.
        if settings.session.idle_minutes.is_none() {
            if let Some(seconds) = lookup("FLINT_GATEWAY_IDLE_TIMEOUT_SECONDS") {
                let seconds: u64 = seconds.trim().parse().map_err(|_| {
                    settings_error("FLINT_GATEWAY_IDLE_TIMEOUT_SECONDS must be an integer")
                })?;
                settings.session.idle_minutes = Some(seconds.div_ceil(60).max(1));
            }
        }

        let port = match lookup("PORT") {
            Some(port) => port
                .trim()
                .parse()
                .map_err(|_| settings_error("PORT must be an integer"))?,
            None => DEFAULT_PORT,
        };

        let default_provider = match lookup("FLINT_GATEWAY_PROVIDER") {
            Some(provider) => ProviderId::parse(&provider)
                .ok_or_else(|| settings_error(format!("unknown provider: {provider}")))?,
            None => ProviderId::Claude,
        };

        let default_routing_mode = match lookup("FLINT_GATEWAY_ROUTING_MODE") {
            Some(mode) => RoutingMode::parse(mode.trim())
                .ok_or_else(|| settings_error(format!("unknown routing mode: {mode}")))?,
            None => RoutingMode::PerPeer,
        };

        let store_path = lookup("FLINT_GATEWAY_STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(default_store_path);

        let idempotency_ttl_ms = match lookup("FLINT_GATEWAY_IDEMPOTENCY_TTL_MS") {
            Some(ttl) => ttl
                .trim()
                .parse()
                .map_err(|_| settings_error("FLINT_GATEWAY_IDEMPOTENCY_TTL_MS must be an integer"))?,
            None => DEFAULT_TTL_MS,
        };

        let identity_links = match lookup("FLINT_GATEWAY_IDENTITY_LINKS") {
            Some(raw) => {
                let value: Value = serde_json::from_str(&raw).map_err(|err| {
                    settings_error(format!("FLINT_GATEWAY_IDENTITY_LINKS is not valid JSON: {err}"))
                })?;
                IdentityLinks::from_value(&value)?
            }
            None => IdentityLinks::default(),
        };

        let memory_enabled = lookup("FLINT_GATEWAY_MEMORY_ENABLED")
            .map(|value| matches!(value.trim(), "1" | "true" | "TRUE"))
            .unwrap_or(settings.memory.enabled);

        let approval_decision = settings.approval_decision.unwrap_or_default();
        let codex_config_error = validate_codex_config(&settings.codex);
        if let Some(error) = &codex_config_error {
            tracing::warn!(error = %error, "codex config is invalid; codex turns will fail");
        }

        Ok(Self {
            port,
            default_provider,
            default_model: lookup("FLINT_GATEWAY_MODEL").filter(|model| !model.trim().is_empty()),
            default_routing_mode,
            store_path,
            idempotency_ttl_ms,
            identity_links,
            memory_enabled,
            approval_decision,
            codex_config_error,
            settings,
        })
    }

    /// Command line used to spawn a provider's agent child; settings may
    /// override the built-in default.
    pub fn spawn_spec(&self, provider: ProviderId) -> SpawnSpec {
        match self.settings.providers.get(provider.as_str()) {
            Some(command) if !command.command.is_empty() => SpawnSpec {
                command: command.command.clone(),
                env: command.env.clone(),
            },
            _ => SpawnSpec {
                command: provider.default_command(),
                env: HashMap::new(),
            },
        }
    }

    /// Config object for the built-in memory server, merged on top of
    /// profile compositions when memory is enabled.
    pub fn memory_server_config(&self) -> Value {
        let command = &self.settings.memory.command;
        serde_json::json!({
            "kind": "stdio",
            "command": command.first().cloned().unwrap_or_default(),
            "args": command.iter().skip(1).cloned().collect::<Vec<_>>(),
        })
    }
}

fn validate_codex_config(codex: &CodexConfig) -> Option<String> {
    if let Some(policy) = &codex.approval_policy {
        if !CODEX_APPROVAL_POLICIES.contains(&policy.as_str()) {
            return Some(format!("codex.approvalPolicy has unknown value: {policy}"));
        }
    }
    if let Some(mode) = &codex.sandbox_mode {
        if !CODEX_SANDBOX_MODES.contains(&mode.as_str()) {
            return Some(format!("codex.sandboxMode has unknown value: {mode}"));
        }
    }
    None
}

fn flint_home() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".flint"))
        .unwrap_or_else(|| PathBuf::from(".flint"))
}

fn default_settings_path() -> PathBuf {
    flint_home().join("settings.json")
}

fn default_store_path() -> PathBuf {
    flint_home().join("gateway").join("threads.json")
}
