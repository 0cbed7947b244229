//! Inbound message shape shared by the HTTP surface and channel adapters.

use flint_error::GatewayError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingMode {
    Main,
    PerPeer,
    PerChannelPeer,
    PerAccountChannelPeer,
}

impl RoutingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::PerPeer => "per-peer",
            Self::PerChannelPeer => "per-channel-peer",
            Self::PerAccountChannelPeer => "per-account-channel-peer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "main" => Some(Self::Main),
            "per-peer" => Some(Self::PerPeer),
            "per-channel-peer" => Some(Self::PerChannelPeer),
            "per-account-channel-peer" => Some(Self::PerAccountChannelPeer),
            _ => None,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    #[default]
    Direct,
    Group,
    Channel,
}

impl ChatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
            Self::Channel => "channel",
        }
    }

    pub fn is_room(&self) -> bool {
        matches!(self, Self::Group | Self::Channel)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub channel: String,
    pub user_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_type: Option<ChatType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_profile_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_mode: Option<RoutingMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Raw server configs are not accepted inline; callers must go through
    /// named MCP profiles.
    #[serde(default, skip_serializing)]
    #[schemars(skip)]
    pub mcp_servers: Option<Value>,
}

fn normalize_token(value: &str) -> String {
    value.trim().to_lowercase()
}

fn invalid(message: impl Into<String>) -> GatewayError {
    GatewayError::InvalidRequest {
        message: message.into(),
    }
}

impl InboundMessage {
    /// Normalizes tokens in place and rejects malformed input.
    pub fn validate_and_normalize(&mut self) -> Result<(), GatewayError> {
        if self.mcp_servers.is_some() {
            return Err(invalid(
                "mcpServers is not accepted; reference named mcpProfileIds instead",
            ));
        }

        self.channel = normalize_token(&self.channel);
        if self.channel.is_empty() {
            return Err(invalid("channel is required"));
        }

        self.user_id = self.user_id.trim().to_string();
        if self.user_id.is_empty() {
            return Err(invalid("userId is required"));
        }

        if self.text.trim().is_empty() {
            return Err(invalid("text must be non-empty"));
        }

        if let Some(provider) = &self.provider {
            let provider = normalize_token(provider);
            if provider.is_empty() {
                return Err(invalid("provider must be non-empty when present"));
            }
            self.provider = Some(provider);
        }
        if let Some(account_id) = &self.account_id {
            self.account_id = Some(normalize_token(account_id));
        }
        if let Some(peer_id) = &self.peer_id {
            let peer_id = peer_id.trim().to_string();
            self.peer_id = (!peer_id.is_empty()).then_some(peer_id);
        }
        if let Some(identity_id) = &self.identity_id {
            self.identity_id = Some(normalize_token(identity_id));
        }
        if let Some(channel_thread_id) = &self.channel_thread_id {
            let channel_thread_id = channel_thread_id.trim().to_string();
            if channel_thread_id.is_empty() {
                self.channel_thread_id = None;
            } else {
                self.channel_thread_id = Some(channel_thread_id);
            }
        }

        if let Some(ids) = &self.mcp_profile_ids {
            if ids.is_empty() {
                return Err(invalid("mcpProfileIds must be a non-empty string array"));
            }
            let mut normalized = Vec::with_capacity(ids.len());
            for id in ids {
                let id = id.trim().to_string();
                if id.is_empty() {
                    return Err(invalid("mcpProfileIds entries must be non-empty"));
                }
                if !normalized.contains(&id) {
                    normalized.push(id);
                }
            }
            self.mcp_profile_ids = Some(normalized);
        }

        Ok(())
    }

    pub fn chat_type(&self) -> ChatType {
        self.chat_type.unwrap_or_default()
    }
}
