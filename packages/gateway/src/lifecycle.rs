//! Session lifecycle: reset policies, expiry evaluation and in-band reset
//! commands with provider/model retargeting.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, Time, UtcOffset};

use crate::inbound::{ChatType, InboundMessage};

pub const DEFAULT_DAILY_RESET_HOUR: u8 = 4;
pub const DEFAULT_RESET_TRIGGERS: &[&str] = &["/new", "/reset"];
pub const DEFAULT_GREETING_PROMPT: &str =
    "A fresh session just started. Greet the user briefly and ask what to work on.";

/// One `session.reset`-shaped block from the settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_hour: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_minutes: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset: Option<ResetConfig>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub reset_by_type: HashMap<String, ResetConfig>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub reset_by_channel: HashMap<String, ResetConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_triggers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub greeting_prompt: Option<String>,
    /// Legacy knob: an idle window with no daily reset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_minutes: Option<u64>,
}

impl SessionConfig {
    pub fn reset_triggers(&self) -> Vec<String> {
        self.reset_triggers.clone().unwrap_or_else(|| {
            DEFAULT_RESET_TRIGGERS
                .iter()
                .map(|trigger| trigger.to_string())
                .collect()
        })
    }

    pub fn greeting_prompt(&self) -> String {
        self.greeting_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_GREETING_PROMPT.to_string())
    }
}

/// Resolved policy. Both fields absent means resets are off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionResetPolicy {
    pub daily_at_hour: Option<u8>,
    pub idle_minutes: Option<u64>,
}

impl SessionResetPolicy {
    pub fn is_off(&self) -> bool {
        self.daily_at_hour.is_none() && self.idle_minutes.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    Thread,
    Direct,
    Group,
}

impl SessionType {
    pub fn of(message: &InboundMessage) -> Self {
        if message.channel_thread_id.is_some() {
            Self::Thread
        } else if message.chat_type() == ChatType::Direct {
            Self::Direct
        } else {
            Self::Group
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thread => "thread",
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }
}

fn policy_from_reset(reset: &ResetConfig) -> SessionResetPolicy {
    match reset.mode.as_deref() {
        Some("off") => SessionResetPolicy::default(),
        Some("idle") => SessionResetPolicy {
            daily_at_hour: None,
            idle_minutes: reset.idle_minutes,
        },
        Some("daily") => SessionResetPolicy {
            daily_at_hour: Some(reset.at_hour.unwrap_or(DEFAULT_DAILY_RESET_HOUR)),
            idle_minutes: None,
        },
        _ => SessionResetPolicy {
            daily_at_hour: reset
                .at_hour
                .or((reset.idle_minutes.is_none()).then_some(DEFAULT_DAILY_RESET_HOUR)),
            idle_minutes: reset.idle_minutes,
        },
    }
}

/// Per-request policy resolution: channel override, then session-type
/// override, then the base config.
pub fn resolve_policy(
    config: &SessionConfig,
    channel: &str,
    session_type: SessionType,
) -> SessionResetPolicy {
    if let Some(reset) = config.reset_by_channel.get(channel) {
        return policy_from_reset(reset);
    }
    if let Some(reset) = config.reset_by_type.get(session_type.as_str()) {
        return policy_from_reset(reset);
    }
    if let Some(reset) = &config.reset {
        return policy_from_reset(reset);
    }
    if let Some(idle_minutes) = config.idle_minutes {
        return SessionResetPolicy {
            daily_at_hour: None,
            idle_minutes: Some(idle_minutes),
        };
    }
    SessionResetPolicy {
        daily_at_hour: Some(DEFAULT_DAILY_RESET_HOUR),
        idle_minutes: None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    Daily,
    Idle,
}

impl ExpiryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Idle => "idle",
        }
    }
}

/// Monotone in `updated_at_ms`: a newer timestamp never expires when an
/// older one would not.
pub fn evaluate_expiry(
    updated_at_ms: i64,
    now_ms: i64,
    offset: UtcOffset,
    policy: SessionResetPolicy,
) -> Option<ExpiryReason> {
    if let Some(hour) = policy.daily_at_hour {
        if let Some(boundary_ms) = daily_boundary_ms(now_ms, offset, hour) {
            if updated_at_ms < boundary_ms {
                return Some(ExpiryReason::Daily);
            }
        }
    }
    if let Some(idle_minutes) = policy.idle_minutes {
        if updated_at_ms < now_ms - (idle_minutes as i64) * 60_000 {
            return Some(ExpiryReason::Idle);
        }
    }
    None
}

/// Most recent instant at `hour:00:00.000` local time, at or before `now`.
fn daily_boundary_ms(now_ms: i64, offset: UtcOffset, hour: u8) -> Option<i64> {
    let now = OffsetDateTime::from_unix_timestamp_nanos((now_ms as i128) * 1_000_000)
        .ok()?
        .to_offset(offset);
    let time = Time::from_hms(hour.min(23), 0, 0).ok()?;
    let mut boundary = now.replace_time(time);
    if now < boundary {
        boundary -= Duration::days(1);
    }
    Some((boundary.unix_timestamp_nanos() / 1_000_000) as i64)
}

/// A recognized in-band reset command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetCommand {
    pub trigger: String,
    pub provider_override: Option<String>,
    pub model_override: Option<String>,
    pub next_text: String,
}

/// Parses a trimmed inbound text against the configured triggers. `/new`
/// additionally accepts a `provider`, `model` or `provider/model` target.
pub fn parse_reset_command(
    text: &str,
    triggers: &[String],
    provider_hints: &[String],
    greeting_prompt: &str,
) -> Option<ResetCommand> {
    let text = text.trim();
    let mut tokens = text.splitn(2, char::is_whitespace);
    let first = tokens.next()?;
    let trigger = triggers.iter().find(|trigger| trigger.as_str() == first)?;
    let rest = tokens.next().unwrap_or("").trim();

    let mut provider_override = None;
    let mut model_override = None;
    let mut remainder = rest;

    if trigger == "/new" && !rest.is_empty() {
        let mut target_tokens = rest.splitn(2, char::is_whitespace);
        let target = target_tokens.next().unwrap_or("");
        let trailing = target_tokens.next().unwrap_or("").trim();

        if let Some((left, right)) = target.split_once('/') {
            match match_provider(left, provider_hints) {
                Some(provider) => {
                    provider_override = Some(provider);
                    if !right.is_empty() {
                        model_override = Some(right.to_string());
                    }
                }
                None => model_override = Some(target.to_string()),
            }
            remainder = trailing;
        } else if let Some(provider) = match_provider(target, provider_hints) {
            provider_override = Some(provider);
            remainder = trailing;
        } else if trailing.is_empty() {
            model_override = Some(target.to_string());
            remainder = "";
        } else if looks_model_like(target) {
            model_override = Some(target.to_string());
            remainder = trailing;
        }
    }

    let next_text = if remainder.is_empty() {
        greeting_prompt.to_string()
    } else {
        remainder.to_string()
    };

    Some(ResetCommand {
        trigger: trigger.clone(),
        provider_override,
        model_override,
        next_text,
    })
}

/// Case-insensitive equality, or a unique prefix of exactly one hint.
fn match_provider(token: &str, hints: &[String]) -> Option<String> {
    let token = token.to_lowercase();
    if token.is_empty() {
        return None;
    }
    if let Some(hit) = hints.iter().find(|hint| hint.to_lowercase() == token) {
        return Some(hit.clone());
    }
    let mut matches = hints
        .iter()
        .filter(|hint| hint.to_lowercase().starts_with(&token));
    match (matches.next(), matches.next()) {
        (Some(hit), None) => Some(hit.clone()),
        _ => None,
    }
}

fn looks_model_like(token: &str) -> bool {
    token
        .chars()
        .any(|ch| ch.is_ascii_digit() || matches!(ch, '-' | '_' | ':' | '.' | '/'))
}
