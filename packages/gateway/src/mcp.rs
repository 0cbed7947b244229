//! Named MCP profile composition and `${NAME}` substitution.

use std::collections::{HashMap, HashSet};

use flint_error::GatewayError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A named bundle of tool-server configs, optionally built on other
/// profiles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpProfile {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub servers: Map<String, Value>,
}

fn profile_error(message: impl Into<String>) -> GatewayError {
    GatewayError::ProfileInvalid {
        message: message.into(),
    }
}

/// Depth-first expansion of a profile id list into one `{alias -> config}`
/// map. Duplicate aliases collide, cycles are rejected, already-expanded
/// profiles are skipped so diamond includes stay legal.
pub fn compose_profiles(
    profiles: &HashMap<String, McpProfile>,
    ids: &[String],
) -> Result<Map<String, Value>, GatewayError> {
    let mut composed = Map::new();
    let mut stack = Vec::new();
    let mut done = HashSet::new();
    for id in ids {
        expand(profiles, id, &mut composed, &mut stack, &mut done)?;
    }
    Ok(composed)
}

fn expand(
    profiles: &HashMap<String, McpProfile>,
    id: &str,
    composed: &mut Map<String, Value>,
    stack: &mut Vec<String>,
    done: &mut HashSet<String>,
) -> Result<(), GatewayError> {
    if done.contains(id) {
        return Ok(());
    }
    if stack.iter().any(|entry| entry == id) {
        return Err(profile_error(format!(
            "profile cycle: {} -> {id}",
            stack.join(" -> ")
        )));
    }
    let profile = profiles
        .get(id)
        .ok_or_else(|| profile_error(format!("unknown MCP profile: {id}")))?;

    stack.push(id.to_string());
    for included in &profile.include {
        expand(profiles, included, composed, stack, done)?;
    }
    stack.pop();

    for (alias, config) in &profile.servers {
        if composed.contains_key(alias) {
            return Err(profile_error(format!(
                "server alias {alias} declared by more than one profile"
            )));
        }
        composed.insert(alias.clone(), config.clone());
    }
    done.insert(id.to_string());
    Ok(())
}

/// Merges a built-in server on top of a composition without ever replacing
/// a user-declared alias; a taken alias gets a `_1`, `_2`, ... suffix.
pub fn merge_builtin_server(composed: &mut Map<String, Value>, alias: &str, config: Value) -> String {
    let mut candidate = alias.to_string();
    let mut suffix = 0;
    while composed.contains_key(&candidate) {
        suffix += 1;
        candidate = format!("{alias}_{suffix}");
    }
    composed.insert(candidate.clone(), config);
    candidate
}

/// `${NAME}` expansion with `$${NAME}` escaping to a literal `${NAME}`.
/// Names must match `[A-Z_][A-Z0-9_]*`; anything else is left untouched.
/// Returns the name of the first missing or empty variable.
pub fn substitute_str<F>(input: &str, lookup: &F) -> Result<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let bytes = input.as_bytes();
    let mut output = String::with_capacity(input.len());
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'$' {
            if let Some(name_end) = reference_end(bytes, index + 1) {
                let name = &input[index + 2..name_end];
                match lookup(name) {
                    Some(value) if !value.is_empty() => output.push_str(&value),
                    _ => return Err(name.to_string()),
                }
                index = name_end + 1;
                continue;
            }
            if index + 1 < bytes.len() && bytes[index + 1] == b'$' {
                if let Some(name_end) = reference_end(bytes, index + 2) {
                    output.push_str(&input[index + 1..=name_end]);
                    index = name_end + 1;
                    continue;
                }
            }
        }
        let ch = input[index..].chars().next().unwrap_or('\u{fffd}');
        output.push(ch);
        index += ch.len_utf8();
    }
    Ok(output)
}

/// Index of the closing `}` when `bytes[start..]` begins a `{NAME}`
/// reference with a well-formed name.
fn reference_end(bytes: &[u8], start: usize) -> Option<usize> {
    if start >= bytes.len() || bytes[start] != b'{' {
        return None;
    }
    let name_start = start + 1;
    let mut index = name_start;
    while index < bytes.len() && bytes[index] != b'}' {
        let byte = bytes[index];
        let valid_head = byte.is_ascii_uppercase() || byte == b'_';
        let valid_tail = valid_head || byte.is_ascii_digit();
        if index == name_start && !valid_head {
            return None;
        }
        if !valid_tail {
            return None;
        }
        index += 1;
    }
    if index >= bytes.len() || index == name_start {
        return None;
    }
    Some(index)
}

/// Recursively substitutes every string value inside a config object.
pub fn substitute_value<F>(value: &Value, lookup: &F) -> Result<Value, String>
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(text) => Ok(Value::String(substitute_str(text, lookup)?)),
        Value::Array(items) => items
            .iter()
            .map(|item| substitute_value(item, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(object) => {
            let mut out = Map::with_capacity(object.len());
            for (key, item) in object {
                out.insert(key.clone(), substitute_value(item, lookup)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Load-time substitution over a profile's servers: a server whose config
/// references a missing variable is dropped with a warning, the rest of the
/// profile stays valid.
pub fn resolve_server_env_refs<F>(servers: &Map<String, Value>, lookup: &F) -> Map<String, Value>
where
    F: Fn(&str) -> Option<String>,
{
    let mut resolved = Map::with_capacity(servers.len());
    for (alias, config) in servers {
        match substitute_value(config, lookup) {
            Ok(config) => {
                resolved.insert(alias.clone(), config);
            }
            Err(variable) => {
                tracing::warn!(
                    alias = %alias,
                    variable = %variable,
                    "dropping MCP server: referenced env var is missing or empty"
                );
            }
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn profile(include: &[&str], servers: Value) -> McpProfile {
        McpProfile {
            include: include.iter().map(|id| id.to_string()).collect(),
            servers: servers.as_object().cloned().unwrap_or_default(),
        }
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn composes_includes_depth_first() {
        let mut profiles = HashMap::new();
        profiles.insert("base".into(), profile(&[], json!({"fs": {"kind": "stdio"}})));
        profiles.insert(
            "dev".into(),
            profile(&["base"], json!({"github": {"kind": "http"}})),
        );

        let composed = compose_profiles(&profiles, &ids(&["dev"])).unwrap();
        let aliases: Vec<&String> = composed.keys().collect();
        assert_eq!(aliases, ["fs", "github"]);
    }

    #[test]
    fn diamond_includes_do_not_collide() {
        let mut profiles = HashMap::new();
        profiles.insert("base".into(), profile(&[], json!({"fs": {}})));
        profiles.insert("a".into(), profile(&["base"], json!({"a1": {}})));
        profiles.insert("b".into(), profile(&["base"], json!({"b1": {}})));

        let composed = compose_profiles(&profiles, &ids(&["a", "b"])).unwrap();
        assert_eq!(composed.len(), 3);
    }

    #[test]
    fn duplicate_alias_is_a_collision() {
        let mut profiles = HashMap::new();
        profiles.insert("a".into(), profile(&[], json!({"fs": {"n": 1}})));
        profiles.insert("b".into(), profile(&[], json!({"fs": {"n": 2}})));
        let err = compose_profiles(&profiles, &ids(&["a", "b"])).unwrap_err();
        assert!(err.to_string().contains("fs"));
    }

    #[test]
    fn cycles_are_rejected() {
        let mut profiles = HashMap::new();
        profiles.insert("a".into(), profile(&["b"], json!({})));
        profiles.insert("b".into(), profile(&["a"], json!({})));
        let err = compose_profiles(&profiles, &ids(&["a"])).unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn unknown_profile_is_an_error() {
        let profiles = HashMap::new();
        assert!(compose_profiles(&profiles, &ids(&["nope"])).is_err());
    }

    #[test]
    fn builtin_merge_never_replaces_user_alias() {
        let mut composed = json!({"memory": {"user": true}})
            .as_object()
            .cloned()
            .unwrap();
        let alias = merge_builtin_server(&mut composed, "memory", json!({"builtin": true}));
        assert_eq!(alias, "memory_1");
        assert_eq!(composed["memory"]["user"], true);
        assert_eq!(composed["memory_1"]["builtin"], true);
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn expands_references() {
        let lookup = env(&[("HOME_DIR", "/home/u")]);
        assert_eq!(
            substitute_str("root=${HOME_DIR}/x", &lookup).unwrap(),
            "root=/home/u/x"
        );
    }

    #[test]
    fn double_dollar_escapes() {
        let lookup = env(&[("NAME", "value")]);
        assert_eq!(
            substitute_str("literal $${NAME} and ${NAME}", &lookup).unwrap(),
            "literal ${NAME} and value"
        );
    }

    #[test]
    fn malformed_names_are_left_alone() {
        let lookup = env(&[]);
        assert_eq!(substitute_str("${lower} ${1X} ${}", &lookup).unwrap(), "${lower} ${1X} ${}");
    }

    #[test]
    fn missing_variable_reports_its_name() {
        let lookup = env(&[]);
        assert_eq!(substitute_str("${GONE}", &lookup).unwrap_err(), "GONE");
    }

    #[test]
    fn empty_variable_counts_as_missing() {
        let lookup = env(&[("EMPTY", "")]);
        assert!(substitute_str("${EMPTY}", &lookup).is_err());
    }

    #[test]
    fn failing_server_is_dropped_but_others_survive() {
        let servers = json!({
            "good": {"command": ["run"], "env": {"KEY": "${PRESENT}"}},
            "bad": {"headers": {"authorization": "Bearer ${ABSENT}"}}
        })
        .as_object()
        .cloned()
        .unwrap();
        let lookup = env(&[("PRESENT", "yes")]);
        let resolved = resolve_server_env_refs(&servers, &lookup);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved["good"]["env"]["KEY"], "yes");
    }
}
