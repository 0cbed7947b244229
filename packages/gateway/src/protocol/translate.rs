//! Maps Agent Protocol notifications onto the uniform [`AgentEvent`] stream.

use serde_json::Value;

use super::{
    AgentEvent, Notification, METHOD_AGENT_EXITED, METHOD_COMMAND_APPROVAL, METHOD_FILE_APPROVAL,
    METHOD_INVALID_STDOUT,
};

/// Stateful only with respect to the current turn id; create one per turn.
#[derive(Debug, Default)]
pub struct EventTranslator {
    current_turn_id: Option<String>,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_turn_id(&self) -> Option<&str> {
        self.current_turn_id.as_deref()
    }

    pub fn translate(&mut self, notification: &Notification) -> Option<AgentEvent> {
        let params = &notification.params;
        match notification.method.as_str() {
            "item/agentMessage/delta" => Some(AgentEvent::Text {
                delta: str_field(params, "delta").unwrap_or_default(),
            }),
            "item/reasoning/textDelta" => Some(AgentEvent::Reasoning {
                delta: str_field(params, "delta").unwrap_or_default(),
            }),
            "item/started" => translate_item_started(params.get("item")?),
            "item/completed" => translate_item_completed(params.get("item")?),
            "turn/started" => {
                self.current_turn_id = params
                    .get("turn")
                    .and_then(|turn| turn.get("id"))
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned);
                None
            }
            "turn/completed" => Some(translate_turn_completed(params)),
            METHOD_COMMAND_APPROVAL | METHOD_FILE_APPROVAL => Some(AgentEvent::Activity),
            METHOD_INVALID_STDOUT => Some(AgentEvent::Error {
                message: format!(
                    "agent emitted an unparseable line: {}",
                    str_field(params, "error").unwrap_or_default()
                ),
            }),
            METHOD_AGENT_EXITED => {
                let code = params.get("code").and_then(Value::as_i64);
                Some(AgentEvent::Error {
                    message: match code {
                        Some(code) => format!("agent process exited with code {code}"),
                        None => "agent process exited".to_string(),
                    },
                })
            }
            method if method.starts_with("item/") && method.ends_with("/outputDelta") => None,
            _ => None,
        }
    }
}

fn translate_item_started(item: &Value) -> Option<AgentEvent> {
    let id = str_field(item, "id").unwrap_or_default();
    match item.get("type").and_then(Value::as_str)? {
        "commandExecution" => Some(AgentEvent::ToolStart {
            id,
            name: "Bash".to_string(),
            input: Some(serde_json::json!({
                "command": item.get("command").cloned().unwrap_or(Value::Null),
                "cwd": item.get("cwd").cloned().unwrap_or(Value::Null),
            })),
        }),
        "fileChange" => {
            let changes = item.get("changes").and_then(Value::as_array);
            let first_kind = changes
                .and_then(|changes| changes.first())
                .and_then(|change| change.get("kind"))
                .and_then(Value::as_str);
            let file_path = changes
                .and_then(|changes| changes.first())
                .and_then(|change| change.get("path"))
                .cloned()
                .unwrap_or(Value::Null);
            let name = if first_kind == Some("add") { "Write" } else { "Edit" };
            Some(AgentEvent::ToolStart {
                id,
                name: name.to_string(),
                input: Some(serde_json::json!({"file_path": file_path})),
            })
        }
        "mcpToolCall" => Some(AgentEvent::ToolStart {
            id,
            name: str_field(item, "tool").unwrap_or_else(|| "mcp".to_string()),
            input: item.get("arguments").cloned(),
        }),
        _ => None,
    }
}

fn translate_item_completed(item: &Value) -> Option<AgentEvent> {
    let id = str_field(item, "id").unwrap_or_default();
    match item.get("type").and_then(Value::as_str)? {
        "commandExecution" => Some(AgentEvent::ToolEnd {
            id,
            result: item.get("aggregatedOutput").cloned(),
            is_error: item.get("exitCode").and_then(Value::as_i64).unwrap_or(0) != 0,
        }),
        "fileChange" => Some(AgentEvent::ToolEnd {
            id,
            result: None,
            is_error: false,
        }),
        "mcpToolCall" => Some(AgentEvent::ToolEnd {
            id,
            result: item.get("result").cloned(),
            is_error: false,
        }),
        _ => None,
    }
}

fn translate_turn_completed(params: &Value) -> AgentEvent {
    let turn = params.get("turn");
    let status = turn
        .and_then(|turn| turn.get("status"))
        .and_then(Value::as_str);
    if status == Some("failed") {
        let message = turn
            .and_then(|turn| turn.get("error"))
            .and_then(|error| error.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("turn failed")
            .to_string();
        return AgentEvent::Error { message };
    }
    AgentEvent::Done {
        usage: turn.and_then(|turn| turn.get("usage")).cloned(),
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(ToOwned::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn note(method: &str, params: Value) -> Notification {
        Notification {
            method: method.to_string(),
            params,
        }
    }

    #[test]
    fn message_delta_becomes_text() {
        let mut translator = EventTranslator::new();
        let event = translator
            .translate(&note("item/agentMessage/delta", json!({"delta": "hel"})))
            .unwrap();
        assert_eq!(
            event,
            AgentEvent::Text {
                delta: "hel".into()
            }
        );
    }

    #[test]
    fn command_execution_maps_to_bash_tool() {
        let mut translator = EventTranslator::new();
        let started = translator
            .translate(&note(
                "item/started",
                json!({"item": {"id": "i1", "type": "commandExecution", "command": "ls", "cwd": "/tmp"}}),
            ))
            .unwrap();
        match started {
            AgentEvent::ToolStart { id, name, input } => {
                assert_eq!(id, "i1");
                assert_eq!(name, "Bash");
                let input = input.unwrap();
                assert_eq!(input["command"], "ls");
                assert_eq!(input["cwd"], "/tmp");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let completed = translator
            .translate(&note(
                "item/completed",
                json!({"item": {"id": "i1", "type": "commandExecution", "aggregatedOutput": "x", "exitCode": 2}}),
            ))
            .unwrap();
        assert_eq!(
            completed,
            AgentEvent::ToolEnd {
                id: "i1".into(),
                result: Some(json!("x")),
                is_error: true,
            }
        );
    }

    #[test]
    fn file_change_kind_selects_write_or_edit() {
        let mut translator = EventTranslator::new();
        let write = translator
            .translate(&note(
                "item/started",
                json!({"item": {"id": "i2", "type": "fileChange", "changes": [{"kind": "add", "path": "a.rs"}]}}),
            ))
            .unwrap();
        match write {
            AgentEvent::ToolStart { name, input, .. } => {
                assert_eq!(name, "Write");
                assert_eq!(input.unwrap()["file_path"], "a.rs");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let edit = translator
            .translate(&note(
                "item/started",
                json!({"item": {"id": "i3", "type": "fileChange", "changes": [{"kind": "update", "path": "b.rs"}]}}),
            ))
            .unwrap();
        assert!(matches!(edit, AgentEvent::ToolStart { name, .. } if name == "Edit"));
    }

    #[test]
    fn mcp_tool_call_keeps_tool_name_and_arguments() {
        let mut translator = EventTranslator::new();
        let event = translator
            .translate(&note(
                "item/started",
                json!({"item": {"id": "i4", "type": "mcpToolCall", "tool": "memory_search", "arguments": {"q": "x"}}}),
            ))
            .unwrap();
        assert!(
            matches!(event, AgentEvent::ToolStart { name, input, .. }
                if name == "memory_search" && input == Some(json!({"q": "x"})))
        );
    }

    #[test]
    fn turn_started_records_id_without_emitting() {
        let mut translator = EventTranslator::new();
        let none = translator.translate(&note(
            "turn/started",
            json!({"turn": {"id": "turn-7"}}),
        ));
        assert!(none.is_none());
        assert_eq!(translator.current_turn_id(), Some("turn-7"));
    }

    #[test]
    fn failed_turn_becomes_error() {
        let mut translator = EventTranslator::new();
        let event = translator
            .translate(&note(
                "turn/completed",
                json!({"turn": {"id": "t", "status": "failed", "error": {"message": "boom"}}}),
            ))
            .unwrap();
        assert_eq!(event, AgentEvent::Error { message: "boom".into() });
    }

    #[test]
    fn completed_turn_becomes_done_with_usage() {
        let mut translator = EventTranslator::new();
        let event = translator
            .translate(&note(
                "turn/completed",
                json!({"turn": {"id": "t", "status": "completed", "usage": {"outputTokens": 3}}}),
            ))
            .unwrap();
        assert_eq!(
            event,
            AgentEvent::Done {
                usage: Some(json!({"outputTokens": 3}))
            }
        );
    }

    #[test]
    fn approval_requests_become_activity() {
        let mut translator = EventTranslator::new();
        for method in [METHOD_COMMAND_APPROVAL, METHOD_FILE_APPROVAL] {
            let event = translator.translate(&note(method, json!({}))).unwrap();
            assert_eq!(event, AgentEvent::Activity);
        }
    }

    #[test]
    fn output_deltas_are_ignored() {
        let mut translator = EventTranslator::new();
        assert!(translator
            .translate(&note(
                "item/commandExecution/outputDelta",
                json!({"delta": "x"}),
            ))
            .is_none());
    }

    #[test]
    fn unknown_notifications_are_ignored() {
        let mut translator = EventTranslator::new();
        assert!(translator.translate(&note("thread/metadata", json!({}))).is_none());
    }
}
