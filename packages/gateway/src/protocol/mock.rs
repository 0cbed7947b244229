//! In-process mock agent speaking the Agent Protocol, used by the mock
//! provider and the integration tests. No child process is spawned.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::sleep;

const WORD_STREAM_DELAY: Duration = Duration::from_millis(5);

/// Model id the mock rejects at turn start, for exercising model fallback.
pub const MOCK_UNKNOWN_MODEL: &str = "missing-model";

#[derive(Debug, Default)]
struct MockState {
    thread_counter: u64,
    turn_counter: u64,
    approval_counter: u64,
    thread_models: HashMap<String, Option<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct MockAgent {
    state: Arc<Mutex<MockState>>,
}

impl MockAgent {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Handles one payload written "to" the mock agent, emitting any responses
/// and notifications back through `emit`.
pub async fn handle_mock_payload<F, Fut>(mock: &MockAgent, payload: &Value, emit: F)
where
    F: Fn(Value) -> Fut,
    Fut: Future<Output = ()>,
{
    let Some(method) = payload.get("method").and_then(Value::as_str) else {
        // Responses to the mock's own reverse requests need no bookkeeping.
        return;
    };
    let params = payload.get("params").cloned().unwrap_or(Value::Null);

    let Some(id) = payload.get("id").cloned() else {
        return;
    };

    match method {
        "initialize" => {
            emit(json!({
                "id": id,
                "result": {
                    "agentInfo": {"name": "mock-agent", "version": "1.0.0"},
                    "capabilities": {"resume": true},
                }
            }))
            .await;
        }
        "thread/start" => {
            let thread_id = {
                let mut state = mock.state.lock().await;
                state.thread_counter += 1;
                let thread_id = format!("mock-thread-{}", state.thread_counter);
                let model = params
                    .get("model")
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned);
                state.thread_models.insert(thread_id.clone(), model);
                thread_id
            };
            emit(json!({"id": id, "result": {"thread": {"id": thread_id}}})).await;
        }
        "thread/resume" => {
            let thread_id = params
                .get("threadId")
                .and_then(Value::as_str)
                .unwrap_or("mock-thread-1")
                .to_string();
            let known = {
                let mut state = mock.state.lock().await;
                if state.thread_models.contains_key(&thread_id) {
                    if let Some(model) = params.get("model").and_then(Value::as_str) {
                        state
                            .thread_models
                            .insert(thread_id.clone(), Some(model.to_string()));
                    }
                    true
                } else {
                    false
                }
            };
            if known {
                emit(json!({"id": id, "result": {"thread": {"id": thread_id}}})).await;
            } else {
                emit(json!({
                    "id": id,
                    "error": {"code": -32002, "message": format!("no such thread: {thread_id}")},
                }))
                .await;
            }
        }
        "turn/start" => {
            run_mock_turn(mock, id, &params, &emit).await;
        }
        "turn/interrupt" => {
            emit(json!({"id": id, "result": {}})).await;
        }
        other => {
            emit(json!({
                "id": id,
                "error": {"code": -32601, "message": format!("method not supported: {other}")},
            }))
            .await;
        }
    }
}

async fn run_mock_turn<F, Fut>(mock: &MockAgent, id: Value, params: &Value, emit: &F)
where
    F: Fn(Value) -> Fut,
    Fut: Future<Output = ()>,
{
    let thread_id = params
        .get("threadId")
        .and_then(Value::as_str)
        .unwrap_or("mock-thread-1")
        .to_string();
    let text = extract_input_text(params);

    let model = {
        let mut state = mock.state.lock().await;
        if let Some(model) = params.get("model").and_then(Value::as_str) {
            state
                .thread_models
                .insert(thread_id.clone(), Some(model.to_string()));
        }
        state
            .thread_models
            .get(&thread_id)
            .cloned()
            .flatten()
    };
    if model.as_deref() == Some(MOCK_UNKNOWN_MODEL) {
        emit(json!({
            "id": id,
            "error": {"code": -32001, "message": format!("unknown model: {MOCK_UNKNOWN_MODEL}")},
        }))
        .await;
        return;
    }

    let turn_id = {
        let mut state = mock.state.lock().await;
        state.turn_counter += 1;
        format!("mock-turn-{}", state.turn_counter)
    };

    emit(json!({"id": id, "result": {"turn": {"id": turn_id}}})).await;
    emit(json!({
        "method": "turn/started",
        "params": {"threadId": thread_id, "turn": {"id": turn_id}},
    }))
    .await;

    if text.contains("use the tool") {
        emit(json!({
            "method": "item/started",
            "params": {
                "threadId": thread_id,
                "item": {
                    "id": "item-cmd-1",
                    "type": "commandExecution",
                    "command": "ls",
                    "cwd": "/",
                },
            },
        }))
        .await;
        emit(json!({
            "method": "item/commandExecution/outputDelta",
            "params": {"threadId": thread_id, "itemId": "item-cmd-1", "delta": "README.md\n"},
        }))
        .await;
        emit(json!({
            "method": "item/completed",
            "params": {
                "threadId": thread_id,
                "item": {
                    "id": "item-cmd-1",
                    "type": "commandExecution",
                    "aggregatedOutput": "README.md\n",
                    "exitCode": 0,
                },
            },
        }))
        .await;
    }

    if text.contains("ask permission") {
        let approval_id = {
            let mut state = mock.state.lock().await;
            state.approval_counter += 1;
            format!("mock-approval-{}", state.approval_counter)
        };
        emit(json!({
            "id": approval_id,
            "method": "item/commandExecution/requestApproval",
            "params": {
                "threadId": thread_id,
                "item": {"id": "item-cmd-2", "type": "commandExecution", "command": "rm -r build"},
            },
        }))
        .await;
    }

    if text.contains("explode") {
        emit(json!({
            "method": "turn/completed",
            "params": {
                "threadId": thread_id,
                "turn": {
                    "id": turn_id,
                    "status": "failed",
                    "error": {"message": "mock turn failed"},
                },
            },
        }))
        .await;
        return;
    }

    let reply = if text.trim().is_empty() {
        "OK".to_string()
    } else {
        format!("mock: {}", text.trim())
    };
    let chunks = word_chunks(&reply);
    let last = chunks.len().saturating_sub(1);
    for (index, chunk) in chunks.into_iter().enumerate() {
        emit(json!({
            "method": "item/agentMessage/delta",
            "params": {"threadId": thread_id, "itemId": "item-msg-1", "delta": chunk},
        }))
        .await;
        if index < last {
            sleep(WORD_STREAM_DELAY).await;
        }
    }

    emit(json!({
        "method": "turn/completed",
        "params": {
            "threadId": thread_id,
            "turn": {
                "id": turn_id,
                "status": "completed",
                "usage": {"inputTokens": 12, "outputTokens": 7},
            },
        },
    }))
    .await;
}

fn extract_input_text(params: &Value) -> String {
    let Some(input) = params.get("input").and_then(Value::as_array) else {
        return String::new();
    };
    let mut output = String::new();
    for block in input {
        if block.get("type").and_then(Value::as_str) == Some("text") {
            if let Some(text) = block.get("text").and_then(Value::as_str) {
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(text);
            }
        }
    }
    output
}

fn word_chunks(text: &str) -> Vec<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return vec![text.to_string()];
    }
    let last = words.len() - 1;
    words
        .into_iter()
        .enumerate()
        .map(|(index, word)| {
            if index == last {
                word.to_string()
            } else {
                format!("{word} ")
            }
        })
        .collect()
}
