#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use futures::future::BoxFuture;
use futures::FutureExt;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tower::util::ServiceExt;

use flint_gateway::channels::{ChannelAdapter, WebhookParse};
use flint_gateway::engine::Gateway;
use flint_gateway::inbound::InboundMessage;
use flint_gateway::protocol::AgentEvent;
use flint_gateway::router::{build_router, AppState, AuthConfig};
use flint_gateway::settings::GatewayOptions;

pub struct TestApp {
    pub app: Router,
    pub gateway: Arc<Gateway>,
    _store_dir: TempDir,
}

pub struct TestAppBuilder {
    env: HashMap<String, String>,
    token: Option<String>,
    adapters: Vec<Arc<dyn ChannelAdapter>>,
    seeded_store: Option<Value>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::builder().build().await
    }

    pub fn builder() -> TestAppBuilder {
        TestAppBuilder {
            env: HashMap::new(),
            token: None,
            adapters: Vec::new(),
            seeded_store: None,
        }
    }
}

impl TestAppBuilder {
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn adapter(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    /// Pre-populates the thread store file before the gateway starts.
    pub fn seeded_store(mut self, contents: Value) -> Self {
        self.seeded_store = Some(contents);
        self
    }

    pub async fn build(self) -> TestApp {
        let store_dir = tempfile::tempdir().expect("create store dir");
        let store_path = store_dir.path().join("threads.json");
        if let Some(contents) = &self.seeded_store {
            std::fs::write(&store_path, contents.to_string()).expect("seed store");
        }

        let mut env = self.env;
        env.entry("FLINT_GATEWAY_PROVIDER".to_string())
            .or_insert_with(|| "mock".to_string());
        env.insert(
            "FLINT_GATEWAY_STORE_PATH".to_string(),
            store_path.to_string_lossy().to_string(),
        );
        env.entry("FLINT_GATEWAY_USER_SETTINGS_PATH".to_string())
            .or_insert_with(|| "/nonexistent/flint-settings.json".to_string());

        let lookup = move |name: &str| env.get(name).cloned();
        let options = GatewayOptions::resolve(&lookup).expect("resolve options");
        let gateway = Gateway::start(options, self.adapters)
            .await
            .expect("start gateway");

        let auth = match self.token {
            Some(token) => AuthConfig::with_token(token),
            None => AuthConfig::disabled(),
        };
        let app = build_router(AppState {
            gateway: gateway.clone(),
            auth,
        });
        TestApp {
            app,
            gateway,
            _store_dir: store_dir,
        }
    }
}

pub async fn send_request(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
    headers: &[(&str, &str)],
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }

    let request_body = if let Some(body) = body {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };

    let request = builder.body(request_body).expect("build request");
    let response = app.clone().oneshot(request).await.expect("request handled");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    let payload = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, payload)
}

pub async fn send_json(app: &Router, method: Method, uri: &str, body: Value) -> (StatusCode, Value) {
    send_request(app, method, uri, Some(body), &[]).await
}

/// Collects an entire SSE response body and splits it into
/// `(event, data)` frames.
pub async fn collect_sse(app: &Router, uri: &str, body: Value) -> Vec<(String, Value)> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ACCEPT, "text/event-stream")
        .body(Body::from(body.to_string()))
        .expect("build request");
    let response = app.clone().oneshot(request).await.expect("sse response");
    assert_eq!(response.status(), StatusCode::OK, "sse status");

    let bytes = tokio::time::timeout(
        Duration::from_secs(10),
        response.into_body().collect(),
    )
    .await
    .expect("sse body timed out")
    .expect("collect sse body")
    .to_bytes();
    let text = String::from_utf8_lossy(&bytes);

    let mut frames = Vec::new();
    for block in text.split("\n\n") {
        let mut event = None;
        let mut data = Vec::new();
        for line in block.lines() {
            if let Some(value) = line.strip_prefix("event: ") {
                event = Some(value.to_string());
            } else if let Some(value) = line.strip_prefix("data: ") {
                data.push(value.to_string());
            }
        }
        if let Some(event) = event {
            let data = data.join("\n");
            let data = serde_json::from_str(&data).unwrap_or(Value::String(data));
            frames.push((event, data));
        }
    }
    frames
}

pub fn direct_message(text: &str) -> Value {
    json!({
        "channel": "telegram",
        "userId": "1234",
        "text": text,
        "chatType": "direct",
        "peerId": "1234",
    })
}

/// Webhook adapter used by the tests: signature header check, JSON bodies,
/// replies captured for later assertions.
pub struct RecordingAdapter {
    pub replies: Arc<Mutex<Vec<String>>>,
    pub events: Arc<Mutex<Vec<AgentEvent>>>,
    pub acknowledged: Arc<Mutex<usize>>,
}

impl RecordingAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            replies: Arc::new(Mutex::new(Vec::new())),
            events: Arc::new(Mutex::new(Vec::new())),
            acknowledged: Arc::new(Mutex::new(0)),
        })
    }

    pub async fn wait_for_reply(&self, timeout: Duration) -> Option<String> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Some(reply) = self.replies.lock().await.first().cloned() {
                return Some(reply);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        None
    }
}

impl ChannelAdapter for RecordingAdapter {
    fn name(&self) -> &str {
        "testchan"
    }

    fn verify_request(&self, headers: &HeaderMap, _raw_body: &[u8]) -> bool {
        headers
            .get("x-test-signature")
            .and_then(|value| value.to_str().ok())
            == Some("valid")
    }

    fn parse_webhook(&self, raw_body: &[u8], _headers: &HeaderMap) -> WebhookParse {
        let Ok(body) = serde_json::from_slice::<Value>(raw_body) else {
            return WebhookParse::Ignore;
        };
        match body.get("type").and_then(Value::as_str) {
            Some("challenge") => WebhookParse::Challenge {
                response: body
                    .get("challenge")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            Some("message") => {
                let message = InboundMessage {
                    channel: "testchan".to_string(),
                    user_id: body
                        .get("userId")
                        .and_then(Value::as_str)
                        .unwrap_or("u1")
                        .to_string(),
                    text: body
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    ..Default::default()
                };
                WebhookParse::Message {
                    message,
                    meta: json!({"channel": "C1"}),
                    event_id: body
                        .get("eventId")
                        .and_then(Value::as_str)
                        .map(ToOwned::to_owned),
                }
            }
            _ => WebhookParse::Ignore,
        }
    }

    fn acknowledge<'a>(&'a self, _meta: &'a Value) -> BoxFuture<'a, ()> {
        async move {
            *self.acknowledged.lock().await += 1;
        }
        .boxed()
    }

    fn on_agent_event<'a>(
        &'a self,
        _meta: &'a Value,
        event: &'a AgentEvent,
    ) -> Option<BoxFuture<'a, ()>> {
        Some(
            async move {
                self.events.lock().await.push(event.clone());
            }
            .boxed(),
        )
    }

    fn deliver_reply<'a>(&'a self, _meta: &'a Value, reply: &'a str) -> BoxFuture<'a, ()> {
        async move {
            self.replies.lock().await.push(reply.to_string());
        }
        .boxed()
    }
}
