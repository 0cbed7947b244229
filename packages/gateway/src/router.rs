//! HTTP surface: thin routing over the gateway engine, SSE streaming and
//! the bearer-token middleware.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use flint_error::{ErrorBody, GatewayError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{OpenApi, ToSchema};

use crate::engine::{Gateway, HandleOutcome, WebhookResponse};
use crate::inbound::{ChatType, InboundMessage, RoutingMode};
use crate::protocol::AgentEvent;
use crate::store::PublicThreadRecord;

const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token: Option<String>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self { token: None }
    }

    pub fn with_token(token: String) -> Self {
        Self { token: Some(token) }
    }
}

pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub auth: AuthConfig,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub ok: bool,
    pub provider: String,
    pub default_routing_mode: RoutingMode,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ThreadListResponse {
    pub data: Vec<PublicThreadRecord>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ThreadResponse {
    pub data: PublicThreadRecord,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ThreadMessageRequest {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InterruptResponse {
    pub ok: bool,
    pub thread_id: String,
    pub interrupted: bool,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        list_threads,
        get_thread,
        post_thread,
        post_thread_message,
        interrupt_thread,
    ),
    components(schemas(
        HealthResponse,
        ThreadListResponse,
        ThreadResponse,
        ThreadMessageRequest,
        InterruptResponse,
        PublicThreadRecord,
        InboundMessage,
        RoutingMode,
        ChatType,
        AgentEvent,
        ErrorBody,
    )),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "threads", description = "Thread routing and turns"),
    )
)]
pub struct ApiDoc;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError::Gateway(err) = self;
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        (status, Json(err.to_body())).into_response()
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let mut v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/threads", get(list_threads).post(post_thread))
        .route("/threads/:thread_id", get(get_thread).post(post_thread_message))
        .route("/threads/:thread_id/interrupt", post(interrupt_thread))
        .with_state(shared.clone());

    if shared.auth.token.is_some() {
        v1_router = v1_router.layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_token,
        ));
    }

    let webhook_router = Router::new()
        .route("/:name", post(post_webhook))
        .with_state(shared.clone());

    let router = Router::new()
        .nest("/v1", v1_router)
        .nest("/webhooks", webhook_router)
        .fallback(not_found)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    tracing::info_span!("http.request", method = %req.method(), uri = %req.uri())
                })
                .on_response(|res: &Response, latency: Duration, span: &Span| {
                    tracing::info!(
                        parent: span,
                        status = %res.status(),
                        latency_ms = latency.as_millis()
                    );
                }),
        );

    (router, shared)
}

async fn require_token(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.auth.token.as_deref() else {
        return next.run(request).await;
    };
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    if presented == Some(expected) {
        next.run(request).await
    } else {
        ApiError::from(GatewayError::TokenInvalid).into_response()
    }
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "Not found."})),
    )
        .into_response()
}

#[utoipa::path(get, path = "/v1/health", tag = "meta",
    responses((status = 200, body = HealthResponse)))]
async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let options = state.gateway.options();
    Json(HealthResponse {
        ok: true,
        provider: options.default_provider.as_str().to_string(),
        default_routing_mode: options.default_routing_mode,
    })
}

#[utoipa::path(get, path = "/v1/threads", tag = "threads",
    responses((status = 200, body = ThreadListResponse)))]
async fn list_threads(State(state): State<Arc<AppState>>) -> Json<ThreadListResponse> {
    let data = state
        .gateway
        .list_threads()
        .await
        .iter()
        .map(|record| record.to_public())
        .collect();
    Json(ThreadListResponse { data })
}

#[utoipa::path(get, path = "/v1/threads/{thread_id}", tag = "threads",
    params(("thread_id" = String, Path, description = "Thread id")),
    responses((status = 200, body = ThreadResponse), (status = 404, body = ErrorBody)))]
async fn get_thread(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
) -> Result<Json<ThreadResponse>, ApiError> {
    let record = state
        .gateway
        .get_thread(&thread_id)
        .await
        .ok_or(GatewayError::ThreadNotFound { thread_id })?;
    Ok(Json(ThreadResponse {
        data: record.to_public(),
    }))
}

#[utoipa::path(post, path = "/v1/threads", tag = "threads",
    request_body = InboundMessage,
    responses((status = 200, description = "Reply or SSE stream"),
        (status = 400, body = ErrorBody), (status = 409, body = ErrorBody),
        (status = 500, body = ErrorBody)))]
async fn post_thread(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let message: InboundMessage =
        serde_json::from_slice(&body).map_err(|err| GatewayError::InvalidRequest {
            message: format!("invalid request body: {err}"),
        })?;
    let fingerprint = String::from_utf8_lossy(&body).to_string();
    Ok(respond(state, headers, message, fingerprint).await)
}

#[utoipa::path(post, path = "/v1/threads/{thread_id}", tag = "threads",
    params(("thread_id" = String, Path, description = "Thread id")),
    request_body = ThreadMessageRequest,
    responses((status = 200, description = "Reply or SSE stream"),
        (status = 404, body = ErrorBody), (status = 409, body = ErrorBody),
        (status = 500, body = ErrorBody)))]
async fn post_thread_message(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: ThreadMessageRequest =
        serde_json::from_slice(&body).map_err(|err| GatewayError::InvalidRequest {
            message: format!("invalid request body: {err}"),
        })?;
    if request.text.trim().is_empty() {
        return Err(GatewayError::InvalidRequest {
            message: "text must be non-empty".to_string(),
        }
        .into());
    }

    let record = state
        .gateway
        .get_thread(&thread_id)
        .await
        .ok_or_else(|| GatewayError::ThreadNotFound {
            thread_id: thread_id.clone(),
        })?;

    let mut message = state.gateway.message_for_thread(&record, request.text);
    message.idempotency_key = request.idempotency_key;
    let fingerprint = format!("{thread_id}:{}", String::from_utf8_lossy(&body));
    Ok(respond(state, headers, message, fingerprint).await)
}

#[utoipa::path(post, path = "/v1/threads/{thread_id}/interrupt", tag = "threads",
    params(("thread_id" = String, Path, description = "Thread id")),
    responses((status = 200, body = InterruptResponse),
        (status = 404, body = ErrorBody), (status = 409, body = ErrorBody)))]
async fn interrupt_thread(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
) -> Result<Json<InterruptResponse>, ApiError> {
    if state.gateway.get_thread(&thread_id).await.is_none() {
        return Err(GatewayError::ThreadNotFound { thread_id }.into());
    }
    if !state.gateway.interrupt_thread(&thread_id).await {
        return Err(GatewayError::NoActiveRuntime { thread_id }.into());
    }
    Ok(Json(InterruptResponse {
        ok: true,
        thread_id,
        interrupted: true,
    }))
}

async fn post_webhook(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let outcome = state
        .gateway
        .clone()
        .handle_webhook(&name, &headers, &body)
        .await?;
    Ok(match outcome {
        WebhookResponse::Challenge(response) => response.into_response(),
        WebhookResponse::Accepted => Json(json!({"ok": true})).into_response(),
        WebhookResponse::Duplicate => Json(json!({"ok": true, "duplicate": true})).into_response(),
        WebhookResponse::Ignored => Json(json!({"ok": true, "ignored": true})).into_response(),
    })
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("text/event-stream"))
        .unwrap_or(false)
}

fn idempotency_key(headers: &HeaderMap, message: &InboundMessage) -> Option<String> {
    headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| message.idempotency_key.clone())
        .filter(|key| !key.trim().is_empty())
}

async fn respond(
    state: Arc<AppState>,
    headers: HeaderMap,
    message: InboundMessage,
    fingerprint: String,
) -> Response {
    let key = idempotency_key(&headers, &message);
    if wants_event_stream(&headers) {
        stream_response(state, message, key, fingerprint).await
    } else {
        json_response(state, message, key, fingerprint).await
    }
}

fn outcome_body(outcome: &HandleOutcome) -> Value {
    json!({
        "threadId": outcome.thread_id,
        "routingMode": outcome.routing_mode.as_str(),
        "provider": outcome.provider,
        "reply": outcome.reply,
        "durationMs": outcome.duration_ms,
    })
}

/// `{status, body}` envelope cached by the idempotency store so replays get
/// byte-identical results including the original status.
fn envelope(status: u16, body: Value) -> Value {
    json!({"status": status, "body": body})
}

fn split_envelope(value: &Value) -> (StatusCode, Value) {
    let status = value
        .get("status")
        .and_then(Value::as_u64)
        .and_then(|status| StatusCode::from_u16(status as u16).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, value.get("body").cloned().unwrap_or(Value::Null))
}

async fn run_to_envelope(
    state: &Arc<AppState>,
    message: InboundMessage,
    events: Option<mpsc::UnboundedSender<AgentEvent>>,
) -> Value {
    match state.gateway.clone().handle_message(message, events).await {
        Ok(outcome) => envelope(200, outcome_body(&outcome)),
        Err(err) => envelope(err.status_code(), serde_json::to_value(err.to_body()).unwrap_or(Value::Null)),
    }
}

async fn json_response(
    state: Arc<AppState>,
    message: InboundMessage,
    key: Option<String>,
    fingerprint: String,
) -> Response {
    let Some(key) = key else {
        let (status, body) = split_envelope(&run_to_envelope(&state, message, None).await);
        return (status, Json(body)).into_response();
    };

    let execution = state
        .gateway
        .idempotency()
        .execute(&key, &fingerprint, run_to_envelope(&state, message, None))
        .await;

    if execution.conflict {
        let mut body = execution.result;
        if let Some(object) = body.as_object_mut() {
            object.insert("cached".to_string(), json!(true));
        }
        return (StatusCode::CONFLICT, Json(body)).into_response();
    }

    let (status, mut body) = split_envelope(&execution.result);
    if execution.cached {
        if let Some(object) = body.as_object_mut() {
            object.insert("cached".to_string(), json!(true));
            object.insert("idempotencyKey".to_string(), json!(key));
        }
    }
    (status, Json(body)).into_response()
}

fn sse_frame(event: &AgentEvent) -> Event {
    Event::default()
        .event(event.event_type())
        .data(serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string()))
}

/// Streams `event: <type>` frames as the agent produces them, then a final
/// `result` (or `error`) frame.
async fn stream_response(
    state: Arc<AppState>,
    message: InboundMessage,
    key: Option<String>,
    fingerprint: String,
) -> Response {
    let (frame_tx, frame_rx) = mpsc::unbounded_channel::<Result<Event, Infallible>>();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<AgentEvent>();

    let event_frames = frame_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let _ = event_frames.send(Ok(sse_frame(&event)));
        }
    });

    tokio::spawn(async move {
        let result = match key {
            Some(key) => {
                let execution = state
                    .gateway
                    .idempotency()
                    .execute(&key, &fingerprint, run_to_envelope(&state, message, Some(event_tx)))
                    .await;
                if execution.conflict {
                    let mut body = execution.result;
                    if let Some(object) = body.as_object_mut() {
                        object.insert("cached".to_string(), json!(true));
                    }
                    envelope(409, body)
                } else {
                    let (status, mut body) = split_envelope(&execution.result);
                    if execution.cached {
                        if let Some(object) = body.as_object_mut() {
                            object.insert("cached".to_string(), json!(true));
                            object.insert("idempotencyKey".to_string(), json!(key));
                        }
                    }
                    envelope(status.as_u16(), body)
                }
            }
            None => run_to_envelope(&state, message, Some(event_tx)).await,
        };

        // Emit remaining live frames before the terminal frame.
        let _ = forwarder.await;

        let (status, body) = split_envelope(&result);
        let frame = if status.is_success() {
            Event::default()
                .event("result")
                .data(body.to_string())
        } else {
            let message = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("request failed");
            Event::default()
                .event("error")
                .data(json!({"type": "error", "message": message}).to_string())
        };
        let _ = frame_tx.send(Ok(frame));
    });

    Sse::new(UnboundedReceiverStream::new(frame_rx))
        .keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
        .into_response()
}
