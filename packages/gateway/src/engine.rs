//! The gateway engine: composes identity resolution, the per-thread queue,
//! session lifecycle, the runtime registry and the thread store into the
//! `handle_message` loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::http::HeaderMap;
use flint_error::GatewayError;
use time::UtcOffset;
use tokio::sync::{mpsc, Mutex};

use crate::channels::{ChannelAdapter, DedupCache, WebhookParse};
use crate::identity::resolve_thread_id;
use crate::idempotency::IdempotencyStore;
use crate::inbound::{InboundMessage, RoutingMode};
use crate::lifecycle::{evaluate_expiry, parse_reset_command, resolve_policy, SessionType};
use crate::protocol::AgentEvent;
use crate::provider::ProviderId;
use crate::queue::ThreadQueues;
use crate::registry::{DesiredRuntime, RuntimeRegistry};
use crate::settings::GatewayOptions;
use crate::store::{now_ms, now_rfc3339, parse_rfc3339_ms, ThreadRecord, ThreadStore};

const MODEL_FALLBACK_MARKERS: &[&str] = &[
    "unknown model",
    "invalid model",
    "not supported",
    "unsupported",
];

/// Live event sink for one in-flight message.
pub type EventSink = mpsc::UnboundedSender<AgentEvent>;

#[derive(Debug, Clone)]
pub struct HandleOutcome {
    pub thread_id: String,
    pub routing_mode: RoutingMode,
    pub provider: String,
    pub reply: String,
    pub duration_ms: u64,
}

/// Router-facing webhook result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookResponse {
    Challenge(String),
    Accepted,
    Duplicate,
    Ignored,
}

struct TurnRun {
    reply: String,
    provider: ProviderId,
    provider_thread_id: String,
    model: Option<String>,
}

pub struct Gateway {
    options: Arc<GatewayOptions>,
    store: ThreadStore,
    registry: RuntimeRegistry,
    queues: ThreadQueues,
    idempotency: IdempotencyStore,
    adapters: HashMap<String, Arc<dyn ChannelAdapter>>,
    webhook_dedup: Mutex<DedupCache>,
}

impl Gateway {
    pub async fn start(
        options: GatewayOptions,
        adapters: Vec<Arc<dyn ChannelAdapter>>,
    ) -> Result<Arc<Self>, GatewayError> {
        let options = Arc::new(options);
        let store = ThreadStore::new(&options.store_path);
        store.init().await?;

        let adapters = adapters
            .into_iter()
            .map(|adapter| (adapter.name().to_string(), adapter))
            .collect();

        Ok(Arc::new(Self {
            registry: RuntimeRegistry::new(options.clone()),
            queues: ThreadQueues::new(),
            idempotency: IdempotencyStore::new(options.idempotency_ttl_ms),
            store,
            adapters,
            webhook_dedup: Mutex::new(DedupCache::default()),
            options,
        }))
    }

    pub fn options(&self) -> &GatewayOptions {
        &self.options
    }

    pub fn idempotency(&self) -> &IdempotencyStore {
        &self.idempotency
    }

    pub async fn list_threads(&self) -> Vec<ThreadRecord> {
        self.store.list().await
    }

    pub async fn get_thread(&self, thread_id: &str) -> Option<ThreadRecord> {
        self.store.get(thread_id).await
    }

    /// Rebuilds an inbound message for a follow-up on a known thread.
    pub fn message_for_thread(&self, record: &ThreadRecord, text: String) -> InboundMessage {
        InboundMessage {
            channel: record.channel.clone(),
            user_id: record.user_id.clone(),
            text,
            provider: Some(record.provider.clone()),
            chat_type: Some(record.chat_type),
            peer_id: Some(record.peer_id.clone()),
            account_id: record.account_id.clone(),
            identity_id: record.identity_id.clone(),
            channel_thread_id: record.channel_thread_id.clone(),
            mcp_profile_ids: if record.mcp_profile_ids.is_empty() {
                None
            } else {
                Some(record.mcp_profile_ids.clone())
            },
            routing_mode: Some(record.routing_mode),
            idempotency_key: None,
            mcp_servers: None,
        }
    }

    /// Full inbound pipeline: normalize, resolve the thread identity, then
    /// run the turn inside the thread's FIFO slot. Reset evaluation through
    /// record upsert happens atomically from the caller's perspective.
    pub async fn handle_message(
        self: Arc<Self>,
        mut message: InboundMessage,
        events: Option<EventSink>,
    ) -> Result<HandleOutcome, GatewayError> {
        message.validate_and_normalize()?;
        let started = Instant::now();

        let routing_mode = message
            .routing_mode
            .unwrap_or(self.options.default_routing_mode);
        let thread_id = resolve_thread_id(&message, routing_mode, &self.options.identity_links);

        let gateway = self.clone();
        let task_thread_id = thread_id.clone();
        let run = self
            .queues
            .run(&thread_id, async move {
                gateway
                    .process_turn(task_thread_id, routing_mode, message, events)
                    .await
            })
            .await??;

        Ok(HandleOutcome {
            thread_id,
            routing_mode,
            provider: run.provider.as_str().to_string(),
            reply: run.reply,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Best-effort interrupt of the thread's in-flight turn.
    pub async fn interrupt_thread(&self, thread_id: &str) -> bool {
        self.registry.interrupt_thread(thread_id).await
    }

    pub async fn shutdown(&self) {
        self.registry.close_all().await;
    }

    async fn process_turn(
        self: Arc<Self>,
        thread_id: String,
        routing_mode: RoutingMode,
        message: InboundMessage,
        events: Option<EventSink>,
    ) -> Result<TurnRun, GatewayError> {
        let stored = self.store.get(&thread_id).await;

        let requested_provider = match &message.provider {
            Some(raw) => Some(ProviderId::parse(raw).ok_or_else(|| {
                GatewayError::InvalidRequest {
                    message: format!("unknown provider: {raw}"),
                }
            })?),
            None => None,
        };
        let stored_provider = stored
            .as_ref()
            .and_then(|record| ProviderId::parse(&record.provider));
        let mut provider = requested_provider
            .or(stored_provider)
            .unwrap_or(self.options.default_provider);

        let mcp_profile_ids = message
            .mcp_profile_ids
            .clone()
            .unwrap_or_else(|| self.options.settings.default_mcp_profile_ids.clone());

        let session = &self.options.settings.session;
        let mut text = message.text.trim().to_string();
        let mut model_override = None;
        let mut reset_reason: Option<String> = None;

        if let Some(command) = parse_reset_command(
            &text,
            &session.reset_triggers(),
            &ProviderId::hints(),
            &session.greeting_prompt(),
        ) {
            reset_reason = Some(format!("trigger:{}", command.trigger));
            if let Some(retarget) = &command.provider_override {
                provider = ProviderId::parse(retarget).unwrap_or(provider);
            }
            model_override = command.model_override;
            text = command.next_text;
        } else if let Some(record) = &stored {
            let policy = resolve_policy(session, &message.channel, SessionType::of(&message));
            if !policy.is_off() {
                if let Some(updated_ms) = parse_rfc3339_ms(&record.updated_at) {
                    if let Some(reason) =
                        evaluate_expiry(updated_ms, now_ms(), local_offset(), policy)
                    {
                        reset_reason = Some(format!("{}_expiry", reason.as_str()));
                    }
                }
            }
        }

        if let Some(reason) = &reset_reason {
            tracing::info!(thread_id = %thread_id, reason = %reason, "resetting agent session");
        }

        let stored_model = stored
            .as_ref()
            .filter(|_| stored_provider == Some(provider))
            .and_then(|record| record.model.clone());
        let model = model_override
            .or(stored_model)
            .or_else(|| self.options.default_model.clone());

        let desired = DesiredRuntime {
            provider,
            model,
            mcp_profile_ids: mcp_profile_ids.clone(),
            force_new_session: reset_reason.is_some(),
            force_default_model: false,
        };

        let run = self
            .run_with_model_fallback(&thread_id, &desired, stored.as_ref(), &text, &events)
            .await?;

        let now = now_rfc3339();
        let record = ThreadRecord {
            thread_id: thread_id.clone(),
            routing_mode,
            provider: run.provider.as_str().to_string(),
            provider_thread_id: run.provider_thread_id.clone(),
            model: run.model.clone(),
            mcp_profile_ids,
            channel: message.channel.clone(),
            user_id: message.user_id.clone(),
            chat_type: message.chat_type(),
            peer_id: message
                .peer_id
                .clone()
                .unwrap_or_else(|| message.user_id.clone()),
            account_id: message.account_id.clone(),
            identity_id: message.identity_id.clone(),
            channel_thread_id: message.channel_thread_id.clone(),
            created_at: stored
                .as_ref()
                .map(|record| record.created_at.clone())
                .unwrap_or_else(|| now.clone()),
            updated_at: now,
        };
        self.store.upsert(record).await?;

        Ok(run)
    }

    /// One retry on errors that clearly reference a rejected model: the
    /// runtime is torn down and re-created forcing the default model, and
    /// the reply carries a one-line warning.
    async fn run_with_model_fallback(
        &self,
        thread_id: &str,
        desired: &DesiredRuntime,
        stored: Option<&ThreadRecord>,
        text: &str,
        events: &Option<EventSink>,
    ) -> Result<TurnRun, GatewayError> {
        let first_error = match self.attempt_turn(thread_id, desired, stored, text, events).await {
            Ok(run) => return Ok(run),
            Err(err) => err,
        };

        if !should_fall_back_to_default_model(
            &first_error,
            desired.model.as_deref(),
            self.options.default_model.as_deref(),
        ) {
            return Err(first_error);
        }

        let rejected = desired.model.clone().unwrap_or_default();
        tracing::warn!(
            thread_id,
            model = %rejected,
            error = %first_error,
            "model was rejected; retrying with the default model"
        );
        self.registry.discard(thread_id).await;

        let retry = DesiredRuntime {
            force_new_session: true,
            force_default_model: true,
            model: None,
            ..desired.clone()
        };
        let run = self.attempt_turn(thread_id, &retry, stored, text, events).await?;
        Ok(TurnRun {
            reply: format!(
                "Note: model \"{rejected}\" was rejected; replied with the default model.\n{}",
                run.reply
            ),
            ..run
        })
    }

    async fn attempt_turn(
        &self,
        thread_id: &str,
        desired: &DesiredRuntime,
        stored: Option<&ThreadRecord>,
        text: &str,
        events: &Option<EventSink>,
    ) -> Result<TurnRun, GatewayError> {
        let runtime = self.registry.ensure_runtime(thread_id, desired, stored).await?;

        let mut forward;
        let sink: Option<&mut (dyn FnMut(AgentEvent) + Send)> = match events {
            Some(tx) => {
                let tx = tx.clone();
                forward = move |event: AgentEvent| {
                    let _ = tx.send(event);
                };
                Some(&mut forward)
            }
            None => None,
        };

        let outcome = self.registry.run_turn(&runtime, text, None, sink).await?;
        Ok(TurnRun {
            reply: outcome.reply,
            provider: runtime.provider,
            provider_thread_id: runtime.provider_thread_id.clone(),
            model: runtime.model.clone(),
        })
    }

    /// `/webhooks/{name}` entry point. Acknowledges before processing and
    /// delivers the reply (or a formatted error) through the adapter.
    pub async fn handle_webhook(
        self: Arc<Self>,
        name: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookResponse, GatewayError> {
        let adapter = self
            .adapters
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::AdapterNotFound {
                name: name.to_string(),
            })?;

        if !adapter.verify_request(headers, body) {
            return Err(GatewayError::VerificationFailed {
                name: name.to_string(),
            });
        }

        match adapter.parse_webhook(body, headers) {
            WebhookParse::Challenge { response } => Ok(WebhookResponse::Challenge(response)),
            WebhookParse::Ignore => Ok(WebhookResponse::Ignored),
            WebhookParse::Message {
                message,
                meta,
                event_id,
            } => {
                if let Some(event_id) = &event_id {
                    let fresh = self
                        .webhook_dedup
                        .lock()
                        .await
                        .insert_if_new(event_id, Instant::now());
                    if !fresh {
                        tracing::debug!(name, event_id, "dropping duplicate webhook event");
                        return Ok(WebhookResponse::Duplicate);
                    }
                }

                adapter.acknowledge(&meta).await;

                let gateway = self.clone();
                tokio::spawn(async move {
                    let (tx, mut rx) = mpsc::unbounded_channel();
                    let event_adapter = adapter.clone();
                    let event_meta = meta.clone();
                    let forwarder = tokio::spawn(async move {
                        while let Some(event) = rx.recv().await {
                            if let Some(delivery) = event_adapter.on_agent_event(&event_meta, &event)
                            {
                                delivery.await;
                            }
                        }
                    });

                    let result = gateway.handle_message(message, Some(tx)).await;
                    let _ = forwarder.await;
                    let reply = match result {
                        Ok(outcome) => outcome.reply,
                        Err(err) => format!("Something went wrong: {err}"),
                    };
                    adapter.deliver_reply(&meta, &reply).await;
                });

                Ok(WebhookResponse::Accepted)
            }
        }
    }
}

fn should_fall_back_to_default_model(
    error: &GatewayError,
    requested_model: Option<&str>,
    default_model: Option<&str>,
) -> bool {
    let Some(requested) = requested_model else {
        return false;
    };
    if Some(requested) == default_model {
        return false;
    }
    let text = error.to_string().to_lowercase();
    text.contains(&requested.to_lowercase())
        && MODEL_FALLBACK_MARKERS
            .iter()
            .any(|marker| text.contains(marker))
}

fn local_offset() -> UtcOffset {
    UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC)
}
