//! Pool of live agent runtimes keyed by thread id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use flint_error::GatewayError;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, Mutex};

use crate::mcp::{compose_profiles, merge_builtin_server};
use crate::protocol::peer::AgentPeer;
use crate::protocol::translate::EventTranslator;
use crate::protocol::{
    AgentEvent, METHOD_THREAD_RESUME, METHOD_THREAD_START, METHOD_TURN_INTERRUPT,
    METHOD_TURN_START,
};
use crate::provider::{
    thread_resume_params, thread_start_params, turn_start_params, ProviderId, ThreadOptions,
};
use crate::settings::GatewayOptions;
use crate::store::ThreadRecord;

const CLIENT_NAME: &str = "flint-gateway";
const MEMORY_SERVER_ALIAS: &str = "memory";
const TURN_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);

/// A running agent child paired with the peer driving it, attached to one
/// thread identity. Owned exclusively by the registry.
#[derive(Debug)]
pub struct ThreadRuntime {
    pub peer: AgentPeer,
    pub provider: ProviderId,
    pub provider_thread_id: String,
    pub model: Option<String>,
    pub mcp_profile_ids: Vec<String>,
    current_turn_id: Mutex<Option<String>>,
}

/// What the current request wants the runtime to look like.
#[derive(Debug, Clone, Default)]
pub struct DesiredRuntime {
    pub provider: ProviderId,
    pub model: Option<String>,
    pub mcp_profile_ids: Vec<String>,
    pub force_new_session: bool,
    pub force_default_model: bool,
}

/// Result of a completed turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub reply: String,
    pub usage: Option<Value>,
}

#[derive(Debug)]
pub struct RuntimeRegistry {
    options: Arc<GatewayOptions>,
    runtimes: Mutex<HashMap<String, Arc<ThreadRuntime>>>,
}

impl RuntimeRegistry {
    pub fn new(options: Arc<GatewayOptions>) -> Self {
        Self {
            options,
            runtimes: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a live runtime for the thread, creating or recycling one per
    /// the reset/provider/profile rules. Callers are serialized per thread
    /// id by the gateway queue, so the map lock is only held for map edits.
    pub async fn ensure_runtime(
        &self,
        thread_id: &str,
        desired: &DesiredRuntime,
        stored: Option<&ThreadRecord>,
    ) -> Result<Arc<ThreadRuntime>, GatewayError> {
        if let Some(existing) = self.take_reusable(thread_id, desired).await? {
            return Ok(existing);
        }

        if desired.provider == ProviderId::Codex {
            if let Some(error) = &self.options.codex_config_error {
                return Err(GatewayError::AgentFailure {
                    message: format!("codex configuration is invalid: {error}"),
                    details: None,
                });
            }
        }

        let model = if desired.force_default_model {
            self.options.default_model.clone()
        } else {
            desired.model.clone()
        };
        let thread_options = self.thread_options(desired, model.clone())?;

        let peer = match desired.provider {
            ProviderId::Mock => AgentPeer::mock(self.options.approval_decision),
            provider => {
                AgentPeer::spawn(&self.options.spawn_spec(provider), self.options.approval_decision)?
            }
        };
        peer.initialize(CLIENT_NAME, env!("CARGO_PKG_VERSION"))
            .await?;

        let provider_thread_id = self
            .open_session(&peer, desired, stored, &thread_options)
            .await?;

        let runtime = Arc::new(ThreadRuntime {
            peer,
            provider: desired.provider,
            provider_thread_id,
            model,
            mcp_profile_ids: desired.mcp_profile_ids.clone(),
            current_turn_id: Mutex::new(None),
        });
        self.runtimes
            .lock()
            .await
            .insert(thread_id.to_string(), runtime.clone());
        Ok(runtime)
    }

    /// Applies the recycle rules to an existing entry. Returns the runtime
    /// when it can be reused as-is.
    async fn take_reusable(
        &self,
        thread_id: &str,
        desired: &DesiredRuntime,
    ) -> Result<Option<Arc<ThreadRuntime>>, GatewayError> {
        let existing = self.runtimes.lock().await.get(thread_id).cloned();
        let Some(existing) = existing else {
            return Ok(None);
        };

        if desired.force_new_session {
            tracing::info!(thread_id, "recycling runtime: session reset requested");
            self.remove_and_close(thread_id, &existing).await;
            return Ok(None);
        }
        if existing.provider != desired.provider {
            // Never switch providers mid-thread without an explicit reset.
            tracing::warn!(
                thread_id,
                current = %existing.provider,
                requested = %desired.provider,
                "keeping existing runtime despite provider mismatch"
            );
            return Ok(Some(existing));
        }
        if existing.mcp_profile_ids != desired.mcp_profile_ids {
            tracing::info!(thread_id, "recycling runtime: MCP profiles changed");
            self.remove_and_close(thread_id, &existing).await;
            return Ok(None);
        }
        if existing.peer.is_closed() {
            tracing::info!(thread_id, "recycling runtime: agent process is gone");
            self.remove_and_close(thread_id, &existing).await;
            return Ok(None);
        }
        Ok(Some(existing))
    }

    fn thread_options(
        &self,
        desired: &DesiredRuntime,
        model: Option<String>,
    ) -> Result<ThreadOptions, GatewayError> {
        let mut mcp_servers =
            compose_profiles(&self.options.settings.mcp_profiles, &desired.mcp_profile_ids)?;
        if self.options.memory_enabled {
            let alias = merge_builtin_server(
                &mut mcp_servers,
                MEMORY_SERVER_ALIAS,
                self.options.memory_server_config(),
            );
            tracing::debug!(alias = %alias, "merged built-in memory server");
        }

        let mut thread_options = ThreadOptions {
            model,
            mcp_servers,
            ..Default::default()
        };
        if desired.provider == ProviderId::Codex {
            thread_options.approval_policy = self.options.settings.codex.approval_policy.clone();
            thread_options.sandbox_mode = self.options.settings.codex.sandbox_mode.clone();
        }
        Ok(thread_options)
    }

    /// `thread/resume` against the stored agent session when there is one,
    /// falling back to a fresh `thread/start`.
    async fn open_session(
        &self,
        peer: &AgentPeer,
        desired: &DesiredRuntime,
        stored: Option<&ThreadRecord>,
        thread_options: &ThreadOptions,
    ) -> Result<String, GatewayError> {
        if let Some(record) = stored {
            let same_provider = ProviderId::parse(&record.provider) == Some(desired.provider);
            // A session reset always starts fresh; resuming would revive the
            // conversation the reset was meant to drop.
            if !desired.force_new_session && same_provider && !record.provider_thread_id.is_empty()
            {
                let params = thread_resume_params(
                    desired.provider,
                    &record.provider_thread_id,
                    thread_options,
                );
                match peer.request(METHOD_THREAD_RESUME, params).await {
                    Ok(result) => return Ok(extract_thread_id(&result)),
                    Err(err) => {
                        tracing::warn!(
                            thread_id = %record.thread_id,
                            error = %err,
                            "thread/resume failed; starting a fresh session"
                        );
                    }
                }
            }
        }

        let params = thread_start_params(desired.provider, thread_options);
        let result = peer.request(METHOD_THREAD_START, params).await?;
        Ok(extract_thread_id(&result))
    }

    /// Drives one turn to exhaustion, concatenating text deltas into the
    /// reply. Any event resets the 120 s inactivity watchdog; on expiry the
    /// turn is interrupted and failed.
    pub async fn run_turn(
        &self,
        runtime: &ThreadRuntime,
        text: &str,
        config: Option<&Map<String, Value>>,
        mut on_event: Option<&mut (dyn FnMut(AgentEvent) + Send)>,
    ) -> Result<TurnOutcome, GatewayError> {
        let mut notifications = runtime.peer.subscribe();
        let params = turn_start_params(
            &runtime.provider_thread_id,
            text,
            runtime.model.as_deref(),
            config,
        );
        runtime.peer.request(METHOD_TURN_START, params).await?;

        let mut translator = EventTranslator::new();
        let mut reply = String::new();
        let mut turn_error: Option<String> = None;
        let mut usage = None;

        loop {
            let notification =
                match tokio::time::timeout(TURN_INACTIVITY_TIMEOUT, notifications.recv()).await {
                    Ok(Ok(notification)) => notification,
                    Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                        tracing::warn!(skipped, "turn listener lagged behind agent events");
                        continue;
                    }
                    Ok(Err(broadcast::error::RecvError::Closed)) => {
                        return Err(GatewayError::ClientClosed);
                    }
                    Err(_) => {
                        self.interrupt_runtime(runtime).await;
                        return Err(GatewayError::AgentFailure {
                            message: format!(
                                "no activity for {} s",
                                TURN_INACTIVITY_TIMEOUT.as_secs()
                            ),
                            details: None,
                        });
                    }
                };

            let Some(event) = translator.translate(&notification) else {
                if let Some(turn_id) = translator.current_turn_id() {
                    *runtime.current_turn_id.lock().await = Some(turn_id.to_string());
                }
                continue;
            };

            match &event {
                AgentEvent::Text { delta } => reply.push_str(delta),
                AgentEvent::Error { message } => turn_error = Some(message.clone()),
                AgentEvent::Done { usage: reported } => usage = reported.clone(),
                _ => {}
            }
            let terminal = event.is_terminal();
            if let Some(on_event) = on_event.as_deref_mut() {
                on_event(event);
            }
            if terminal {
                break;
            }
        }

        runtime.current_turn_id.lock().await.take();
        if let Some(message) = turn_error {
            return Err(GatewayError::AgentFailure {
                message,
                details: None,
            });
        }
        Ok(TurnOutcome { reply, usage })
    }

    /// Best-effort `turn/interrupt`; the runtime itself stays alive.
    pub async fn interrupt_thread(&self, thread_id: &str) -> bool {
        let runtime = self.runtimes.lock().await.get(thread_id).cloned();
        match runtime {
            Some(runtime) => {
                self.interrupt_runtime(&runtime).await;
                true
            }
            None => false,
        }
    }

    async fn interrupt_runtime(&self, runtime: &ThreadRuntime) {
        let turn_id = runtime.current_turn_id.lock().await.clone();
        let mut params = Map::new();
        params.insert(
            "threadId".to_string(),
            Value::String(runtime.provider_thread_id.clone()),
        );
        if let Some(turn_id) = turn_id {
            params.insert("turnId".to_string(), Value::String(turn_id));
        }
        if let Err(err) = runtime
            .peer
            .request(METHOD_TURN_INTERRUPT, Value::Object(params))
            .await
        {
            tracing::warn!(error = %err, "turn/interrupt failed");
        }
    }

    /// Tears a runtime down so the next use starts fresh (model fallback).
    pub async fn discard(&self, thread_id: &str) {
        let runtime = self.runtimes.lock().await.remove(thread_id);
        if let Some(runtime) = runtime {
            runtime.peer.close().await;
        }
    }

    pub async fn close_all(&self) {
        let runtimes: Vec<_> = self.runtimes.lock().await.drain().collect();
        for (thread_id, runtime) in runtimes {
            tracing::debug!(thread_id = %thread_id, "closing runtime");
            runtime.peer.close().await;
        }
    }

    async fn remove_and_close(&self, thread_id: &str, runtime: &Arc<ThreadRuntime>) {
        self.runtimes.lock().await.remove(thread_id);
        runtime.peer.close().await;
    }
}

fn extract_thread_id(result: &Value) -> String {
    result
        .get("thread")
        .and_then(|thread| thread.get("id"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
