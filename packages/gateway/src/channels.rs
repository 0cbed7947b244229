//! Channel adapter boundary: named webhooks plugged into the gateway.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::inbound::InboundMessage;
use crate::protocol::AgentEvent;

pub const WEBHOOK_DEDUP_TTL: Duration = Duration::from_secs(5 * 60);
const WEBHOOK_DEDUP_MAX_ENTRIES: usize = 4096;

/// What an adapter made of a raw webhook request.
#[derive(Debug)]
pub enum WebhookParse {
    /// Endpoint verification handshake; reply with `response` verbatim.
    Challenge { response: String },
    /// A user message to route through the gateway.
    Message {
        message: InboundMessage,
        /// Opaque adapter context threaded back into delivery calls.
        meta: Value,
        /// Channel-side event id, deduplicated for five minutes.
        event_id: Option<String>,
    },
    /// Anything the adapter does not care about.
    Ignore,
}

/// A messaging channel plugged into `/webhooks/{name}`. Verification and
/// parsing are pure functions over the raw request; acknowledgement and
/// delivery do I/O.
pub trait ChannelAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn verify_request(&self, headers: &HeaderMap, raw_body: &[u8]) -> bool;

    fn parse_webhook(&self, raw_body: &[u8], headers: &HeaderMap) -> WebhookParse;

    /// Called before the message is processed so the channel stops retrying.
    fn acknowledge<'a>(&'a self, meta: &'a Value) -> BoxFuture<'a, ()>;

    /// Optional live status updates while the turn streams.
    fn on_agent_event<'a>(
        &'a self,
        _meta: &'a Value,
        _event: &'a AgentEvent,
    ) -> Option<BoxFuture<'a, ()>> {
        None
    }

    fn deliver_reply<'a>(&'a self, meta: &'a Value, reply: &'a str) -> BoxFuture<'a, ()>;
}

/// Bounded TTL cache over adapter-reported event ids.
#[derive(Debug)]
pub struct DedupCache {
    ttl: Duration,
    max_entries: usize,
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(WEBHOOK_DEDUP_TTL, WEBHOOK_DEDUP_MAX_ENTRIES)
    }
}

impl DedupCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// True when the id was not seen within the TTL; records it either way.
    pub fn insert_if_new(&mut self, id: &str, now: Instant) -> bool {
        self.evict(now);
        if self.seen.contains_key(id) {
            return false;
        }

        self.seen.insert(id.to_string(), now);
        self.order.push_back((id.to_string(), now));
        while self.seen.len() > self.max_entries {
            if let Some((oldest, _)) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    fn evict(&mut self, now: Instant) {
        while let Some((id, seen_at)) = self.order.front().cloned() {
            if now.duration_since(seen_at) < self.ttl {
                break;
            }
            self.order.pop_front();
            self.seen.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
