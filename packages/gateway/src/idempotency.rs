//! Idempotency gate: in-flight coalescing plus a TTL replay cache.

use std::collections::HashMap;
use std::future::Future;

use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex};

use crate::store::now_ms;

pub const DEFAULT_TTL_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone)]
struct Entry {
    timestamp_ms: i64,
    fingerprint: String,
    result: Value,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    in_flight: HashMap<String, broadcast::Sender<Value>>,
}

/// Outcome of an idempotent execution. `conflict` marks a key replayed with
/// a different fingerprint; the HTTP surface maps it to 409.
#[derive(Debug, Clone)]
pub struct Execution {
    pub result: Value,
    pub cached: bool,
    pub conflict: bool,
}

#[derive(Debug)]
pub struct IdempotencyStore {
    ttl_ms: i64,
    state: Mutex<State>,
}

impl IdempotencyStore {
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            ttl_ms,
            state: Mutex::new(State::default()),
        }
    }

    /// Runs `task` at most once per `(key, fingerprint)` within the TTL.
    /// Concurrent submissions for the same key await the first run's result.
    /// The lock is never held across the task itself.
    pub async fn execute<F>(&self, key: &str, fingerprint: &str, task: F) -> Execution
    where
        F: Future<Output = Value>,
    {
        let mut rx = {
            let mut state = self.state.lock().await;
            let cutoff = now_ms() - self.ttl_ms;
            state.entries.retain(|_, entry| entry.timestamp_ms > cutoff);

            if let Some(entry) = state.entries.get(key) {
                if entry.fingerprint != fingerprint {
                    return Execution {
                        result: json!({"error": "Idempotency key conflict."}),
                        cached: true,
                        conflict: true,
                    };
                }
                return Execution {
                    result: entry.result.clone(),
                    cached: true,
                    conflict: false,
                };
            }

            match state.in_flight.get(key) {
                Some(sender) => sender.subscribe(),
                None => {
                    let (sender, _rx) = broadcast::channel(1);
                    state.in_flight.insert(key.to_string(), sender);
                    drop(state);

                    let result = task.await;

                    let mut state = self.state.lock().await;
                    state.entries.insert(
                        key.to_string(),
                        Entry {
                            timestamp_ms: now_ms(),
                            fingerprint: fingerprint.to_string(),
                            result: result.clone(),
                        },
                    );
                    if let Some(sender) = state.in_flight.remove(key) {
                        let _ = sender.send(result.clone());
                    }
                    return Execution {
                        result,
                        cached: false,
                        conflict: false,
                    };
                }
            }
        };

        match rx.recv().await {
            Ok(result) => Execution {
                result,
                cached: true,
                conflict: false,
            },
            Err(_) => Execution {
                result: json!({"error": "Request was dropped before completing."}),
                cached: true,
                conflict: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn replays_identical_submissions() {
        let store = IdempotencyStore::new(DEFAULT_TTL_MS);
        let calls = Arc::new(AtomicUsize::new(0));

        let first = {
            let calls = calls.clone();
            store
                .execute("k1", "fp", async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    json!({"reply": "hello"})
                })
                .await
        };
        assert!(!first.cached);

        let second = store
            .execute("k1", "fp", async { json!({"reply": "other"}) })
            .await;
        assert!(second.cached);
        assert!(!second.conflict);
        assert_eq!(second.result, first.result);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn conflicting_fingerprint_is_flagged() {
        let store = IdempotencyStore::new(DEFAULT_TTL_MS);
        store.execute("k1", "fp-a", async { json!({}) }).await;
        let outcome = store.execute("k1", "fp-b", async { json!({}) }).await;
        assert!(outcome.conflict);
        assert!(outcome.cached);
        assert_eq!(outcome.result["error"], "Idempotency key conflict.");
    }

    #[tokio::test]
    async fn expired_entries_are_swept() {
        let store = IdempotencyStore::new(0);
        store.execute("k1", "fp", async { json!({"n": 1}) }).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let outcome = store.execute("k1", "fp", async { json!({"n": 2}) }).await;
        assert!(!outcome.cached);
        assert_eq!(outcome.result["n"], 2);
    }

    #[tokio::test]
    async fn concurrent_submissions_coalesce() {
        let store = Arc::new(IdempotencyStore::new(DEFAULT_TTL_MS));
        let calls = Arc::new(AtomicUsize::new(0));

        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
        let slow = {
            let store = store.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                store
                    .execute("k1", "fp", async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let _ = gate_rx.await;
                        json!({"reply": "slow"})
                    })
                    .await
            })
        };

        // Let the first submission claim the in-flight slot.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let follower = {
            let store = store.clone();
            tokio::spawn(
                async move { store.execute("k1", "fp", async { json!({"reply": "x"}) }).await },
            )
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let _ = gate_tx.send(());

        let first = slow.await.unwrap();
        let second = follower.await.unwrap();
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(second.result, first.result);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
