//! Durable `{threadId -> ThreadRecord}` store backed by a single JSON file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use flint_error::GatewayError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use utoipa::ToSchema;

use crate::inbound::{ChatType, RoutingMode};

/// One record per thread identity. `provider_thread_id` is the agent's own
/// session identifier and never leaves the process via listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRecord {
    pub thread_id: String,
    pub routing_mode: RoutingMode,
    pub provider: String,
    pub provider_thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub mcp_profile_ids: Vec<String>,
    pub channel: String,
    pub user_id: String,
    pub chat_type: ChatType,
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_thread_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Projection of [`ThreadRecord`] safe to return to external callers.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PublicThreadRecord {
    pub thread_id: String,
    pub routing_mode: RoutingMode,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub mcp_profile_ids: Vec<String>,
    pub channel: String,
    pub user_id: String,
    pub chat_type: ChatType,
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_thread_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ThreadRecord {
    pub fn to_public(&self) -> PublicThreadRecord {
        PublicThreadRecord {
            thread_id: self.thread_id.clone(),
            routing_mode: self.routing_mode,
            provider: self.provider.clone(),
            model: self.model.clone(),
            mcp_profile_ids: self.mcp_profile_ids.clone(),
            channel: self.channel.clone(),
            user_id: self.user_id.clone(),
            chat_type: self.chat_type,
            peer_id: self.peer_id.clone(),
            account_id: self.account_id.clone(),
            identity_id: self.identity_id.clone(),
            channel_thread_id: self.channel_thread_id.clone(),
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    threads: HashMap<String, ThreadRecord>,
}

/// RFC-3339 UTC timestamp; lexicographic order matches chronological order.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .replace_nanosecond(0)
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Current unix time in milliseconds.
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Parses a stored timestamp back to unix milliseconds.
pub fn parse_rfc3339_ms(value: &str) -> Option<i64> {
    OffsetDateTime::parse(value, &Rfc3339)
        .ok()
        .map(|instant| (instant.unix_timestamp_nanos() / 1_000_000) as i64)
}

#[derive(Debug)]
pub struct ThreadStore {
    path: PathBuf,
    threads: Mutex<HashMap<String, ThreadRecord>>,
}

impl ThreadStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            threads: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the parent directory and an empty file when absent. A corrupt
    /// file is reset to empty and rewritten rather than aborting startup.
    pub async fn init(&self) -> Result<(), GatewayError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => match serde_json::from_str::<StoreFile>(&raw) {
                Ok(file) => {
                    *self.threads.lock().await = file.threads;
                }
                Err(err) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %err,
                        "thread store file is corrupt; resetting to empty"
                    );
                    self.persist(&HashMap::new()).await?;
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.persist(&HashMap::new()).await?;
            }
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    pub async fn get(&self, thread_id: &str) -> Option<ThreadRecord> {
        self.threads.lock().await.get(thread_id).cloned()
    }

    /// All records, most recently updated first.
    pub async fn list(&self) -> Vec<ThreadRecord> {
        let mut records: Vec<ThreadRecord> = self.threads.lock().await.values().cloned().collect();
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        records
    }

    pub async fn upsert(&self, record: ThreadRecord) -> Result<(), GatewayError> {
        let mut threads = self.threads.lock().await;
        threads.insert(record.thread_id.clone(), record);
        let snapshot = threads.clone();
        drop(threads);
        self.persist(&snapshot).await
    }

    async fn persist(&self, threads: &HashMap<String, ThreadRecord>) -> Result<(), GatewayError> {
        let file = StoreFile {
            threads: threads.clone(),
        };
        let body = serde_json::to_string_pretty(&file)?;
        tokio::fs::write(&self.path, body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(thread_id: &str, updated_at: &str) -> ThreadRecord {
        ThreadRecord {
            thread_id: thread_id.into(),
            routing_mode: RoutingMode::PerPeer,
            provider: "claude".into(),
            provider_thread_id: "sess-1".into(),
            model: None,
            mcp_profile_ids: Vec::new(),
            channel: "telegram".into(),
            user_id: "u".into(),
            chat_type: ChatType::Direct,
            peer_id: "u".into(),
            account_id: None,
            identity_id: None,
            channel_thread_id: None,
            created_at: "2026-01-01T00:00:00Z".into(),
            updated_at: updated_at.into(),
        }
    }

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("threads.json");
        let store = ThreadStore::new(&path);
        store.init().await.unwrap();
        store
            .upsert(record("agent:main:direct:u", "2026-01-02T00:00:00Z"))
            .await
            .unwrap();

        let reopened = ThreadStore::new(&path);
        reopened.init().await.unwrap();
        let loaded = reopened.get("agent:main:direct:u").await.unwrap();
        assert_eq!(loaded.provider_thread_id, "sess-1");
        assert_eq!(loaded.updated_at, "2026-01-02T00:00:00Z");
    }

    #[tokio::test]
    async fn listing_is_sorted_by_updated_at_desc() {
        let dir = tempfile::tempdir().unwrap();
        let store = ThreadStore::new(dir.path().join("threads.json"));
        store.init().await.unwrap();
        store
            .upsert(record("a", "2026-01-01T00:00:00Z"))
            .await
            .unwrap();
        store
            .upsert(record("b", "2026-03-01T00:00:00Z"))
            .await
            .unwrap();
        store
            .upsert(record("c", "2026-02-01T00:00:00Z"))
            .await
            .unwrap();

        let ids: Vec<String> = store
            .list()
            .await
            .into_iter()
            .map(|record| record.thread_id)
            .collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn corrupt_file_resets_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("threads.json");
        tokio::fs::write(&path, "{not json").await.unwrap();
        let store = ThreadStore::new(&path);
        store.init().await.unwrap();
        assert!(store.list().await.is_empty());
        let raw = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(serde_json::from_str::<serde_json::Value>(&raw).is_ok());
    }

    #[test]
    fn public_projection_hides_provider_thread_id() {
        let record = record("a", "2026-01-01T00:00:00Z");
        let value = serde_json::to_value(record.to_public()).unwrap();
        assert!(value.get("providerThreadId").is_none());
        assert_eq!(value["threadId"], "a");
    }
}
