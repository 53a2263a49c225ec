//! TTL-bounded idempotent event dedupe buffer.
//!
//! Grounded on this codebase's idempotency guard: a `put_if_absent`
//! primitive keyed by a namespaced string, with an in-memory backend
//! for single-process instances and a JetStream KV backend for
//! deployments where several processes front one workspace.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::error::InstanceError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferKey {
    pub instance: String,
    pub envelope_id: String,
}

impl std::fmt::Display for BufferKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.instance, self.envelope_id)
    }
}

#[derive(Debug, Clone)]
pub struct BufferEntry {
    pub payload: Value,
    pub touched_at: OffsetDateTime,
    pub ttl: Duration,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RecordOutcome {
    Ok,
    Duplicate,
}

/// Adapter contract every event buffer backend implements.
#[async_trait]
pub trait EventBuffer: Send + Sync {
    async fn record(&self, key: &BufferKey, payload: Value, ttl: Duration) -> RecordOutcome;
    async fn seen(&self, key: &BufferKey) -> bool;
    async fn delete(&self, key: &BufferKey);
    /// Oldest `touched_at` first; duplicates refresh position but never payload.
    async fn pending(&self) -> Vec<Value>;
    /// Startup round-trip probe; an instance refuses to start if this fails.
    async fn probe(&self) -> Result<(), InstanceError>;
    /// Background sweep to reclaim expired entries. `seen`/`pending`
    /// already filter by TTL on every call regardless of whether this
    /// has run recently; this only bounds memory growth. Backends with
    /// server-side expiry are free to no-op.
    async fn purge_expired(&self) {}
}

#[derive(Default)]
pub struct InMemoryEventBuffer {
    entries: RwLock<HashMap<BufferKey, BufferEntry>>,
}

impl InMemoryEventBuffer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventBuffer for InMemoryEventBuffer {
    async fn record(&self, key: &BufferKey, payload: Value, ttl: Duration) -> RecordOutcome {
        let now = OffsetDateTime::now_utc();
        let mut entries = self.entries.write().await;

        if let Some(existing) = entries.get_mut(key) {
            if now - existing.touched_at < existing.ttl {
                existing.touched_at = now;
                return RecordOutcome::Duplicate;
            }
        }

        entries.insert(
            key.clone(),
            BufferEntry {
                payload,
                touched_at: now,
                ttl,
            },
        );
        RecordOutcome::Ok
    }

    async fn seen(&self, key: &BufferKey) -> bool {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) => OffsetDateTime::now_utc() - entry.touched_at < entry.ttl,
            None => false,
        }
    }

    async fn delete(&self, key: &BufferKey) {
        self.entries.write().await.remove(key);
    }

    async fn pending(&self) -> Vec<Value> {
        let now = OffsetDateTime::now_utc();
        let entries = self.entries.read().await;
        let mut ordered: Vec<&BufferEntry> = entries
            .values()
            .filter(|e| now - e.touched_at < e.ttl)
            .collect();
        ordered.sort_by_key(|e| e.touched_at);
        ordered.into_iter().map(|e| e.payload.clone()).collect()
    }

    async fn probe(&self) -> Result<(), InstanceError> {
        Ok(())
    }

    async fn purge_expired(&self) {
        let now = OffsetDateTime::now_utc();
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| now - entry.touched_at < entry.ttl);
    }
}

/// JetStream-KV-backed event buffer for multi-node instances, using
/// the bucket's `create`-on-absent semantics as the atomic
/// set-if-absent primitive.
pub struct NatsEventBuffer {
    kv: async_nats::jetstream::kv::Store,
    namespace: String,
    pending: Arc<RwLock<Vec<(OffsetDateTime, Value)>>>,
}

impl NatsEventBuffer {
    pub async fn connect(url: &str, bucket: &str, namespace: &str) -> anyhow::Result<Self> {
        let client = async_nats::connect(url).await?;
        let js = async_nats::jetstream::new(client);
        let kv = js
            .create_key_value(async_nats::jetstream::kv::Config {
                bucket: bucket.to_string(),
                ..Default::default()
            })
            .await?;
        Ok(Self {
            kv,
            namespace: namespace.to_string(),
            pending: Arc::new(RwLock::new(Vec::new())),
        })
    }

    fn kv_key(&self, key: &BufferKey) -> String {
        format!("{}.{}", self.namespace, key)
    }
}

#[async_trait]
impl EventBuffer for NatsEventBuffer {
    async fn record(&self, key: &BufferKey, payload: Value, _ttl: Duration) -> RecordOutcome {
        let kv_key = self.kv_key(key);
        let body = payload.to_string().into_bytes();
        match self.kv.create(&kv_key, body.into()).await {
            Ok(_) => {
                self.pending
                    .write()
                    .await
                    .push((OffsetDateTime::now_utc(), payload));
                RecordOutcome::Ok
            }
            Err(err) => match err.kind() {
                async_nats::jetstream::kv::CreateErrorKind::AlreadyExists => {
                    RecordOutcome::Duplicate
                }
                _ => {
                    tracing::warn!(error = %err, "event buffer create failed, treating as duplicate");
                    RecordOutcome::Duplicate
                }
            },
        }
    }

    async fn seen(&self, key: &BufferKey) -> bool {
        self.kv.get(self.kv_key(key)).await.ok().flatten().is_some()
    }

    async fn delete(&self, key: &BufferKey) {
        let _ = self.kv.delete(self.kv_key(key)).await;
    }

    async fn pending(&self) -> Vec<Value> {
        let mut pending = self.pending.read().await.clone();
        pending.sort_by_key(|(at, _)| *at);
        pending.into_iter().map(|(_, payload)| payload).collect()
    }

    async fn probe(&self) -> Result<(), InstanceError> {
        self.kv
            .status()
            .await
            .map(|_| ())
            .map_err(|err| InstanceError::AdapterProbeFailed {
                name: "event_buffer(nats)",
                reason: err.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> BufferKey {
        BufferKey {
            instance: "bot-1".into(),
            envelope_id: id.into(),
        }
    }

    #[tokio::test]
    async fn first_record_wins_subsequent_are_duplicates() {
        let buf = InMemoryEventBuffer::new();
        let ttl = Duration::from_secs(300);
        let first = buf
            .record(&key("E1"), serde_json::json!({"text": "first"}), ttl)
            .await;
        let second = buf
            .record(&key("E1"), serde_json::json!({"text": "second"}), ttl)
            .await;
        assert_eq!(first, RecordOutcome::Ok);
        assert_eq!(second, RecordOutcome::Duplicate);

        let pending = buf.pending().await;
        assert_eq!(pending, vec![serde_json::json!({"text": "first"})]);
    }

    #[tokio::test]
    async fn expired_entries_are_not_seen_and_drop_from_pending() {
        let buf = InMemoryEventBuffer::new();
        let short_ttl = Duration::from_millis(1);
        buf.record(&key("E2"), serde_json::json!({}), short_ttl)
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!buf.seen(&key("E2")).await);
        buf.purge_expired().await;
        assert!(buf.pending().await.is_empty());
    }

    #[tokio::test]
    async fn pending_is_ordered_oldest_first() {
        let buf = InMemoryEventBuffer::new();
        let ttl = Duration::from_secs(300);
        buf.record(&key("A"), serde_json::json!({"n": 1}), ttl).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        buf.record(&key("B"), serde_json::json!({"n": 2}), ttl).await;
        let pending = buf.pending().await;
        assert_eq!(pending, vec![serde_json::json!({"n": 1}), serde_json::json!({"n": 2})]);
    }
}
