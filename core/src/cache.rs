//! Channel membership and user metadata cache, with TTL and a janitor sweep.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::error::SlackApiError;
use crate::webapi::WebApiClient;

#[derive(Debug, Clone)]
pub struct CachedUser {
    pub data: Value,
    pub expires_at: OffsetDateTime,
}

/// Channel membership + user snapshots for one instance.
///
/// Stored as independent `DashMap`s (no external lock) the way this
/// codebase's in-memory session store backs its two indices, plus a
/// single `metadata` map the sync worker and inbound events merge
/// into but never replace wholesale.
#[derive(Default)]
pub struct MetadataCache {
    channels: DashMap<String, ()>,
    channels_by_name: DashMap<String, String>,
    users: DashMap<String, CachedUser>,
    metadata: RwLock<serde_json::Map<String, Value>>,
}

impl MetadataCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn join_channel(&self, channel_id: impl Into<String>) {
        self.channels.insert(channel_id.into(), ());
    }

    pub fn leave_channel(&self, channel_id: &str) {
        self.channels.remove(channel_id);
    }

    pub fn channels(&self) -> HashSet<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    pub fn get_channel(&self, channel_id: &str) -> Option<()> {
        self.channels.get(channel_id).map(|_| ())
    }

    pub fn find_channel_by_name(&self, name: &str) -> Option<String> {
        let normalized = name.trim_start_matches('#').to_lowercase();
        self.channels_by_name.get(&normalized).map(|v| v.clone())
    }

    pub fn index_channel_name(&self, channel_id: impl Into<String>, name: &str) {
        let normalized = name.trim_start_matches('#').to_lowercase();
        self.channels_by_name.insert(normalized, channel_id.into());
    }

    pub fn put_user(&self, user_id: impl Into<String>, data: Value, ttl: Duration) {
        self.users.insert(
            user_id.into(),
            CachedUser {
                data,
                expires_at: OffsetDateTime::now_utc() + ttl,
            },
        );
    }

    pub fn drop_user(&self, user_id: &str) {
        self.users.remove(user_id);
    }

    pub fn get_user(&self, user_id: &str) -> Option<Value> {
        self.users.get(user_id).and_then(|entry| {
            if entry.expires_at > OffsetDateTime::now_utc() {
                Some(entry.data.clone())
            } else {
                None
            }
        })
    }

    pub fn users(&self) -> Vec<(String, Value)> {
        let now = OffsetDateTime::now_utc();
        self.users
            .iter()
            .filter(|e| e.expires_at > now)
            .map(|e| (e.key().clone(), e.data.clone()))
            .collect()
    }

    pub fn find_user(&self, by_email: Option<&str>, by_name: Option<&str>) -> Option<Value> {
        let now = OffsetDateTime::now_utc();
        self.users.iter().find_map(|entry| {
            if entry.expires_at <= now {
                return None;
            }
            let profile = entry.data.get("profile");
            if let Some(email) = by_email {
                let matches = profile
                    .and_then(|p| p.get("email"))
                    .and_then(Value::as_str)
                    .map(|v| v.eq_ignore_ascii_case(email))
                    .unwrap_or(false);
                if matches {
                    return Some(entry.data.clone());
                }
                return None;
            }
            if let Some(name) = by_name {
                let matches = entry
                    .data
                    .get("name")
                    .and_then(Value::as_str)
                    .map(|v| v.eq_ignore_ascii_case(name))
                    .unwrap_or(false);
                if matches {
                    return Some(entry.data.clone());
                }
            }
            None
        })
    }

    pub async fn put_metadata(&self, merge: serde_json::Map<String, Value>) {
        let mut metadata = self.metadata.write().await;
        for (key, value) in merge {
            metadata.insert(key, value);
        }
    }

    pub async fn metadata(&self) -> serde_json::Map<String, Value> {
        self.metadata.read().await.clone()
    }

    /// Consults the cache first; on a miss or stale entry, fetches
    /// `users.info` and re-inserts with the standard TTL.
    pub async fn fetch_user(
        &self,
        user_id: &str,
        web_api: &WebApiClient,
        ttl: Duration,
    ) -> Result<Value, SlackApiError> {
        if let Some(user) = self.get_user(user_id) {
            return Ok(user);
        }

        let response = web_api
            .post("users.info", serde_json::json!({ "user": user_id }))
            .await?;
        let data = response
            .get("user")
            .cloned()
            .unwrap_or(serde_json::json!({}));
        self.put_user(user_id, data.clone(), ttl);
        Ok(data)
    }

    /// Removes users whose TTL has lapsed; run on `cleanup_interval_ms`.
    pub fn run_janitor(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let expired: Vec<String> = self
            .users
            .iter()
            .filter(|e| e.expires_at <= now)
            .map(|e| e.key().clone())
            .collect();
        for id in &expired {
            self.users.remove(id);
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_and_leave_channel_round_trip() {
        let cache = MetadataCache::new();
        cache.join_channel("C9");
        assert!(cache.channels().contains("C9"));
        cache.leave_channel("C9");
        assert!(!cache.channels().contains("C9"));
    }

    #[test]
    fn channel_name_lookup_strips_leading_hash() {
        let cache = MetadataCache::new();
        cache.index_channel_name("C1", "general");
        assert_eq!(cache.find_channel_by_name("#general"), Some("C1".to_string()));
        assert_eq!(cache.find_channel_by_name("GENERAL"), Some("C1".to_string()));
    }

    #[test]
    fn expired_user_is_not_returned() {
        let cache = MetadataCache::new();
        cache.put_user("U1", serde_json::json!({"name": "ana"}), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get_user("U1").is_none());
    }

    #[test]
    fn janitor_sweeps_expired_entries_only() {
        let cache = MetadataCache::new();
        cache.put_user("U1", serde_json::json!({}), Duration::from_millis(0));
        cache.put_user("U2", serde_json::json!({}), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));
        let swept = cache.run_janitor();
        assert_eq!(swept, 1);
        assert!(cache.get_user("U2").is_some());
    }
}
