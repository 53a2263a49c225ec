//! Background paginated refresh of channel membership and user snapshots.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::cache::MetadataCache;
use crate::config::{CacheSyncConfig, SyncKind, UserCacheConfig};
use crate::error::SlackApiError;
use crate::webapi::WebApiClient;

pub struct CacheSyncWorker {
    config: CacheSyncConfig,
    user_cache_config: UserCacheConfig,
    cache: Arc<MetadataCache>,
    web_api: Arc<WebApiClient>,
    instance: String,
}

impl CacheSyncWorker {
    pub fn new(
        config: CacheSyncConfig,
        user_cache_config: UserCacheConfig,
        cache: Arc<MetadataCache>,
        web_api: Arc<WebApiClient>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            config,
            user_cache_config,
            cache,
            web_api,
            instance: instance.into(),
        }
    }

    pub async fn run(&self) {
        if !self.config.enabled {
            return;
        }

        let kinds = self.config.kinds.clone();
        loop {
            for kind in &kinds {
                let result = match kind {
                    SyncKind::Channels => self.sync_channels().await,
                    SyncKind::Users => self.sync_users().await,
                };
                match result {
                    Ok(count) => {
                        tracing::info!(
                            instance = %self.instance,
                            kind = ?kind,
                            count,
                            "cache sync completed"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(instance = %self.instance, kind = ?kind, error = %err, "cache sync failed");
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(self.config.interval_ms)).await;
        }
    }

    async fn sync_channels(&self) -> Result<usize, SlackApiError> {
        let mut cursor: Option<String> = None;
        let mut count = 0usize;
        let mut pages = 0u32;

        loop {
            if let Some(limit) = self.config.page_limit {
                if pages >= limit {
                    break;
                }
            }

            // "user" is omitted: Slack defaults `users.conversations`
            // to the authenticated bot token's own membership.
            let mut body = serde_json::json!({ "types": "public_channel,private_channel" });
            if let Some(cursor) = &cursor {
                body["cursor"] = Value::String(cursor.clone());
            }

            let response = match self.web_api.post("users.conversations", body).await {
                Ok(response) => response,
                Err(SlackApiError::RateLimited { retry_after }) => {
                    tokio::time::sleep(retry_after).await;
                    continue;
                }
                Err(err) => return Err(err),
            };

            if let Some(channels) = response.get("channels").and_then(Value::as_array) {
                for channel in channels {
                    if let Some(id) = channel.get("id").and_then(Value::as_str) {
                        self.cache.join_channel(id);
                        if let Some(name) = channel.get("name").and_then(Value::as_str) {
                            self.cache.index_channel_name(id, name);
                        }
                        count += 1;
                    }
                }
            }

            cursor = response
                .get("response_metadata")
                .and_then(|m| m.get("next_cursor"))
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .map(str::to_string);
            pages += 1;

            if cursor.is_none() {
                break;
            }
        }

        Ok(count)
    }

    async fn sync_users(&self) -> Result<usize, SlackApiError> {
        let mut cursor: Option<String> = None;
        let mut count = 0usize;
        let mut pages = 0u32;
        let ttl = Duration::from_millis(self.user_cache_config.ttl_ms);

        loop {
            if let Some(limit) = self.config.page_limit {
                if pages >= limit {
                    break;
                }
            }

            let mut body = serde_json::json!({});
            if let Some(cursor) = &cursor {
                body["cursor"] = Value::String(cursor.clone());
            }

            let response = match self.web_api.post("users.list", body).await {
                Ok(response) => response,
                Err(SlackApiError::RateLimited { retry_after }) => {
                    tokio::time::sleep(retry_after).await;
                    continue;
                }
                Err(err) => return Err(err),
            };

            if let Some(members) = response.get("members").and_then(Value::as_array) {
                for member in members {
                    if let Some(id) = member.get("id").and_then(Value::as_str) {
                        self.cache.put_user(id, member.clone(), ttl);
                        count += 1;
                    }
                }
            }

            cursor = response
                .get("response_metadata")
                .and_then(|m| m.get("next_cursor"))
                .and_then(Value::as_str)
                .filter(|c| !c.is_empty())
                .map(str::to_string);
            pages += 1;

            if cursor.is_none() {
                break;
            }
        }

        Ok(count)
    }
}
