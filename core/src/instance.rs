//! Per-instance wiring and public lifecycle surface.
//!
//! Start order is strict: config -> event buffer probe -> cache ->
//! limiters -> diagnostics -> web api client -> connection manager ->
//! health monitor -> cache sync worker. A later stage never starts
//! before an earlier one has succeeded.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::MetadataCache;
use crate::config::{CacheBackend, Config, RateLimiterBackend};
use crate::connection::ConnectionManager;
use crate::diagnostics::{DiagnosticsBuffer, ListFilter};
use crate::error::{InstanceError, SlackApiError};
use crate::event_buffer::{EventBuffer, InMemoryEventBuffer};
use crate::handler::Handler;
use crate::health::HealthMonitor;
use crate::limiter::{InMemoryRateLimiter, NatsRateLimiter, RateLimiter};
use crate::sync::CacheSyncWorker;
use crate::webapi::WebApiClient;

pub struct Instance {
    name: String,
    config: Config,
    web_api: Arc<WebApiClient>,
    cache: Arc<MetadataCache>,
    event_buffer: Arc<dyn EventBuffer>,
    diagnostics: Arc<DiagnosticsBuffer>,
    connection: Arc<ConnectionManager>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Instance {
    /// Wires every adapter and actor in start order, probing the event
    /// buffer backend before anything else depends on it.
    pub async fn start(
        name: impl Into<String>,
        config: Config,
        handler: Arc<dyn Handler>,
    ) -> Result<Arc<Self>, InstanceError> {
        let name = name.into();

        let event_buffer: Arc<dyn EventBuffer> = match config.event_buffer_backend {
            crate::config::EventBufferBackend::Nats => match &config.event_buffer_nats_url {
                Some(url) => Arc::new(
                    crate::event_buffer::NatsEventBuffer::connect(url, "boltframe-events", &name)
                        .await
                        .map_err(|err| InstanceError::AdapterProbeFailed {
                            name: "event_buffer(nats)",
                            reason: err.to_string(),
                        })?,
                ),
                None => {
                    tracing::warn!(
                        instance = %name,
                        "event_buffer_backend=nats but no event_buffer_nats_url configured, falling back to in-memory"
                    );
                    Arc::new(InMemoryEventBuffer::new())
                }
            },
            crate::config::EventBufferBackend::InMemory => Arc::new(InMemoryEventBuffer::new()),
        };
        event_buffer
            .probe()
            .await
            .map_err(|_| InstanceError::AdapterProbeFailed {
                name: "event_buffer",
                reason: "startup probe failed".to_string(),
            })?;

        let cache = match config.cache_backend {
            CacheBackend::InMemory => MetadataCache::new(),
        };

        let rate_limiter: Arc<dyn RateLimiter> = match config.rate_limiter_backend {
            RateLimiterBackend::Nats => match &config.rate_limiter_nats_url {
                Some(url) => Arc::new(
                    NatsRateLimiter::connect(name.clone(), url, "boltframe-ratelimit")
                        .await
                        .map_err(|err| InstanceError::AdapterProbeFailed {
                            name: "rate_limiter(nats)",
                            reason: err.to_string(),
                        })?,
                ),
                None => {
                    tracing::warn!(
                        instance = %name,
                        "rate_limiter_backend=nats but no rate_limiter_nats_url configured, falling back to in-memory"
                    );
                    Arc::new(InMemoryRateLimiter::new(name.clone()))
                }
            },
            RateLimiterBackend::InMemory => Arc::new(InMemoryRateLimiter::new(name.clone())),
        };
        rate_limiter
            .probe()
            .await
            .map_err(|_| InstanceError::AdapterProbeFailed {
                name: "rate_limiter",
                reason: "startup probe failed".to_string(),
            })?;

        let diagnostics = Arc::new(DiagnosticsBuffer::new(
            config.diagnostics.enabled,
            config.diagnostics.buffer_size,
        ));
        let web_api = Arc::new(WebApiClient::new(config.bot_token.clone(), rate_limiter));

        let connection = Arc::new(ConnectionManager::new(
            name.clone(),
            config.clone(),
            web_api.clone(),
            event_buffer.clone(),
            cache.clone(),
            diagnostics.clone(),
            handler,
        ));

        let instance = Arc::new(Self {
            name,
            config,
            web_api,
            cache,
            event_buffer,
            diagnostics,
            connection,
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        instance.spawn_actors();
        Ok(instance)
    }

    fn spawn_actors(self: &Arc<Self>) {
        let (health_tx, health_rx) = mpsc::unbounded_channel();

        let connection = self.connection.clone();
        let connection_task = tokio::spawn(async move {
            if let Err(err) = connection.run(health_rx).await {
                tracing::error!(error = %err, "connection manager exited");
            }
        });

        let health_monitor = HealthMonitor::new(self.config.health_check, self.web_api.clone(), health_tx);
        let health_task = tokio::spawn(async move {
            health_monitor.run().await;
        });

        let sync_worker = CacheSyncWorker::new(
            self.config.cache_sync.clone(),
            self.config.user_cache,
            self.cache.clone(),
            self.web_api.clone(),
            self.name.clone(),
        );
        let sync_task = tokio::spawn(async move {
            sync_worker.run().await;
        });

        let janitor_cache = self.cache.clone();
        let janitor_interval = self.config.user_cache.cleanup_interval_ms;
        let janitor_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(janitor_interval)).await;
                janitor_cache.run_janitor();
            }
        });

        let janitor_event_buffer = self.event_buffer.clone();
        let event_buffer_janitor_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(janitor_interval)).await;
                janitor_event_buffer.purge_expired().await;
            }
        });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(connection_task);
        tasks.push(health_task);
        tasks.push(sync_task);
        tasks.push(janitor_task);
        tasks.push(event_buffer_janitor_task);
    }

    pub fn stop(&self) {
        self.connection.stop();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    pub async fn diagnostics(&self, filter: ListFilter) -> Vec<crate::diagnostics::DiagnosticsEntry> {
        self.diagnostics.list(&filter).await
    }

    /// Blocking call: waits for the response (or error) before returning.
    pub async fn push(&self, method: &str, body: Value) -> Result<Value, SlackApiError> {
        self.web_api.post(method, body).await
    }

    /// Fire-and-forget variant of [`Instance::push`]; errors are logged,
    /// not surfaced to the caller.
    pub fn push_async(self: &Arc<Self>, method: String, body: Value) {
        let instance = self.clone();
        tokio::spawn(async move {
            if let Err(err) = instance.push(&method, body).await {
                tracing::warn!(method = %method, error = %err, "push_async failed");
            }
        });
    }
}
