//! Per-method token-bucket rate limiting against Slack's published tiers.
//!
//! Each bucket is served by its own task reading an unbounded mpsc
//! channel of acquire requests — mailbox order gives FIFO admission
//! for free, while `suspend` (triggered by a 429 response) mutates the
//! shared bucket state directly so it takes effect without waiting for
//! the mailbox to drain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};

use boltframe_telemetry::TelemetryLabels;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierScope {
    Workspace,
    /// Per-call scope key is read from this field of the request body.
    Channel(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct TierSpec {
    pub tier: &'static str,
    pub window_ms: u64,
    pub max_calls: u32,
    pub scope: TierScope,
    pub group: Option<&'static str>,
    pub burst_ratio: f64,
    pub initial_fill_ratio: f64,
}

impl TierSpec {
    fn capacity(&self) -> f64 {
        self.max_calls as f64 + (self.max_calls as f64 * self.burst_ratio).ceil()
    }

    fn refill_interval(&self) -> Duration {
        let calls = self.max_calls.max(1) as f64;
        Duration::from_millis((self.window_ms as f64 / calls) as u64)
    }
}

/// Slack's published per-method quotas. Approximate tiering; overridable
/// at construction via [`TierLimiter::with_overrides`].
pub fn default_tier_table() -> HashMap<&'static str, TierSpec> {
    let mut table = HashMap::new();

    let tier1 = TierSpec {
        tier: "tier1",
        window_ms: 60_000,
        max_calls: 1,
        scope: TierScope::Workspace,
        group: None,
        burst_ratio: 0.0,
        initial_fill_ratio: 1.0,
    };
    let tier2 = TierSpec {
        tier: "tier2",
        window_ms: 60_000,
        max_calls: 20,
        scope: TierScope::Workspace,
        group: None,
        burst_ratio: 0.1,
        initial_fill_ratio: 1.0,
    };
    let tier3 = TierSpec {
        tier: "tier3",
        window_ms: 60_000,
        max_calls: 50,
        scope: TierScope::Workspace,
        group: None,
        burst_ratio: 0.1,
        initial_fill_ratio: 1.0,
    };
    let tier4 = TierSpec {
        tier: "tier4",
        window_ms: 60_000,
        max_calls: 100,
        scope: TierScope::Workspace,
        group: None,
        burst_ratio: 0.2,
        initial_fill_ratio: 1.0,
    };

    for method in ["admin.apps.approve", "admin.apps.restrict", "admin.users.session.reset"] {
        table.insert(method, tier1);
    }
    for method in ["channels.list", "conversations.list", "usergroups.list"] {
        table.insert(method, tier2);
    }
    for method in ["conversations.info", "conversations.history", "reactions.add"] {
        table.insert(method, tier3);
    }
    for method in ["users.info", "users.list", "auth.test", "bots.info"] {
        table.insert(method, tier4);
    }

    table.insert(
        "chat.postMessage",
        TierSpec {
            tier: "special",
            window_ms: 1_000,
            max_calls: 1,
            scope: TierScope::Channel("channel"),
            group: Some("chat.postMessage"),
            burst_ratio: 0.0,
            initial_fill_ratio: 1.0,
        },
    );
    table.insert(
        "chat.update",
        TierSpec {
            tier: "special",
            window_ms: 1_000,
            max_calls: 1,
            scope: TierScope::Channel("channel"),
            group: Some("chat.postMessage"),
            burst_ratio: 0.0,
            initial_fill_ratio: 1.0,
        },
    );
    table.insert(
        "apps.connections.open",
        TierSpec {
            tier: "special",
            window_ms: 60_000,
            max_calls: 100,
            scope: TierScope::Workspace,
            group: None,
            burst_ratio: 0.0,
            initial_fill_ratio: 1.0,
        },
    );

    table
}

struct BucketState {
    spec: TierSpec,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
    suspended_until: Option<Instant>,
}

impl BucketState {
    fn new(spec: TierSpec) -> Self {
        let capacity = spec.capacity();
        Self {
            spec,
            capacity,
            tokens: capacity * spec.initial_fill_ratio.clamp(0.0, 1.0),
            last_refill: Instant::now(),
            suspended_until: None,
        }
    }

    fn refill(&mut self, now: Instant) {
        if let Some(until) = self.suspended_until {
            if now < until {
                return;
            }
            self.suspended_until = None;
            self.last_refill = now;
            return;
        }
        let interval = self.spec.refill_interval();
        if interval.is_zero() {
            self.tokens = self.capacity;
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill);
        let refilled = elapsed.as_secs_f64() / interval.as_secs_f64();
        if refilled > 0.0 {
            self.tokens = (self.tokens + refilled).min(self.capacity);
            self.last_refill = now;
        }
    }

    fn suspend(&mut self, now: Instant, delay: Duration) {
        self.tokens = 0.0;
        self.suspended_until = Some(now + delay);
        self.last_refill = now + delay;
    }

    fn wait_for_one(&self, now: Instant) -> Duration {
        if let Some(until) = self.suspended_until {
            if now < until {
                return until - now;
            }
        }
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let missing = 1.0 - self.tokens;
        Duration::from_secs_f64(missing * self.spec.refill_interval().as_secs_f64())
    }
}

struct BucketHandle {
    state: Arc<Mutex<BucketState>>,
    sender: mpsc::UnboundedSender<oneshot::Sender<()>>,
}

/// Per-method token bucket limiter; one FIFO-served bucket task per
/// `(method_or_group, scope_key)` pair.
pub struct TierLimiter {
    instance: String,
    specs: HashMap<&'static str, TierSpec>,
    buckets: DashMap<String, Arc<BucketHandle>>,
}

impl TierLimiter {
    pub fn new(instance: impl Into<String>) -> Self {
        Self::with_overrides(instance, default_tier_table())
    }

    pub fn with_overrides(instance: impl Into<String>, specs: HashMap<&'static str, TierSpec>) -> Self {
        Self {
            instance: instance.into(),
            specs,
            buckets: DashMap::new(),
        }
    }

    fn scope_key(spec: &TierSpec, body: &Value) -> String {
        match spec.scope {
            TierScope::Workspace => "workspace".to_string(),
            TierScope::Channel(field) => body
                .get(field)
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| "workspace".to_string()),
        }
    }

    fn bucket_key(spec: &TierSpec, method: &str, scope_key: &str) -> String {
        format!("{}:{}", spec.group.unwrap_or(method), scope_key)
    }

    fn handle_for(&self, key: String, spec: TierSpec) -> Arc<BucketHandle> {
        if let Some(existing) = self.buckets.get(&key) {
            return existing.clone();
        }

        let state = Arc::new(Mutex::new(BucketState::new(spec)));
        let (tx, mut rx) = mpsc::unbounded_channel::<oneshot::Sender<()>>();
        let task_state = state.clone();
        let labels_instance = self.instance.clone();
        let bucket_key = key.clone();
        tokio::spawn(async move {
            while let Some(reply) = rx.recv().await {
                loop {
                    let wait = {
                        let mut guard = task_state.lock().await;
                        let now = Instant::now();
                        guard.refill(now);
                        let wait = guard.wait_for_one(now);
                        if wait.is_zero() {
                            guard.tokens -= 1.0;
                            boltframe_telemetry::gauge!(
                                "tier_limiter.tokens",
                                guard.tokens,
                                &TelemetryLabels::new(&labels_instance, "tier_limiter")
                                    .with_key(bucket_key.clone())
                            );
                        }
                        wait
                    };
                    if wait.is_zero() {
                        break;
                    }
                    tokio::time::sleep(wait).await;
                }
                let _ = reply.send(());
            }
        });

        let handle = Arc::new(BucketHandle { state, sender: tx });
        self.buckets.insert(key, handle.clone());
        handle
    }

    /// Blocks until a token is available for `method`; a no-op for
    /// methods with no configured tier spec.
    pub async fn acquire(&self, method: &str, body: &Value) {
        let Some(spec) = self.specs.get(method).copied() else {
            return;
        };
        let scope_key = Self::scope_key(&spec, body);
        let key = Self::bucket_key(&spec, method, &scope_key);
        let handle = self.handle_for(key, spec);

        let (tx, rx) = oneshot::channel();
        if handle.sender.send(tx).is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Called after a 429 response; cancels the bucket's pending
    /// refill and blocks new admissions until `delay` elapses.
    pub async fn suspend(&self, method: &str, body: &Value, delay: Duration) {
        let Some(spec) = self.specs.get(method).copied() else {
            return;
        };
        let scope_key = Self::scope_key(&spec, body);
        let key = Self::bucket_key(&spec, method, &scope_key);
        let handle = self.handle_for(key, spec);
        let mut guard = handle.state.lock().await;
        guard.suspend(Instant::now(), delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_method_bypasses_limiter() {
        let limiter = TierLimiter::new("bot-1");
        let start = Instant::now();
        limiter.acquire("not.a.real.method", &serde_json::json!({})).await;
        assert!(start.elapsed() < Duration::from_millis(20));
    }

    #[tokio::test]
    async fn second_call_in_tight_window_is_delayed() {
        let mut specs = HashMap::new();
        specs.insert(
            "users.list",
            TierSpec {
                tier: "test",
                window_ms: 50,
                max_calls: 1,
                scope: TierScope::Workspace,
                group: None,
                burst_ratio: 0.0,
                initial_fill_ratio: 1.0,
            },
        );
        let limiter = TierLimiter::with_overrides("bot-1", specs);
        limiter.acquire("users.list", &serde_json::json!({})).await;
        let start = Instant::now();
        limiter.acquire("users.list", &serde_json::json!({})).await;
        assert!(start.elapsed() >= Duration::from_millis(35));
    }

    #[tokio::test]
    async fn channel_scope_falls_back_to_workspace_when_field_absent() {
        let mut specs = HashMap::new();
        specs.insert(
            "chat.postMessage",
            TierSpec {
                tier: "special",
                window_ms: 1_000,
                max_calls: 1,
                scope: TierScope::Channel("channel"),
                group: Some("chat.postMessage"),
                burst_ratio: 0.0,
                initial_fill_ratio: 1.0,
            },
        );
        let limiter = TierLimiter::with_overrides("bot-1", specs);
        // No "channel" field: must resolve to the workspace bucket,
        // not panic or hang.
        limiter
            .acquire("chat.postMessage", &serde_json::json!({"text": "hi"}))
            .await;
    }
}
