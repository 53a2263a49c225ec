//! Per-channel / per-workspace burst serializer.
//!
//! At most one call per scope key is in flight at a time; a 429
//! response blocks the scope's admissions until the advised delay
//! passes. Bookkeeping on the way out — decrementing `in_flight` and
//! waking the next waiter — happens in a `Drop` impl so it runs even
//! if the protected call panics or its future is dropped early.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use boltframe_telemetry::TelemetryLabels;

const CHANNEL_SCOPED_METHODS: &[&str] = &[
    "chat.postMessage",
    "chat.update",
    "chat.delete",
    "chat.postEphemeral",
    "reactions.add",
    "reactions.remove",
    "conversations.invite",
    "conversations.kick",
];

pub fn scope_key(method: &str, body: &Value) -> String {
    if CHANNEL_SCOPED_METHODS.contains(&method) {
        let channel = body
            .get("channel")
            .or_else(|| body.get("channel_id"))
            .and_then(Value::as_str);
        if let Some(channel) = channel {
            return format!("channel:{channel}");
        }
    }
    "workspace".to_string()
}

struct ScopeInner {
    in_flight: u32,
    blocked_until: Option<Instant>,
    queue: VecDeque<oneshot::Sender<()>>,
    timer_armed: bool,
}

struct ScopeState {
    inner: Mutex<ScopeInner>,
}

impl ScopeState {
    fn new() -> Self {
        Self {
            inner: Mutex::new(ScopeInner {
                in_flight: 0,
                blocked_until: None,
                queue: VecDeque::new(),
                timer_armed: false,
            }),
        }
    }

    fn drain_if_possible(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.queue.is_empty() || inner.in_flight > 0 {
            return;
        }
        let now = Instant::now();
        if let Some(until) = inner.blocked_until {
            if now < until {
                return;
            }
        }
        inner.blocked_until = None;
        if let Some(waiter) = inner.queue.pop_front() {
            inner.in_flight = 1;
            inner.timer_armed = false;
            let _ = waiter.send(());
        }
    }

    fn arm_timer(self: &Arc<Self>, until: Instant) {
        let state = self.clone();
        tokio::spawn(async move {
            let now = Instant::now();
            if until > now {
                tokio::time::sleep(until - now).await;
            }
            state.drain_if_possible();
        });
    }
}

/// Holds one in-flight slot for a scope key; releases it and wakes the
/// next waiter (if any) on drop, regardless of how the call ended.
pub struct ScopeGuard {
    state: Arc<ScopeState>,
}

impl ScopeGuard {
    /// Marks the scope blocked for `delay`; call before dropping the
    /// guard when the protected call observed a 429.
    pub fn record_rate_limited(&self, delay: Duration) {
        let mut inner = self.state.inner.lock().unwrap();
        inner.blocked_until = Some(Instant::now() + delay);
        if !inner.queue.is_empty() && !inner.timer_armed {
            inner.timer_armed = true;
            let until = inner.blocked_until.unwrap();
            drop(inner);
            self.state.arm_timer(until);
        }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        {
            let mut inner = self.state.inner.lock().unwrap();
            inner.in_flight = inner.in_flight.saturating_sub(1);
        }
        self.state.drain_if_possible();
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum AdmitDecision {
    Allow,
    Queued { queue_len: usize },
}

pub struct ScopeLimiter {
    instance: String,
    states: DashMap<String, Arc<ScopeState>>,
}

impl ScopeLimiter {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            states: DashMap::new(),
        }
    }

    fn state_for(&self, key: &str) -> Arc<ScopeState> {
        self.states
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(ScopeState::new()))
            .clone()
    }

    /// Admits the caller for `key`, blocking until a slot is free.
    /// Returns a guard whose drop releases the slot.
    pub async fn acquire(&self, key: &str) -> (ScopeGuard, AdmitDecision) {
        let state = self.state_for(key);
        let (decision, rx) = {
            let mut inner = state.inner.lock().unwrap();
            let now = Instant::now();
            let blocked = inner.blocked_until.map_or(false, |u| now < u);
            if !blocked && inner.in_flight == 0 {
                inner.in_flight = 1;
                (AdmitDecision::Allow, None)
            } else {
                let (tx, rx) = oneshot::channel();
                inner.queue.push_back(tx);
                let queue_len = inner.queue.len();
                if blocked && !inner.timer_armed {
                    inner.timer_armed = true;
                    let until = inner.blocked_until.unwrap();
                    drop(inner);
                    state.arm_timer(until);
                } else {
                    drop(inner);
                }
                (AdmitDecision::Queued { queue_len }, Some(rx))
            }
        };

        if let Some(rx) = rx {
            let _ = rx.await;
        }

        boltframe_telemetry::counter!(
            "scope_limiter.decision",
            &TelemetryLabels::new(&self.instance, "scope_limiter").with_key(key)
        );

        (ScopeGuard { state }, decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_caller_is_admitted_immediately() {
        let limiter = ScopeLimiter::new("bot-1");
        let (_guard, decision) = limiter.acquire("channel:C1").await;
        assert_eq!(decision, AdmitDecision::Allow);
    }

    #[tokio::test]
    async fn second_concurrent_caller_is_queued_then_drained_on_drop() {
        let limiter = ScopeLimiter::new("bot-1");
        let (first_guard, first_decision) = limiter.acquire("channel:C1").await;
        assert_eq!(first_decision, AdmitDecision::Allow);

        let limiter = Arc::new(limiter);
        let limiter2 = limiter.clone();
        let second = tokio::spawn(async move { limiter2.acquire("channel:C1").await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first_guard);

        let (_second_guard, second_decision) = second.await.unwrap();
        assert!(matches!(second_decision, AdmitDecision::Queued { queue_len: 1 }));
    }

    #[tokio::test]
    async fn scope_key_falls_back_to_workspace_for_unscoped_methods() {
        assert_eq!(scope_key("users.list", &serde_json::json!({})), "workspace");
        assert_eq!(
            scope_key("chat.postMessage", &serde_json::json!({"channel": "C1"})),
            "channel:C1"
        );
        assert_eq!(
            scope_key("chat.postMessage", &serde_json::json!({})),
            "workspace"
        );
    }
}
