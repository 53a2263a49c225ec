//! Bounded ring buffer of in/out frames, with filtered listing and replay.

use std::collections::{HashSet, VecDeque};

use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone)]
pub struct DiagnosticsEntry {
    pub id: u64,
    pub at: OffsetDateTime,
    pub direction: Direction,
    pub kind: String,
    pub payload: Value,
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    NewestFirst,
    OldestFirst,
}

#[derive(Debug, Default)]
pub struct ListFilter {
    pub direction: Option<Direction>,
    pub types: Option<HashSet<String>>,
    pub limit: Option<usize>,
    pub order: Option<Order>,
}

pub struct DiagnosticsBuffer {
    enabled: bool,
    capacity: usize,
    entries: RwLock<VecDeque<DiagnosticsEntry>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl DiagnosticsBuffer {
    pub fn new(enabled: bool, capacity: usize) -> Self {
        Self {
            enabled,
            capacity,
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    pub async fn record(
        &self,
        direction: Direction,
        kind: impl Into<String>,
        payload: Value,
        meta: Option<Value>,
    ) {
        if !self.enabled {
            return;
        }
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let entry = DiagnosticsEntry {
            id,
            at: OffsetDateTime::now_utc(),
            direction,
            kind: kind.into(),
            payload,
            meta,
        };

        let mut entries = self.entries.write().await;
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub async fn list(&self, filter: &ListFilter) -> Vec<DiagnosticsEntry> {
        let entries = self.entries.read().await;
        let mut matched: Vec<DiagnosticsEntry> = entries
            .iter()
            .filter(|e| filter.direction.is_none_or(|d| d == e.direction))
            .filter(|e| {
                filter
                    .types
                    .as_ref()
                    .is_none_or(|types| types.contains(&e.kind))
            })
            .cloned()
            .collect();

        match filter.order.unwrap_or(Order::NewestFirst) {
            Order::NewestFirst => matched.reverse(),
            Order::OldestFirst => {}
        }

        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        matched
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Re-injects matching inbound entries through `dispatch`, in
    /// stored (oldest-first) order. Returns the count replayed;
    /// per-entry dispatch failures are logged but do not abort the run.
    pub async fn replay<F, Fut>(&self, filter: &ListFilter, mut dispatch: F) -> usize
    where
        F: FnMut(DiagnosticsEntry) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        let inbound_filter = ListFilter {
            direction: Some(Direction::Inbound),
            types: filter.types.clone(),
            limit: filter.limit,
            order: Some(Order::OldestFirst),
        };

        let entries = self.list(&inbound_filter).await;
        let mut replayed = 0;
        for entry in entries {
            let id = entry.id;
            if let Err(err) = dispatch(entry).await {
                tracing::warn!(entry_id = id, error = %err, "replay dispatch failed");
            }
            replayed += 1;
        }
        replayed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overflow_evicts_oldest() {
        let buf = DiagnosticsBuffer::new(true, 2);
        buf.record(Direction::Inbound, "a", serde_json::json!({}), None).await;
        buf.record(Direction::Inbound, "b", serde_json::json!({}), None).await;
        buf.record(Direction::Inbound, "c", serde_json::json!({}), None).await;

        let all = buf.list(&ListFilter::default()).await;
        let kinds: Vec<&str> = all.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds.len(), 2);
        assert!(!kinds.contains(&"a"));
    }

    #[tokio::test]
    async fn disabled_buffer_records_nothing() {
        let buf = DiagnosticsBuffer::new(false, 10);
        buf.record(Direction::Inbound, "a", serde_json::json!({}), None).await;
        assert!(buf.list(&ListFilter::default()).await.is_empty());
    }

    #[tokio::test]
    async fn replay_invokes_dispatch_once_per_matching_entry() {
        let buf = DiagnosticsBuffer::new(true, 10);
        buf.record(
            Direction::Inbound,
            "slash_commands",
            serde_json::json!({"command": "/deploy", "text": "api"}),
            None,
        )
        .await;

        let filter = ListFilter {
            types: Some(["slash_commands".to_string()].into_iter().collect()),
            ..ListFilter::default()
        };

        let count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = count.clone();
        let replayed = buf
            .replay(&filter, move |_entry| {
                let count2 = count2.clone();
                async move {
                    count2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;

        assert_eq!(replayed, 1);
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
