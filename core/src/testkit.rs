//! In-memory fakes for every adapter trait, used by this crate's own
//! tests and available to host applications under the `testkit` feature.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::handler::{DispatchContext, DispatchOutcome, Handler};

/// Records every `dispatch` call it receives, for assertions in tests.
pub struct FakeHandler {
    pub calls: Mutex<Vec<(String, Value)>>,
    call_count: AtomicUsize,
}

impl FakeHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for FakeHandler {
    async fn dispatch(&self, kind: &str, payload: Value, _ctx: DispatchContext) -> DispatchOutcome {
        self.calls.lock().unwrap().push((kind.to_string(), payload));
        self.call_count.fetch_add(1, Ordering::SeqCst);
        DispatchOutcome::Ok
    }
}

/// Feeds scripted inbound frames to a test and records every
/// `envelope_id` it would have acked, without opening a real socket.
/// Mirrors `SocketTransport::recv`'s ack-before-return contract.
pub struct FakeTransport {
    inbound: Mutex<VecDeque<Value>>,
    acked: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            inbound: Mutex::new(VecDeque::new()),
            acked: Mutex::new(Vec::new()),
        }
    }

    /// Queues a raw frame, as it would arrive over the wire, to be
    /// returned by the next `recv()` call.
    pub fn push_inbound(&self, frame: Value) {
        self.inbound.lock().unwrap().push_back(frame);
    }

    pub async fn recv(&self) -> Result<Option<Envelope>, TransportError> {
        let raw = self.inbound.lock().unwrap().pop_front();
        let Some(raw) = raw else {
            return Ok(None);
        };
        let envelope: Envelope = serde_json::from_value(raw).map_err(TransportError::Decode)?;
        if let Some(id) = &envelope.envelope_id {
            self.acked.lock().unwrap().push(id.clone());
        }
        Ok(Some(envelope))
    }

    /// Envelope ids acked so far, in ack order.
    pub fn acked_envelope_ids(&self) -> Vec<String> {
        self.acked.lock().unwrap().clone()
    }
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::envelope::{Envelope, Frame};
    use time::OffsetDateTime;

    fn dummy_ctx() -> DispatchContext {
        DispatchContext {
            config: Config::builder()
                .app_token("xapp-1")
                .bot_token("xoxb-1")
                .build()
                .unwrap(),
            envelope: Envelope {
                envelope_id: Some("E1".into()),
                frame: Frame::Hello { payload: None },
                received_at: OffsetDateTime::now_utc(),
            },
            assigns: Value::Null,
        }
    }

    #[tokio::test]
    async fn fake_handler_records_calls() {
        let handler = FakeHandler::new();
        handler
            .dispatch("message", serde_json::json!({"text": "hi"}), dummy_ctx())
            .await;
        assert_eq!(handler.call_count(), 1);
        assert_eq!(handler.calls.lock().unwrap()[0].0, "message");
    }

    #[tokio::test]
    async fn fake_transport_acks_inbound_frame_with_envelope_id() {
        let transport = FakeTransport::new();
        transport.push_inbound(serde_json::json!({
            "type": "events_api",
            "envelope_id": "E1",
            "payload": {"event": {"type": "message", "text": "hi"}}
        }));

        let envelope = transport.recv().await.unwrap().unwrap();
        assert_eq!(envelope.envelope_id.as_deref(), Some("E1"));
        assert_eq!(transport.acked_envelope_ids(), vec!["E1".to_string()]);
    }

    #[tokio::test]
    async fn fake_transport_recv_returns_none_when_queue_is_empty() {
        let transport = FakeTransport::new();
        assert!(transport.recv().await.unwrap().is_none());
    }
}
