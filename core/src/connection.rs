//! Connection lifecycle: identity discovery, dialing, reconnect with
//! backoff, and inbound dispatch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::backoff::Backoff;
use crate::cache::MetadataCache;
use crate::config::Config;
use crate::diagnostics::{Direction, DiagnosticsBuffer};
use crate::envelope::{Envelope, Frame};
use crate::error::{InstanceError, SlackApiError};
use crate::event_buffer::{BufferKey, EventBuffer, RecordOutcome};
use crate::handler::{DispatchContext, DispatchOutcome, Handler};
use crate::health::HealthEvent;
use crate::transport::SocketTransport;
use crate::webapi::WebApiClient;

use boltframe_telemetry::TelemetryLabels;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Discovering,
    Dialing,
    Connected,
    Reconnecting,
    FatalAuth,
}

pub struct ConnectionManager {
    instance: String,
    config: Config,
    web_api: Arc<WebApiClient>,
    event_buffer: Arc<dyn EventBuffer>,
    cache: Arc<MetadataCache>,
    diagnostics: Arc<DiagnosticsBuffer>,
    handler: Arc<dyn Handler>,
    state: std::sync::Mutex<ConnectionState>,
    bot_user_id: std::sync::Mutex<Option<String>>,
    stopping: AtomicBool,
}

impl ConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance: impl Into<String>,
        config: Config,
        web_api: Arc<WebApiClient>,
        event_buffer: Arc<dyn EventBuffer>,
        cache: Arc<MetadataCache>,
        diagnostics: Arc<DiagnosticsBuffer>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Self {
            instance: instance.into(),
            config,
            web_api,
            event_buffer,
            cache,
            diagnostics,
            handler,
            state: std::sync::Mutex::new(ConnectionState::Idle),
            bot_user_id: std::sync::Mutex::new(None),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
        boltframe_telemetry::counter!(
            "connection.state",
            &TelemetryLabels::new(&self.instance, "connection_manager").with_key(format!("{state:?}"))
        );
    }

    pub fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    /// Drives the connect -> run -> reconnect loop until `stop()` is
    /// called, `max_attempts` is exhausted, or a fatal auth error is
    /// observed during discovery.
    pub async fn run(&self, mut health_events: mpsc::UnboundedReceiver<HealthEvent>) -> Result<(), InstanceError> {
        let mut backoff = Backoff::new(&self.config.backoff);

        loop {
            if self.stopping.load(Ordering::SeqCst) {
                return Ok(());
            }

            self.set_state(ConnectionState::Discovering);
            let discovery = self.web_api.post("auth.test", serde_json::json!({})).await;
            let bot_user_id = match discovery {
                Ok(response) => response
                    .get("user_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                Err(SlackApiError::RateLimited { retry_after }) => {
                    tokio::time::sleep(retry_after).await;
                    continue;
                }
                Err(err) if err.is_fatal_auth() => {
                    self.set_state(ConnectionState::FatalAuth);
                    return Err(InstanceError::SlackApi(err));
                }
                Err(err) => {
                    if self.wait_for_backoff(&mut backoff).await.is_none() {
                        return Err(InstanceError::ReconnectExhausted {
                            attempts: backoff.attempt(),
                        });
                    }
                    tracing::warn!(instance = %self.instance, error = %err, "auth.test failed during discovery");
                    continue;
                }
            };
            *self.bot_user_id.lock().unwrap() = Some(bot_user_id);

            self.set_state(ConnectionState::Dialing);
            let open = self.web_api.open_connection(&self.config.app_token).await;
            let ws_url = match open {
                Ok(response) => response.get("url").and_then(Value::as_str).map(str::to_string),
                Err(err) if err.is_fatal_auth() => {
                    self.set_state(ConnectionState::FatalAuth);
                    return Err(InstanceError::SlackApi(err));
                }
                Err(err) => {
                    tracing::warn!(instance = %self.instance, error = %err, "apps.connections.open failed");
                    None
                }
            };
            let Some(ws_url) = ws_url else {
                if self.wait_for_backoff(&mut backoff).await.is_none() {
                    return Err(InstanceError::ReconnectExhausted {
                        attempts: backoff.attempt(),
                    });
                }
                continue;
            };

            let transport = match SocketTransport::connect(&ws_url).await {
                Ok(t) => t,
                Err(err) => {
                    tracing::warn!(instance = %self.instance, error = %err, "transport connect failed");
                    if self.wait_for_backoff(&mut backoff).await.is_none() {
                        return Err(InstanceError::ReconnectExhausted {
                            attempts: backoff.attempt(),
                        });
                    }
                    continue;
                }
            };

            self.set_state(ConnectionState::Connected);
            backoff.reset();

            let run_result = self.run_connected(transport, &mut health_events).await;

            if self.stopping.load(Ordering::SeqCst) {
                return Ok(());
            }

            self.set_state(ConnectionState::Reconnecting);
            tracing::info!(instance = %self.instance, reason = ?run_result, "reconnecting");
            if self.wait_for_backoff(&mut backoff).await.is_none() {
                return Err(InstanceError::ReconnectExhausted {
                    attempts: backoff.attempt(),
                });
            }
        }
    }

    async fn wait_for_backoff(&self, backoff: &mut Backoff) -> Option<()> {
        let delay = backoff.next_delay()?;
        tokio::time::sleep(delay).await;
        Some(())
    }

    async fn run_connected(
        &self,
        mut transport: SocketTransport,
        health_events: &mut mpsc::UnboundedReceiver<HealthEvent>,
    ) -> &'static str {
        loop {
            tokio::select! {
                frame = transport.recv() => {
                    match frame {
                        Ok(Some(envelope)) => {
                            match &envelope.frame {
                                Frame::Disconnect { reason } => {
                                    tracing::info!(instance = %self.instance, reason = ?reason, "received disconnect frame, reconnecting");
                                    return "disconnect_frame";
                                }
                                Frame::Ping { id } => {
                                    if let Some(id) = id.clone() {
                                        if let Err(err) = transport.send_pong(id).await {
                                            tracing::warn!(instance = %self.instance, error = %err, "failed to send pong");
                                            return "transport_error";
                                        }
                                    }
                                }
                                Frame::Hello { .. } | Frame::Pong { .. } => {}
                                _ => self.handle_envelope(envelope).await,
                            }
                        }
                        Ok(None) => return "stream_ended",
                        Err(err) => {
                            tracing::warn!(instance = %self.instance, error = %err, "transport error");
                            return "transport_error";
                        }
                    }
                }
                health = health_events.recv() => {
                    match health {
                        Some(HealthEvent::CheckFailed { reason }) => {
                            tracing::warn!(instance = %self.instance, reason, "health check failed, forcing reconnect");
                            return "healthcheck_failed";
                        }
                        Some(HealthEvent::Fatal { code }) => {
                            tracing::error!(instance = %self.instance, code, "health monitor observed fatal auth error");
                        }
                        None => {}
                    }
                }
            }
        }
    }

    async fn handle_envelope(&self, envelope: Envelope) {
        if !envelope.frame.is_dispatchable() {
            return;
        }

        let payload = envelope.frame.payload().cloned().unwrap_or(Value::Null);
        let kind = envelope.frame.dispatch_type().unwrap_or("unknown");

        self.diagnostics
            .record(Direction::Inbound, kind, payload.clone(), None)
            .await;

        if let Some(envelope_id) = &envelope.envelope_id {
            let key = BufferKey {
                instance: self.instance.clone(),
                envelope_id: envelope_id.clone(),
            };
            let ttl = Duration::from_secs(300);
            let outcome = self.event_buffer.record(&key, payload.clone(), ttl).await;
            if outcome == RecordOutcome::Duplicate {
                boltframe_telemetry::counter!(
                    "handler.ingress",
                    &TelemetryLabels::new(&self.instance, "connection_manager")
                        .with_extra("decision", "duplicate")
                        .with_extra("type", kind)
                );
                return;
            }
        }

        boltframe_telemetry::counter!(
            "handler.ingress",
            &TelemetryLabels::new(&self.instance, "connection_manager")
                .with_extra("decision", "queue")
                .with_extra("type", kind)
        );

        self.apply_cache_side_effect(kind, &payload);
        self.spawn_dispatch(kind.to_string(), payload, envelope);
    }

    fn apply_cache_side_effect(&self, kind: &str, payload: &Value) {
        let bot_user_id = self.bot_user_id.lock().unwrap().clone();
        match kind {
            "member_joined_channel" | "channel_joined" => {
                let user = payload.get("user").and_then(Value::as_str);
                let channel = payload.get("channel").and_then(Value::as_str);
                if let (Some(user), Some(channel)) = (user, channel) {
                    if Some(user) == bot_user_id.as_deref() {
                        self.cache.join_channel(channel);
                    }
                }
            }
            "channel_left" | "member_left_channel" => {
                let user = payload.get("user").and_then(Value::as_str);
                let channel = payload.get("channel").and_then(Value::as_str);
                if let (Some(user), Some(channel)) = (user, channel) {
                    if Some(user) == bot_user_id.as_deref() {
                        self.cache.leave_channel(channel);
                    }
                }
            }
            "team_join" => {
                if let Some(user) = payload.get("user") {
                    if let Some(id) = user.get("id").and_then(Value::as_str) {
                        self.cache.put_user(id, user.clone(), Duration::from_secs(300));
                    }
                }
            }
            "user_change" => {
                if let Some(user) = payload.get("user") {
                    if let Some(id) = user.get("id").and_then(Value::as_str) {
                        self.cache.put_user(id, user.clone(), Duration::from_secs(300));
                    }
                }
            }
            _ => {}
        }
    }

    fn spawn_dispatch(&self, kind: String, payload: Value, envelope: Envelope) {
        let handler = self.handler.clone();
        let config = self.config.clone();
        let instance = self.instance.clone();
        let span = tracing::info_span!("handler.dispatch", instance = %instance, kind = %kind);
        let fut = async move {
            let ctx = DispatchContext {
                config,
                envelope,
                assigns: Value::Null,
            };
            let outcome = match std::panic::AssertUnwindSafe(handler.dispatch(&kind, payload, ctx))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(panic_payload) => DispatchOutcome::Exception(panic_message(&panic_payload)),
            };
            match outcome {
                DispatchOutcome::Ok => tracing::debug!(kind = %kind, status = "ok", "handler ok"),
                DispatchOutcome::Error(err) => {
                    tracing::warn!(kind = %kind, status = "error", error = %err, "handler returned error")
                }
                DispatchOutcome::Halted(response) => {
                    tracing::debug!(kind = %kind, status = "halted", ?response, "handler halted")
                }
                DispatchOutcome::Exception(message) => {
                    tracing::error!(kind = %kind, status = "exception", message = %message, "handler panicked")
                }
            }
        }
        .instrument(span);
        tokio::spawn(fut);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
