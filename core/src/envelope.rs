//! Decoded Socket Mode frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// One decoded Socket Mode frame.
///
/// `envelope_id` is `None` for frames that bypass dedupe entirely
/// (`hello`, `ping`/`pong`, `disconnect`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub envelope_id: Option<String>,
    #[serde(flatten)]
    pub frame: Frame,
    #[serde(skip, default = "OffsetDateTime::now_utc")]
    pub received_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "hello")]
    Hello { payload: Option<Value> },
    #[serde(rename = "disconnect")]
    Disconnect { reason: Option<String> },
    #[serde(rename = "events_api")]
    EventsApi { payload: Value },
    #[serde(rename = "slash_commands")]
    SlashCommands { payload: Value },
    #[serde(rename = "interactive")]
    Interactive { payload: Value },
    #[serde(rename = "ping")]
    Ping { id: Option<Value> },
    #[serde(rename = "pong")]
    Pong { id: Option<Value> },
}

impl Frame {
    pub fn dispatch_type(&self) -> Option<&'static str> {
        match self {
            Frame::EventsApi { payload } => Some(
                payload
                    .get("event")
                    .and_then(|e| e.get("type"))
                    .and_then(Value::as_str)
                    .map(leak_static)
                    .unwrap_or("events_api"),
            ),
            Frame::SlashCommands { .. } => Some("slash_commands"),
            Frame::Interactive { payload } => Some(
                payload
                    .get("type")
                    .and_then(Value::as_str)
                    .map(leak_static)
                    .unwrap_or("interactive"),
            ),
            _ => None,
        }
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            Frame::EventsApi { payload }
            | Frame::SlashCommands { payload }
            | Frame::Interactive { payload } => Some(payload),
            _ => None,
        }
    }

    pub fn is_dispatchable(&self) -> bool {
        matches!(
            self,
            Frame::EventsApi { .. } | Frame::SlashCommands { .. } | Frame::Interactive { .. }
        )
    }
}

/// Interns a small, bounded set of dispatch-type strings so
/// `dispatch_type` can return `&'static str` without re-allocating on
/// every frame; Slack's event vocabulary is closed and small enough
/// that leaking once per distinct value is bounded.
fn leak_static(s: &str) -> &'static str {
    match s {
        "message" => "message",
        "app_mention" => "app_mention",
        "member_joined_channel" => "member_joined_channel",
        "member_left_channel" => "member_left_channel",
        "channel_left" => "channel_left",
        "channel_joined" => "channel_joined",
        "team_join" => "team_join",
        "user_change" => "user_change",
        "shortcut" => "shortcut",
        "message_action" => "message_action",
        "block_suggestion" => "block_suggestion",
        "workflow_step_edit" => "workflow_step_edit",
        "workflow_step_execute" => "workflow_step_execute",
        "view_submission" => "view_submission",
        "block_actions" => "block_actions",
        other => Box::leak(other.to_string().into_boxed_str()),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AckFrame<'a> {
    pub envelope_id: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_events_api_envelope() {
        let raw = serde_json::json!({
            "type": "events_api",
            "envelope_id": "E1",
            "payload": {"event": {"type": "message", "text": "hi"}}
        });
        let env: Envelope = serde_json::from_value(raw).unwrap();
        assert_eq!(env.envelope_id.as_deref(), Some("E1"));
        assert_eq!(env.frame.dispatch_type(), Some("message"));
    }

    #[test]
    fn ping_has_no_dispatch_type() {
        let raw = serde_json::json!({"type": "ping", "id": 1});
        let env: Envelope = serde_json::from_value(raw).unwrap();
        assert!(env.frame.dispatch_type().is_none());
        assert!(!env.frame.is_dispatchable());
    }
}
