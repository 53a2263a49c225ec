//! Crate-wide error taxonomy.
//!
//! Each behavioral failure kind described by the runtime is one
//! `thiserror` variant rather than a stringly-typed error, mirroring
//! the way the rest of this codebase layers a named code, an optional
//! retry hint, and an optional source error.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("backoff min_ms ({min_ms}) must be <= max_ms ({max_ms})")]
    InvalidBackoffWindow { min_ms: u64, max_ms: u64 },

    #[error("jitter_ratio must be within [0, 1], got {0}")]
    InvalidJitterRatio(f64),

    #[error("missing required option: {name}")]
    MissingOption { name: &'static str },

    #[error("cache_sync.kinds must be non-empty when cache_sync is enabled")]
    EmptySyncKinds,

    #[error("duration option {name} must be positive, got {value}ms")]
    NonPositiveDuration { name: &'static str, value: i64 },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[source] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[source] tokio_tungstenite::tungstenite::Error),

    #[error("failed to decode frame: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("connection closed by peer")]
    ClosedByPeer,
}

#[derive(Debug, Error)]
pub enum SlackApiError {
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("slack error: {code}")]
    Slack { code: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("http error: {0}")]
    Http(#[source] reqwest::Error),
}

impl SlackApiError {
    pub fn is_fatal_auth(&self) -> bool {
        matches!(
            self,
            SlackApiError::Slack { code }
                if matches!(code.as_str(), "invalid_auth" | "account_inactive" | "not_authed" | "token_revoked")
        )
    }
}

#[derive(Debug, Error)]
#[error("handler failed: {source}")]
pub struct HandlerError {
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync>,
}

impl HandlerError {
    pub fn new(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    SlackApi(#[from] SlackApiError),

    #[error("reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },

    #[error("adapter {name} failed startup probe: {reason}")]
    AdapterProbeFailed { name: &'static str, reason: String },
}
