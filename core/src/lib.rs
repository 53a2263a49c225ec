//! Resilient Slack Socket Mode bot runtime.
//!
//! Wires a supervised WebSocket connection, an ack-before-dispatch
//! ingest pipeline, a TTL-bounded dedupe buffer, two cooperating rate
//! limiters, a metadata cache with background sync, and a diagnostics
//! ring buffer into one [`instance::Instance`].

pub mod backoff;
pub mod cache;
pub mod config;
pub mod connection;
pub mod diagnostics;
pub mod envelope;
pub mod error;
pub mod event_buffer;
pub mod handler;
pub mod health;
pub mod instance;
pub mod limiter;
pub mod scope;
pub mod sync;
pub mod tier;
pub mod transport;
pub mod webapi;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use config::Config;
pub use handler::{DispatchContext, DispatchOutcome, FnHandler, Handler};
pub use instance::Instance;
