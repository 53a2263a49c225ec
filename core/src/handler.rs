//! The host-supplied collaborator that receives dispatched events.

use async_trait::async_trait;
use serde_json::Value;

use crate::config::Config;
use crate::envelope::Envelope;

#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub config: Config,
    pub envelope: Envelope,
    pub assigns: Value,
}

#[derive(Debug)]
pub enum DispatchOutcome {
    Ok,
    Error(Box<dyn std::error::Error + Send + Sync>),
    Halted(Value),
    /// The dispatch future panicked; carries the panic message. Never
    /// returned by a `Handler` impl directly — `connection.rs` produces
    /// this from a caught panic so dispatch failures always surface
    /// through the same outcome type.
    Exception(String),
}

/// Opaque routing collaborator; the core only ever calls `dispatch`.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn dispatch(&self, kind: &str, payload: Value, ctx: DispatchContext) -> DispatchOutcome;
}

/// Closure-backed handler for hosts that don't need the full trait
/// ceremony, mirroring this codebase's closure-based in-memory test
/// clients for its other collaborator traits.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(&str, Value, DispatchContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = DispatchOutcome> + Send,
{
    async fn dispatch(&self, kind: &str, payload: Value, ctx: DispatchContext) -> DispatchOutcome {
        (self.0)(kind, payload, ctx).await
    }
}
