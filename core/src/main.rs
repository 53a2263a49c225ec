use std::sync::Arc;

use boltframe_core::{Config, FnHandler, Instance};
use boltframe_telemetry::TelemetryConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env("BOLTFRAME")?;
    boltframe_telemetry::init(TelemetryConfig::from_env("BOLTFRAME"))?;

    let handler = Arc::new(FnHandler(|kind: &str, payload, _ctx| {
        let kind = kind.to_string();
        async move {
            tracing::info!(kind = %kind, ?payload, "dispatch");
            boltframe_core::DispatchOutcome::Ok
        }
    }));

    let instance = Instance::start("default", config, handler).await?;

    tokio::signal::ctrl_c().await?;
    instance.stop();
    Ok(())
}
