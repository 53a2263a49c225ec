use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryProtocol {
    Grpc,
    HttpProtobuf,
}

/// Logging and tracing configuration for one bot instance.
///
/// Built either via [`TelemetryConfig::from_env`] (reading the
/// `{PREFIX}_*` variables documented on the instance's `Config`) or by
/// constructing the struct directly for tests.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub endpoint: String,
    pub protocol: TelemetryProtocol,
    pub service_name: String,
    pub service_version: String,
    pub json_logs: bool,
    pub otel_enabled: bool,
}

impl TelemetryConfig {
    pub fn from_env(prefix: &str) -> Self {
        let var = |suffix: &str| env::var(format!("{prefix}_{suffix}"));

        let endpoint = var("OTEL_ENDPOINT").unwrap_or_default();
        let protocol = var("OTEL_PROTOCOL")
            .map(|v| match v.to_lowercase().as_str() {
                "http" | "http/protobuf" => TelemetryProtocol::HttpProtobuf,
                _ => TelemetryProtocol::Grpc,
            })
            .unwrap_or(TelemetryProtocol::Grpc);
        let service_name = var("SERVICE_NAME").unwrap_or_else(|_| prefix.to_lowercase());
        let service_version =
            var("SERVICE_VERSION").unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string());
        let json_logs = var("LOG_FORMAT")
            .map(|v| !matches!(v.to_lowercase().as_str(), "text" | "pretty" | "plain"))
            .unwrap_or(true);
        let otel_flag = var("OTEL_ENABLED")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
        let otel_enabled = otel_flag && !endpoint.trim().is_empty();

        Self {
            endpoint,
            protocol,
            service_name,
            service_version,
            json_logs,
            otel_enabled,
        }
    }

    pub fn exporter_enabled(&self) -> bool {
        self.otel_enabled && !self.endpoint.trim().is_empty()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            protocol: TelemetryProtocol::Grpc,
            service_name: "boltframe".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            json_logs: true,
            otel_enabled: false,
        }
    }
}
