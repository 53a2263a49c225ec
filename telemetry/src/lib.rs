//! Logging, tracing and metrics helpers shared by every boltframe actor.

pub mod config;
pub mod context;
pub mod metrics;
pub mod tracing_init;

pub use config::{TelemetryConfig, TelemetryProtocol};
pub use context::TelemetryLabels;
pub use tracing_init::{init, otel_enabled};

#[macro_export]
macro_rules! counter {
    ($name:expr, $labels:expr) => {
        $crate::metrics::record_counter($name, 1, $labels)
    };
    ($name:expr, $value:expr, $labels:expr) => {
        $crate::metrics::record_counter($name, $value, $labels)
    };
}

#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr, $labels:expr) => {
        $crate::metrics::record_gauge($name, $value, $labels)
    };
}

#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr, $labels:expr) => {
        $crate::metrics::record_histogram($name, $value, $labels)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telemetry_config_defaults_disabled() {
        let cfg = TelemetryConfig::default();
        assert!(!cfg.exporter_enabled());
    }

    #[test]
    fn labels_tags_include_instance_and_component() {
        let labels = TelemetryLabels::new("bot-1", "tier_limiter").with_key("chat.postMessage");
        let tags = labels.tags();
        assert!(tags.contains(&("instance".to_string(), "bot-1".to_string())));
        assert!(tags.contains(&("component".to_string(), "tier_limiter".to_string())));
        assert!(tags.contains(&("key".to_string(), "chat.postMessage".to_string())));
    }
}
