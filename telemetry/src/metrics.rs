use metrics::Label;

use crate::context::TelemetryLabels;

pub fn record_counter(name: &'static str, value: u64, labels: &TelemetryLabels) {
    metrics::counter!(name, &tags_to_metrics(labels)).increment(value);
}

pub fn record_gauge(name: &'static str, value: f64, labels: &TelemetryLabels) {
    metrics::gauge!(name, &tags_to_metrics(labels)).set(value);
}

pub fn record_histogram(name: &'static str, value: f64, labels: &TelemetryLabels) {
    metrics::histogram!(name, &tags_to_metrics(labels)).record(value);
}

fn tags_to_metrics(labels: &TelemetryLabels) -> Vec<Label> {
    labels
        .tags()
        .into_iter()
        .map(|(k, v)| Label::new(k, v))
        .collect()
}
