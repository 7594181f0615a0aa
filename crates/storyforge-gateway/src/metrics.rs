//! Prometheus metrics recording and endpoint.

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use storyforge_core::protocol::{EventType, StreamingEvent};

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Record a finished HTTP request with its duration.
pub fn record_request(route: &str, duration_secs: f64) {
    let labels = [("route", route.to_string())];
    metrics::counter!("agent_requests_total", &labels).increment(1);
    metrics::histogram!("agent_request_duration_seconds", &labels).record(duration_secs);
}

/// Record a request rejected because the gate was held.
pub fn record_gate_busy(route: &str) {
    let labels = [("route", route.to_string())];
    metrics::counter!("gate_busy_total", &labels).increment(1);
}

pub fn record_run_start() {
    metrics::gauge!("agent_runs_active").increment(1.0);
}

pub fn record_run_end() {
    metrics::gauge!("agent_runs_active").decrement(1.0);
}

/// Record an error of a given kind.
pub fn record_error(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("errors_total", &labels).increment(1);
}

/// Count an in-band `error` event relayed to a client, by its kind.
pub fn record_error_event(event: &StreamingEvent) {
    if event.event_type == EventType::Error {
        record_error(event.metadata["kind"].as_str().unwrap_or("unknown"));
    }
}
