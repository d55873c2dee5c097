//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

pub fn record_ws_connect() {
    metrics::gauge!("ws_connections_active").increment(1.0);
}

pub fn record_ws_disconnect() {
    metrics::gauge!("ws_connections_active").decrement(1.0);
}

/// Record an inbound event with its handling duration.
pub fn record_event(event: &str, duration_secs: f64) {
    let labels = [("event", event.to_string())];
    metrics::counter!("ws_events_total", &labels).increment(1);
    metrics::histogram!("ws_event_duration_seconds", &labels).record(duration_secs);
}

/// Record a broadcast fan-out.
pub fn record_broadcast(event: &str) {
    let labels = [("event", event.to_string())];
    metrics::counter!("ws_broadcasts_total", &labels).increment(1);
}

/// Record an error of a given kind.
pub fn record_error(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("errors_total", &labels).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_prometheus_recorder() {
        // One recorder per process; a second install in the same binary errors.
        if let Ok(handle) = install_prometheus_recorder() {
            let output = handle.render();
            assert!(output.is_empty() || output.contains("# "));
        }
    }

    #[test]
    fn test_recording_without_recorder() {
        record_event("register-role", 0.002);
        record_broadcast("voiceMembers");
        record_error("malformed_payload");
        record_ws_connect();
        record_ws_disconnect();
    }
}
