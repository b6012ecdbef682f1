//! Prometheus metrics exposition
//!
//! - `gateway_requests_total` (counter): labels `status`, `method`
//! - `gateway_request_duration_seconds` (histogram): label `status`
//! - `gateway_upstream_errors_total` (counter): label `error_type`
//!
//! The session layer adds `guard_decisions_total`, `session_refreshes_total`
//! and `callback_outcomes_total` through the same recorder.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Bucket boundaries from 5ms to 60s, matching the upstream timeout range.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("gateway_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `gateway_request_duration_seconds` gets explicit buckets so it renders as a
/// histogram (`_bucket` lines) rather than a summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed request with status code and HTTP method labels.
pub fn record_request(status: u16, method: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!(
        "gateway_requests_total",
        "status" => status_str.clone(),
        "method" => method.to_string()
    )
    .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record an upstream forwarding error with a classification label.
pub fn record_upstream_error(error_type: &'static str) {
    metrics::counter!("gateway_upstream_errors_total", "error_type" => error_type).increment(1);
}

#[cfg(test)]
pub fn test_handle() -> PrometheusHandle {
    builder()
        .expect("failed to set histogram buckets")
        .build_recorder()
        .handle()
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_request(200, "GET", 0.05);
        record_upstream_error("timeout");
    }

    /// Isolated recorder/handle pair; install_recorder() is a process-wide
    /// singleton and panics on a second call.
    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = builder()
            .expect("failed to set histogram buckets")
            .build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_request_increments_counter_and_histogram() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request(200, "GET", 0.042);
        record_request(303, "POST", 1.5);

        let output = handle.render();
        assert!(output.contains("gateway_requests_total"));
        assert!(output.contains("status=\"200\""));
        assert!(output.contains("method=\"GET\""));
        assert!(output.contains("status=\"303\""));
        assert!(output.contains("method=\"POST\""));
        assert!(
            output.contains("gateway_request_duration_seconds_bucket"),
            "histogram must render _bucket lines for histogram_quantile() queries"
        );
        assert!(output.contains("le=\"0.005\""));
        assert!(output.contains("le=\"60\""));
    }

    #[test]
    fn record_upstream_error_increments_counter_with_label() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_upstream_error("timeout");
        record_upstream_error("connection");

        let output = handle.render();
        assert!(output.contains("gateway_upstream_errors_total"));
        assert!(output.contains("error_type=\"timeout\""));
        assert!(output.contains("error_type=\"connection\""));
    }
}
