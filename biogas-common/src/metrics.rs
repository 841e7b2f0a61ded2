use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Install the global Prometheus recorder. Can only succeed once per process.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()
}

/// Middleware to record request counts and latencies per route.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };
    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];

    metrics::counter!("biogas_http_requests_total", &labels).increment(1);
    metrics::histogram!("biogas_http_requests_duration_seconds", &labels).record(latency);

    response
}

pub fn report_received(topic: &str) {
    metrics::counter!("biogas_messages_received_total", "topic" => topic.to_owned()).increment(1);
}

pub fn report_dropped(reason: &'static str) {
    metrics::counter!("biogas_messages_dropped_total", "reason" => reason).increment(1);
}

pub fn report_inserted(table: &'static str) {
    metrics::counter!("biogas_records_inserted_total", "table" => table).increment(1);
}

pub fn report_store_error(operation: &'static str) {
    metrics::counter!("biogas_store_errors_total", "operation" => operation).increment(1);
}
