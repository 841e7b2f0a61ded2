use std::future::ready;
use std::sync::Arc;

use axum::{routing, Router};
use biogas_common::metrics::track_metrics;
use biogas_common::store::StoreBackend;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use crate::bus::Publisher;
use crate::calibration::Calibrator;
use crate::config::Topics;
use crate::correlation::Correlation;

use super::{calibration, status};

#[derive(Clone)]
pub struct AppState {
    pub calibrator: Calibrator,
    pub correlation: Arc<Correlation>,
    pub publisher: Arc<dyn Publisher>,
    pub topics: Topics,
    pub store_backend: StoreBackend,
    /// `host:port` only. Credentials never reach the HTTP surface.
    pub broker: String,
}

pub fn app(state: AppState, metrics: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/", routing::get(index))
        .route("/health", routing::get(status::health))
        .route("/api/status", routing::get(status::status))
        .route("/debug", routing::get(status::debug))
        .route("/api/calibrate-ph", routing::post(calibration::calibrate))
        .route(
            "/api/calibration-status",
            routing::get(calibration::calibration_status),
        )
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // The recorder is process-global: main installs it once, tests never do.
    if let Some(recorder_handle) = metrics {
        router.route("/metrics", routing::get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}

pub async fn index() -> &'static str {
    "biogas bridge"
}
