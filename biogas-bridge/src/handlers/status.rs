use axum::extract::State;
use axum::Json;
use biogas_common::records::SensorId;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bus::ConnectionState;
use crate::config::Topics;

use super::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    status: &'static str,
    mqtt_connected: bool,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    mqtt_state: ConnectionState,
    mqtt_connected: bool,
    warmup_active: bool,
    latest_sensor_id: Option<SensorId>,
    calibration_in_progress: bool,
    topics: Topics,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugInfo {
    #[serde(flatten)]
    status: BridgeStatus,
    store_backend: &'static str,
    broker: String,
    timestamp: DateTime<Utc>,
}

/// Liveness only: the bridge stays up while the broker is away, so this is always 200.
pub async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        mqtt_connected: state.publisher.is_connected(),
        timestamp: Utc::now(),
    })
}

fn bridge_status(state: &AppState) -> BridgeStatus {
    let snapshot = state.correlation.snapshot();
    let mqtt_state = state.publisher.connection_state();

    BridgeStatus {
        mqtt_state,
        mqtt_connected: mqtt_state == ConnectionState::Connected,
        warmup_active: snapshot.warmup_active,
        latest_sensor_id: snapshot.latest_sensor_id,
        calibration_in_progress: snapshot.calibration_in_progress,
        topics: state.topics.clone(),
    }
}

pub async fn status(State(state): State<AppState>) -> Json<BridgeStatus> {
    Json(bridge_status(&state))
}

pub async fn debug(State(state): State<AppState>) -> Json<DebugInfo> {
    Json(DebugInfo {
        status: bridge_status(&state),
        store_backend: state.store_backend.as_str(),
        broker: state.broker.clone(),
        timestamp: Utc::now(),
    })
}
