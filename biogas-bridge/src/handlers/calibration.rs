use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use biogas_common::records::{CalibrationLog, CalibrationRequest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::CalibrationError;

use super::AppState;

/// Values are kept raw so that numeric strings are accepted and a missing field
/// reports the same error as an invalid one.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrateBody {
    #[serde(default)]
    reference_ph: Value,
    #[serde(default)]
    current_ph: Value,
}

#[derive(Debug, Serialize)]
pub struct CalibrateResponse {
    success: bool,
    message: &'static str,
    data: CalibrationRequest,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationStatusData {
    is_calibrating: bool,
    last_calibration: Option<CalibrationLog>,
    pending_calibration: Option<CalibrationRequest>,
    mqtt_connected: bool,
}

#[derive(Debug, Serialize)]
pub struct CalibrationStatusResponse {
    success: bool,
    data: CalibrationStatusData,
}

// Parsed by hand: a malformed body must still get the `{success, error}` envelope.
pub async fn calibrate(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<CalibrateResponse>, CalibrationError> {
    let body: CalibrateBody = serde_json::from_slice(&body).map_err(|err| {
        debug!("rejecting calibration request body: {}", err);
        CalibrationError::MalformedBody
    })?;

    let request = state
        .calibrator
        .calibrate(&body.reference_ph, &body.current_ph)
        .await?;

    Ok(Json(CalibrateResponse {
        success: true,
        message: "pH calibration offset published",
        data: request,
    }))
}

pub async fn calibration_status(State(state): State<AppState>) -> Json<CalibrationStatusResponse> {
    let status = state.calibrator.status();

    Json(CalibrationStatusResponse {
        success: true,
        data: CalibrationStatusData {
            is_calibrating: status.in_progress,
            last_calibration: status.last_calibration,
            pending_calibration: status.pending,
            mqtt_connected: status.bus_connected,
        },
    })
}
