use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier the store assigns to an inserted `SensorReading`.
pub type SensorId = i64;

/// A sanitized reading from the `sensors` block of a sensor message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub ph: f64,
    pub temp: f64,
    pub ch4: f64,
    pub pressure: f64,
}

/// A sanitized `sensor_errors` block, not yet tied to a stored reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorErrors {
    pub ph_error: f64,
    pub ph_delta_error: f64,
    pub temp_error: f64,
    pub temp_delta_error: f64,
}

impl SensorErrors {
    /// Attach these margins to the reading they were reported with.
    pub fn for_sensor(self, sensor_id: SensorId) -> SensorErrorMargin {
        SensorErrorMargin {
            sensor_id,
            errors: self,
        }
    }
}

/// Error margins of a stored sensor reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorErrorMargin {
    pub sensor_id: SensorId,
    #[serde(flatten)]
    pub errors: SensorErrors,
}

/// A sanitized `actuators` block, not yet correlated with a sensor reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ActuatorReadings {
    pub pump_base: f64,
    pub pump_acid: f64,
    pub heater: f64,
    pub solenoid: f64,
    pub stirrer: f64,
}

impl ActuatorReadings {
    pub fn for_sensor(self, sensor_id: SensorId) -> ActuatorState {
        ActuatorState {
            sensor_id,
            readings: self,
        }
    }
}

/// Actuator state as persisted, linked to the sensor reading that was most recent
/// when it arrived.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActuatorState {
    pub sensor_id: SensorId,
    #[serde(flatten)]
    pub readings: ActuatorReadings,
}

/// A calibration offset that has been published and is waiting for a response.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationRequest {
    pub reference_ph: f64,
    pub current_ph: f64,
    pub offset: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationOutcome {
    Success,
    Failed,
    Timeout,
}

impl CalibrationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalibrationOutcome::Success => "success",
            CalibrationOutcome::Failed => "failed",
            CalibrationOutcome::Timeout => "timeout",
        }
    }
}

/// The end of a calibration: either the device answered or we gave up waiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationLog {
    pub reference_ph: Option<f64>,
    pub current_ph: Option<f64>,
    pub offset: Option<f64>,
    pub outcome: CalibrationOutcome,
    pub success: bool,
    /// Raw response payload; null when the calibration timed out.
    pub response: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl CalibrationLog {
    pub fn new(
        pending: Option<&CalibrationRequest>,
        outcome: CalibrationOutcome,
        response: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            reference_ph: pending.map(|p| p.reference_ph),
            current_ph: pending.map(|p| p.current_ph),
            offset: pending.map(|p| p.offset),
            outcome,
            success: outcome == CalibrationOutcome::Success,
            response,
            timestamp,
        }
    }
}
