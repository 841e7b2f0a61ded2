//! Sanitization of telemetry payloads.
//!
//! Devices on the bus are not trusted to send clean numbers: fields go missing, arrive
//! as strings, or come through as `null`. Everything that reaches the store passes
//! through [`sanitize`], which always yields a finite value rounded to six decimals.
use serde_json::{Map, Value};
use thiserror::Error;

use crate::records::{ActuatorReadings, SensorErrors, SensorReading};

/// Scale factor for six decimal digits of precision.
const PRECISION: f64 = 1_000_000.0;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{block} must be a JSON object")]
    NotAnObject { block: &'static str },
}

/// Round a value to six decimal places.
/// Values too large to scale are already beyond that precision and come back unchanged.
pub fn round_to_precision(value: f64) -> f64 {
    let scaled = (value * PRECISION).round();
    if scaled.is_finite() {
        scaled / PRECISION
    } else {
        value
    }
}

/// Parse a JSON number or numeric string, rejecting anything non-finite.
pub fn parse_finite(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    parsed.filter(|v| v.is_finite())
}

/// Coerce any JSON value into a finite, rounded number. Never fails: input that cannot
/// be read as a number becomes 0.
pub fn sanitize(value: &Value) -> f64 {
    match parse_finite(value) {
        Some(number) => round_to_precision(number),
        None => {
            if !value.is_null() {
                tracing::debug!("replacing non-numeric value {} with 0", value);
            }
            0.0
        }
    }
}

fn as_object<'a>(
    value: &'a Value,
    block: &'static str,
) -> Result<&'a Map<String, Value>, ValidationError> {
    value
        .as_object()
        .ok_or(ValidationError::NotAnObject { block })
}

fn field(object: &Map<String, Value>, name: &str) -> f64 {
    match object.get(name) {
        Some(value) => sanitize(value),
        None => {
            tracing::debug!(field = name, "missing field, defaulting to 0");
            0.0
        }
    }
}

pub fn validate_sensor_data(value: &Value) -> Result<SensorReading, ValidationError> {
    let sensors = as_object(value, "sensors")?;

    Ok(SensorReading {
        ph: field(sensors, "ph"),
        temp: field(sensors, "temp"),
        ch4: field(sensors, "ch4"),
        pressure: field(sensors, "pressure"),
    })
}

pub fn validate_sensor_errors(value: &Value) -> Result<SensorErrors, ValidationError> {
    let errors = as_object(value, "sensor_errors")?;

    Ok(SensorErrors {
        ph_error: field(errors, "ph_error"),
        ph_delta_error: field(errors, "ph_delta_error"),
        temp_error: field(errors, "temp_error"),
        temp_delta_error: field(errors, "temp_delta_error"),
    })
}

pub fn validate_actuator_data(value: &Value) -> Result<ActuatorReadings, ValidationError> {
    let actuators = as_object(value, "actuators")?;

    Ok(ActuatorReadings {
        pump_base: field(actuators, "pump_base"),
        pump_acid: field(actuators, "pump_acid"),
        heater: field(actuators, "heater"),
        solenoid: field(actuators, "solenoid"),
        stirrer: field(actuators, "stirrer"),
    })
}
