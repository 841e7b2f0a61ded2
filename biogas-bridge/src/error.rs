use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use biogas_common::store::StoreError;
use biogas_common::validation::ValidationError;
use serde::Serialize;
use thiserror::Error;

/// Enumeration of errors related to the MQTT connection.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("invalid broker url: {0}")]
    InvalidUrl(String),
    #[error("failed to configure tls: {0}")]
    Tls(String),
    #[error("mqtt client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("not connected to the broker")]
    Disconnected,
    #[error("timed out waiting for the broker to acknowledge a publish")]
    Timeout,
}

/// Enumeration of reasons a single bus message was not (fully) processed.
/// These never leave the pipeline: they are logged and counted.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("payload is not valid JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),
    #[error("payload is missing the {0} block")]
    MissingBlock(&'static str),
    #[error("invalid payload: {0}")]
    Invalid(#[from] ValidationError),
    #[error("store operation failed: {0}")]
    Store(#[from] StoreError),
    #[error("no sensor reading available to link to")]
    NoSensorReading,
    #[error("message on unrecognized topic {0}")]
    UnknownTopic(String),
}

impl IngestError {
    /// Label used for the dropped-messages counter.
    pub fn reason(&self) -> &'static str {
        match self {
            IngestError::MalformedJson(_) => "malformed_json",
            IngestError::MissingBlock(_) => "missing_block",
            IngestError::Invalid(_) => "invalid_payload",
            IngestError::Store(_) => "store_error",
            IngestError::NoSensorReading => "no_sensor_reading",
            IngestError::UnknownTopic(_) => "unknown_topic",
        }
    }
}

/// Enumeration of errors returned to callers of the calibration endpoint.
#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("request body is not a valid JSON object")]
    MalformedBody,
    #[error("referencePh and currentPh are required and must be finite numbers")]
    InvalidInput,
    #[error("a calibration is already in progress")]
    InProgress,
    #[error("the MQTT broker is not connected")]
    BusUnavailable,
    #[error("failed to publish the calibration offset")]
    PublishFailed(#[source] BusError),
    #[error("calibration was interrupted")]
    Aborted,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl IntoResponse for CalibrationError {
    fn into_response(self) -> Response {
        let status = match self {
            CalibrationError::MalformedBody | CalibrationError::InvalidInput => {
                StatusCode::BAD_REQUEST
            }
            CalibrationError::InProgress => StatusCode::CONFLICT,
            CalibrationError::BusUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            CalibrationError::PublishFailed(_) | CalibrationError::Aborted => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        // Display only: the source chain stays in the logs.
        let body = ErrorResponse {
            success: false,
            error: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}
