//! Ingestion of inbound bus messages.
//!
//! Messages are handled one at a time in arrival order. A message that cannot be handled
//! is logged and counted, then the pipeline moves on: there is no retry and no
//! dead-letter queue.
use std::sync::Arc;

use biogas_common::metrics::{report_dropped, report_inserted, report_received, report_store_error};
use biogas_common::records::{CalibrationOutcome, SensorId};
use biogas_common::store::{Store, StoreError};
use biogas_common::validation::{
    validate_actuator_data, validate_sensor_data, validate_sensor_errors,
};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bus::InboundMessage;
use crate::config::Topics;
use crate::correlation::Correlation;
use crate::error::IngestError;

pub struct Pipeline {
    store: Arc<dyn Store>,
    correlation: Arc<Correlation>,
    topics: Topics,
}

impl Pipeline {
    pub fn new(store: Arc<dyn Store>, correlation: Arc<Correlation>, topics: Topics) -> Self {
        Self {
            store,
            correlation,
            topics,
        }
    }

    /// Consume the bus channel until the supervisor drops its sender.
    pub async fn run(self, mut inbound: mpsc::Receiver<InboundMessage>) {
        while let Some(message) = inbound.recv().await {
            self.handle(&message.topic, &message.payload).await;
        }
        info!("inbound channel closed, ingestion stopped");
    }

    /// Process one message. Failures are logged and counted, never returned.
    pub async fn handle(&self, topic: &str, payload: &[u8]) {
        report_received(topic);

        if let Err(err) = self.process(topic, payload).await {
            match &err {
                IngestError::MalformedJson(_) => warn!(
                    topic,
                    payload = %String::from_utf8_lossy(payload),
                    "dropping message: {}", err
                ),
                IngestError::Store(_) => error!(topic, "failed to persist message: {}", err),
                _ => warn!(topic, "dropping message: {}", err),
            }
            report_dropped(err.reason());
        }
    }

    async fn process(&self, topic: &str, payload: &[u8]) -> Result<(), IngestError> {
        let message: Value = serde_json::from_slice(payload)?;

        if topic == self.topics.sensors {
            self.handle_sensors(&message).await
        } else if topic == self.topics.control {
            self.handle_control(&message).await
        } else if topic == self.topics.calibration_response {
            self.handle_calibration_response(message).await;
            Ok(())
        } else {
            Err(IngestError::UnknownTopic(topic.to_owned()))
        }
    }

    async fn handle_sensors(&self, message: &Value) -> Result<(), IngestError> {
        if self.correlation.warmup_active() {
            info!("warmup active, skipping sensor data");
            return Ok(());
        }

        let sensors = message
            .get("sensors")
            .ok_or(IngestError::MissingBlock("sensors"))?;
        let reading = validate_sensor_data(sensors)?;

        let errors = match message.get("sensor_errors") {
            None => None,
            Some(block) => match validate_sensor_errors(block) {
                Ok(errors) => Some(errors),
                Err(err) => {
                    warn!("skipping sensor_errors block: {}", err);
                    None
                }
            },
        };

        let sensor_id = self
            .store
            .insert_sensor_reading(&reading)
            .await
            .map_err(|err| store_failure("insert_sensor_reading", err))?;
        report_inserted("sensor_data");
        self.correlation.set_latest_sensor_id(sensor_id);
        debug!(sensor_id, "stored sensor reading");

        if let Some(errors) = errors {
            self.store
                .insert_sensor_errors(&errors.for_sensor(sensor_id))
                .await
                .map_err(|err| store_failure("insert_sensor_errors", err))?;
            report_inserted("sensor_errors");
        }

        Ok(())
    }

    async fn handle_control(&self, message: &Value) -> Result<(), IngestError> {
        if let Some(flag) = message.get("system").and_then(|s| s.get("warmup_active")) {
            let active = flag.as_f64() == Some(1.0);
            let previous = self.correlation.set_warmup_active(active);
            if previous != active {
                info!(warmup_active = active, "warmup mode changed");
            }
        }

        let Some(actuators) = message.get("actuators") else {
            return Ok(());
        };
        if self.correlation.warmup_active() {
            info!("warmup active, skipping actuator data");
            return Ok(());
        }

        let readings = validate_actuator_data(actuators)?;
        let sensor_id = self
            .resolve_sensor_id()
            .await?
            .ok_or(IngestError::NoSensorReading)?;

        self.store
            .insert_actuator_state(&readings.for_sensor(sensor_id))
            .await
            .map_err(|err| store_failure("insert_actuator_state", err))?;
        report_inserted("actuator_data");

        Ok(())
    }

    /// The cached id of the latest reading, falling back to asking the store.
    async fn resolve_sensor_id(&self) -> Result<Option<SensorId>, IngestError> {
        if let Some(id) = self.correlation.latest_sensor_id() {
            return Ok(Some(id));
        }

        let latest = self
            .store
            .latest_sensor_id()
            .await
            .map_err(|err| store_failure("latest_sensor_id", err))?;
        if let Some(id) = latest {
            self.correlation.set_latest_sensor_id(id);
        }
        Ok(latest)
    }

    async fn handle_calibration_response(&self, response: Value) {
        let succeeded = response.get("success").is_some_and(is_truthy)
            || response.get("status").and_then(Value::as_str) == Some("success");
        let outcome = if succeeded {
            CalibrationOutcome::Success
        } else {
            CalibrationOutcome::Failed
        };

        let log = self
            .correlation
            .complete_calibration(outcome, response, Utc::now());
        info!(outcome = outcome.as_str(), offset = ?log.offset, "calibration finished");

        match self.store.insert_calibration_log(&log).await {
            Ok(()) => report_inserted("calibration_logs"),
            Err(err) => {
                report_store_error("insert_calibration_log");
                error!("failed to persist calibration log: {}", err);
            }
        }
    }
}

fn store_failure(operation: &'static str, error: StoreError) -> IngestError {
    report_store_error(operation);
    IngestError::Store(error)
}

/// Loose truthiness, as devices report `success` as a bool, a number or a string.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
