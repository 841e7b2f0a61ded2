use std::str::FromStr;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

use crate::records::{
    ActuatorState, CalibrationLog, SensorErrorMargin, SensorId, SensorReading,
};

/// Enumeration of errors for operations against a record store.
/// Errors originate from the backend client and are wrapped to record which operation failed.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{operation} query failed with: {error}")]
    QueryError {
        operation: &'static str,
        error: sqlx::Error,
    },
    #[error("{operation} request failed with: {error}")]
    RequestError {
        operation: &'static str,
        error: reqwest::Error,
    },
    #[error("{operation} returned an unexpected response: {reason}")]
    UnexpectedResponse {
        operation: &'static str,
        reason: String,
    },
    #[error("invalid store url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Insert and query capability over the bridge's record stores.
#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a reading and return the identifier the store assigned to it.
    async fn insert_sensor_reading(&self, reading: &SensorReading) -> StoreResult<SensorId>;
    async fn insert_sensor_errors(&self, margin: &SensorErrorMargin) -> StoreResult<()>;
    async fn insert_actuator_state(&self, state: &ActuatorState) -> StoreResult<()>;
    /// Identifier of the most recently created sensor reading, if there is one.
    async fn latest_sensor_id(&self) -> StoreResult<Option<SensorId>>;
    async fn insert_calibration_log(&self, log: &CalibrationLog) -> StoreResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Rest,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "postgres" => Ok(StoreBackend::Postgres),
            "rest" => Ok(StoreBackend::Rest),
            "memory" => Ok(StoreBackend::Memory),
            _ => Err(format!(
                "unknown store backend: {s}, must be postgres, rest or memory"
            )),
        }
    }
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Postgres => "postgres",
            StoreBackend::Rest => "rest",
            StoreBackend::Memory => "memory",
        }
    }
}

/// A store call as observed by `MemoryStore`, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOperation {
    SensorReading(SensorId, SensorReading),
    SensorErrors(SensorErrorMargin),
    ActuatorState(ActuatorState),
    LatestSensorQuery,
    CalibrationLog(CalibrationLog),
}

/// A store that keeps everything in process memory and logs each write.
///
/// Every call is kept for the life of the process and nothing is ever evicted, so this
/// backend is only meant for tests and short local runs without a database.
#[derive(Default)]
pub struct MemoryStore {
    operations: Mutex<Vec<StoreOperation>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call made so far, oldest first.
    pub fn operations(&self) -> Vec<StoreOperation> {
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, operation: StoreOperation) {
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(operation);
    }

    fn readings(&self) -> impl Iterator<Item = SensorId> {
        self.operations()
            .into_iter()
            .filter_map(|operation| match operation {
                StoreOperation::SensorReading(id, _) => Some(id),
                _ => None,
            })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_sensor_reading(&self, reading: &SensorReading) -> StoreResult<SensorId> {
        let mut operations = self
            .operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let id = operations
            .iter()
            .filter(|operation| matches!(operation, StoreOperation::SensorReading(..)))
            .count() as SensorId
            + 1;
        operations.push(StoreOperation::SensorReading(id, *reading));

        tracing::info!(id, "sensor reading: {:?}", reading);
        Ok(id)
    }

    async fn insert_sensor_errors(&self, margin: &SensorErrorMargin) -> StoreResult<()> {
        tracing::info!("sensor error margin: {:?}", margin);
        self.record(StoreOperation::SensorErrors(*margin));
        Ok(())
    }

    async fn insert_actuator_state(&self, state: &ActuatorState) -> StoreResult<()> {
        tracing::info!("actuator state: {:?}", state);
        self.record(StoreOperation::ActuatorState(*state));
        Ok(())
    }

    async fn latest_sensor_id(&self) -> StoreResult<Option<SensorId>> {
        let latest = self.readings().last();
        self.record(StoreOperation::LatestSensorQuery);
        Ok(latest)
    }

    async fn insert_calibration_log(&self, log: &CalibrationLog) -> StoreResult<()> {
        tracing::info!("calibration log: {:?}", log);
        self.record(StoreOperation::CalibrationLog(log.clone()));
        Ok(())
    }
}
