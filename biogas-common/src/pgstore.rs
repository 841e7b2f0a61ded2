//! Record store on top of PostgreSQL tables created by the `migrations` directory.
use std::time;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::records::{
    ActuatorState, CalibrationLog, SensorErrorMargin, SensorId, SensorReading,
};
use crate::store::{Store, StoreError, StoreResult};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Initialize a new PgStore with a lazily connected pool.
    /// Queries wait at most `acquire_timeout` for a connection.
    pub fn new(
        url: &str,
        max_connections: u32,
        acquire_timeout: time::Duration,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(url)
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self { pool })
    }

    /// Initialize a PgStore from an existing pool.
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_sensor_reading(&self, reading: &SensorReading) -> StoreResult<SensorId> {
        let query = r#"
INSERT INTO sensor_data
    (ph, temp, ch4, pressure)
VALUES
    ($1, $2, $3, $4)
RETURNING id
        "#;

        sqlx::query_scalar(query)
            .bind(reading.ph)
            .bind(reading.temp)
            .bind(reading.ch4)
            .bind(reading.pressure)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                operation: "insert sensor_data",
                error,
            })
    }

    async fn insert_sensor_errors(&self, margin: &SensorErrorMargin) -> StoreResult<()> {
        let query = r#"
INSERT INTO sensor_errors
    (sensor_id, ph_error, ph_delta_error, temp_error, temp_delta_error)
VALUES
    ($1, $2, $3, $4, $5)
        "#;

        sqlx::query(query)
            .bind(margin.sensor_id)
            .bind(margin.errors.ph_error)
            .bind(margin.errors.ph_delta_error)
            .bind(margin.errors.temp_error)
            .bind(margin.errors.temp_delta_error)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                operation: "insert sensor_errors",
                error,
            })?;

        Ok(())
    }

    async fn insert_actuator_state(&self, state: &ActuatorState) -> StoreResult<()> {
        let query = r#"
INSERT INTO actuator_data
    (sensor_id, pump_base, pump_acid, heater, solenoid, stirrer)
VALUES
    ($1, $2, $3, $4, $5, $6)
        "#;

        sqlx::query(query)
            .bind(state.sensor_id)
            .bind(state.readings.pump_base)
            .bind(state.readings.pump_acid)
            .bind(state.readings.heater)
            .bind(state.readings.solenoid)
            .bind(state.readings.stirrer)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                operation: "insert actuator_data",
                error,
            })?;

        Ok(())
    }

    async fn latest_sensor_id(&self) -> StoreResult<Option<SensorId>> {
        let query = r#"
SELECT id
FROM sensor_data
ORDER BY created_at DESC, id DESC
LIMIT 1
        "#;

        sqlx::query_scalar(query)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                operation: "select latest sensor_data",
                error,
            })
    }

    async fn insert_calibration_log(&self, log: &CalibrationLog) -> StoreResult<()> {
        let query = r#"
INSERT INTO calibration_logs
    (reference_ph, current_ph, ph_offset, outcome, success, response, created_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7)
        "#;

        sqlx::query(query)
            .bind(log.reference_ph)
            .bind(log.current_ph)
            .bind(log.offset)
            .bind(log.outcome.as_str())
            .bind(log.success)
            .bind(sqlx::types::Json(&log.response))
            .bind(log.timestamp)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                operation: "insert calibration_logs",
                error,
            })?;

        Ok(())
    }
}
