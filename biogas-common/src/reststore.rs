//! Record store reached through a PostgREST-compatible HTTP endpoint.
//!
//! The configured URL is the REST root (for a hosted Supabase project that is
//! `https://<project>.supabase.co/rest/v1`); each table is addressed as a path below it.
//! Requests carry the access key both as `apikey` and as a bearer token.
use std::time;

use async_trait::async_trait;
use reqwest::{header, StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::records::{
    ActuatorState, CalibrationLog, SensorErrorMargin, SensorId, SensorReading,
};
use crate::store::{Store, StoreError, StoreResult};

#[derive(Clone)]
pub struct RestStore {
    base: Url,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct IdRow {
    id: SensorId,
}

#[derive(Serialize)]
struct CalibrationLogRow<'a> {
    reference_ph: Option<f64>,
    current_ph: Option<f64>,
    ph_offset: Option<f64>,
    outcome: &'static str,
    success: bool,
    response: &'a serde_json::Value,
    created_at: String,
}

impl<'a> From<&'a CalibrationLog> for CalibrationLogRow<'a> {
    fn from(log: &'a CalibrationLog) -> Self {
        Self {
            reference_ph: log.reference_ph,
            current_ph: log.current_ph,
            ph_offset: log.offset,
            outcome: log.outcome.as_str(),
            success: log.success,
            response: &log.response,
            created_at: log.timestamp.to_rfc3339(),
        }
    }
}

impl RestStore {
    pub fn new(url: &str, key: Option<&str>, timeout: time::Duration) -> StoreResult<Self> {
        let mut base = Url::parse(url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        if let Some(key) = key {
            let invalid = |_| StoreError::UnexpectedResponse {
                operation: "configure client",
                reason: "store key is not a valid header value".to_owned(),
            };
            let mut apikey = header::HeaderValue::from_str(key).map_err(invalid)?;
            apikey.set_sensitive(true);
            let mut bearer =
                header::HeaderValue::from_str(&format!("Bearer {key}")).map_err(invalid)?;
            bearer.set_sensitive(true);
            headers.insert("apikey", apikey);
            headers.insert(header::AUTHORIZATION, bearer);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("biogas-bridge")
            .timeout(timeout)
            .build()
            .map_err(|error| StoreError::RequestError {
                operation: "configure client",
                error,
            })?;

        Ok(Self { base, client })
    }

    fn table(&self, table: &str) -> StoreResult<Url> {
        Ok(self.base.join(table)?)
    }

    async fn insert<T: Serialize + Sync>(
        &self,
        operation: &'static str,
        table: &str,
        row: &T,
        prefer: &'static str,
    ) -> StoreResult<reqwest::Response> {
        let response = self
            .client
            .post(self.table(table)?)
            .header("Prefer", prefer)
            .json(row)
            .send()
            .await
            .map_err(|error| StoreError::RequestError { operation, error })?;

        response
            .error_for_status()
            .map_err(|error| StoreError::RequestError { operation, error })
    }
}

#[async_trait]
impl Store for RestStore {
    async fn insert_sensor_reading(&self, reading: &SensorReading) -> StoreResult<SensorId> {
        let operation = "insert sensor_data";
        let response = self
            .insert(operation, "sensor_data", reading, "return=representation")
            .await?;

        let rows: Vec<IdRow> = response
            .json()
            .await
            .map_err(|error| StoreError::RequestError { operation, error })?;

        rows.first()
            .map(|row| row.id)
            .ok_or_else(|| StoreError::UnexpectedResponse {
                operation,
                reason: "no row returned for inserted reading".to_owned(),
            })
    }

    async fn insert_sensor_errors(&self, margin: &SensorErrorMargin) -> StoreResult<()> {
        self.insert("insert sensor_errors", "sensor_errors", margin, "return=minimal")
            .await?;
        Ok(())
    }

    async fn insert_actuator_state(&self, state: &ActuatorState) -> StoreResult<()> {
        self.insert("insert actuator_data", "actuator_data", state, "return=minimal")
            .await?;
        Ok(())
    }

    async fn latest_sensor_id(&self) -> StoreResult<Option<SensorId>> {
        let operation = "select latest sensor_data";
        let response = self
            .client
            .get(self.table("sensor_data")?)
            .query(&[
                ("select", "id"),
                ("order", "created_at.desc"),
                ("limit", "1"),
            ])
            .send()
            .await
            .map_err(|error| StoreError::RequestError { operation, error })?;

        if response.status() != StatusCode::OK {
            return Err(StoreError::UnexpectedResponse {
                operation,
                reason: format!("status {}", response.status()),
            });
        }

        let rows: Vec<IdRow> = response
            .json()
            .await
            .map_err(|error| StoreError::RequestError { operation, error })?;

        Ok(rows.first().map(|row| row.id))
    }

    async fn insert_calibration_log(&self, log: &CalibrationLog) -> StoreResult<()> {
        self.insert(
            "insert calibration_logs",
            "calibration_logs",
            &CalibrationLogRow::from(log),
            "return=minimal",
        )
        .await?;
        Ok(())
    }
}
