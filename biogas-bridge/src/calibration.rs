use std::sync::Arc;
use std::time::Duration;

use biogas_common::metrics::{report_inserted, report_store_error};
use biogas_common::records::{CalibrationLog, CalibrationRequest};
use biogas_common::store::Store;
use biogas_common::validation::{parse_finite, round_to_precision};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::bus::Publisher;
use crate::config::Topics;
use crate::correlation::{CalibrationTicket, Correlation};
use crate::error::CalibrationError;

/// Payload published to the offset topic.
fn offset_message(request: &CalibrationRequest) -> Vec<u8> {
    json!({
        "offset": request.offset,
        "reference_ph": request.reference_ph,
        "current_ph": request.current_ph,
        "timestamp": request.timestamp.to_rfc3339(),
    })
    .to_string()
    .into_bytes()
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationStatus {
    pub in_progress: bool,
    pub last_calibration: Option<CalibrationLog>,
    pub pending: Option<CalibrationRequest>,
    pub bus_connected: bool,
}

/// Publishes pH offsets and tracks the calibration they start.
#[derive(Clone)]
pub struct Calibrator {
    correlation: Arc<Correlation>,
    publisher: Arc<dyn Publisher>,
    store: Arc<dyn Store>,
    topics: Topics,
    calibration_timeout: Duration,
}

impl Calibrator {
    pub fn new(
        correlation: Arc<Correlation>,
        publisher: Arc<dyn Publisher>,
        store: Arc<dyn Store>,
        topics: Topics,
        calibration_timeout: Duration,
    ) -> Self {
        Self {
            correlation,
            publisher,
            store,
            topics,
            calibration_timeout,
        }
    }

    /// Start a calibration: publish `reference_ph - current_ph` as the new offset.
    ///
    /// Returns as soon as the broker has acknowledged the offset. The device's answer
    /// arrives later on the response topic, or the calibration times out.
    pub async fn calibrate(
        &self,
        reference_ph: &Value,
        current_ph: &Value,
    ) -> Result<CalibrationRequest, CalibrationError> {
        let (Some(reference_ph), Some(current_ph)) =
            (parse_finite(reference_ph), parse_finite(current_ph))
        else {
            return Err(CalibrationError::InvalidInput);
        };

        if !self.publisher.is_connected() {
            return Err(CalibrationError::BusUnavailable);
        }

        let request = CalibrationRequest {
            reference_ph,
            current_ph,
            offset: round_to_precision(reference_ph - current_ph),
            timestamp: Utc::now(),
        };
        let ticket = self
            .correlation
            .begin_calibration(request)
            .ok_or(CalibrationError::InProgress)?;

        // Spawned: ends in a rollback or an armed timeout even if the caller is dropped.
        let calibrator = self.clone();
        let published =
            tokio::spawn(async move { calibrator.publish_offset(ticket, request).await }).await;

        match published {
            Ok(result) => result.map(|()| request),
            Err(join_error) => {
                self.correlation.rollback_calibration(ticket);
                error!("ph offset publish task failed: {}", join_error);
                Err(CalibrationError::Aborted)
            }
        }
    }

    async fn publish_offset(
        &self,
        ticket: CalibrationTicket,
        request: CalibrationRequest,
    ) -> Result<(), CalibrationError> {
        let payload = offset_message(&request);
        if let Err(err) = self.publisher.publish(&self.topics.offset, payload).await {
            self.correlation.rollback_calibration(ticket);
            error!(topic = %self.topics.offset, "failed to publish ph offset: {}", err);
            return Err(CalibrationError::PublishFailed(err));
        }

        info!(
            offset = request.offset,
            reference_ph = request.reference_ph,
            current_ph = request.current_ph,
            "published ph offset, waiting for device response"
        );
        self.watch_for_timeout(ticket);

        Ok(())
    }

    /// Expire the calibration if the device has not answered within the timeout.
    fn watch_for_timeout(&self, ticket: CalibrationTicket) {
        let correlation = self.correlation.clone();
        let store = self.store.clone();
        let timeout = self.calibration_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let Some(log) = correlation.expire_calibration(ticket, Utc::now()) else {
                return;
            };
            warn!(
                timeout_secs = timeout.as_secs_f64(),
                "no calibration response received, giving up"
            );

            match store.insert_calibration_log(&log).await {
                Ok(()) => report_inserted("calibration_logs"),
                Err(err) => {
                    report_store_error("insert_calibration_log");
                    error!("failed to persist calibration timeout: {}", err);
                }
            }
        });
    }

    pub fn status(&self) -> CalibrationStatus {
        let state = self.correlation.snapshot();

        CalibrationStatus {
            in_progress: state.calibration_in_progress,
            last_calibration: state.last_calibration,
            pending: state.pending_calibration,
            bus_connected: self.publisher.is_connected(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use biogas_common::records::CalibrationOutcome;
    use biogas_common::store::{MemoryStore, StoreOperation};

    use crate::bus::ConnectionState;
    use crate::error::BusError;

    /// Takes `delay` to get an answer from the broker, then succeeds or fails.
    struct SlowPublisher {
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl Publisher for SlowPublisher {
        fn connection_state(&self) -> ConnectionState {
            ConnectionState::Connected
        }

        async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> Result<(), BusError> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                Err(BusError::Timeout)
            } else {
                Ok(())
            }
        }
    }

    fn slow_calibrator(fail: bool) -> Calibrator {
        Calibrator::new(
            Arc::new(Correlation::new()),
            Arc::new(SlowPublisher {
                delay: Duration::from_secs(5),
                fail,
            }),
            Arc::new(MemoryStore::new()),
            Topics::default(),
            Duration::from_secs(30),
        )
    }

    #[derive(Default)]
    struct RecordingPublisher {
        disconnected: bool,
        fail: bool,
        published: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        fn connection_state(&self) -> ConnectionState {
            if self.disconnected {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connected
            }
        }

        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
            if self.fail {
                return Err(BusError::Timeout);
            }
            let payload = serde_json::from_slice(&payload).unwrap();
            self.published
                .lock()
                .unwrap()
                .push((topic.to_owned(), payload));
            Ok(())
        }
    }

    fn calibrator(
        publisher: Arc<RecordingPublisher>,
        timeout: Duration,
    ) -> (Calibrator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let calibrator = Calibrator::new(
            Arc::new(Correlation::new()),
            publisher,
            store.clone(),
            Topics::default(),
            timeout,
        );
        (calibrator, store)
    }

    #[tokio::test]
    async fn publishes_rounded_offset() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (calibrator, _) = calibrator(publisher.clone(), Duration::from_secs(30));

        let request = calibrator
            .calibrate(&json!(7.0), &json!("6.5"))
            .await
            .unwrap();

        assert_eq!(request.offset, 0.5);
        let published = publisher.published.lock().unwrap().clone();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "biogas/ph_offset");
        assert_eq!(published[0].1["offset"], json!(0.5));
        assert_eq!(published[0].1["reference_ph"], json!(7.0));
        assert_eq!(published[0].1["current_ph"], json!(6.5));
        assert!(published[0].1["timestamp"].is_string());

        let status = calibrator.status();
        assert!(status.in_progress);
        assert_eq!(status.pending, Some(request));
    }

    #[tokio::test]
    async fn offsets_are_rounded_to_six_decimals() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (calibrator, _) = calibrator(publisher, Duration::from_secs(30));

        let request = calibrator
            .calibrate(&json!(7.1), &json!(6.9))
            .await
            .unwrap();

        assert_eq!(request.offset, 0.2);
    }

    #[tokio::test]
    async fn rejects_invalid_input() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (calibrator, _) = calibrator(publisher.clone(), Duration::from_secs(30));

        for (reference, current) in [
            (json!(null), json!(6.5)),
            (json!("seven"), json!(6.5)),
            (json!(7.0), json!({})),
            (json!(7.0), json!("")),
        ] {
            assert!(matches!(
                calibrator.calibrate(&reference, &current).await,
                Err(CalibrationError::InvalidInput)
            ));
        }
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_calibration_conflicts() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (calibrator, _) = calibrator(publisher.clone(), Duration::from_secs(30));

        calibrator.calibrate(&json!(7), &json!(6.5)).await.unwrap();
        assert!(matches!(
            calibrator.calibrate(&json!(7), &json!(6.8)).await,
            Err(CalibrationError::InProgress)
        ));
        assert_eq!(publisher.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disconnected_bus_is_unavailable() {
        let publisher = Arc::new(RecordingPublisher {
            disconnected: true,
            ..Default::default()
        });
        let (calibrator, _) = calibrator(publisher, Duration::from_secs(30));

        assert!(matches!(
            calibrator.calibrate(&json!(7), &json!(6.5)).await,
            Err(CalibrationError::BusUnavailable)
        ));
        assert!(!calibrator.status().in_progress);
    }

    #[tokio::test]
    async fn publish_failure_rolls_back() {
        let publisher = Arc::new(RecordingPublisher {
            fail: true,
            ..Default::default()
        });
        let (calibrator, _) = calibrator(publisher, Duration::from_secs(30));

        assert!(matches!(
            calibrator.calibrate(&json!(7), &json!(6.5)).await,
            Err(CalibrationError::PublishFailed(BusError::Timeout))
        ));

        let status = calibrator.status();
        assert!(!status.in_progress);
        assert!(status.pending.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_calibration_times_out() {
        let publisher = Arc::new(RecordingPublisher::default());
        let (calibrator, store) = calibrator(publisher, Duration::from_secs(30));

        calibrator.calibrate(&json!(7), &json!(6.5)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;

        let status = calibrator.status();
        assert!(!status.in_progress);
        let log = status.last_calibration.unwrap();
        assert_eq!(log.outcome, CalibrationOutcome::Timeout);
        assert_eq!(log.offset, Some(0.5));
        assert_eq!(store.operations(), vec![StoreOperation::CalibrationLog(log)]);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_caller_still_rolls_back_failed_publish() {
        let calibrator = slow_calibrator(true);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            calibrator.calibrate(&json!(7), &json!(6.5)),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(calibrator.status().in_progress);

        tokio::time::sleep(Duration::from_secs(10)).await;

        let status = calibrator.status();
        assert!(!status.in_progress);
        assert!(status.pending.is_none());
        assert!(matches!(
            calibrator.calibrate(&json!(7), &json!(6.8)).await,
            Err(CalibrationError::PublishFailed(BusError::Timeout))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_caller_still_arms_timeout() {
        let calibrator = slow_calibrator(false);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            calibrator.calibrate(&json!(7), &json!(6.5)),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(60)).await;

        let status = calibrator.status();
        assert!(!status.in_progress);
        assert_eq!(
            status.last_calibration.map(|log| log.outcome),
            Some(CalibrationOutcome::Timeout)
        );
    }
}
