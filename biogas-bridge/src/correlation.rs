//! Process-wide state shared by the ingestion pipeline and the HTTP handlers.
//!
//! All of it sits behind a single mutex. Every method takes the lock once and releases it
//! before returning, so callers never hold it across an `.await`.
use std::sync::{Mutex, MutexGuard, PoisonError};

use biogas_common::records::{
    CalibrationLog, CalibrationOutcome, CalibrationRequest, SensorId,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CorrelationState {
    /// Id of the most recently inserted sensor reading.
    pub latest_sensor_id: Option<SensorId>,
    pub warmup_active: bool,
    pub calibration_in_progress: bool,
    pub pending_calibration: Option<CalibrationRequest>,
    pub last_calibration: Option<CalibrationLog>,
    /// Incremented for every calibration that starts, so late rollbacks and timeouts
    /// can tell whether they still refer to the calibration in flight.
    #[serde(skip)]
    calibration_ticket: u64,
}

/// Handle for one started calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationTicket(u64);

#[derive(Default)]
pub struct Correlation {
    state: Mutex<CorrelationState>,
}

impl Correlation {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CorrelationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> CorrelationState {
        self.lock().clone()
    }

    pub fn warmup_active(&self) -> bool {
        self.lock().warmup_active
    }

    /// Set the warmup flag, returning the previous value.
    pub fn set_warmup_active(&self, active: bool) -> bool {
        std::mem::replace(&mut self.lock().warmup_active, active)
    }

    pub fn latest_sensor_id(&self) -> Option<SensorId> {
        self.lock().latest_sensor_id
    }

    pub fn set_latest_sensor_id(&self, id: SensorId) {
        self.lock().latest_sensor_id = Some(id);
    }

    /// Mark a calibration as in flight. Returns `None` when one already is.
    pub fn begin_calibration(&self, request: CalibrationRequest) -> Option<CalibrationTicket> {
        let mut state = self.lock();
        if state.calibration_in_progress {
            return None;
        }

        state.calibration_in_progress = true;
        state.pending_calibration = Some(request);
        state.calibration_ticket += 1;
        Some(CalibrationTicket(state.calibration_ticket))
    }

    /// Undo `begin_calibration` after the offset could not be published.
    pub fn rollback_calibration(&self, ticket: CalibrationTicket) {
        let mut state = self.lock();
        if state.calibration_in_progress && state.calibration_ticket == ticket.0 {
            state.calibration_in_progress = false;
            state.pending_calibration = None;
        }
    }

    /// Close the calibration in flight (if any) with a response from the device.
    pub fn complete_calibration(
        &self,
        outcome: CalibrationOutcome,
        response: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> CalibrationLog {
        let mut state = self.lock();
        let pending = state.pending_calibration.take();
        let log = CalibrationLog::new(pending.as_ref(), outcome, response, timestamp);

        state.calibration_in_progress = false;
        state.last_calibration = Some(log.clone());
        log
    }

    /// Give up on a calibration that never got a response. Does nothing if that
    /// calibration already finished or was rolled back.
    pub fn expire_calibration(
        &self,
        ticket: CalibrationTicket,
        timestamp: DateTime<Utc>,
    ) -> Option<CalibrationLog> {
        let mut state = self.lock();
        if !state.calibration_in_progress || state.calibration_ticket != ticket.0 {
            return None;
        }

        let pending = state.pending_calibration.take();
        let log = CalibrationLog::new(
            pending.as_ref(),
            CalibrationOutcome::Timeout,
            serde_json::Value::Null,
            timestamp,
        );

        state.calibration_in_progress = false;
        state.last_calibration = Some(log.clone());
        Some(log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(offset: f64) -> CalibrationRequest {
        CalibrationRequest {
            reference_ph: 7.0,
            current_ph: 7.0 - offset,
            offset,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn only_one_calibration_in_flight() {
        let correlation = Correlation::new();

        let ticket = correlation.begin_calibration(request(0.5));
        assert!(ticket.is_some());
        assert!(correlation.begin_calibration(request(0.1)).is_none());

        let state = correlation.snapshot();
        assert!(state.calibration_in_progress);
        assert_eq!(state.pending_calibration.map(|p| p.offset), Some(0.5));
    }

    #[test]
    fn rollback_clears_pending_request() {
        let correlation = Correlation::new();
        let ticket = correlation.begin_calibration(request(0.5)).unwrap();

        correlation.rollback_calibration(ticket);

        let state = correlation.snapshot();
        assert!(!state.calibration_in_progress);
        assert!(state.pending_calibration.is_none());
        assert!(correlation.begin_calibration(request(0.2)).is_some());
    }

    #[test]
    fn stale_ticket_does_not_touch_new_calibration() {
        let correlation = Correlation::new();
        let first = correlation.begin_calibration(request(0.5)).unwrap();
        correlation.complete_calibration(CalibrationOutcome::Success, json!({}), Utc::now());
        let _second = correlation.begin_calibration(request(0.3)).unwrap();

        correlation.rollback_calibration(first);
        assert!(correlation.expire_calibration(first, Utc::now()).is_none());
        assert!(correlation.snapshot().calibration_in_progress);
    }

    #[test]
    fn response_completes_pending_calibration() {
        let correlation = Correlation::new();
        correlation.begin_calibration(request(0.5)).unwrap();

        let log = correlation.complete_calibration(
            CalibrationOutcome::Success,
            json!({"success": true}),
            Utc::now(),
        );

        assert_eq!(log.offset, Some(0.5));
        let state = correlation.snapshot();
        assert!(!state.calibration_in_progress);
        assert_eq!(state.last_calibration, Some(log));
    }

    #[test]
    fn expiry_records_timeout() {
        let correlation = Correlation::new();
        let ticket = correlation.begin_calibration(request(0.5)).unwrap();

        let log = correlation.expire_calibration(ticket, Utc::now()).unwrap();

        assert_eq!(log.outcome, CalibrationOutcome::Timeout);
        assert!(!log.success);
        assert!(!correlation.snapshot().calibration_in_progress);
        assert!(correlation.expire_calibration(ticket, Utc::now()).is_none());
    }

    #[test]
    fn warmup_flag_round_trip() {
        let correlation = Correlation::new();
        assert!(!correlation.set_warmup_active(true));
        assert!(correlation.warmup_active());
        assert!(correlation.set_warmup_active(false));
    }
}
