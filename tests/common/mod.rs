//! Common test utilities for sheet_daq integration tests
//!
//! - Sweep plan builders
//! - Controllers over a shared [`MockSourceMeter`] handle
//! - Sinks that inject faults or cancel between sweep legs

#![allow(dead_code)] // Utilities may not all be used by every test binary

use sheet_daq::controller::{SweepCanceller, SweepController};
use sheet_daq::data::SweepReport;
use sheet_daq::error::ErrorKind;
use sheet_daq::instrument::MockSourceMeter;
use sheet_daq::measurement::{Direction, SweepData};
use sheet_daq::plan::{SweepParameters, SweepPlan};
use sheet_daq::sink::{ResultSink, SweepEvent};
use sheet_daq::timeout::TimeoutEstimator;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A -1 V to 1 V sweep well inside compliance for a 1 kΩ load.
pub fn params(point_count: i64) -> SweepParameters {
    SweepParameters {
        start: -1.0,
        end: 1.0,
        point_count,
        compliance: 1e-2,
        ..Default::default()
    }
}

/// Validated [`params`].
pub fn plan(point_count: i64) -> SweepPlan {
    params(point_count).validate().unwrap()
}

/// Same as [`plan`] with the abort policy.
pub fn abort_plan(point_count: i64) -> SweepPlan {
    SweepParameters {
        on_failure: "abort".to_string(),
        ..params(point_count)
    }
    .validate()
    .unwrap()
}

/// A mock that takes `point_time` per point, plus a controller owning a clone of it.
pub fn mock_controller(
    point_time: Duration,
) -> (MockSourceMeter, SweepController<MockSourceMeter>) {
    let mock = MockSourceMeter::new().with_point_time(point_time);
    let controller = SweepController::new(mock.clone(), TimeoutEstimator::default());
    (mock, controller)
}

/// Rejects the next configuration once the forward samples are in.
pub struct RejectReverseConfiguration {
    pub mock: MockSourceMeter,
}

impl ResultSink for RejectReverseConfiguration {
    fn on_forward_result(&self, _report: &SweepReport) {}

    fn on_reverse_result(&self, _report: &SweepReport) {}

    fn on_failure(&self, _kind: ErrorKind, _partial: Option<&SweepData>) {}

    fn on_event(&self, event: &SweepEvent) {
        if let SweepEvent::Fetched {
            direction: Direction::Forward,
            ..
        } = event
        {
            self.mock.reject_next_configuration();
        }
    }
}

/// Cancels the armed sweep as soon as a sweep in `direction` is triggered.
pub struct CancelOnTrigger {
    pub direction: Direction,
    pub canceller: Mutex<Option<SweepCanceller>>,
}

impl CancelOnTrigger {
    pub fn new(direction: Direction) -> Arc<Self> {
        Arc::new(Self {
            direction,
            canceller: Mutex::new(None),
        })
    }

    pub fn arm(&self, canceller: SweepCanceller) {
        *self.canceller.lock().unwrap() = Some(canceller);
    }
}

impl ResultSink for CancelOnTrigger {
    fn on_forward_result(&self, _report: &SweepReport) {}

    fn on_reverse_result(&self, _report: &SweepReport) {}

    fn on_failure(&self, _kind: ErrorKind, _partial: Option<&SweepData>) {}

    fn on_event(&self, event: &SweepEvent) {
        if let SweepEvent::Triggered { direction, .. } = event {
            if *direction == self.direction {
                if let Some(canceller) = self.canceller.lock().unwrap().as_ref() {
                    canceller.cancel();
                }
            }
        }
    }
}

/// Remembers every event it sees.
#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<SweepEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<SweepEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ResultSink for RecordingSink {
    fn on_forward_result(&self, _report: &SweepReport) {}

    fn on_reverse_result(&self, _report: &SweepReport) {}

    fn on_failure(&self, _kind: ErrorKind, _partial: Option<&SweepData>) {}

    fn on_event(&self, event: &SweepEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
