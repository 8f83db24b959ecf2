//! Acquisition to result pipeline.
//!
//! [`MeasurementPipeline`] runs a plan through the [`SweepController`], fits
//! every sweep that came back, and hands reports and failures to a
//! [`ResultSink`]. Nothing here fails as a whole: every leg ends up in a
//! [`SweepOutcome`], with whatever raw data survived.

use crate::controller::{SweepCanceller, SweepController};
use crate::data::{CsvRecorder, CurveFitter, SweepReport};
use crate::error::SweepError;
use crate::instrument::SourceMeter;
use crate::measurement::{Direction, SweepData};
use crate::plan::SweepPlan;
use crate::sink::ResultSink;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

/// What became of one sweep leg.
#[derive(Debug)]
pub enum SweepOutcome {
    /// Acquired and fitted.
    Fitted(SweepReport),
    /// Acquired, but the fit failed. The raw samples are kept.
    FitFailed {
        /// Raw samples
        data: SweepData,
        /// Why the fit failed
        error: SweepError,
    },
    /// Acquisition failed. Partial samples, if any, travel in the error.
    Failed(SweepError),
}

impl SweepOutcome {
    /// The fitted report, if any.
    pub fn report(&self) -> Option<&SweepReport> {
        match self {
            SweepOutcome::Fitted(report) => Some(report),
            _ => None,
        }
    }

    /// Raw samples, complete or partial.
    pub fn data(&self) -> Option<&SweepData> {
        match self {
            SweepOutcome::Fitted(report) => Some(&report.data),
            SweepOutcome::FitFailed { data, .. } => Some(data),
            SweepOutcome::Failed(error) => error.partial_data(),
        }
    }

    /// The error that ended this leg, if any.
    pub fn error(&self) -> Option<&SweepError> {
        match self {
            SweepOutcome::Fitted(_) => None,
            SweepOutcome::FitFailed { error, .. } | SweepOutcome::Failed(error) => Some(error),
        }
    }

    /// True if the leg was acquired and fitted.
    pub fn is_fitted(&self) -> bool {
        matches!(self, SweepOutcome::Fitted(_))
    }
}

/// Result of [`MeasurementPipeline::measure`].
#[derive(Debug)]
pub struct MeasurementOutcome {
    /// The plan as given
    pub forward: SweepOutcome,
    /// The swapped plan. `None` for single-direction plans, or when the
    /// forward acquisition failed and the reverse leg was skipped.
    pub reverse: Option<SweepOutcome>,
}

impl MeasurementOutcome {
    /// True if every leg that was attempted was fitted.
    pub fn is_success(&self) -> bool {
        self.forward.is_fitted() && self.reverse.as_ref().map_or(true, SweepOutcome::is_fitted)
    }

    /// Fitted reports, forward first.
    pub fn reports(&self) -> impl Iterator<Item = &SweepReport> {
        std::iter::once(&self.forward)
            .chain(self.reverse.as_ref())
            .filter_map(SweepOutcome::report)
    }
}

/// Sweep, fit, report.
pub struct MeasurementPipeline<D> {
    controller: SweepController<D>,
    fitter: CurveFitter,
    sink: Arc<dyn ResultSink>,
    recorder: Option<CsvRecorder>,
    in_flight: Mutex<Option<SweepCanceller>>,
}

impl<D: SourceMeter + 'static> MeasurementPipeline<D> {
    /// Wire `controller` and `fitter` to `sink`.
    pub fn new(
        controller: SweepController<D>,
        fitter: CurveFitter,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            controller,
            fitter,
            sink,
            recorder: None,
            in_flight: Mutex::new(None),
        }
    }

    /// Also write every fitted sweep to CSV.
    pub fn with_recorder(mut self, recorder: CsvRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// The controller driving the device.
    pub fn controller(&self) -> &SweepController<D> {
        &self.controller
    }

    /// Cancel the sweep currently in flight, if any.
    pub fn cancel(&self) {
        if let Some(canceller) = self.lock_in_flight().as_ref() {
            info!("Cancelling in-flight sweep");
            canceller.cancel();
        }
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, Option<SweepCanceller>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire `plan`, forward only or forward then reverse according to
    /// [`SweepPlan::dual_direction`], and fit every sweep that came back.
    pub async fn measure(&self, plan: SweepPlan) -> MeasurementOutcome {
        info!("Starting measurement: {}", plan);
        if plan.dual_direction() {
            self.measure_dual(plan).await
        } else {
            MeasurementOutcome {
                forward: self.measure_single(plan).await,
                reverse: None,
            }
        }
    }

    async fn measure_single(&self, plan: SweepPlan) -> SweepOutcome {
        let task = {
            let mut in_flight = self.lock_in_flight();
            match self.controller.start_planned_sweep(plan) {
                Ok(task) => {
                    *in_flight = Some(task.canceller());
                    task
                }
                Err(err) => return self.acquisition_failed(err),
            }
        };
        let result = task.join().await;
        *self.lock_in_flight() = None;

        match result {
            Ok(data) => self.analyse(data),
            Err(err) => self.acquisition_failed(err),
        }
    }

    async fn measure_dual(&self, plan: SweepPlan) -> MeasurementOutcome {
        let task = {
            let mut in_flight = self.lock_in_flight();
            match self.controller.start_dual_sweep(plan) {
                Ok(task) => {
                    *in_flight = Some(task.canceller());
                    task
                }
                Err(err) => {
                    return MeasurementOutcome {
                        forward: self.acquisition_failed(err),
                        reverse: None,
                    }
                }
            }
        };
        let result = task.join().await;
        *self.lock_in_flight() = None;

        match result {
            Ok(outcome) => {
                let forward = self.analyse(outcome.forward);
                let reverse = match outcome.reverse {
                    Ok(data) => self.analyse(data),
                    Err(err) => self.acquisition_failed(err),
                };
                MeasurementOutcome {
                    forward,
                    reverse: Some(reverse),
                }
            }
            Err(err) => MeasurementOutcome {
                forward: self.acquisition_failed(err),
                reverse: None,
            },
        }
    }

    fn analyse(&self, data: SweepData) -> SweepOutcome {
        match self.fitter.fit(&data) {
            Ok(fit) => {
                let report = SweepReport::new(data, fit);
                match report.direction {
                    Direction::Forward => self.sink.on_forward_result(&report),
                    Direction::Reverse => self.sink.on_reverse_result(&report),
                }
                if let Some(recorder) = &self.recorder {
                    if let Err(err) = recorder.write_report(&report) {
                        warn!("Could not export {} sweep: {}", report.direction, err);
                    }
                }
                SweepOutcome::Fitted(report)
            }
            Err(error) => {
                warn!("Fit of {} sweep failed: {}", data.direction(), error);
                self.sink.on_failure(error.kind(), Some(&data));
                SweepOutcome::FitFailed { data, error }
            }
        }
    }

    fn acquisition_failed(&self, error: SweepError) -> SweepOutcome {
        warn!("Acquisition failed: {}", error);
        self.sink.on_failure(error.kind(), error.partial_data());
        SweepOutcome::Failed(error)
    }
}
