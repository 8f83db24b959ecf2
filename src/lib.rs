//! Core library for the sheet_daq application.
//!
//! Drives a sourcemeter through I-V sweeps and extracts resistance and van
//! der Pauw sheet resistance, with uncertainty, from the measured curves.
//!
//! Data flows
//!
//! ```text
//! SweepParameters -> SweepPlan -> SweepController (forward[, reverse])
//!                                   -> SweepData -> CurveFitter -> FitResult -> ResultSink
//! ```
//!
//! - [`plan`]: validated sweep configuration
//! - [`timeout`]: worst-case acquisition time
//! - [`controller`]: device ownership and the acquisition state machine
//! - [`data`]: curve fitting and CSV export
//! - [`sink`]: result and event consumers
//! - [`pipeline`]: the above wired together
//! - [`instrument`] / [`adapters`]: device handles and SCPI transport
//! - [`config`]: Figment based configuration

pub mod adapters;
pub mod config;
pub mod controller;
pub mod data;
pub mod error;
pub mod instrument;
pub mod measurement;
pub mod pipeline;
pub mod plan;
pub mod sink;
pub mod timeout;

pub use controller::{ControllerState, DualSweepOutcome, SweepController, SweepTask};
pub use data::{CurveFitter, FitResult, SweepReport};
pub use error::{AppResult, ErrorKind, SweepError};
pub use measurement::{Direction, SweepData, SweepSample};
pub use pipeline::{MeasurementOutcome, MeasurementPipeline, SweepOutcome};
pub use plan::{SweepParameters, SweepPlan};
pub use sink::{ResultSink, SweepEvent};
pub use timeout::TimeoutEstimator;
