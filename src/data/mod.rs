//! Sweep analysis and export.
//!
//! [`fit`] turns raw I-V samples into resistance and sheet resistance;
//! [`storage`] writes finished sweeps to disk.

pub mod fit;
pub mod storage;

pub use fit::{linear_regression, CurveFitter, FitResult, LineFit, VAN_DER_PAUW_FACTOR};
pub use storage::CsvRecorder;

use crate::measurement::{Direction, SweepData};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A fitted sweep together with the raw samples it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Sweep leg
    pub direction: Direction,
    /// When the samples were fetched from the instrument
    pub acquired_at: DateTime<Utc>,
    /// Raw samples
    pub data: SweepData,
    /// Fit of `data`
    pub fit: FitResult,
}

impl SweepReport {
    /// Bundle `data` with its fit, stamped now.
    pub fn new(data: SweepData, fit: FitResult) -> Self {
        Self {
            direction: data.direction(),
            acquired_at: Utc::now(),
            data,
            fit,
        }
    }
}
