//! Sweep samples and the ordered data set one sweep leg produces.

use crate::plan::SourceVariable;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which leg of a dual sweep produced the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// `start -> end` as planned
    Forward,
    /// `end -> start`
    Reverse,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => write!(f, "forward"),
            Direction::Reverse => write!(f, "reverse"),
        }
    }
}

/// One swept point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepSample {
    /// Sourced value (setpoint readback)
    pub independent: f64,
    /// Measured value
    pub dependent: f64,
    /// Point was in compliance; `dependent` is clamped to the limit
    #[serde(default)]
    pub saturated: bool,
}

impl SweepSample {
    /// A regular, unsaturated sample.
    pub fn new(independent: f64, dependent: f64) -> Self {
        Self {
            independent,
            dependent,
            saturated: false,
        }
    }
}

/// Samples of one sweep, in sweep order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepData {
    source: SourceVariable,
    direction: Direction,
    compliance: f64,
    samples: Vec<SweepSample>,
}

impl SweepData {
    /// Wrap samples acquired while sourcing `source`.
    pub fn new(
        source: SourceVariable,
        direction: Direction,
        compliance: f64,
        samples: Vec<SweepSample>,
    ) -> Self {
        Self {
            source,
            direction,
            compliance,
            samples,
        }
    }

    /// Swept quantity.
    pub fn source(&self) -> SourceVariable {
        self.source
    }

    /// Sweep leg.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Compliance ceiling that applied during acquisition.
    pub fn compliance(&self) -> f64 {
        self.compliance
    }

    /// All samples in sweep order.
    pub fn samples(&self) -> &[SweepSample] {
        &self.samples
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True if no sample was acquired.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Number of samples flagged as saturated.
    pub fn saturated_count(&self) -> usize {
        self.samples.iter().filter(|s| s.saturated).count()
    }

    /// Voltage of every sample, whichever side of the source it was on.
    pub fn voltages(&self) -> Vec<f64> {
        self.samples
            .iter()
            .map(|s| match self.source {
                SourceVariable::Voltage => s.independent,
                SourceVariable::Current => s.dependent,
            })
            .collect()
    }

    /// Current of every sample, whichever side of the source it was on.
    pub fn currents(&self) -> Vec<f64> {
        self.samples
            .iter()
            .map(|s| match self.source {
                SourceVariable::Voltage => s.dependent,
                SourceVariable::Current => s.independent,
            })
            .collect()
    }
}
