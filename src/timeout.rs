//! Worst-case acquisition time for a sweep.
//!
//! The estimate is headroom for the controller's wait step, not a contract
//! with the instrument:
//!
//! ```text
//! per_point = integration_cycles / line_frequency_hz + effective_delay
//! total     = point_count * per_point * safety_margin
//! ```
//!
//! `effective_delay` is the plan's fixed step delay, or `auto_delay` when the
//! instrument chooses its own settling time. `auto_delay` is strictly positive
//! so an all-auto, very short sweep never gets a zero deadline. The total is
//! capped at [`MAX_SWEEP_TIMEOUT`].

use crate::error::{AppResult, SweepError};
use crate::plan::{StepDelay, SweepPlan};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Power-line frequency assumed when none is configured.
pub const DEFAULT_LINE_FREQUENCY_HZ: f64 = 60.0;
/// Default multiplier applied on top of the nominal sweep time.
pub const DEFAULT_SAFETY_MARGIN: f64 = 1.2;
/// Settling time budgeted per point when the instrument picks the delay.
pub const DEFAULT_AUTO_DELAY_S: f64 = 0.01;
/// Longest deadline ever handed to the controller.
pub const MAX_SWEEP_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 3600);

/// Computes sweep deadlines from point count, integration time and delay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeoutEstimator {
    line_frequency_hz: f64,
    safety_margin: f64,
    auto_delay_s: f64,
}

impl Default for TimeoutEstimator {
    fn default() -> Self {
        Self {
            line_frequency_hz: DEFAULT_LINE_FREQUENCY_HZ,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            auto_delay_s: DEFAULT_AUTO_DELAY_S,
        }
    }
}

impl TimeoutEstimator {
    /// Create an estimator.
    ///
    /// # Errors
    ///
    /// Returns [`SweepError::Validation`] if `line_frequency_hz` or
    /// `auto_delay_s` is not positive, or `safety_margin < 1.0`.
    pub fn new(line_frequency_hz: f64, safety_margin: f64, auto_delay_s: f64) -> AppResult<Self> {
        if !line_frequency_hz.is_finite() || line_frequency_hz <= 0.0 {
            return Err(SweepError::Validation(format!(
                "line frequency must be positive, got {}",
                line_frequency_hz
            )));
        }
        if !safety_margin.is_finite() || safety_margin < 1.0 {
            return Err(SweepError::Validation(format!(
                "safety margin must be >= 1.0, got {}",
                safety_margin
            )));
        }
        if !auto_delay_s.is_finite() || auto_delay_s <= 0.0 {
            return Err(SweepError::Validation(format!(
                "auto delay must be positive, got {}",
                auto_delay_s
            )));
        }
        Ok(Self {
            line_frequency_hz,
            safety_margin,
            auto_delay_s,
        })
    }

    /// Power-line frequency in Hz.
    pub fn line_frequency_hz(&self) -> f64 {
        self.line_frequency_hz
    }

    /// Multiplier on the nominal duration.
    pub fn safety_margin(&self) -> f64 {
        self.safety_margin
    }

    /// Time for one point: integration plus settling, in seconds.
    pub fn per_point_seconds(&self, step_delay: StepDelay, integration_cycles: f64) -> f64 {
        let integration = integration_cycles / self.line_frequency_hz;
        let delay = match step_delay {
            StepDelay::Fixed(seconds) => seconds,
            StepDelay::Auto => self.auto_delay_s,
        };
        integration + delay
    }

    /// Worst-case duration of a sweep with the given shape, at most
    /// [`MAX_SWEEP_TIMEOUT`].
    pub fn estimate(
        &self,
        point_count: usize,
        step_delay: StepDelay,
        integration_cycles: f64,
    ) -> Duration {
        let total = point_count as f64
            * self.per_point_seconds(step_delay, integration_cycles)
            * self.safety_margin;
        Duration::try_from_secs_f64(total.max(0.0))
            .map_or(MAX_SWEEP_TIMEOUT, |d| d.min(MAX_SWEEP_TIMEOUT))
    }

    /// Worst-case duration of `plan`.
    pub fn estimate_plan(&self, plan: &SweepPlan) -> Duration {
        self.estimate(
            plan.point_count(),
            plan.step_delay(),
            plan.integration_cycles(),
        )
    }
}
