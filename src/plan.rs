//! Sweep planning: raw user parameters in, validated [`SweepPlan`] out.
//!
//! `SweepParameters` is the loosely typed form that comes from configuration
//! files or a UI (enum values as strings, counts as signed integers).
//! [`SweepParameters::validate`] turns it into an immutable, instrument
//! agnostic [`SweepPlan`]. A plan can only be built through validation, so
//! every plan in the system satisfies:
//!
//! - `start != end`
//! - `point_count >= 2`
//! - `compliance > 0`
//! - `-1 <= step_delay <= MAX_STEP_DELAY_S` (negative means instrument auto delay)
//! - `0 < integration_cycles <= MAX_INTEGRATION_CYCLES`

use crate::error::{AppResult, SweepError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Upper bound on points per sweep, to keep buffer reads bounded.
pub const MAX_POINT_COUNT: usize = 100_000;
/// Longest settling delay per point, in seconds.
pub const MAX_STEP_DELAY_S: f64 = 10_000.0;
/// Longest integration time, in power-line cycles.
pub const MAX_INTEGRATION_CYCLES: f64 = 1_000.0;

/// The quantity driven by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceVariable {
    /// Source volts, measure amps
    Voltage,
    /// Source amps, measure volts
    Current,
}

/// The quantity measured while sourcing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenseVariable {
    /// Measure amps
    Current,
    /// Measure volts
    Voltage,
}

impl SourceVariable {
    /// The sense variable paired with this source variable.
    pub fn complement(self) -> SenseVariable {
        match self {
            SourceVariable::Voltage => SenseVariable::Current,
            SourceVariable::Current => SenseVariable::Voltage,
        }
    }

    /// SI unit symbol of the sourced quantity.
    pub fn unit(self) -> &'static str {
        match self {
            SourceVariable::Voltage => "V",
            SourceVariable::Current => "A",
        }
    }
}

impl SenseVariable {
    /// SI unit symbol of the measured quantity.
    pub fn unit(self) -> &'static str {
        match self {
            SenseVariable::Current => "A",
            SenseVariable::Voltage => "V",
        }
    }
}

/// Measurement range selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangeMode {
    /// One range for the whole sweep, chosen from the compliance limit
    Fixed,
    /// Instrument autoranges at every point
    Auto,
    /// Instrument picks the best fixed range for the sweep span
    Best,
}

/// Lead configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Wiring {
    /// Force and sense on the same pair of leads
    TwoWire,
    /// Separate sense leads (Kelvin)
    FourWire,
}

/// What to do when a point reaches compliance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop the sweep at the first point in compliance
    Abort,
    /// Keep sweeping and mark the point as saturated
    Continue,
}

/// Settling delay applied before each measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StepDelay {
    /// Instrument chooses its minimal settling delay
    Auto,
    /// Fixed delay in seconds
    Fixed(f64),
}

impl StepDelay {
    /// Build from the raw encoding, where any negative value means auto.
    pub fn from_seconds(seconds: f64) -> Self {
        if seconds < 0.0 {
            StepDelay::Auto
        } else {
            StepDelay::Fixed(seconds)
        }
    }

    /// Raw encoding understood by instruments (`-1` for auto).
    pub fn as_seconds(self) -> f64 {
        match self {
            StepDelay::Auto => -1.0,
            StepDelay::Fixed(seconds) => seconds,
        }
    }
}

fn unsupported(field: &str, value: &str, allowed: &[&str]) -> SweepError {
    SweepError::Validation(format!(
        "Unsupported {} '{}'. Must be one of: {}",
        field,
        value,
        allowed.join(", ")
    ))
}

impl FromStr for SourceVariable {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "voltage" | "volt" | "v" => Ok(SourceVariable::Voltage),
            "current" | "curr" | "i" => Ok(SourceVariable::Current),
            other => Err(unsupported("source variable", other, &["voltage", "current"])),
        }
    }
}

impl FromStr for SenseVariable {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "current" | "curr" | "i" => Ok(SenseVariable::Current),
            "voltage" | "volt" | "v" => Ok(SenseVariable::Voltage),
            other => Err(unsupported("sense variable", other, &["current", "voltage"])),
        }
    }
}

impl FromStr for RangeMode {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(RangeMode::Fixed),
            "auto" => Ok(RangeMode::Auto),
            "best" => Ok(RangeMode::Best),
            other => Err(unsupported("range mode", other, &["fixed", "auto", "best"])),
        }
    }
}

impl FromStr for Wiring {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "two-wire" | "2-wire" | "two_wire" => Ok(Wiring::TwoWire),
            "four-wire" | "4-wire" | "four_wire" => Ok(Wiring::FourWire),
            other => Err(unsupported("wiring", other, &["two-wire", "four-wire"])),
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(FailurePolicy::Abort),
            "continue" => Ok(FailurePolicy::Continue),
            other => Err(unsupported("failure policy", other, &["abort", "continue"])),
        }
    }
}

impl fmt::Display for SourceVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceVariable::Voltage => write!(f, "voltage"),
            SourceVariable::Current => write!(f, "current"),
        }
    }
}

impl fmt::Display for Wiring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Wiring::TwoWire => write!(f, "two-wire"),
            Wiring::FourWire => write!(f, "four-wire"),
        }
    }
}

/// Unvalidated sweep intent, as found in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepParameters {
    /// Swept quantity (`voltage` or `current`)
    #[serde(default = "default_source")]
    pub source: String,
    /// Measured quantity; defaults to the complement of `source`
    #[serde(default)]
    pub sense: Option<String>,
    /// First setpoint, in units of `source`
    pub start: f64,
    /// Last setpoint, in units of `source`
    pub end: f64,
    /// Number of setpoints including both ends
    pub point_count: i64,
    /// Compliance ceiling on the measured quantity
    pub compliance: f64,
    /// Range selection (`fixed`, `auto`, `best`)
    #[serde(default = "default_range")]
    pub range: String,
    /// Lead configuration (`two-wire`, `four-wire`)
    #[serde(default = "default_wiring")]
    pub wiring: String,
    /// Integration time in power-line cycles
    #[serde(default = "default_integration_cycles")]
    pub integration_cycles: f64,
    /// Re-measure internal references at every point
    #[serde(default = "default_auto_zero")]
    pub auto_zero: bool,
    /// Subtract thermal offsets at every point
    #[serde(default)]
    pub offset_compensation: bool,
    /// Settling delay in seconds, `-1` for auto
    #[serde(default = "default_step_delay")]
    pub step_delay: f64,
    /// Acquire a reverse sweep after the forward one
    #[serde(default)]
    pub dual_direction: bool,
    /// Compliance behavior (`abort`, `continue`)
    #[serde(default = "default_on_failure")]
    pub on_failure: String,
}

fn default_source() -> String {
    "voltage".to_string()
}

fn default_range() -> String {
    "best".to_string()
}

fn default_wiring() -> String {
    "four-wire".to_string()
}

fn default_integration_cycles() -> f64 {
    1.0
}

fn default_auto_zero() -> bool {
    true
}

fn default_step_delay() -> f64 {
    -1.0
}

fn default_on_failure() -> String {
    "continue".to_string()
}

impl Default for SweepParameters {
    fn default() -> Self {
        Self {
            source: default_source(),
            sense: None,
            start: -1.0,
            end: 1.0,
            point_count: 21,
            compliance: 1e-2,
            range: default_range(),
            wiring: default_wiring(),
            integration_cycles: default_integration_cycles(),
            auto_zero: default_auto_zero(),
            offset_compensation: false,
            step_delay: default_step_delay(),
            dual_direction: false,
            on_failure: default_on_failure(),
        }
    }
}

impl SweepParameters {
    /// Validate and convert into a [`SweepPlan`].
    ///
    /// # Errors
    ///
    /// Returns [`SweepError::Validation`] when:
    /// - `point_count` is below 2 or above [`MAX_POINT_COUNT`]
    /// - `compliance` is not a positive finite number
    /// - `start == end`, or either is not finite
    /// - `integration_cycles` is not positive or above [`MAX_INTEGRATION_CYCLES`]
    /// - `step_delay` is below -1 or above [`MAX_STEP_DELAY_S`]
    /// - any enum field holds an unsupported value, or `sense` is not the
    ///   complement of `source`
    pub fn validate(&self) -> AppResult<SweepPlan> {
        let source: SourceVariable = self.source.parse()?;
        let sense = match &self.sense {
            Some(raw) => {
                let sense: SenseVariable = raw.parse()?;
                if sense != source.complement() {
                    return Err(SweepError::Validation(format!(
                        "Sense variable '{}' cannot be used while sourcing {}",
                        raw, source
                    )));
                }
                sense
            }
            None => source.complement(),
        };

        if self.point_count < 2 {
            return Err(SweepError::Validation(format!(
                "point_count must be at least 2, got {}",
                self.point_count
            )));
        }
        let point_count = usize::try_from(self.point_count)
            .ok()
            .filter(|n| *n <= MAX_POINT_COUNT)
            .ok_or_else(|| {
                SweepError::Validation(format!(
                    "point_count {} exceeds the maximum of {}",
                    self.point_count, MAX_POINT_COUNT
                ))
            })?;

        if !self.compliance.is_finite() || self.compliance <= 0.0 {
            return Err(SweepError::Validation(format!(
                "compliance must be a positive number, got {}",
                self.compliance
            )));
        }

        if !self.start.is_finite() || !self.end.is_finite() {
            return Err(SweepError::Validation(format!(
                "start and end must be finite, got {} and {}",
                self.start, self.end
            )));
        }
        if self.start == self.end {
            return Err(SweepError::Validation(format!(
                "start and end must differ, both are {}",
                self.start
            )));
        }

        if !self.integration_cycles.is_finite()
            || self.integration_cycles <= 0.0
            || self.integration_cycles > MAX_INTEGRATION_CYCLES
        {
            return Err(SweepError::Validation(format!(
                "integration_cycles must be in (0, {}], got {}",
                MAX_INTEGRATION_CYCLES, self.integration_cycles
            )));
        }

        if !(-1.0..=MAX_STEP_DELAY_S).contains(&self.step_delay) {
            return Err(SweepError::Validation(format!(
                "step_delay must be between -1 (auto) and {} s, got {}",
                MAX_STEP_DELAY_S, self.step_delay
            )));
        }

        Ok(SweepPlan {
            source,
            sense,
            start: self.start,
            end: self.end,
            point_count,
            compliance: self.compliance,
            range_mode: self.range.parse()?,
            wiring: self.wiring.parse()?,
            integration_cycles: self.integration_cycles,
            auto_zero: self.auto_zero,
            offset_compensation: self.offset_compensation,
            step_delay: StepDelay::from_seconds(self.step_delay),
            dual_direction: self.dual_direction,
            on_failure: self.on_failure.parse()?,
        })
    }
}

/// A validated, instrument agnostic sweep configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepPlan {
    source: SourceVariable,
    sense: SenseVariable,
    start: f64,
    end: f64,
    point_count: usize,
    compliance: f64,
    range_mode: RangeMode,
    wiring: Wiring,
    integration_cycles: f64,
    auto_zero: bool,
    offset_compensation: bool,
    step_delay: StepDelay,
    dual_direction: bool,
    on_failure: FailurePolicy,
}

impl SweepPlan {
    /// Validate raw parameters. Same as [`SweepParameters::validate`].
    pub fn validate(params: &SweepParameters) -> AppResult<Self> {
        params.validate()
    }

    /// Swept quantity.
    pub fn source(&self) -> SourceVariable {
        self.source
    }

    /// Measured quantity.
    pub fn sense(&self) -> SenseVariable {
        self.sense
    }

    /// First setpoint.
    pub fn start(&self) -> f64 {
        self.start
    }

    /// Last setpoint.
    pub fn end(&self) -> f64 {
        self.end
    }

    /// Number of setpoints.
    pub fn point_count(&self) -> usize {
        self.point_count
    }

    /// Compliance ceiling, in units of the sense variable.
    pub fn compliance(&self) -> f64 {
        self.compliance
    }

    /// Range selection.
    pub fn range_mode(&self) -> RangeMode {
        self.range_mode
    }

    /// Lead configuration.
    pub fn wiring(&self) -> Wiring {
        self.wiring
    }

    /// Integration time in power-line cycles.
    pub fn integration_cycles(&self) -> f64 {
        self.integration_cycles
    }

    /// Whether autozero is enabled.
    pub fn auto_zero(&self) -> bool {
        self.auto_zero
    }

    /// Whether offset compensation is enabled.
    pub fn offset_compensation(&self) -> bool {
        self.offset_compensation
    }

    /// Per-point settling delay.
    pub fn step_delay(&self) -> StepDelay {
        self.step_delay
    }

    /// Whether a reverse sweep follows the forward one.
    pub fn dual_direction(&self) -> bool {
        self.dual_direction
    }

    /// Compliance behavior.
    pub fn on_failure(&self) -> FailurePolicy {
        self.on_failure
    }

    /// The reverse-direction plan: `start` and `end` swapped, all else equal.
    pub fn reversed(&self) -> SweepPlan {
        SweepPlan {
            start: self.end,
            end: self.start,
            ..self.clone()
        }
    }

    /// True when `self` is the exact start/end swap of `forward`.
    pub fn is_reverse_of(&self, forward: &SweepPlan) -> bool {
        self.start == forward.end
            && self.end == forward.start
            && self.reversed() == *forward
    }

    /// Setpoints in sweep order, evenly spaced from `start` to `end`.
    pub fn setpoints(&self) -> Vec<f64> {
        let steps = (self.point_count - 1) as f64;
        let span = self.end - self.start;
        (0..self.point_count)
            .map(|i| {
                if i + 1 == self.point_count {
                    self.end
                } else {
                    self.start + span * (i as f64) / steps
                }
            })
            .collect()
    }
}

impl fmt::Display for SweepPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} sweep {}{} -> {}{} ({} pts, compliance {}{}, {})",
            self.source,
            self.start,
            self.source.unit(),
            self.end,
            self.source.unit(),
            self.point_count,
            self.compliance,
            self.sense.unit(),
            self.wiring
        )
    }
}
