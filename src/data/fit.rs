//! Linear I-V fit and sheet-resistance extraction.
//!
//! Samples are fitted with ordinary least squares, regressing the measured
//! quantity on the sourced one. Errors come from the residual variance over
//! `n - 2` degrees of freedom, so at least three usable samples are required.
//!
//! Whatever was sourced, the reported `slope` is dI/dV and `resistance` is its
//! reciprocal. Uncertainty is propagated to first order:
//!
//! ```text
//! sigma_R  = |R| * sigma_slope / |slope|
//! R_s      = R * pi / ln 2
//! sigma_Rs = sigma_R * pi / ln 2
//! ```
//!
//! Saturated samples (taken while in compliance) are left out of the fit.

use crate::error::{AppResult, SweepError};
use crate::measurement::SweepData;
use crate::plan::SourceVariable;
use serde::{Deserialize, Serialize};
use std::f64::consts::{LN_2, PI};
use std::fmt;
use tracing::debug;

/// Van der Pauw geometric factor for a symmetric four-point arrangement.
pub const VAN_DER_PAUW_FACTOR: f64 = PI / LN_2;

/// Straight-line least squares result, `y = intercept + slope * x`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineFit {
    /// dy/dx
    pub slope: f64,
    /// Standard error of `slope`
    pub slope_std_error: f64,
    /// y at x = 0
    pub intercept: f64,
    /// Standard error of `intercept`
    pub intercept_std_error: f64,
    /// Coefficient of determination
    pub r_squared: f64,
    /// Number of points in the fit
    pub points: usize,
}

/// Ordinary least squares of `ys` on `xs`.
///
/// # Errors
/// - [`SweepError::InsufficientData`] for fewer than 3 points
/// - [`SweepError::DegenerateFit`] if all `xs` are equal or a value is not finite
pub fn linear_regression(xs: &[f64], ys: &[f64]) -> AppResult<LineFit> {
    let n = xs.len().min(ys.len());
    if n < 3 {
        return Err(SweepError::InsufficientData { usable: n });
    }
    if let Some(i) = (0..n).find(|&i| !xs[i].is_finite() || !ys[i].is_finite()) {
        return Err(SweepError::DegenerateFit(format!(
            "non-finite sample at index {}",
            i
        )));
    }

    let nf = n as f64;
    let mean_x = xs[..n].iter().sum::<f64>() / nf;
    let mean_y = ys[..n].iter().sum::<f64>() / nf;

    let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
    for (x, y) in xs.iter().zip(ys).take(n) {
        let dx = x - mean_x;
        let dy = y - mean_y;
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
    }
    if sxx == 0.0 {
        return Err(SweepError::DegenerateFit(
            "all sourced values are identical".to_string(),
        ));
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;

    // Explicit residuals: never negative, unlike syy - slope * sxy.
    let rss: f64 = xs
        .iter()
        .zip(ys)
        .take(n)
        .map(|(x, y)| {
            let r = y - (intercept + slope * x);
            r * r
        })
        .sum();
    let variance = rss / (nf - 2.0);

    Ok(LineFit {
        slope,
        slope_std_error: (variance / sxx).sqrt(),
        intercept,
        intercept_std_error: (variance * (1.0 / nf + mean_x * mean_x / sxx)).sqrt(),
        r_squared: if syy > 0.0 { 1.0 - rss / syy } else { 1.0 },
        points: n,
    })
}

/// Resistance and sheet resistance extracted from one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    /// dI/dV in siemens
    pub slope: f64,
    /// Standard error of `slope`
    pub slope_std_error: f64,
    /// Current at zero volts, in amps
    pub intercept: f64,
    /// Resistance in ohms
    pub resistance: f64,
    /// Standard error of `resistance`
    pub resistance_std_error: f64,
    /// Sheet resistance in ohms per square
    pub sheet_resistance: f64,
    /// Standard error of `sheet_resistance`
    pub sheet_resistance_std_error: f64,
    /// Coefficient of determination of the underlying line fit
    pub r_squared: f64,
    /// Samples that entered the fit
    pub points: usize,
}

impl FitResult {
    /// `resistance ± k * sigma`.
    pub fn resistance_interval(&self, coverage_factor: f64) -> (f64, f64) {
        let half = coverage_factor * self.resistance_std_error;
        (self.resistance - half, self.resistance + half)
    }

    /// `sheet_resistance ± k * sigma`.
    pub fn sheet_resistance_interval(&self, coverage_factor: f64) -> (f64, f64) {
        let half = coverage_factor * self.sheet_resistance_std_error;
        (self.sheet_resistance - half, self.sheet_resistance + half)
    }
}

impl fmt::Display for FitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "R = {:.6e} ± {:.2e} Ω, R_s = {:.6e} ± {:.2e} Ω/□ (n = {}, r² = {:.6})",
            self.resistance,
            self.resistance_std_error,
            self.sheet_resistance,
            self.sheet_resistance_std_error,
            self.points,
            self.r_squared
        )
    }
}

/// Fits sweeps and scales resistance to sheet resistance with the square
/// van der Pauw factor π / ln 2.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CurveFitter;

impl CurveFitter {
    /// A new fitter.
    pub fn new() -> Self {
        Self
    }

    /// Fit one sweep.
    ///
    /// `data` is only borrowed, so the raw samples stay available to the
    /// caller when the fit fails.
    ///
    /// # Errors
    /// - [`SweepError::InsufficientData`] with fewer than 3 unsaturated samples
    /// - [`SweepError::DegenerateFit`] when the I-V slope is zero (open circuit)
    ///   or the resistance is zero (short circuit)
    pub fn fit(&self, data: &SweepData) -> AppResult<FitResult> {
        let usable: Vec<_> = data.samples().iter().filter(|s| !s.saturated).collect();
        let excluded = data.len() - usable.len();
        if excluded > 0 {
            debug!("Excluding {} saturated samples from fit", excluded);
        }
        let xs: Vec<f64> = usable.iter().map(|s| s.independent).collect();
        let ys: Vec<f64> = usable.iter().map(|s| s.dependent).collect();
        let line = linear_regression(&xs, &ys)?;

        let (slope, slope_std_error, intercept, resistance, resistance_std_error) =
            match data.source() {
                SourceVariable::Voltage => {
                    if line.slope == 0.0 {
                        return Err(SweepError::DegenerateFit(
                            "I-V slope is zero (infinite resistance)".to_string(),
                        ));
                    }
                    let resistance = 1.0 / line.slope;
                    let sigma_r = resistance.abs() * line.slope_std_error / line.slope.abs();
                    (
                        line.slope,
                        line.slope_std_error,
                        line.intercept,
                        resistance,
                        sigma_r,
                    )
                }
                SourceVariable::Current => {
                    if line.slope == 0.0 {
                        return Err(SweepError::DegenerateFit(
                            "V-I slope is zero (zero resistance)".to_string(),
                        ));
                    }
                    let resistance = line.slope;
                    let slope = 1.0 / resistance;
                    let sigma_slope = slope.abs() * line.slope_std_error / resistance.abs();
                    (
                        slope,
                        sigma_slope,
                        -line.intercept / resistance,
                        resistance,
                        line.slope_std_error,
                    )
                }
            };

        Ok(FitResult {
            slope,
            slope_std_error,
            intercept,
            resistance,
            resistance_std_error,
            sheet_resistance: resistance * VAN_DER_PAUW_FACTOR,
            sheet_resistance_std_error: resistance_std_error * VAN_DER_PAUW_FACTOR,
            r_squared: line.r_squared,
            points: line.points,
        })
    }
}
