//! Custom error types for sweep acquisition and analysis.
//!
//! `SweepError` is the single error type of the library. Each variant maps to
//! one failure category of the acquisition pipeline:
//!
//! - **`Validation`**: a sweep plan or configuration value is invalid. Caller error,
//!   never retried.
//! - **`Connection`**: the transport could not reach the instrument. Retrying with
//!   backoff is the caller's decision.
//! - **`DeviceConfig`**: the instrument rejected a configuration parameter.
//! - **`SweepTimeout`**: the instrument did not finish inside the estimated window.
//!   The controller must be re-configured before the next sweep.
//! - **`ComplianceTripped`**: a point hit the compliance ceiling while the plan asked
//!   to abort. This is an expected operating condition and carries the samples
//!   collected up to and including the tripped point.
//! - **`IncompleteSweepData`**: fewer samples came back than the plan asked for.
//! - **`InsufficientData`** / **`DegenerateFit`**: analysis-level failures. The raw
//!   samples are never consumed by the fitter, so callers can still plot them.
//!
//! Variants that carry partial data expose it through [`SweepError::partial_data`].

use crate::measurement::SweepData;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, SweepError>;

/// Errors raised while planning, acquiring or fitting a sweep.
#[derive(Error, Debug)]
pub enum SweepError {
    /// Sweep parameters or configuration values are invalid.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The instrument could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The instrument rejected part of the configuration.
    #[error("Device configuration rejected: {0}")]
    DeviceConfig(String),

    /// The instrument did not signal completion before the deadline.
    #[error("Sweep did not complete within {waited:?}")]
    SweepTimeout {
        /// Time spent waiting before giving up
        waited: Duration,
    },

    /// A point reached the compliance limit under the abort policy.
    #[error("Compliance limit tripped at point {tripped_at} of {point_count}")]
    ComplianceTripped {
        /// One-based index of the point that tripped
        tripped_at: usize,
        /// Number of points the plan asked for
        point_count: usize,
        /// Samples collected up to and including the tripped point
        partial: SweepData,
    },

    /// The instrument returned fewer samples than requested.
    #[error("Incomplete sweep data: expected {expected} samples, received {received}")]
    IncompleteSweepData {
        /// Number of samples the plan asked for
        expected: usize,
        /// Number of samples the instrument returned
        received: usize,
        /// Whatever the instrument did return
        partial: SweepData,
    },

    /// Too few usable samples for a residual-based error estimate.
    #[error("Insufficient data for fit: {usable} usable samples, at least 3 required")]
    InsufficientData {
        /// Number of samples that could enter the regression
        usable: usize,
    },

    /// The fitted I-V slope is zero or the regressor has no spread.
    #[error("Degenerate fit: {0}")]
    DegenerateFit(String),

    /// Another sweep is already in flight on this device.
    #[error("Device is busy with another sweep")]
    DeviceBusy,

    /// The sweep was cancelled before completion.
    #[error("Sweep cancelled")]
    Cancelled,

    /// A sweep was requested before a plan was applied.
    #[error("Controller is not configured")]
    NotConfigured,

    /// The session has been closed and the device released.
    #[error("Session is closed")]
    SessionClosed,

    /// Transport level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fieldless classification of [`SweepError`], handed to result sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// See [`SweepError::Validation`]
    Validation,
    /// See [`SweepError::Connection`]
    Connection,
    /// See [`SweepError::DeviceConfig`]
    DeviceConfig,
    /// See [`SweepError::SweepTimeout`]
    SweepTimeout,
    /// See [`SweepError::ComplianceTripped`]
    ComplianceTripped,
    /// See [`SweepError::IncompleteSweepData`]
    IncompleteSweepData,
    /// See [`SweepError::InsufficientData`]
    InsufficientData,
    /// See [`SweepError::DegenerateFit`]
    DegenerateFit,
    /// See [`SweepError::DeviceBusy`]
    DeviceBusy,
    /// See [`SweepError::Cancelled`]
    Cancelled,
    /// See [`SweepError::NotConfigured`]
    NotConfigured,
    /// See [`SweepError::SessionClosed`]
    SessionClosed,
    /// See [`SweepError::Io`]
    Io,
}

impl SweepError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SweepError::Validation(_) => ErrorKind::Validation,
            SweepError::Connection(_) => ErrorKind::Connection,
            SweepError::DeviceConfig(_) => ErrorKind::DeviceConfig,
            SweepError::SweepTimeout { .. } => ErrorKind::SweepTimeout,
            SweepError::ComplianceTripped { .. } => ErrorKind::ComplianceTripped,
            SweepError::IncompleteSweepData { .. } => ErrorKind::IncompleteSweepData,
            SweepError::InsufficientData { .. } => ErrorKind::InsufficientData,
            SweepError::DegenerateFit(_) => ErrorKind::DegenerateFit,
            SweepError::DeviceBusy => ErrorKind::DeviceBusy,
            SweepError::Cancelled => ErrorKind::Cancelled,
            SweepError::NotConfigured => ErrorKind::NotConfigured,
            SweepError::SessionClosed => ErrorKind::SessionClosed,
            SweepError::Io(_) => ErrorKind::Io,
        }
    }

    /// Samples that were collected before the failure, if any.
    pub fn partial_data(&self) -> Option<&SweepData> {
        match self {
            SweepError::ComplianceTripped { partial, .. }
            | SweepError::IncompleteSweepData { partial, .. } => Some(partial),
            _ => None,
        }
    }
}
