//! Sourcemeter device handles.
//!
//! [`SourceMeter`] is the capability the sweep controller drives. It is owned
//! exclusively by one controller for the lifetime of a session, so methods take
//! `&mut self` and no internal locking is required of implementations.
//!
//! Implementations:
//! - [`keithley2450::Keithley2450`]: SCPI driver over any [`crate::adapters::ScpiTransport`]
//! - [`mock::MockSourceMeter`]: simulated ohmic device with fault injection

pub mod keithley2450;
pub mod mock;

use crate::error::AppResult;
use crate::plan::SweepPlan;
use async_trait::async_trait;
use tokio::time::Instant;

pub use keithley2450::Keithley2450;
pub use mock::MockSourceMeter;

/// One point as reported by the instrument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    /// Sourced value readback
    pub source: f64,
    /// Measured value
    pub reading: f64,
    /// The source was limited by compliance while this point was measured
    pub in_compliance: bool,
}

/// Device handle capability consumed by the sweep controller.
#[async_trait]
pub trait SourceMeter: Send {
    /// Human readable identifier, used in logs.
    fn name(&self) -> &str;

    /// Apply every parameter of `plan`.
    ///
    /// # Errors
    /// [`crate::SweepError::DeviceConfig`] if the instrument rejects any parameter.
    async fn apply_configuration(&mut self, plan: &SweepPlan) -> AppResult<()>;

    /// Start executing the configured sweep.
    async fn trigger(&mut self) -> AppResult<()>;

    /// Block until the sweep finishes or `deadline` passes.
    ///
    /// Must be cancel safe: the controller drops this future on user abort.
    ///
    /// # Errors
    /// [`crate::SweepError::SweepTimeout`] if the deadline passes first.
    async fn wait_for_completion(&mut self, deadline: Instant) -> AppResult<()>;

    /// Read back up to `expected` samples of the last sweep.
    ///
    /// Returns whatever the instrument holds. Short reads are classified by
    /// the controller, not here.
    async fn fetch_samples(&mut self, expected: usize) -> AppResult<Vec<RawSample>>;

    /// Best-effort stop of a running sweep. May be a no-op.
    async fn abort(&mut self) -> AppResult<()>;

    /// Release the instrument. Idempotent.
    async fn close(&mut self) -> AppResult<()>;
}
