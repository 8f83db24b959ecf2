//! Measured sweep data.
//!
//! A sweep produces an ordered list of [`SweepSample`]s, one per setpoint, in
//! the order the instrument visited them. [`SweepData`] keeps the samples
//! together with what was sourced and the compliance ceiling, so downstream
//! consumers can tell volts from amps without access to the plan.

pub mod sweep_data;

pub use sweep_data::{Direction, SweepData, SweepSample};
