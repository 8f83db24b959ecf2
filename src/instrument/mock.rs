//! A simulated sourcemeter driving an ohmic load.
//!
//! `MockSourceMeter` behaves like a sourcemeter wired to a resistor: sourcing
//! volts yields `V / R` amps and sourcing amps yields `I * R` volts, clamped
//! at the compliance ceiling. It provides:
//! - Optional seeded noise on every reading
//! - Simulated acquisition time per point and per configuration
//! - Controllable failure injection (rejected configuration, hung sweep,
//!   short buffer reads, compliance trips at a chosen point)
//! - Call logging for test verification
//!
//! Clones share state, so a test can keep one clone for inspection after
//! handing the other to a controller.

use super::{RawSample, SourceMeter};
use crate::error::{AppResult, SweepError};
use crate::plan::{FailurePolicy, SourceVariable, SweepPlan};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Largest current limit the simulated instrument accepts, in amps.
pub const MAX_CURRENT_LIMIT: f64 = 1.05;
/// Largest voltage limit the simulated instrument accepts, in volts.
pub const MAX_VOLTAGE_LIMIT: f64 = 210.0;

struct MockState {
    plan: Option<SweepPlan>,
    acquired: Vec<RawSample>,
    sweep_started: Option<Instant>,
    call_log: Vec<String>,
    reject_next_configuration: bool,
    hang_next_sweep: bool,
    truncate_next_fetch: Option<usize>,
    trip_next_sweep_at: Option<usize>,
    abort_count: usize,
    close_count: usize,
    closed: bool,
    rng: StdRng,
}

/// Simulated sourcemeter for tests and dry runs.
#[derive(Clone)]
pub struct MockSourceMeter {
    name: String,
    resistance: f64,
    noise: f64,
    point_time: Duration,
    configure_time: Duration,
    state: Arc<Mutex<MockState>>,
}

impl Default for MockSourceMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSourceMeter {
    /// A noiseless 1 kΩ load with instantaneous acquisition.
    pub fn new() -> Self {
        Self {
            name: "Mock SourceMeter".to_string(),
            resistance: 1000.0,
            noise: 0.0,
            point_time: Duration::ZERO,
            configure_time: Duration::ZERO,
            state: Arc::new(Mutex::new(MockState {
                plan: None,
                acquired: Vec::new(),
                sweep_started: None,
                call_log: Vec::new(),
                reject_next_configuration: false,
                hang_next_sweep: false,
                truncate_next_fetch: None,
                trip_next_sweep_at: None,
                abort_count: 0,
                close_count: 0,
                closed: false,
                rng: StdRng::seed_from_u64(0),
            })),
        }
    }

    /// Set the simulated load resistance in ohms.
    pub fn with_resistance(mut self, ohms: f64) -> Self {
        self.resistance = ohms;
        self
    }

    /// Add uniform relative noise of `relative` amplitude, seeded for repeatability.
    pub fn with_noise(self, relative: f64, seed: u64) -> Self {
        self.lock().rng = StdRng::seed_from_u64(seed);
        Self {
            noise: relative,
            ..self
        }
    }

    /// Set the simulated acquisition time of one point.
    pub fn with_point_time(mut self, point_time: Duration) -> Self {
        self.point_time = point_time;
        self
    }

    /// Set how long applying a configuration takes.
    pub fn with_configure_time(mut self, configure_time: Duration) -> Self {
        self.configure_time = configure_time;
        self
    }

    /// Reject the next `apply_configuration` call.
    pub fn reject_next_configuration(&self) {
        self.lock().reject_next_configuration = true;
    }

    /// Never signal completion for the next sweep.
    pub fn hang_next_sweep(&self) {
        self.lock().hang_next_sweep = true;
    }

    /// Return at most `len` samples on the next fetch.
    pub fn truncate_next_fetch(&self, len: usize) {
        self.lock().truncate_next_fetch = Some(len);
    }

    /// Force the point at zero-based `index` into compliance on the next sweep.
    pub fn trip_compliance_at(&self, index: usize) {
        self.lock().trip_next_sweep_at = Some(index);
    }

    /// Get the call log.
    pub fn call_log(&self) -> Vec<String> {
        self.lock().call_log.clone()
    }

    /// The plan currently applied, if any.
    pub fn applied_plan(&self) -> Option<SweepPlan> {
        self.lock().plan.clone()
    }

    /// Number of `abort` calls received.
    pub fn abort_count(&self) -> usize {
        self.lock().abort_count
    }

    /// Number of `close` calls received.
    pub fn close_count(&self) -> usize {
        self.lock().close_count
    }

    /// Whether the device has been released.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log_call(&self, call: String) {
        self.lock().call_log.push(call);
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.lock().closed {
            Err(SweepError::SessionClosed)
        } else {
            Ok(())
        }
    }

    fn respond(&self, state: &mut MockState, plan: &SweepPlan, setpoint: f64) -> f64 {
        let ideal = match plan.source() {
            SourceVariable::Voltage => setpoint / self.resistance,
            SourceVariable::Current => setpoint * self.resistance,
        };
        if self.noise > 0.0 {
            ideal * (1.0 + self.noise * state.rng.gen_range(-1.0..1.0))
        } else {
            ideal
        }
    }
}

#[async_trait]
impl SourceMeter for MockSourceMeter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply_configuration(&mut self, plan: &SweepPlan) -> AppResult<()> {
        self.ensure_open()?;
        self.log_call(format!("configure: {}", plan));
        if !self.configure_time.is_zero() {
            tokio::time::sleep(self.configure_time).await;
        }

        let mut state = self.lock();
        if std::mem::take(&mut state.reject_next_configuration) {
            return Err(SweepError::DeviceConfig("Injected failure".to_string()));
        }

        let max_limit = match plan.source() {
            SourceVariable::Voltage => MAX_CURRENT_LIMIT,
            SourceVariable::Current => MAX_VOLTAGE_LIMIT,
        };
        if plan.compliance() > max_limit {
            return Err(SweepError::DeviceConfig(format!(
                "compliance {}{} exceeds instrument maximum {}{}",
                plan.compliance(),
                plan.sense().unit(),
                max_limit,
                plan.sense().unit()
            )));
        }

        state.plan = Some(plan.clone());
        state.acquired.clear();
        Ok(())
    }

    async fn trigger(&mut self) -> AppResult<()> {
        self.ensure_open()?;
        self.log_call("trigger".to_string());

        let mut state = self.lock();
        let plan = state.plan.clone().ok_or(SweepError::NotConfigured)?;
        let trip_at = state.trip_next_sweep_at.take();

        let mut acquired = Vec::with_capacity(plan.point_count());
        for (index, setpoint) in plan.setpoints().into_iter().enumerate() {
            let reading = self.respond(&mut state, &plan, setpoint);
            let tripped = trip_at == Some(index) || reading.abs() >= plan.compliance();
            let reading = if tripped {
                plan.compliance().copysign(reading)
            } else {
                reading
            };
            acquired.push(RawSample {
                source: setpoint,
                reading,
                in_compliance: tripped,
            });
            if tripped && plan.on_failure() == FailurePolicy::Abort {
                debug!("Mock sweep aborted by compliance at point {}", index + 1);
                break;
            }
        }

        state.acquired = acquired;
        state.sweep_started = Some(Instant::now());
        Ok(())
    }

    async fn wait_for_completion(&mut self, deadline: Instant) -> AppResult<()> {
        self.log_call("wait".to_string());
        let (hang, started, points) = {
            let mut state = self.lock();
            (
                std::mem::take(&mut state.hang_next_sweep),
                state.sweep_started.unwrap_or_else(Instant::now),
                state.acquired.len() as u32,
            )
        };

        let finish = started + self.point_time * points;
        if hang || finish > deadline {
            tokio::time::sleep_until(deadline).await;
            return Err(SweepError::SweepTimeout {
                waited: deadline.saturating_duration_since(started),
            });
        }

        tokio::time::sleep_until(finish).await;
        Ok(())
    }

    async fn fetch_samples(&mut self, expected: usize) -> AppResult<Vec<RawSample>> {
        self.ensure_open()?;
        self.log_call(format!("fetch: {}", expected));

        let mut state = self.lock();
        let mut samples = state.acquired.clone();
        samples.truncate(expected);
        if let Some(len) = state.truncate_next_fetch.take() {
            samples.truncate(len);
        }
        Ok(samples)
    }

    async fn abort(&mut self) -> AppResult<()> {
        self.log_call("abort".to_string());
        self.lock().abort_count += 1;
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.log_call("close".to_string());
        let mut state = self.lock();
        state.close_count += 1;
        if !state.closed {
            state.closed = true;
            info!("Disconnecting from {}.", self.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::SweepParameters;

    fn plan(on_failure: &str) -> SweepPlan {
        SweepParameters {
            start: -1.0,
            end: 1.0,
            point_count: 5,
            compliance: 1e-2,
            on_failure: on_failure.to_string(),
            ..Default::default()
        }
        .validate()
        .unwrap()
    }

    #[tokio::test]
    async fn test_mock_ohmic_response() {
        let mut device = MockSourceMeter::new().with_resistance(500.0);
        device.apply_configuration(&plan("continue")).await.unwrap();
        device.trigger().await.unwrap();
        device
            .wait_for_completion(Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();
        let samples = device.fetch_samples(5).await.unwrap();
        assert_eq!(samples.len(), 5);
        assert!((samples[4].reading - 2e-3).abs() < 1e-15);
        assert!(samples.iter().all(|s| !s.in_compliance));
    }

    #[tokio::test]
    async fn test_mock_rejects_excessive_compliance() {
        let mut device = MockSourceMeter::new();
        let plan = SweepParameters {
            compliance: 2.0,
            ..Default::default()
        }
        .validate()
        .unwrap();
        let result = device.apply_configuration(&plan).await;
        assert!(matches!(result, Err(SweepError::DeviceConfig(_))));
        assert!(device.applied_plan().is_none());
    }

    #[tokio::test]
    async fn test_mock_abort_policy_stops_at_trip() {
        let mut device = MockSourceMeter::new();
        device.apply_configuration(&plan("abort")).await.unwrap();
        device.trip_compliance_at(2);
        device.trigger().await.unwrap();
        let samples = device.fetch_samples(5).await.unwrap();
        assert_eq!(samples.len(), 3);
        assert!(samples[2].in_compliance);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_hang_times_out_at_deadline() {
        let mut device = MockSourceMeter::new();
        device.apply_configuration(&plan("continue")).await.unwrap();
        device.hang_next_sweep();
        device.trigger().await.unwrap();
        let result = device
            .wait_for_completion(Instant::now() + Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(SweepError::SweepTimeout { .. })));
    }

    #[tokio::test]
    async fn test_mock_close_is_idempotent() {
        let mut device = MockSourceMeter::new();
        device.close().await.unwrap();
        device.close().await.unwrap();
        assert!(device.is_closed());
        assert_eq!(device.close_count(), 2);
        assert!(device.trigger().await.is_err());
    }
}
