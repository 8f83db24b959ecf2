//! Sweep controller.
//!
//! [`SweepController`] owns one [`SourceMeter`] for the lifetime of a session
//! and drives it through
//!
//! ```text
//! Idle -> Configured -> Triggered -> Fetching -> Configured -> ...
//!   \__________________________________________________________ Closed
//! ```
//!
//! The device sits behind an async mutex. Every operation takes the lock with
//! `try_lock`, so a second request while a sweep is in flight fails with
//! [`SweepError::DeviceBusy`] instead of interleaving commands on the wire.
//! Sweeps run on their own tokio task and are returned as a [`SweepTask`],
//! which can be cancelled while the device is working.
//!
//! State is published through a `tokio::sync::watch` channel; progress events
//! go to an optional [`ResultSink`].

use crate::error::{AppResult, SweepError};
use crate::instrument::{RawSample, SourceMeter};
use crate::measurement::{Direction, SweepData, SweepSample};
use crate::plan::{FailurePolicy, SweepPlan};
use crate::sink::{ResultSink, SweepEvent};
use crate::timeout::TimeoutEstimator;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle state of a [`SweepController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// No plan applied, or the last one was invalidated
    Idle,
    /// A plan is applied and the device is ready to sweep
    Configured,
    /// The device is executing a sweep
    Triggered,
    /// Samples are being read back
    Fetching,
    /// The device has been released
    Closed,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Idle => "idle",
            ControllerState::Configured => "configured",
            ControllerState::Triggered => "triggered",
            ControllerState::Fetching => "fetching",
            ControllerState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Result of a forward plus reverse acquisition.
///
/// The forward sweep succeeded by construction. The reverse sweep is reported
/// on its own so its failure does not cost the forward data.
#[derive(Debug)]
pub struct DualSweepOutcome {
    /// Samples of the plan as given
    pub forward: SweepData,
    /// Samples of the plan with start and end swapped
    pub reverse: AppResult<SweepData>,
}

struct Session<D> {
    device: Option<D>,
    plan: Option<SweepPlan>,
}

struct Shared {
    estimator: TimeoutEstimator,
    state: watch::Sender<ControllerState>,
    shutdown: watch::Sender<bool>,
    sink: Option<Arc<dyn ResultSink>>,
}

impl Shared {
    fn transition(&self, next: ControllerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Controller state {} -> {}", previous, next);
        }
    }

    fn emit(&self, event: SweepEvent) {
        if let Some(sink) = &self.sink {
            sink.on_event(&event);
        }
    }
}

/// Exclusive owner of a sourcemeter for one acquisition session.
///
/// Cloning is cheap and every clone refers to the same device.
pub struct SweepController<D> {
    session: Arc<Mutex<Session<D>>>,
    shared: Arc<Shared>,
}

impl<D> Clone for SweepController<D> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D: SourceMeter + 'static> SweepController<D> {
    /// Take ownership of `device`. Deadlines come from `estimator`.
    pub fn new(device: D, estimator: TimeoutEstimator) -> Self {
        Self::build(device, estimator, None)
    }

    /// Like [`SweepController::new`], also reporting progress to `sink`.
    pub fn with_sink(device: D, estimator: TimeoutEstimator, sink: Arc<dyn ResultSink>) -> Self {
        Self::build(device, estimator, Some(sink))
    }

    fn build(device: D, estimator: TimeoutEstimator, sink: Option<Arc<dyn ResultSink>>) -> Self {
        info!("Sweep controller attached to {}", device.name());
        let (state, _) = watch::channel(ControllerState::Idle);
        let (shutdown, _) = watch::channel(false);
        Self {
            session: Arc::new(Mutex::new(Session {
                device: Some(device),
                plan: None,
            })),
            shared: Arc::new(Shared {
                estimator,
                state,
                shutdown,
                sink,
            }),
        }
    }

    /// Current state.
    pub fn state(&self) -> ControllerState {
        *self.shared.state.borrow()
    }

    /// Receive every state change.
    pub fn subscribe(&self) -> watch::Receiver<ControllerState> {
        self.shared.state.subscribe()
    }

    /// Estimator used to derive sweep deadlines.
    pub fn estimator(&self) -> &TimeoutEstimator {
        &self.shared.estimator
    }

    fn try_acquire(&self) -> AppResult<OwnedMutexGuard<Session<D>>> {
        let session = Arc::clone(&self.session)
            .try_lock_owned()
            .map_err(|_| SweepError::DeviceBusy)?;
        if session.device.is_none() {
            return Err(SweepError::SessionClosed);
        }
        Ok(session)
    }

    /// Apply `plan` to the device.
    ///
    /// Atomic: if the device rejects the plan, the previously applied plan is
    /// re-applied and the controller keeps its pre-call state. If even that
    /// fails the controller drops to [`ControllerState::Idle`].
    ///
    /// # Errors
    /// - [`SweepError::DeviceBusy`] while a sweep is in flight
    /// - [`SweepError::DeviceConfig`] if the device rejects the plan
    /// - [`SweepError::SessionClosed`] after [`SweepController::close`]
    pub async fn configure(&self, plan: SweepPlan) -> AppResult<()> {
        let mut session = self.try_acquire()?;
        configure_session(&mut session, &self.shared, plan).await
    }

    /// Run the configured plan on a background task.
    ///
    /// The device stays locked until the task finishes.
    ///
    /// # Errors
    /// Fails immediately with [`SweepError::DeviceBusy`],
    /// [`SweepError::SessionClosed`] or [`SweepError::NotConfigured`]; sweep
    /// errors are returned by [`SweepTask::join`].
    pub fn start_sweep(&self) -> AppResult<SweepTask<SweepData>> {
        let mut session = self.try_acquire()?;
        if session.plan.is_none() {
            return Err(SweepError::NotConfigured);
        }
        let shared = Arc::clone(&self.shared);
        Ok(SweepTask::spawn(move |mut cancel| async move {
            sweep_session(&mut session, &shared, Direction::Forward, &mut cancel).await
        }))
    }

    /// Configure `plan` and sweep it on one background task, under one device
    /// lock. Cancelling while the plan is still being applied stops the sweep
    /// before it is triggered.
    ///
    /// # Errors
    /// Fails immediately with [`SweepError::DeviceBusy`] or
    /// [`SweepError::SessionClosed`]; configuration and sweep errors are
    /// returned by [`SweepTask::join`].
    pub fn start_planned_sweep(&self, plan: SweepPlan) -> AppResult<SweepTask<SweepData>> {
        let mut session = self.try_acquire()?;
        let shared = Arc::clone(&self.shared);
        Ok(SweepTask::spawn(move |mut cancel| async move {
            configure_session(&mut session, &shared, plan).await?;
            sweep_session(&mut session, &shared, Direction::Forward, &mut cancel).await
        }))
    }

    /// Run the configured plan and wait for its samples.
    ///
    /// # Errors
    /// - [`SweepError::SweepTimeout`]: the device missed its deadline; the
    ///   controller is left `Idle` and must be re-configured
    /// - [`SweepError::ComplianceTripped`]: abort policy tripped, partial samples attached
    /// - [`SweepError::IncompleteSweepData`]: short read, partial samples attached
    pub async fn run_sweep(&self) -> AppResult<SweepData> {
        self.start_sweep()?.join().await
    }

    /// Configure `plan`, sweep it, then sweep it again with start and end
    /// swapped, all on a background task and under one device lock.
    ///
    /// The reverse configuration is only issued after the forward samples
    /// have been fully read back.
    pub fn start_dual_sweep(&self, plan: SweepPlan) -> AppResult<SweepTask<DualSweepOutcome>> {
        let mut session = self.try_acquire()?;
        let shared = Arc::clone(&self.shared);
        Ok(SweepTask::spawn(move |mut cancel| async move {
            dual_sweep_session(&mut session, &shared, plan, &mut cancel).await
        }))
    }

    /// Forward then reverse acquisition of `plan`.
    ///
    /// # Errors
    /// Any failure of the forward leg. Reverse failures are reported in
    /// [`DualSweepOutcome::reverse`].
    pub async fn run_dual_sweep(&self, plan: SweepPlan) -> AppResult<DualSweepOutcome> {
        self.start_dual_sweep(plan)?.join().await
    }

    /// Release the device. Idempotent and infallible.
    ///
    /// A sweep in flight is cancelled first.
    pub async fn close(&self) {
        self.shared.shutdown.send_replace(true);
        let mut session = self.session.lock().await;
        session.plan = None;
        if let Some(mut device) = session.device.take() {
            if let Err(err) = device.close().await {
                warn!("Error while closing {}: {}", device.name(), err);
            }
            info!("Released {}", device.name());
            self.shared.transition(ControllerState::Closed);
            self.shared.emit(SweepEvent::Closed);
        } else {
            debug!("Controller already closed");
        }
    }

    /// Run `f` with this controller and close it afterwards, whatever `f`
    /// returned.
    pub async fn scoped<F, Fut, T>(self, f: F) -> AppResult<T>
    where
        F: FnOnce(SweepController<D>) -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let result = f(self.clone()).await;
        self.close().await;
        result
    }
}

/// Handle to a sweep running on its own task.
///
/// Dropping the handle detaches the sweep; it still runs to completion.
pub struct SweepTask<T> {
    handle: JoinHandle<AppResult<T>>,
    cancel: Arc<watch::Sender<bool>>,
}

/// Cancels the [`SweepTask`] it was taken from. Cloneable.
#[derive(Clone)]
pub struct SweepCanceller(Arc<watch::Sender<bool>>);

impl SweepCanceller {
    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

impl<T: Send + 'static> SweepTask<T> {
    fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = AppResult<T>> + Send + 'static,
    {
        let (cancel, rx) = watch::channel(false);
        Self {
            handle: tokio::spawn(f(rx)),
            cancel: Arc::new(cancel),
        }
    }

    /// Interrupt the wait for the device. A best-effort abort is sent, the
    /// partial samples are discarded and [`SweepTask::join`] returns
    /// [`SweepError::Cancelled`]. No effect once the device has finished.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// A handle that can cancel this task from elsewhere.
    pub fn canceller(&self) -> SweepCanceller {
        SweepCanceller(Arc::clone(&self.cancel))
    }

    /// True once the task has finished.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the sweep result.
    pub async fn join(self) -> AppResult<T> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(SweepError::Cancelled),
        }
    }
}

async fn cancellation(flag: &mut watch::Receiver<bool>) {
    // A dropped sender means nobody can cancel any more.
    if flag.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn configure_session<D: SourceMeter>(
    session: &mut Session<D>,
    shared: &Shared,
    plan: SweepPlan,
) -> AppResult<()> {
    let device = session.device.as_mut().ok_or(SweepError::SessionClosed)?;
    debug!("Configuring {}: {}", device.name(), plan);

    match device.apply_configuration(&plan).await {
        Ok(()) => {
            info!("{} configured: {}", device.name(), plan);
            shared.emit(SweepEvent::Configured(plan.clone()));
            session.plan = Some(plan);
            shared.transition(ControllerState::Configured);
            Ok(())
        }
        Err(err) => {
            warn!("{} rejected configuration: {}", device.name(), err);
            if let Some(previous) = session.plan.clone() {
                match device.apply_configuration(&previous).await {
                    Ok(()) => debug!("Restored previous configuration"),
                    Err(restore_err) => {
                        warn!(
                            "Could not restore previous configuration, re-configure required: {}",
                            restore_err
                        );
                        session.plan = None;
                        shared.transition(ControllerState::Idle);
                    }
                }
            }
            Err(err)
        }
    }
}

async fn sweep_session<D: SourceMeter>(
    session: &mut Session<D>,
    shared: &Shared,
    direction: Direction,
    cancel: &mut watch::Receiver<bool>,
) -> AppResult<SweepData> {
    let plan = session.plan.clone().ok_or(SweepError::NotConfigured)?;
    let device = session.device.as_mut().ok_or(SweepError::SessionClosed)?;
    let point_count = plan.point_count();
    let timeout = shared.estimator.estimate_plan(&plan);
    let mut shutdown = shared.shutdown.subscribe();

    if *cancel.borrow() || *shutdown.borrow() {
        info!("{} sweep cancelled before trigger", direction);
        shared.emit(SweepEvent::Cancelled { direction });
        return Err(SweepError::Cancelled);
    }

    shared.transition(ControllerState::Triggered);
    if let Err(err) = device.trigger().await {
        warn!("Trigger of {} failed: {}", device.name(), err);
        session.plan = None;
        shared.transition(ControllerState::Idle);
        return Err(err);
    }
    info!(
        "{} sweep triggered: {} points, timeout {:?}",
        direction, point_count, timeout
    );
    shared.emit(SweepEvent::Triggered {
        direction,
        point_count,
        timeout,
    });

    let deadline = Instant::now() + timeout;
    let waited = tokio::select! {
        biased;
        _ = cancellation(cancel) => None,
        _ = cancellation(&mut shutdown) => None,
        result = tokio::time::timeout_at(deadline, device.wait_for_completion(deadline)) => {
            Some(result)
        }
    };

    match waited {
        None => {
            warn!("{} sweep cancelled, aborting {}", direction, device.name());
            if let Err(err) = device.abort().await {
                warn!("Abort of {} failed: {}", device.name(), err);
            }
            shared.transition(ControllerState::Configured);
            shared.emit(SweepEvent::Cancelled { direction });
            return Err(SweepError::Cancelled);
        }
        Some(Err(_)) | Some(Ok(Err(SweepError::SweepTimeout { .. }))) => {
            warn!(
                "{} did not finish the {} sweep within {:?}",
                device.name(),
                direction,
                timeout
            );
            if let Err(err) = device.abort().await {
                warn!("Abort of {} failed: {}", device.name(), err);
            }
            session.plan = None;
            shared.transition(ControllerState::Idle);
            return Err(SweepError::SweepTimeout { waited: timeout });
        }
        Some(Ok(Err(err))) => {
            warn!("Waiting on {} failed: {}", device.name(), err);
            session.plan = None;
            shared.transition(ControllerState::Idle);
            return Err(err);
        }
        Some(Ok(Ok(()))) => {}
    }

    shared.transition(ControllerState::Fetching);
    let raw = match device.fetch_samples(point_count).await {
        Ok(raw) => raw,
        Err(err) => {
            warn!("Fetching samples from {} failed: {}", device.name(), err);
            session.plan = None;
            shared.transition(ControllerState::Idle);
            return Err(err);
        }
    };
    debug!("Fetched {} of {} samples", raw.len(), point_count);
    shared.emit(SweepEvent::Fetched {
        direction,
        samples: raw.len(),
    });
    shared.transition(ControllerState::Configured);

    collect_samples(&plan, direction, raw)
}

async fn dual_sweep_session<D: SourceMeter>(
    session: &mut Session<D>,
    shared: &Shared,
    plan: SweepPlan,
    cancel: &mut watch::Receiver<bool>,
) -> AppResult<DualSweepOutcome> {
    let reverse_plan = plan.reversed();
    if !reverse_plan.is_reverse_of(&plan) {
        return Err(SweepError::Validation(format!(
            "reverse plan {} is not the exact swap of {}",
            reverse_plan, plan
        )));
    }

    configure_session(session, shared, plan).await?;
    let forward = sweep_session(session, shared, Direction::Forward, cancel).await?;

    let reverse = match configure_session(session, shared, reverse_plan).await {
        Ok(()) => sweep_session(session, shared, Direction::Reverse, cancel).await,
        Err(err) => Err(err),
    };
    if let Err(err) = &reverse {
        warn!("Reverse sweep failed, keeping forward data: {}", err);
    }
    Ok(DualSweepOutcome { forward, reverse })
}

/// Turn raw device points into sweep samples and apply the failure policy.
fn collect_samples(
    plan: &SweepPlan,
    direction: Direction,
    raw: Vec<RawSample>,
) -> AppResult<SweepData> {
    let point_count = plan.point_count();
    let mut samples = Vec::with_capacity(point_count);

    for (index, point) in raw.into_iter().take(point_count).enumerate() {
        if !point.in_compliance {
            samples.push(SweepSample::new(point.source, point.reading));
            continue;
        }
        samples.push(SweepSample {
            independent: point.source,
            dependent: plan.compliance().copysign(point.reading),
            saturated: true,
        });
        if plan.on_failure() == FailurePolicy::Abort {
            warn!(
                "Compliance tripped at point {} of {}",
                index + 1,
                point_count
            );
            return Err(SweepError::ComplianceTripped {
                tripped_at: index + 1,
                point_count,
                partial: SweepData::new(plan.source(), direction, plan.compliance(), samples),
            });
        }
    }

    let data = SweepData::new(plan.source(), direction, plan.compliance(), samples);
    if data.len() < point_count {
        return Err(SweepError::IncompleteSweepData {
            expected: point_count,
            received: data.len(),
            partial: data,
        });
    }
    if data.saturated_count() > 0 {
        info!(
            "{} of {} points saturated at compliance",
            data.saturated_count(),
            point_count
        );
    }
    Ok(data)
}
