//! Plan execution.
//!
//! [`ExecutionOrchestrator`] walks an ordered list of scheduled targets and
//! drives the adapter through `slewing -> focusing -> imaging` for each one.
//!
//! - A failed phase is retried up to `phase_retries` times. Every failed
//!   attempt is appended to the error log. Once retries run out the target is
//!   marked failed and the plan moves on to the next target.
//! - Abort and pause are cooperative. They take effect at the next phase
//!   boundary (or retry/poll wait), never while an adapter call is outstanding.
//! - Only a lost connection that survives `reconnect_attempts` reconnects ends
//!   the run in [`ExecutionState::Error`].
//!
//! Adapter calls are serialized through one async mutex, so the orchestrator
//! never has two mutating operations in flight against the same device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hardware::telescope::TelescopeAdapter;
use shared::{ExecutionConfig, ImagingDefaults, ObservatoryContext};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::progress::{
    ExecutionError, ExecutionProgress, ExecutionResult, ExecutionState, Phase, TargetOutcome,
    TargetResult,
};
use crate::target::ScheduledTarget;

/// Errors starting an execution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("Execution {0:?} is already running on this orchestrator")]
    AlreadyRunning(String),
}

/// Stand-in deadline for waits too long to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

enum PhaseOutcome {
    Succeeded,
    Failed,
    Aborted,
    ConnectionLost,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drives one adapter through scheduled plans, one plan at a time.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use hardware::telescope::AdapterRegistry;
/// use sequencer::ExecutionOrchestrator;
/// use shared::{ConfigStorage, ObservatoryContext};
///
/// # async fn run(plan: Vec<sequencer::ScheduledTarget>) -> anyhow::Result<()> {
/// let context = ObservatoryContext::load(ConfigStorage::new()?)?;
/// let mut adapter = AdapterRegistry::with_defaults().create(&context.config.device)?;
/// adapter
///     .connect(&context.config.device.host, context.config.device.port)
///     .await;
///
/// let orchestrator = Arc::new(ExecutionOrchestrator::from_context(adapter, &context));
/// let result = orchestrator.execute("tonight", &plan).await?;
/// println!("{}: {:.0}%", result.state, result.progress.progress_percent);
/// # Ok(())
/// # }
/// ```
pub struct ExecutionOrchestrator {
    adapter: tokio::sync::Mutex<Box<dyn TelescopeAdapter>>,
    execution: ExecutionConfig,
    imaging: ImagingDefaults,
    /// Id of the execution currently holding this orchestrator
    active: Mutex<Option<String>>,
    abort_requested: AtomicBool,
    pause_requested: AtomicBool,
    /// Wakes paused or sleeping runs on abort/resume
    wake: Notify,
    progress: watch::Sender<ExecutionProgress>,
    errors: Mutex<Vec<ExecutionError>>,
}

/// Releases the orchestrator when an execution ends, including when the
/// `execute` future is dropped mid-run.
struct ActiveRun<'a> {
    orchestrator: &'a ExecutionOrchestrator,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.orchestrator.progress.send_modify(|p| {
            if p.state.is_active() {
                p.state = ExecutionState::Aborted;
                p.current_phase = None;
            }
        });
        *lock(&self.orchestrator.active) = None;
    }
}

impl ExecutionOrchestrator {
    pub fn new(
        adapter: Box<dyn TelescopeAdapter>,
        execution: ExecutionConfig,
        imaging: ImagingDefaults,
    ) -> Self {
        let (progress, _) = watch::channel(ExecutionProgress::default());
        Self {
            adapter: tokio::sync::Mutex::new(adapter),
            execution,
            imaging,
            active: Mutex::new(None),
            abort_requested: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
            wake: Notify::new(),
            progress,
            errors: Mutex::new(Vec::new()),
        }
    }

    pub fn from_context(adapter: Box<dyn TelescopeAdapter>, context: &ObservatoryContext) -> Self {
        Self::new(
            adapter,
            context.config.execution.clone(),
            context.config.imaging.clone(),
        )
    }

    /// The driven adapter. Holding the lock blocks the phase loop.
    pub fn adapter(&self) -> &tokio::sync::Mutex<Box<dyn TelescopeAdapter>> {
        &self.adapter
    }

    pub fn execution_config(&self) -> &ExecutionConfig {
        &self.execution
    }

    /// Snapshot of the current (or last finished) run.
    pub fn progress(&self) -> ExecutionProgress {
        self.progress.borrow().clone()
    }

    pub fn state(&self) -> ExecutionState {
        self.progress.borrow().state
    }

    /// Receiver notified at every phase boundary and state change.
    pub fn subscribe(&self) -> watch::Receiver<ExecutionProgress> {
        self.progress.subscribe()
    }

    /// Ordered error log of the current (or last finished) run.
    pub fn errors(&self) -> Vec<ExecutionError> {
        lock(&self.errors).clone()
    }

    /// Request a cooperative abort of the running plan.
    ///
    /// Returns `false` if no plan is running. The flag stays set until the
    /// run ends.
    pub fn abort(&self) -> bool {
        let active = lock(&self.active);
        let Some(id) = active.as_ref() else {
            return false;
        };
        if !self.abort_requested.swap(true, Ordering::SeqCst) {
            info!("Abort requested for execution {id}");
        }
        self.wake.notify_waiters();
        true
    }

    /// Hold the run at the next phase boundary. Returns `false` if idle.
    pub fn pause(&self) -> bool {
        let active = lock(&self.active);
        let Some(id) = active.as_ref() else {
            return false;
        };
        if !self.pause_requested.swap(true, Ordering::SeqCst) {
            info!("Pause requested for execution {id}");
        }
        true
    }

    /// Release a paused run. Returns `false` if no pause was pending.
    pub fn resume(&self) -> bool {
        let was_paused = self.pause_requested.swap(false, Ordering::SeqCst);
        if was_paused {
            info!("Resume requested");
            self.wake.notify_waiters();
        }
        was_paused
    }

    /// Park the telescope now. Never fails loudly; `false` on any failure.
    pub async fn park_telescope(&self) -> bool {
        self.adapter.lock().await.park().await
    }

    /// Run `targets` in order and return the final result.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::AlreadyRunning`] if another execution holds this
    /// orchestrator. Target and phase failures are not errors; they are in
    /// the returned [`ExecutionResult`].
    pub async fn execute(
        &self,
        execution_id: &str,
        targets: &[ScheduledTarget],
    ) -> Result<ExecutionResult, OrchestratorError> {
        let _run = self.begin(execution_id)?;
        let started_at = Utc::now();

        lock(&self.errors).clear();
        self.progress
            .send_modify(|p| *p = ExecutionProgress::new(execution_id, targets.len()));
        self.set_state(ExecutionState::Starting);
        info!(
            "Starting execution {execution_id} with {} targets",
            targets.len()
        );

        let mut outcomes: Vec<TargetResult> = targets
            .iter()
            .enumerate()
            .map(|(index, target)| TargetResult {
                index,
                target_name: target.name().to_string(),
                outcome: TargetOutcome::Skipped,
                phases_completed: Vec::new(),
            })
            .collect();

        if targets.is_empty() {
            self.finish(ExecutionState::Completed);
            return Ok(self.result(started_at, outcomes, false));
        }

        let terminal = self.run_plan(targets, &mut outcomes).await;

        let parked = if self.execution.park_on_completion {
            info!("Parking telescope");
            let parked = self.park_telescope().await;
            if !parked {
                warn!("Park after execution {execution_id} failed");
            }
            parked
        } else {
            false
        };

        self.finish(terminal);
        Ok(self.result(started_at, outcomes, parked))
    }

    fn begin(&self, execution_id: &str) -> Result<ActiveRun<'_>, OrchestratorError> {
        let mut active = lock(&self.active);
        if let Some(running) = active.as_ref() {
            warn!("Rejecting execution {execution_id}: {running} is still running");
            return Err(OrchestratorError::AlreadyRunning(running.clone()));
        }
        *active = Some(execution_id.to_string());
        self.abort_requested.store(false, Ordering::SeqCst);
        self.pause_requested.store(false, Ordering::SeqCst);
        Ok(ActiveRun { orchestrator: self })
    }

    async fn run_plan(
        &self,
        targets: &[ScheduledTarget],
        outcomes: &mut [TargetResult],
    ) -> ExecutionState {
        if let Some(first) = targets.first() {
            if !self.ensure_connected(0, first.name()).await {
                error!("Device is not connected, execution cannot start");
                return ExecutionState::Error;
            }
        }
        self.set_state(ExecutionState::Running);

        for (index, (target, outcome)) in targets.iter().zip(outcomes.iter_mut()).enumerate() {
            if self.checkpoint().await {
                return ExecutionState::Aborted;
            }

            self.progress.send_modify(|p| {
                p.current_target_index = Some(index);
                p.current_phase = None;
                p.recompute();
            });
            info!(
                "Target {}/{}: {}",
                index + 1,
                targets.len(),
                target.name()
            );

            match self.run_target(index, target, outcome).await {
                PhaseOutcome::Succeeded => {
                    outcome.outcome = TargetOutcome::Completed;
                    self.progress.send_modify(|p| {
                        p.targets_completed += 1;
                        p.recompute();
                    });
                    info!("Target {} completed", target.name());
                }
                PhaseOutcome::Failed => {
                    outcome.outcome = TargetOutcome::Failed;
                    self.progress.send_modify(|p| {
                        p.targets_failed += 1;
                        p.recompute();
                    });
                    warn!("Target {} failed, moving on", target.name());
                }
                PhaseOutcome::Aborted => {
                    outcome.outcome = TargetOutcome::Interrupted;
                    return ExecutionState::Aborted;
                }
                PhaseOutcome::ConnectionLost => {
                    outcome.outcome = TargetOutcome::Interrupted;
                    error!("Connection lost during {}, ending execution", target.name());
                    return ExecutionState::Error;
                }
            }
        }

        ExecutionState::Completed
    }

    async fn run_target(
        &self,
        index: usize,
        target: &ScheduledTarget,
        outcome: &mut TargetResult,
    ) -> PhaseOutcome {
        let autofocus = self.adapter.lock().await.capabilities().autofocus;

        for phase in Phase::TARGET_PHASES {
            if self.checkpoint().await {
                return PhaseOutcome::Aborted;
            }
            if phase == Phase::Focusing && !autofocus {
                debug!("No autofocus capability, skipping focusing");
                continue;
            }

            self.progress.send_modify(|p| {
                p.current_phase = Some(phase);
                p.recompute();
            });

            match self.run_phase(index, target, phase).await {
                PhaseOutcome::Succeeded => outcome.phases_completed.push(phase),
                other => return other,
            }
        }

        if self.execution.wait_for_exposure {
            return self.wait_for_exposure(index, target).await;
        }
        PhaseOutcome::Succeeded
    }

    /// One phase with bounded retries.
    async fn run_phase(&self, index: usize, target: &ScheduledTarget, phase: Phase) -> PhaseOutcome {
        let attempts = self.execution.phase_retries.saturating_add(1);
        let budget = self.execution.phase_timeout();

        for attempt in 0..attempts {
            if attempt > 0 {
                if self.sleep_or_abort(self.execution.retry_delay()).await {
                    return PhaseOutcome::Aborted;
                }
                info!(
                    "Retrying {phase} for {} ({attempt}/{})",
                    target.name(),
                    self.execution.phase_retries
                );
            }

            let message = match tokio::time::timeout(budget, self.call_phase(phase, target)).await {
                Ok(true) => {
                    debug!("{phase} succeeded for {}", target.name());
                    return PhaseOutcome::Succeeded;
                }
                Ok(false) => format!("{phase} reported failure"),
                Err(_) => format!("{phase} timed out after {:.1}s", budget.as_secs_f64()),
            };

            warn!(
                "Target {} attempt {} of {phase} failed: {message}",
                target.name(),
                attempt + 1
            );
            self.record_error(index, target.name(), phase, message, attempt);

            if !self.ensure_connected(index, target.name()).await {
                return PhaseOutcome::ConnectionLost;
            }
        }

        PhaseOutcome::Failed
    }

    async fn call_phase(&self, phase: Phase, target: &ScheduledTarget) -> bool {
        let adapter = self.adapter.lock().await;
        match phase {
            Phase::Slewing => adapter.goto(target.target.coordinates, target.name()).await,
            Phase::Focusing => adapter.autofocus().await,
            Phase::Imaging => {
                let request = target.exposure_request(&self.imaging);
                adapter.start_exposure(&request).await
            }
            Phase::Connection => unreachable!("connection is not a target phase"),
        }
    }

    /// Poll until the device stops exposing.
    ///
    /// Gives up (stopping the exposure) once the nominal exposure time plus
    /// one phase timeout has passed. An abort here stops the exposure, and a
    /// session lost mid-exposure fails the target even if it reconnects.
    async fn wait_for_exposure(&self, index: usize, target: &ScheduledTarget) -> PhaseOutcome {
        let request = target.exposure_request(&self.imaging);
        let nominal = Duration::try_from_secs_f64(request.total_seconds()).unwrap_or(Duration::ZERO);
        let deadline = Instant::now().checked_add(nominal.saturating_add(self.execution.phase_timeout()));
        let poll = self.execution.exposure_poll_interval();

        debug!(
            "Waiting up to {:.0}s for {} to finish exposing",
            nominal.as_secs_f64(),
            target.name()
        );

        loop {
            if self.abort_requested.load(Ordering::SeqCst) {
                info!("Abort during exposure of {}, stopping exposure", target.name());
                if !self.adapter.lock().await.stop_exposure().await {
                    warn!("stopExposure failed while aborting");
                }
                return PhaseOutcome::Aborted;
            }

            let status = self.adapter.lock().await.get_status();
            if !status.connected {
                self.record_error(
                    index,
                    target.name(),
                    Phase::Imaging,
                    "connection lost while exposing".to_string(),
                    0,
                );
                if !self.ensure_connected(index, target.name()).await {
                    return PhaseOutcome::ConnectionLost;
                }
                // The new session knows nothing of the interrupted exposure
                warn!("Exposure of {} cut short by reconnect", target.name());
                return PhaseOutcome::Failed;
            }
            if !status.exposing {
                debug!("Exposure of {} finished", target.name());
                return PhaseOutcome::Succeeded;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!("Exposure of {} overran, stopping it", target.name());
                if !self.adapter.lock().await.stop_exposure().await {
                    warn!("stopExposure failed after overrun");
                }
                return PhaseOutcome::Succeeded;
            }

            // Loop top handles an abort that cut the wait short
            self.sleep_or_abort(poll).await;
        }
    }

    /// Reconnect up to `reconnect_attempts` times if the session is gone.
    async fn ensure_connected(&self, index: usize, target_name: &str) -> bool {
        if self.adapter.lock().await.get_status().connected {
            return true;
        }

        let attempts = self.execution.reconnect_attempts;
        for attempt in 1..=attempts {
            warn!("Device connection lost, reconnect attempt {attempt}/{attempts}");
            if self.adapter.lock().await.reconnect().await {
                info!("Reconnected to device");
                return true;
            }
        }

        self.record_error(
            index,
            target_name,
            Phase::Connection,
            format!("connection lost; {attempts} reconnect attempts failed"),
            attempts,
        );
        false
    }

    /// Phase-boundary checkpoint. Blocks while paused; `true` means abort.
    async fn checkpoint(&self) -> bool {
        loop {
            let woken = self.wake.notified();
            tokio::pin!(woken);
            woken.as_mut().enable();

            if self.abort_requested.load(Ordering::SeqCst) {
                return true;
            }
            if !self.pause_requested.load(Ordering::SeqCst) {
                if self.state() == ExecutionState::Paused {
                    info!("Execution resumed");
                    self.set_state(ExecutionState::Running);
                }
                return false;
            }
            if self.state() != ExecutionState::Paused {
                info!("Execution paused at phase boundary");
                self.set_state(ExecutionState::Paused);
            }
            woken.await;
        }
    }

    /// Sleep for `duration` unless an abort arrives first. `true` means abort.
    async fn sleep_or_abort(&self, duration: Duration) -> bool {
        let deadline = Instant::now()
            .checked_add(duration)
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE);
        loop {
            let woken = self.wake.notified();
            tokio::pin!(woken);
            woken.as_mut().enable();

            if self.abort_requested.load(Ordering::SeqCst) {
                return true;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    return self.abort_requested.load(Ordering::SeqCst);
                }
                _ = &mut woken => {}
            }
        }
    }

    fn record_error(
        &self,
        target_index: usize,
        target_name: &str,
        phase: Phase,
        message: String,
        retry_count: u32,
    ) {
        lock(&self.errors).push(ExecutionError {
            timestamp: Utc::now(),
            target_index,
            target_name: target_name.to_string(),
            phase,
            message,
            retry_count,
        });
    }

    fn set_state(&self, state: ExecutionState) {
        self.progress.send_modify(|p| {
            p.state = state;
            p.recompute();
        });
    }

    fn finish(&self, terminal: ExecutionState) {
        self.progress.send_modify(|p| {
            p.state = terminal;
            p.current_phase = None;
            p.recompute();
        });
        let progress = self.progress();
        match terminal {
            ExecutionState::Error => error!(
                "Execution {} ended in ERROR ({} completed, {} failed)",
                progress.execution_id, progress.targets_completed, progress.targets_failed
            ),
            _ => info!(
                "Execution {} {terminal}: {} completed, {} failed, {:.0}%",
                progress.execution_id,
                progress.targets_completed,
                progress.targets_failed,
                progress.progress_percent
            ),
        }
    }

    fn result(
        &self,
        started_at: DateTime<Utc>,
        targets: Vec<TargetResult>,
        parked: bool,
    ) -> ExecutionResult {
        let progress = self.progress();
        ExecutionResult {
            execution_id: progress.execution_id.clone(),
            state: progress.state,
            progress,
            targets,
            errors: self.errors(),
            parked,
            started_at,
            finished_at: Utc::now(),
        }
    }
}
