//! Temperature/field sequence execution.
//!
//! A [`Sequence`] is an ordered list of steps edited freely before a run
//! and consumed read-only during one. [`Sequencer::start`] hands the
//! sequence to a one-shot background worker that dispatches each step to
//! the controller and polls a status string until the step completes, the
//! operator stops the run, or (when configured) a per-step ceiling expires.
//!
//! Run state is shared with the foreground through [`RunState`]: plain
//! atomic flags plus a mutex-guarded per-step state vector, giving the
//! stop-request and status-rendering paths a race-free view of the worker.
//!
//! A step whose target status never arrives blocks forever by default;
//! controller hardware failures are expected to be handled by an operator
//! requesting a stop. Configure `step_timeout` to fail such a step with a
//! step-timeout error instead.

use crate::error::{AppResult, DaqError};
use crate::ppms::Ppms;
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

/// Granularity at which waits notice a stop request.
const STOP_POLL_SLICE: Duration = Duration::from_millis(250);

/// One programmed action in an experiment script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum SequenceStep {
    /// Ramp the temperature (Kelvin, Kelvin per minute), fast-settle mode.
    SetTemperature {
        /// Setpoint in Kelvin.
        kelvin: f64,
        /// Ramp rate in Kelvin per minute.
        rate: f64,
    },
    /// Ramp the field (Tesla, Tesla per minute), magnet left driven.
    SetFieldDriven {
        /// Setpoint in Tesla.
        tesla: f64,
        /// Ramp rate in Tesla per minute.
        rate: f64,
    },
    /// Ramp the field (Tesla, Tesla per minute), ending persistent.
    SetFieldPersistent {
        /// Setpoint in Tesla.
        tesla: f64,
        /// Ramp rate in Tesla per minute.
        rate: f64,
    },
    /// Wait a fixed number of minutes.
    Wait {
        /// Wait duration in minutes.
        minutes: f64,
    },
    /// Shut the system down leaving the pot in operation.
    ShutdownPotOps,
    /// Shut the system down in continuous cooling mode.
    ShutdownContinuous,
}

impl SequenceStep {
    /// The status string that marks this step complete, if it polls one.
    pub fn target_status(&self) -> Option<&'static str> {
        match self {
            SequenceStep::SetTemperature { .. } => Some("Stable"),
            SequenceStep::SetFieldDriven { .. } => Some("Driven mode stable"),
            SequenceStep::SetFieldPersistent { .. } => Some("Persistent mode stable"),
            SequenceStep::Wait { .. } => None,
            SequenceStep::ShutdownPotOps | SequenceStep::ShutdownContinuous => Some("Standby"),
        }
    }

    /// Human-readable label for logs and status display.
    pub fn label(&self) -> String {
        match self {
            SequenceStep::SetTemperature { kelvin, rate } => {
                format!("Set temperature (fast settle) to {kelvin} K at {rate} K/min")
            }
            SequenceStep::SetFieldDriven { tesla, rate } => {
                format!("Set field driven to {tesla} T at {rate} T/min")
            }
            SequenceStep::SetFieldPersistent { tesla, rate } => {
                format!("Set field persistent to {tesla} T at {rate} T/min")
            }
            SequenceStep::Wait { minutes } => format!("Wait {minutes} minutes"),
            SequenceStep::ShutdownPotOps => "Shutdown in PotOps mode".to_string(),
            SequenceStep::ShutdownContinuous => "Shutdown in continuous mode".to_string(),
        }
    }
}

/// An ordered, editable list of steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    steps: Vec<SequenceStep>,
}

impl Sequence {
    /// Create an empty sequence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step at the end.
    pub fn push(&mut self, step: SequenceStep) {
        self.steps.push(step);
    }

    /// Insert a step at `index`, clamped to the end.
    pub fn insert(&mut self, index: usize, step: SequenceStep) {
        let index = index.min(self.steps.len());
        self.steps.insert(index, step);
    }

    /// Remove and return the step at `index`, if it exists.
    pub fn remove(&mut self, index: usize) -> Option<SequenceStep> {
        (index < self.steps.len()).then(|| self.steps.remove(index))
    }

    /// Remove all steps.
    pub fn clear(&mut self) {
        self.steps.clear();
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the sequence is empty.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The steps in order.
    pub fn steps(&self) -> &[SequenceStep] {
        &self.steps
    }
}

/// Visual state of one step during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    /// Not reached yet.
    Pending,
    /// Currently executing.
    Ongoing,
    /// Completed normally.
    Finished,
    /// A stop request landed while this step was executing.
    Stopped,
}

/// How a sequence run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// Every step completed.
    Finished,
    /// A stop request ended the run early.
    Stopped,
}

/// Shared run state: written by the worker, read from the stop-request and
/// status-rendering paths.
pub struct RunState {
    current_step: AtomicUsize,
    should_stop: AtomicBool,
    step_finished: AtomicBool,
    sequence_done: AtomicBool,
    step_states: Mutex<Vec<StepState>>,
}

impl RunState {
    fn new(sequence_len: usize) -> Self {
        Self {
            current_step: AtomicUsize::new(0),
            should_stop: AtomicBool::new(false),
            step_finished: AtomicBool::new(false),
            sequence_done: AtomicBool::new(false),
            step_states: Mutex::new(vec![StepState::Pending; sequence_len]),
        }
    }

    /// Index of the step currently (or last) executing.
    pub fn current_step(&self) -> usize {
        self.current_step.load(Ordering::SeqCst)
    }

    /// Whether a stop has been requested.
    pub fn should_stop(&self) -> bool {
        self.should_stop.load(Ordering::SeqCst)
    }

    /// Whether the current step has reached its target.
    pub fn step_finished(&self) -> bool {
        self.step_finished.load(Ordering::SeqCst)
    }

    /// Whether the whole sequence completed normally.
    pub fn is_finished(&self) -> bool {
        self.sequence_done.load(Ordering::SeqCst)
    }

    /// Snapshot of the per-step visual states.
    pub fn step_states(&self) -> Vec<StepState> {
        self.states().clone()
    }

    fn request_stop(&self) {
        self.should_stop.store(true, Ordering::SeqCst);
    }

    fn set_step_finished(&self, finished: bool) {
        self.step_finished.store(finished, Ordering::SeqCst);
    }

    fn states(&self) -> std::sync::MutexGuard<'_, Vec<StepState>> {
        self.step_states.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin_step(&self, index: usize) {
        self.current_step.store(index, Ordering::SeqCst);
        self.set_step_finished(false);
        let mut states = self.states();
        if index > 0 {
            states[index - 1] = StepState::Finished;
        }
        states[index] = StepState::Ongoing;
    }

    fn mark(&self, index: usize, state: StepState) {
        let mut states = self.states();
        if index < states.len() {
            states[index] = state;
        }
    }
}

/// Executes sequences against a controller on a background worker.
pub struct Sequencer {
    ppms: Arc<Ppms>,
    check_interval: Duration,
    step_timeout: Option<Duration>,
}

impl Sequencer {
    /// Create a sequencer with the default 30 s completion-poll interval.
    pub fn new(ppms: Arc<Ppms>) -> Self {
        Self {
            ppms,
            check_interval: Duration::from_secs(30),
            step_timeout: None,
        }
    }

    /// Set the interval between step-completion polls.
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Arm a per-step ceiling; a step failing to reach its target status in
    /// time fails the run instead of blocking forever.
    pub fn with_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Start a one-shot worker running `sequence`, returning its handle.
    pub fn start(&self, sequence: Sequence) -> SequenceHandle {
        let state = Arc::new(RunState::new(sequence.len()));
        let worker = Worker {
            ppms: self.ppms.clone(),
            state: state.clone(),
            check_interval: self.check_interval,
            step_timeout: self.step_timeout,
        };
        let task = tokio::spawn(async move { worker.run(sequence).await });
        SequenceHandle {
            state,
            ppms: self.ppms.clone(),
            task,
        }
    }
}

/// Handle to a running (or finished) sequence.
pub struct SequenceHandle {
    state: Arc<RunState>,
    ppms: Arc<Ppms>,
    task: JoinHandle<AppResult<SequenceOutcome>>,
}

impl SequenceHandle {
    /// The shared run state.
    pub fn state(&self) -> Arc<RunState> {
        self.state.clone()
    }

    /// A cheap clone-able stop control for this run.
    pub fn stopper(&self) -> SequenceStopper {
        SequenceStopper {
            state: self.state.clone(),
            ppms: self.ppms.clone(),
        }
    }

    /// Whether the whole sequence completed normally.
    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Request a stop; see [`SequenceStopper::request_stop`].
    pub async fn request_stop(&self) -> AppResult<()> {
        self.stopper().request_stop().await
    }

    /// Wait for the worker and return how the run ended.
    pub async fn join(self) -> AppResult<SequenceOutcome> {
        self.task
            .await
            .map_err(|e| DaqError::Worker(e.to_string()))?
    }
}

/// Stop control for a sequence run, detached from the handle.
#[derive(Clone)]
pub struct SequenceStopper {
    state: Arc<RunState>,
    ppms: Arc<Ppms>,
}

impl SequenceStopper {
    /// Request a stop: raise the stop flag and abort the controller command
    /// in flight. The worker breaks out at its next stop check without
    /// advancing to further steps.
    pub async fn request_stop(&self) -> AppResult<()> {
        self.state.request_stop();
        self.ppms.abort().await?;
        let last_step = self.state.current_step();
        let states_len = self.state.states().len();
        if states_len > 0 && last_step == states_len - 1 && self.state.step_finished() {
            // The stop landed after the last step already completed.
            info!("Sequence aborted after finishing.");
        } else {
            self.state.mark(last_step, StepState::Stopped);
            info!("Sequence aborted.");
        }
        Ok(())
    }
}

struct Worker {
    ppms: Arc<Ppms>,
    state: Arc<RunState>,
    check_interval: Duration,
    step_timeout: Option<Duration>,
}

impl Worker {
    async fn run(&self, sequence: Sequence) -> AppResult<SequenceOutcome> {
        for (index, step) in sequence.steps().iter().enumerate() {
            self.state.begin_step(index);
            info!("Running step {}: {}", index + 1, step.label());
            self.run_step(step).await?;
            if self.state.should_stop() {
                return Ok(SequenceOutcome::Stopped);
            }
        }
        if let Some(last) = sequence.len().checked_sub(1) {
            self.state.mark(last, StepState::Finished);
        }
        self.state.sequence_done.store(true, Ordering::SeqCst);
        info!("Sequence finished.");
        Ok(SequenceOutcome::Finished)
    }

    async fn run_step(&self, step: &SequenceStep) -> AppResult<()> {
        match step {
            SequenceStep::SetTemperature { kelvin, rate } => {
                self.ppms.set_temperature(*kelvin, *rate).await?;
            }
            SequenceStep::SetFieldDriven { tesla, rate } => {
                self.ppms.set_field_driven(*tesla, *rate).await?;
            }
            SequenceStep::SetFieldPersistent { tesla, rate } => {
                self.ppms.set_field_persistent(*tesla, *rate).await?;
            }
            SequenceStep::Wait { minutes } => {
                return self.wait_step(*minutes).await;
            }
            SequenceStep::ShutdownPotOps => {
                self.ppms.shutdown_potops().await?;
            }
            SequenceStep::ShutdownContinuous => {
                self.ppms.shutdown_continuous().await?;
            }
        }
        // Non-wait steps poll a controller status until it hits the target.
        if let Some(target) = step.target_status() {
            self.poll_until(step, target).await?;
        }
        Ok(())
    }

    /// Sleep `minutes` and mark the step finished; a stop request only
    /// interrupts the nap, never fails it.
    async fn wait_step(&self, minutes: f64) -> AppResult<()> {
        if self.state.should_stop() {
            return Ok(());
        }
        let done = sleep_watching_stop(Duration::from_secs_f64(minutes * 60.0), &self.state).await;
        if done {
            self.state.set_step_finished(true);
        }
        Ok(())
    }

    async fn poll_until(&self, step: &SequenceStep, target: &'static str) -> AppResult<()> {
        let started = Instant::now();
        while !self.state.step_finished() && !self.state.should_stop() {
            let status = match step {
                SequenceStep::SetFieldDriven { .. } | SequenceStep::SetFieldPersistent { .. } => {
                    self.ppms.magnet_status().await?
                }
                _ => self.ppms.temperature_status().await?,
            };
            if status == target {
                self.state.set_step_finished(true);
                break;
            }
            if let Some(limit) = self.step_timeout {
                if started.elapsed() >= limit {
                    return Err(DaqError::StepTimeout {
                        step: step.label(),
                        target: target.to_string(),
                        timeout: limit,
                    });
                }
            }
            sleep_watching_stop(self.check_interval, &self.state).await;
        }
        Ok(())
    }
}

/// Sleep for `total`, waking early on a stop request. Returns `true` when
/// the full duration elapsed.
async fn sleep_watching_stop(total: Duration, state: &RunState) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if state.should_stop() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        sleep(STOP_POLL_SLICE.min(deadline - now)).await;
    }
}
