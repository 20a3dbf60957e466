//! AutoStepSequencer - unattended stepping scans (focus search)
//!
//! Drives a bounded series of equal relative moves on one axis from a
//! [`PeriodicTask`], optionally sampling a caller-supplied metric after each
//! move, and reports the position of the best metric when the run completes.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐  start()   ┌─────────┐   last step    ┌───────────┐
//! │ Idle │───────────▶│ Running │───────────────▶│ Completed │──┐
//! └──────┘            └────┬────┘                └───────────┘  │
//!    ▲                     │ stop()              ┌───────────┐  │
//!    │                     ├────────────────────▶│ Cancelled │──┤
//!    │                     │ move fails          ┌───────────┐  │
//!    │                     └────────────────────▶│  Errored  │──┤
//!    │                                           └───────────┘  │
//!    └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The terminal outcome is recorded in a [`SequenceReport`] and the state
//! machine is back to `Idle` immediately. The session itself never outlives
//! its run.
//!
//! # Cancellation
//!
//! A tick holds the run lock for its whole step (move, sample, notify).
//! `stop()` takes the same lock, so it can only land between ticks; it then
//! aborts the timer task and waits for it to be gone before returning. No
//! step side effect can fire after `stop()` returns, and a new `start()`
//! is accepted right away.

use parking_lot::RwLock;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::axis::Axis;
use crate::config::{SequencerLimits, StageConfig};
use crate::error::{StageError, StageResult, ValidationError};
use crate::events::{EventBus, Sample, StageEvent};
use crate::motion::StageMotionController;
use crate::scheduler::PeriodicTask;

/// Source of the scalar metric sampled after each step.
///
/// Any `Fn() -> f64 + Send + Sync` closure is a sampler.
pub trait MetricSampler: Send + Sync {
    /// Sample the metric at the current stage position.
    fn sample(&self) -> f64;
}

impl<F> MetricSampler for F
where
    F: Fn() -> f64 + Send + Sync,
{
    fn sample(&self) -> f64 {
        self()
    }
}

/// Scan direction along the axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Increasing positions
    Up,
    /// Decreasing positions
    Down,
}

impl Direction {
    /// `+1.0` or `-1.0`
    pub fn sign(self) -> f64 {
        match self {
            Direction::Up => 1.0,
            Direction::Down => -1.0,
        }
    }
}

/// Parameters of one auto-step run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutoStepParams {
    /// Axis to step
    pub axis: Axis,
    /// Step magnitude in µm (positive)
    pub step_size: f64,
    /// Scan direction
    pub direction: Direction,
    /// Number of steps (>= 1)
    pub num_steps: u32,
    /// Delay between steps
    pub delay: Duration,
    /// Whether to call the metric sampler after each step
    pub record_metrics: bool,
}

impl AutoStepParams {
    /// Upward scan with metric recording enabled.
    pub fn new(axis: Axis, step_size: f64, num_steps: u32, delay: Duration) -> Self {
        Self {
            axis,
            step_size,
            direction: Direction::Up,
            num_steps,
            delay,
            record_metrics: true,
        }
    }

    /// Set the scan direction.
    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Enable or disable metric recording.
    pub fn record_metrics(mut self, record: bool) -> Self {
        self.record_metrics = record;
        self
    }

    /// The delta handed to every `move_relative` call.
    pub fn signed_step(&self) -> f64 {
        self.direction.sign() * self.step_size
    }
}

/// Whether a sequence is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    /// Ready to start
    Idle,
    /// Stepping
    Running,
}

impl fmt::Display for SequenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceState::Idle => write!(f, "idle"),
            SequenceState::Running => write!(f, "running"),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// Every step executed
    Completed,
    /// Stopped by the caller
    Cancelled,
    /// A move failed
    Errored,
}

impl fmt::Display for SequenceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequenceOutcome::Completed => write!(f, "completed"),
            SequenceOutcome::Cancelled => write!(f, "cancelled"),
            SequenceOutcome::Errored => write!(f, "errored"),
        }
    }
}

/// Progress of the running sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceProgress {
    /// Steps executed so far
    pub current_step: u32,
    /// Steps in the run
    pub total_steps: u32,
}

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct SequenceReport {
    /// How the run ended
    pub outcome: SequenceOutcome,
    /// Axis that was stepped
    pub axis: Axis,
    /// Steps executed
    pub steps_completed: u32,
    /// Steps requested
    pub total_steps: u32,
    /// Recorded `(position, metric)` pairs
    pub samples: Vec<Sample>,
    /// Position of the best metric, if any was recorded
    pub peak_position: Option<f64>,
    /// The failure behind an `Errored` outcome
    pub error: Option<StageError>,
    /// Wall time from start to end
    pub elapsed: Duration,
}

/// Live state of one run. Created by `start()`, dropped when the run ends.
#[derive(Debug, Clone)]
pub struct AutoStepSession {
    axis: Axis,
    signed_step: f64,
    total_steps: u32,
    delay: Duration,
    record_metrics: bool,
    current_step: u32,
    samples: Vec<Sample>,
    started: Instant,
}

impl AutoStepSession {
    fn new(params: &AutoStepParams) -> Self {
        Self {
            axis: params.axis,
            signed_step: params.signed_step(),
            total_steps: params.num_steps,
            delay: params.delay,
            record_metrics: params.record_metrics,
            current_step: 0,
            samples: Vec::with_capacity(if params.record_metrics {
                params.num_steps as usize
            } else {
                0
            }),
            started: Instant::now(),
        }
    }

    /// Axis being stepped.
    pub fn axis(&self) -> Axis {
        self.axis
    }

    /// Signed delta applied per step.
    pub fn signed_step(&self) -> f64 {
        self.signed_step
    }

    /// Delay between steps.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Samples recorded so far.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    fn progress(&self) -> SequenceProgress {
        SequenceProgress {
            current_step: self.current_step,
            total_steps: self.total_steps,
        }
    }

    fn is_done(&self) -> bool {
        self.current_step >= self.total_steps
    }

    fn into_report(self, outcome: SequenceOutcome, error: Option<StageError>) -> SequenceReport {
        SequenceReport {
            outcome,
            axis: self.axis,
            steps_completed: self.current_step,
            total_steps: self.total_steps,
            peak_position: peak_of(&self.samples),
            samples: self.samples,
            error,
            elapsed: self.started.elapsed(),
        }
    }
}

/// Position of the highest metric. NaN metrics are ignored; ties keep the
/// earliest sample.
pub fn peak_of(samples: &[Sample]) -> Option<f64> {
    samples
        .iter()
        .filter(|s| !s.metric.is_nan())
        .fold(None::<&Sample>, |best, s| match best {
            Some(b) if b.metric >= s.metric => Some(b),
            _ => Some(s),
        })
        .map(|s| s.position)
}

struct ActiveRun {
    session: AutoStepSession,
    sampler: Arc<dyn MetricSampler>,
}

#[derive(Default)]
struct RunSlot {
    run: Option<ActiveRun>,
    timer: Option<PeriodicTask>,
}

#[derive(Default)]
struct Status {
    progress: Option<SequenceProgress>,
    last_report: Option<SequenceReport>,
}

enum StepResult {
    Moved,
    Done,
    Failed(StageError),
}

struct Core {
    motion: Arc<StageMotionController>,
    events: EventBus,
    slot: Mutex<RunSlot>,
    /// Lock-free mirror of `slot` for synchronous queries
    status: RwLock<Status>,
}

impl Core {
    async fn tick(&self) -> ControlFlow<()> {
        let mut slot = self.slot.lock().await;
        let Some(active) = slot.run.as_mut() else {
            // Orphaned tick: nothing to drive, tear the timer down.
            return ControlFlow::Break(());
        };

        let session = &mut active.session;
        let result = match self
            .motion
            .move_relative(session.axis, session.signed_step)
            .await
        {
            Err(e) => StepResult::Failed(e),
            Ok(position) => {
                if session.record_metrics {
                    let metric = active.sampler.sample();
                    session.samples.push(Sample { position, metric });
                }
                session.current_step += 1;
                let progress = session.progress();
                debug!(
                    axis = %session.axis,
                    step = progress.current_step,
                    total = progress.total_steps,
                    position,
                    "auto-step"
                );
                self.status.write().progress = Some(progress);
                self.events.publish(StageEvent::AutoStepProgress {
                    current_step: progress.current_step,
                    total_steps: progress.total_steps,
                });
                if session.is_done() {
                    StepResult::Done
                } else {
                    StepResult::Moved
                }
            }
        };

        match result {
            StepResult::Moved => ControlFlow::Continue(()),
            StepResult::Done => {
                self.finish(&mut slot, SequenceOutcome::Completed, None);
                ControlFlow::Break(())
            }
            StepResult::Failed(error) => {
                warn!(error = %error, "auto-step aborted");
                self.finish(&mut slot, SequenceOutcome::Errored, Some(error));
                ControlFlow::Break(())
            }
        }
    }

    /// End the active run and publish its terminal notification.
    fn finish(&self, slot: &mut RunSlot, outcome: SequenceOutcome, error: Option<StageError>) {
        let Some(active) = slot.run.take() else {
            return;
        };
        let report = active.session.into_report(outcome, error);
        info!(
            outcome = %outcome,
            axis = %report.axis,
            steps = report.steps_completed,
            total = report.total_steps,
            peak = ?report.peak_position,
            "auto-step sequence ended"
        );

        // Queries must already reflect the finished run when subscribers react.
        {
            let mut status = self.status.write();
            status.progress = None;
            status.last_report = Some(report.clone());
        }

        match outcome {
            SequenceOutcome::Completed => self.events.publish(StageEvent::AutoStepCompleted {
                current_step: report.steps_completed,
                total_steps: report.total_steps,
                samples: report.samples.clone(),
                peak_position: report.peak_position,
            }),
            SequenceOutcome::Errored => {
                if let Some(error) = report.error.clone() {
                    self.events.publish(StageEvent::AutoStepFailed { error });
                }
            }
            SequenceOutcome::Cancelled => {}
        }
    }
}

/// Runs unattended, cancellable stepping sequences.
pub struct AutoStepSequencer {
    core: Arc<Core>,
    limits: SequencerLimits,
}

impl AutoStepSequencer {
    /// Sequencer moving through `motion`, bounded by `limits`.
    pub fn new(
        motion: Arc<StageMotionController>,
        limits: SequencerLimits,
        events: EventBus,
    ) -> Self {
        Self {
            core: Arc::new(Core {
                motion,
                events,
                slot: Mutex::new(RunSlot::default()),
                status: RwLock::new(Status::default()),
            }),
            limits,
        }
    }

    /// Sequencer bounded by the `sequencer` configuration section.
    pub fn from_config(
        config: &StageConfig,
        motion: Arc<StageMotionController>,
        events: EventBus,
    ) -> Self {
        Self::new(motion, config.sequencer, events)
    }

    /// Validate `params` and arm a new run.
    ///
    /// The first step fires one `delay` after this returns.
    ///
    /// # Errors
    /// - `Validation` if a run is already active or a parameter is out of
    ///   bounds; nothing changes.
    /// - `Resource` if the step timer cannot be armed.
    pub async fn start<S>(&self, params: AutoStepParams, sampler: S) -> StageResult<()>
    where
        S: MetricSampler + 'static,
    {
        let mut slot = self.core.slot.lock().await;
        if slot.run.is_some() {
            return Err(ValidationError::AlreadyRunning.into());
        }
        self.validate(&params)?;

        // A previous run that ended on its own leaves a finished timer here.
        if let Some(stale) = slot.timer.take() {
            stale.cancel().await;
        }

        let session = AutoStepSession::new(&params);
        let progress = session.progress();
        slot.run = Some(ActiveRun {
            session,
            sampler: Arc::new(sampler),
        });

        let core: Weak<Core> = Arc::downgrade(&self.core);
        let timer = PeriodicTask::spawn("auto-step", params.delay, move || {
            let core = core.clone();
            Box::pin(async move {
                match core.upgrade() {
                    Some(core) => core.tick().await,
                    None => ControlFlow::Break(()),
                }
            })
        });
        match timer {
            Ok(timer) => slot.timer = Some(timer),
            Err(e) => {
                slot.run = None;
                return Err(e);
            }
        }

        self.core.status.write().progress = Some(progress);
        info!(
            axis = %params.axis,
            step = params.signed_step(),
            steps = params.num_steps,
            delay_ms = params.delay.as_millis() as u64,
            record_metrics = params.record_metrics,
            "auto-step sequence started"
        );
        Ok(())
    }

    /// Cancel the active run.
    ///
    /// Returns once the step timer is fully released. Calling it with no run
    /// active is a no-op. Returns whether a run was cancelled.
    pub async fn stop(&self) -> bool {
        let mut slot = self.core.slot.lock().await;
        if slot.run.is_none() {
            return false;
        }
        let timer = slot.timer.take();
        self.core
            .finish(&mut slot, SequenceOutcome::Cancelled, None);
        if let Some(timer) = timer {
            timer.cancel().await;
        }
        true
    }

    /// `Running` while a run is active, `Idle` otherwise.
    pub fn state(&self) -> SequenceState {
        if self.is_running() {
            SequenceState::Running
        } else {
            SequenceState::Idle
        }
    }

    /// Whether a run is active.
    pub fn is_running(&self) -> bool {
        self.core.status.read().progress.is_some()
    }

    /// Progress of the active run.
    pub fn progress(&self) -> Option<SequenceProgress> {
        self.core.status.read().progress
    }

    /// Report of the most recently finished run.
    pub fn last_report(&self) -> Option<SequenceReport> {
        self.core.status.read().last_report.clone()
    }

    /// Bounds applied by `start()`.
    pub fn limits(&self) -> SequencerLimits {
        self.limits
    }

    fn validate(&self, params: &AutoStepParams) -> Result<(), ValidationError> {
        if self.core.motion.position(params.axis).is_none() {
            return Err(ValidationError::UnknownAxis(params.axis));
        }
        if !params.step_size.is_finite() {
            return Err(ValidationError::NonFinite {
                field: "step_size",
                value: params.step_size,
            });
        }
        let step_limits = self.core.motion.limits();
        if params.step_size < 0.0 {
            return Err(ValidationError::StepOutOfRange {
                value: params.step_size,
                min: step_limits.min_step,
                max: step_limits.max_step,
            });
        }
        step_limits.check_step(params.step_size)?;
        self.limits.check_steps(params.num_steps)?;
        self.limits.check_delay(params.delay)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(position: f64, metric: f64) -> Sample {
        Sample { position, metric }
    }

    #[test]
    fn peak_picks_highest_metric() {
        let samples = [sample(1.0, 3.0), sample(2.0, 9.0), sample(3.0, 4.0)];
        assert_eq!(peak_of(&samples), Some(2.0));
    }

    #[test]
    fn peak_keeps_first_of_equal_metrics_and_skips_nan() {
        let samples = [
            sample(1.0, f64::NAN),
            sample(2.0, 5.0),
            sample(3.0, 5.0),
            sample(4.0, f64::NAN),
        ];
        assert_eq!(peak_of(&samples), Some(2.0));
        assert_eq!(peak_of(&[sample(1.0, f64::NAN)]), None);
        assert_eq!(peak_of(&[]), None);
    }

    #[test]
    fn direction_is_folded_into_the_step_sign() {
        let params = AutoStepParams::new(Axis::Z, 2.5, 4, Duration::from_millis(10));
        assert_eq!(params.signed_step(), 2.5);
        assert_eq!(params.direction(Direction::Down).signed_step(), -2.5);

        let session = AutoStepSession::new(&params.direction(Direction::Down));
        assert_eq!(session.signed_step(), -2.5);
        assert_eq!(session.progress().current_step, 0);
    }

    #[test]
    fn session_report_counts_steps() {
        let params = AutoStepParams::new(Axis::Z, 1.0, 3, Duration::from_millis(10));
        let mut session = AutoStepSession::new(&params);
        session.current_step = 2;
        session.samples.push(sample(1.0, 1.0));
        session.samples.push(sample(2.0, 0.5));
        assert!(!session.is_done());

        let report = session.into_report(SequenceOutcome::Cancelled, None);
        assert_eq!(report.steps_completed, 2);
        assert_eq!(report.total_steps, 3);
        assert_eq!(report.peak_position, Some(1.0));
    }
}
