//! Stage motion control.
//!
//! [`StageMotionController`] is the single owner of per-axis position state.
//! Every move is validated before anything is touched, executed against the
//! backend the [`ConnectionManager`] hands out *for that move*, and committed
//! only once the backend confirms it. Each committed move publishes exactly
//! one `PositionChanged` notification.
//!
//! Moves are serialised by an async gate, so positions are committed (and
//! announced) in the order the moves were issued.
//!
//! Positions tracked against the simulator are not carried over to the
//! hardware: the first move after the link (re)connects reconciles every
//! axis with the hardware before computing its delta.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::axis::{Axis, AxisPosition, AxisSelector, MoveRequest};
use crate::backend::Backend;
use crate::config::{AxisConfig, StageConfig, StepLimits};
use crate::connection::ConnectionManager;
use crate::error::{StageError, StageResult, ValidationError};
use crate::events::{EventBus, StageEvent};
use crate::scheduler::PeriodicTask;

/// Validated, backend-agnostic stage mover.
pub struct StageMotionController {
    connection: Arc<ConnectionManager>,
    events: EventBus,
    limits: StepLimits,
    axes: RwLock<BTreeMap<Axis, AxisPosition>>,
    move_gate: Mutex<()>,
    // Whether local positions were last reconciled with the hardware.
    hardware_synced: AtomicBool,
}

impl StageMotionController {
    /// Controller for `axes`, all starting at position 0.
    ///
    /// # Errors
    /// `StageError::Config` for an empty axis list, duplicate axes or
    /// non-positive tolerances.
    pub fn new(
        connection: Arc<ConnectionManager>,
        limits: StepLimits,
        axes: &[AxisConfig],
        events: EventBus,
    ) -> StageResult<Self> {
        if axes.is_empty() {
            return Err(StageError::Config("no axes configured".to_string()));
        }
        let mut table = BTreeMap::new();
        for cfg in axes {
            if !(cfg.tolerance > 0.0) {
                return Err(StageError::Config(format!(
                    "axis {} tolerance must be positive",
                    cfg.axis
                )));
            }
            let position = AxisPosition::new(0.0, cfg.tolerance).with_travel(cfg.travel_range());
            if table.insert(cfg.axis, position).is_some() {
                return Err(StageError::Config(format!("duplicate axis {}", cfg.axis)));
            }
        }

        Ok(Self {
            connection,
            events,
            limits,
            axes: RwLock::new(table),
            move_gate: Mutex::new(()),
            hardware_synced: AtomicBool::new(false),
        })
    }

    /// Controller built from the `axes` and `limits` configuration sections.
    pub fn from_config(
        config: &StageConfig,
        connection: Arc<ConnectionManager>,
        events: EventBus,
    ) -> StageResult<Self> {
        Self::new(connection, config.limits, &config.axes, events)
    }

    /// Move `axis` by `delta` µm.
    ///
    /// Rejected without any mutation when `|delta|` is outside
    /// `[min_step, max_step]`, the axis is unknown, or the target leaves the
    /// travel range. Returns the confirmed new position.
    pub async fn move_relative(&self, axis: Axis, delta: f64) -> StageResult<f64> {
        let _gate = self.move_gate.lock().await;
        self.move_relative_locked(axis, delta).await
    }

    /// Move `axis` to `target` µm.
    ///
    /// A target already within tolerance is a successful no-op that still
    /// publishes the current position.
    pub async fn move_absolute(&self, axis: Axis, target: f64) -> StageResult<f64> {
        let _gate = self.move_gate.lock().await;
        self.move_absolute_locked(axis, target).await
    }

    /// Move X, Y and Z to absolute targets, in that order.
    ///
    /// Stops at the first failing axis and reports which axes had already
    /// moved; the caller may simply retry.
    pub async fn set_multi_axis(&self, x: f64, y: f64, z: f64) -> StageResult<()> {
        let _gate = self.move_gate.lock().await;
        self.move_each_locked(&[(Axis::X, x), (Axis::Y, y), (Axis::Z, z)])
            .await
    }

    /// Move one axis, or every configured axis, back to 0.
    pub async fn reset_axis(&self, selector: impl Into<AxisSelector>) -> StageResult<()> {
        let _gate = self.move_gate.lock().await;
        match selector.into() {
            AxisSelector::One(axis) => self.move_absolute_locked(axis, 0.0).await.map(|_| ()),
            AxisSelector::All => {
                let targets: Vec<_> = self.axes().into_iter().map(|axis| (axis, 0.0)).collect();
                self.move_each_locked(&targets).await
            }
        }
    }

    /// Reconcile local positions with the backend.
    ///
    /// Picks up moves made outside this controller (an operator driving the
    /// stage directly). Only axes that drifted beyond tolerance are updated
    /// and announced. Simulated backends only move through this controller,
    /// so there is nothing to reconcile.
    pub async fn refresh(&self) -> StageResult<Vec<Axis>> {
        let _gate = self.move_gate.lock().await;
        let backend = self.connection.active_backend();
        if backend.is_simulated() {
            self.hardware_synced.store(false, Ordering::SeqCst);
            return Ok(Vec::new());
        }
        Ok(self.reconcile(&backend).await)
    }

    /// Run [`refresh`](Self::refresh) every `interval`.
    ///
    /// The returned task belongs to the caller; dropping it stops polling.
    pub fn start_polling(self: &Arc<Self>, interval: Duration) -> StageResult<PeriodicTask> {
        let controller = Arc::downgrade(self);
        PeriodicTask::spawn("position-poll", interval, move || {
            let controller = controller.clone();
            Box::pin(async move {
                let Some(controller) = controller.upgrade() else {
                    return ControlFlow::Break(());
                };
                if let Err(e) = controller.refresh().await {
                    warn!(error = %e, "position refresh failed");
                }
                ControlFlow::Continue(())
            })
        })
    }

    /// Last confirmed position of `axis`.
    pub fn position(&self, axis: Axis) -> Option<f64> {
        self.axes.read().get(&axis).map(|state| state.current)
    }

    /// Snapshot of every axis.
    pub fn positions(&self) -> BTreeMap<Axis, AxisPosition> {
        self.axes.read().clone()
    }

    /// Configured axes in X, Y, Z order.
    pub fn axes(&self) -> Vec<Axis> {
        self.axes.read().keys().copied().collect()
    }

    /// Step bounds applied to every move.
    pub fn limits(&self) -> StepLimits {
        self.limits
    }

    fn axis_state(&self, axis: Axis) -> Result<AxisPosition, ValidationError> {
        self.axes
            .read()
            .get(&axis)
            .copied()
            .ok_or(ValidationError::UnknownAxis(axis))
    }

    /// Active backend, with local positions reconciled if the link has
    /// switched to the hardware since the last hardware read. Gate held.
    async fn synced_backend(&self) -> Arc<dyn Backend> {
        let backend = self.connection.active_backend();
        if backend.is_simulated() {
            self.hardware_synced.store(false, Ordering::SeqCst);
        } else if !self.hardware_synced.load(Ordering::SeqCst) {
            let changed = self.reconcile(&backend).await;
            debug!(changed = ?changed, backend = backend.name(), "positions reconciled with hardware");
        }
        backend
    }

    /// Pull every axis position from `backend`. Gate held.
    ///
    /// Marks the controller synced only when every axis was read.
    async fn reconcile(&self, backend: &Arc<dyn Backend>) -> Vec<Axis> {
        let mut changed = Vec::new();
        let mut complete = true;
        for axis in self.axes() {
            let reported = match backend.position(axis).await {
                Ok(value) if value.is_finite() => value,
                Ok(value) => {
                    warn!(axis = %axis, value, "backend reported a non-finite position");
                    complete = false;
                    continue;
                }
                Err(e) => {
                    warn!(axis = %axis, error = %format!("{e:#}"), "position poll failed");
                    complete = false;
                    continue;
                }
            };

            let drifted = {
                let mut axes = self.axes.write();
                match axes.get_mut(&axis) {
                    Some(state) if !state.within_tolerance(reported) => {
                        state.current = reported;
                        state.target = reported;
                        true
                    }
                    _ => false,
                }
            };
            if drifted {
                debug!(axis = %axis, position = reported, "external position change");
                self.publish_position(axis, reported);
                changed.push(axis);
            }
        }
        self.hardware_synced.store(complete, Ordering::SeqCst);
        changed
    }

    async fn move_relative_locked(&self, axis: Axis, delta: f64) -> StageResult<f64> {
        let backend = self.synced_backend().await;
        let state = self.axis_state(axis)?;
        let delta = MoveRequest::relative(axis, delta).validate(&self.limits, &state)?;
        self.execute(&backend, axis, state, delta).await
    }

    async fn move_absolute_locked(&self, axis: Axis, target: f64) -> StageResult<f64> {
        let backend = self.synced_backend().await;
        let state = self.axis_state(axis)?;
        if !target.is_finite() {
            return Err(ValidationError::NonFinite {
                field: "target",
                value: target,
            }
            .into());
        }
        if state.within_tolerance(target) {
            // Already there: no backend round-trip.
            self.publish_position(axis, state.current);
            return Ok(state.current);
        }
        let delta = MoveRequest::absolute(axis, target).validate(&self.limits, &state)?;
        self.execute(&backend, axis, state, delta).await
    }

    async fn move_each_locked(&self, targets: &[(Axis, f64)]) -> StageResult<()> {
        let mut completed = Vec::with_capacity(targets.len());
        for &(axis, target) in targets {
            if let Err(e) = self.move_absolute_locked(axis, target).await {
                warn!(axis = %axis, error = %e, completed = ?completed, "multi-axis move interrupted");
                return Err(StageError::PartialMove {
                    failed: axis,
                    completed,
                    reason: e.to_string(),
                });
            }
            completed.push(axis);
        }
        Ok(())
    }

    /// Send a validated delta to `backend` and commit the result.
    async fn execute(
        &self,
        backend: &Arc<dyn Backend>,
        axis: Axis,
        state: AxisPosition,
        delta: f64,
    ) -> StageResult<f64> {
        let target = state.current + delta;
        if let Some(slot) = self.axes.write().get_mut(&axis) {
            slot.target = target;
        }

        let confirmed = match backend.move_relative(axis, delta).await {
            Ok(_) if backend.is_simulated() => target,
            Ok(reported) if reported.is_finite() => reported,
            Ok(reported) => {
                return Err(StageError::Movement {
                    axis,
                    message: format!("{} confirmed a non-finite position {reported}", backend.name()),
                });
            }
            Err(e) => {
                warn!(axis = %axis, delta, backend = backend.name(), error = %format!("{e:#}"), "move failed");
                return Err(StageError::movement(axis, &e));
            }
        };

        if let Some(slot) = self.axes.write().get_mut(&axis) {
            slot.current = confirmed;
        }
        debug!(axis = %axis, delta, position = confirmed, backend = backend.name(), "move committed");
        self.publish_position(axis, confirmed);
        Ok(confirmed)
    }

    fn publish_position(&self, axis: Axis, position: f64) {
        self.events
            .publish(StageEvent::PositionChanged { axis, position });
    }
}
