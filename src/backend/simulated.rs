//! Simulated stage backend.
//!
//! Keeps per-axis positions in memory. Used in two roles:
//!
//! - the simulation-mode fallback the connection manager hands out when the
//!   control surface is unreachable;
//! - a stand-in for hardware in tests and demos (with [`FaultPlan`] to make
//!   it misbehave on purpose).
//!
//! All delays use `tokio::time::sleep`, never `std::thread::sleep`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::debug;

use super::{Backend, FaultPlan};
use crate::axis::Axis;

/// Hardware limit of one simulated axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatedLimit {
    /// Lowest reachable position
    pub min: f64,
    /// Highest reachable position
    pub max: f64,
}

/// In-memory multi-axis stage.
///
/// # Example
///
/// ```
/// use stage_control::axis::Axis;
/// use stage_control::backend::{Backend, SimulatedStage};
///
/// # tokio_test::block_on(async {
/// let stage = SimulatedStage::builder()
///     .initial_position(Axis::Z, 100.0)
///     .motion_speed(500.0)
///     .build();
///
/// let z = stage.move_relative(Axis::Z, 5.0).await.unwrap();
/// assert_eq!(z, 105.0);
/// # });
/// ```
pub struct SimulatedStage {
    name: String,
    reports_simulated: bool,
    positions: RwLock<HashMap<Axis, f64>>,
    limits: HashMap<Axis, SimulatedLimit>,
    /// Motion speed in µm/s; 0 means instant moves
    motion_speed: f64,
    connected: AtomicBool,
    move_count: AtomicU64,
    faults: Arc<FaultPlan>,
}

impl SimulatedStage {
    /// Instant, fault-free simulator with every axis at 0.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for configuring the simulator.
    pub fn builder() -> SimulatedStageBuilder {
        SimulatedStageBuilder::new()
    }

    /// Shared handle to the fault plan (flip faults at runtime).
    pub fn faults(&self) -> Arc<FaultPlan> {
        Arc::clone(&self.faults)
    }

    /// Teleport an axis, as if an operator moved the stage by hand.
    pub fn set_position(&self, axis: Axis, position: f64) {
        self.positions.write().insert(axis, position);
    }

    /// Current position without going through the async trait.
    pub fn position_now(&self, axis: Axis) -> f64 {
        self.positions.read().get(&axis).copied().unwrap_or(0.0)
    }

    /// Number of successful moves performed.
    pub fn move_count(&self) -> u64 {
        self.move_count.load(Ordering::SeqCst)
    }

    /// Whether `connect()` has succeeded at least once.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn motion_duration(&self, delta: f64) -> Duration {
        if self.motion_speed > 0.0 {
            Duration::from_secs_f64(delta.abs() / self.motion_speed)
        } else {
            Duration::ZERO
        }
    }
}

impl Default for SimulatedStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for SimulatedStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_simulated(&self) -> bool {
        self.reports_simulated
    }

    async fn connect(&self) -> Result<()> {
        self.faults.check_connect()?;
        self.connected.store(true, Ordering::SeqCst);
        debug!(backend = %self.name, "connected");
        Ok(())
    }

    async fn position(&self, axis: Axis) -> Result<f64> {
        Ok(self.position_now(axis))
    }

    async fn move_relative(&self, axis: Axis, delta: f64) -> Result<f64> {
        self.faults.check_move()?;

        let current = self.position_now(axis);
        let target = current + delta;
        if let Some(limit) = self.limits.get(&axis) {
            if target < limit.min || target > limit.max {
                bail!(
                    "hardware limit reached on axis {axis}: {target:.3} outside [{:.3}, {:.3}]",
                    limit.min,
                    limit.max
                );
            }
        }

        let duration = self.motion_duration(delta);
        if !duration.is_zero() {
            sleep(duration).await;
        }

        // Re-read under the write lock; `set_position` may have run while moving.
        let confirmed = {
            let mut positions = self.positions.write();
            let slot = positions.entry(axis).or_insert(0.0);
            *slot += delta;
            *slot
        };
        self.move_count.fetch_add(1, Ordering::SeqCst);
        debug!(backend = %self.name, axis = %axis, delta, confirmed, "simulated move");
        Ok(confirmed)
    }

    async fn probe(&self) -> Result<()> {
        self.faults.check_probe()
    }
}

/// Builder for [`SimulatedStage`].
pub struct SimulatedStageBuilder {
    name: String,
    reports_simulated: bool,
    positions: HashMap<Axis, f64>,
    limits: HashMap<Axis, SimulatedLimit>,
    motion_speed: f64,
    faults: FaultPlan,
}

impl SimulatedStageBuilder {
    fn new() -> Self {
        Self {
            name: "simulator".to_string(),
            reports_simulated: true,
            positions: Axis::ALL.into_iter().map(|axis| (axis, 0.0)).collect(),
            limits: HashMap::new(),
            motion_speed: 0.0,
            faults: FaultPlan::none(),
        }
    }

    /// Backend name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Whether the stage identifies itself as simulated.
    ///
    /// Set to `false` to let the simulator play the part of real hardware.
    pub fn reports_simulated(mut self, simulated: bool) -> Self {
        self.reports_simulated = simulated;
        self
    }

    /// Starting position of one axis.
    pub fn initial_position(mut self, axis: Axis, position: f64) -> Self {
        self.positions.insert(axis, position);
        self
    }

    /// Hard travel limit of one axis; moves beyond it fail.
    pub fn limit(mut self, axis: Axis, min: f64, max: f64) -> Self {
        self.limits.insert(axis, SimulatedLimit { min, max });
        self
    }

    /// Motion speed in µm/s (0 = instant).
    pub fn motion_speed(mut self, speed: f64) -> Self {
        self.motion_speed = if speed.is_finite() { speed.max(0.0) } else { 0.0 };
        self
    }

    /// Fault injection plan.
    pub fn faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    /// Build the stage.
    pub fn build(self) -> SimulatedStage {
        SimulatedStage {
            name: self.name,
            reports_simulated: self.reports_simulated,
            positions: RwLock::new(self.positions),
            limits: self.limits,
            motion_speed: self.motion_speed,
            connected: AtomicBool::new(false),
            move_count: AtomicU64::new(0),
            faults: Arc::new(self.faults),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn relative_moves_accumulate() {
        let stage = SimulatedStage::new();
        assert_eq!(stage.move_relative(Axis::Z, 5.0).await.unwrap(), 5.0);
        assert_eq!(stage.move_relative(Axis::Z, 10.0).await.unwrap(), 15.0);
        assert_eq!(stage.move_relative(Axis::Z, -3.0).await.unwrap(), 12.0);
        assert_eq!(stage.position(Axis::Z).await.unwrap(), 12.0);
        assert_eq!(stage.position(Axis::X).await.unwrap(), 0.0);
        assert_eq!(stage.move_count(), 3);
    }

    #[tokio::test]
    async fn hardware_limit_leaves_position_untouched() {
        let stage = SimulatedStage::builder()
            .initial_position(Axis::Z, 95.0)
            .limit(Axis::Z, 0.0, 100.0)
            .build();

        let err = stage.move_relative(Axis::Z, 10.0).await.unwrap_err();
        assert!(err.to_string().contains("hardware limit"));
        assert_eq!(stage.position_now(Axis::Z), 95.0);
    }

    #[tokio::test]
    async fn motion_speed_adds_travel_time() {
        let stage = SimulatedStage::builder().motion_speed(1000.0).build();

        let start = Instant::now();
        stage.move_relative(Axis::Y, 50.0).await.unwrap();
        let elapsed = start.elapsed();

        assert!(
            elapsed >= Duration::from_millis(45),
            "Expected ~50ms, got {}ms",
            elapsed.as_millis()
        );
    }

    #[tokio::test]
    async fn injected_faults_surface_as_errors() {
        let stage = SimulatedStage::builder()
            .faults(FaultPlan::none().fail_first_connects(1).fail_moves_after(1))
            .build();

        assert!(stage.connect().await.is_err());
        assert!(!stage.is_connected());
        stage.connect().await.unwrap();
        assert!(stage.is_connected());

        stage.move_relative(Axis::X, 1.0).await.unwrap();
        assert!(stage.move_relative(Axis::X, 1.0).await.is_err());
        assert_eq!(stage.position_now(Axis::X), 1.0);

        stage.faults().set_probe_failing(true);
        assert!(stage.probe().await.is_err());
    }

    #[tokio::test]
    async fn manual_repositioning_is_visible() {
        let stage = SimulatedStage::new();
        stage.set_position(Axis::X, -42.0);
        assert_eq!(stage.position(Axis::X).await.unwrap(), -42.0);
    }
}
