//! Motion backends.
//!
//! A [`Backend`] is the concrete mover of the stage axes: either the adapter
//! for the external acquisition program, or the in-process simulator. The
//! core never talks to hardware except through this trait.
//!
//! # Contract
//! - All methods take `&self`; implementations use interior mutability.
//! - `move_relative` resolves once the move is complete and returns the
//!   confirmed absolute position.
//! - Faults are reported as `anyhow::Error`; the core maps them into its own
//!   error taxonomy.

pub mod fault;
pub mod simulated;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::axis::Axis;
use crate::config::{BackendConfig, BackendKind};

pub use fault::FaultPlan;
pub use simulated::SimulatedStage;

/// Capability: multi-axis stage motion.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name used in logs and status messages.
    fn name(&self) -> &str;

    /// Whether moves are modelled in software.
    ///
    /// The motion controller trusts its own bookkeeping for simulated
    /// backends (`current + delta`) and skips reconciliation polls.
    fn is_simulated(&self) -> bool {
        false
    }

    /// Discover and open the control surface.
    async fn connect(&self) -> Result<()>;

    /// Current position of `axis` in µm.
    async fn position(&self, axis: Axis) -> Result<f64>;

    /// Move `axis` by `delta` µm and return the confirmed new position.
    async fn move_relative(&self, axis: Axis, delta: f64) -> Result<f64>;

    /// Cheap liveness check used by the health monitor.
    ///
    /// # Default Implementation
    /// Reads the Z position.
    async fn probe(&self) -> Result<()> {
        self.position(Axis::Z).await.map(|_| ())
    }
}

/// Hardware slot with no control surface attached.
///
/// Every connection attempt fails with a readable reason, so the connection
/// manager settles into simulation mode.
#[derive(Debug, Clone)]
pub struct OfflineBackend {
    reason: String,
}

impl OfflineBackend {
    /// Offline backend reporting `reason` on every connection attempt.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Default for OfflineBackend {
    fn default() -> Self {
        Self::new("no stage control surface configured")
    }
}

#[async_trait]
impl Backend for OfflineBackend {
    fn name(&self) -> &str {
        "offline"
    }

    async fn connect(&self) -> Result<()> {
        anyhow::bail!("{}", self.reason)
    }

    async fn position(&self, axis: Axis) -> Result<f64> {
        anyhow::bail!("{}: cannot read axis {axis}", self.reason)
    }

    async fn move_relative(&self, axis: Axis, _delta: f64) -> Result<f64> {
        anyhow::bail!("{}: cannot move axis {axis}", self.reason)
    }
}

/// Build the hardware backend selected in configuration.
pub fn from_config(config: &BackendConfig) -> Arc<dyn Backend> {
    match config.kind {
        BackendKind::Offline => Arc::new(OfflineBackend::default()),
        BackendKind::Simulated => Arc::new(
            SimulatedStage::builder()
                .name("simulated-hardware")
                .reports_simulated(false)
                .motion_speed(config.motion_speed)
                .build(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offline_backend_always_refuses() {
        let backend = OfflineBackend::new("acquisition program not running");
        let err = backend.connect().await.unwrap_err();
        assert!(err.to_string().contains("acquisition program not running"));
        assert!(backend.position(Axis::X).await.is_err());
        assert!(backend.move_relative(Axis::Z, 1.0).await.is_err());
        assert!(backend.probe().await.is_err());
        assert!(!backend.is_simulated());
    }

    #[tokio::test]
    async fn from_config_builds_selected_backend() {
        let offline = from_config(&BackendConfig::default());
        assert_eq!(offline.name(), "offline");

        let simulated = from_config(&BackendConfig {
            kind: BackendKind::Simulated,
            motion_speed: 0.0,
        });
        assert!(!simulated.is_simulated());
        simulated.connect().await.unwrap();
        assert_eq!(simulated.move_relative(Axis::Z, 2.5).await.unwrap(), 2.5);
    }
}
