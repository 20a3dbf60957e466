//! # Stage Control Core Library
//!
//! Control core for a three-axis (X, Y, Z) motorized microscope stage. It
//! owns the link to the stage hardware, moves axes safely, and runs
//! unattended stepping scans (focus searches) whose progress is published
//! as notifications.
//!
//! ## Crate Structure
//!
//! - **`axis`**: Axis identifiers, per-axis position state and move validation.
//! - **`backend`**: The `Backend` trait plus the simulated and offline
//!   backends.
//! - **`config`**: Figment-based configuration (`StageConfig`) loaded from
//!   TOML and `STAGE_*` environment variables.
//! - **`connection`**: `ConnectionManager`, which discovers hardware, falls back
//!   to simulation, retries with exponential backoff and monitors link health.
//! - **`error`**: `StageError` and `ValidationError`.
//! - **`events`**: `StageEvent` notifications over a broadcast `EventBus`.
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`motion`**: `StageMotionController` for bounded relative, absolute and
//!   multi-axis moves.
//! - **`scheduler`**: `PeriodicTask`, a cancellable interval timer.
//! - **`sequencer`**: `AutoStepSequencer`, the auto-step state machine.
//!
//! ## Wiring
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use stage_control::prelude::*;
//!
//! # async fn run() -> Result<(), StageError> {
//! let config = StageConfig::load()?;
//! let events = EventBus::default();
//!
//! let connection = Arc::new(ConnectionManager::from_config(
//!     &config,
//!     stage_control::backend::from_config(&config.backend),
//!     Arc::new(SimulatedStage::new()),
//!     events.clone(),
//! )?);
//! let (state, message) = connection.connect().await;
//! tracing::info!(%state, %message, "link ready");
//!
//! let motion = Arc::new(StageMotionController::from_config(
//!     &config,
//!     Arc::clone(&connection),
//!     events.clone(),
//! )?);
//! motion.move_relative(Axis::Z, 5.0).await?;
//!
//! let sequencer = AutoStepSequencer::from_config(&config, Arc::clone(&motion), events);
//! let params = AutoStepParams::new(Axis::Z, 1.0, 5, Duration::from_millis(100));
//! sequencer.start(params, || 0.0).await?;
//! # Ok(())
//! # }
//! ```

pub mod axis;
pub mod backend;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod logging;
pub mod motion;
pub mod scheduler;
pub mod sequencer;

pub use error::{ErrorKind, StageError, StageResult, ValidationError};

/// Commonly used types.
pub mod prelude {
    pub use crate::axis::{Axis, AxisPosition, AxisSelector};
    pub use crate::backend::{Backend, FaultPlan, OfflineBackend, SimulatedStage};
    pub use crate::config::StageConfig;
    pub use crate::connection::{ConnectionManager, ConnectionState, RetryOutcome, RetryPolicy};
    pub use crate::error::{StageError, StageResult, ValidationError};
    pub use crate::events::{EventBus, Sample, StageEvent};
    pub use crate::motion::StageMotionController;
    pub use crate::sequencer::{
        AutoStepParams, AutoStepSequencer, Direction, MetricSampler, SequenceOutcome,
        SequenceReport, SequenceState,
    };
}
