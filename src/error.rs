//! Error taxonomy for the stage control core.
//!
//! Using the `thiserror` crate, this module defines the two error types that
//! cross the core boundary:
//!
//! - **`ValidationError`**: a request was rejected before any state was
//!   touched (out-of-range step, unknown axis, a `start()` while a sequence is
//!   already running, ...). Always surfaced synchronously to the caller.
//! - **`StageError`**: the umbrella type returned by every fallible core
//!   operation. Its variants map onto [`ErrorKind`]:
//!   - `Connection`: discovery failure or a lost link. The
//!     connection manager absorbs these into state transitions; they only
//!     appear in log entries and status messages.
//!   - `Validation`: wraps a `ValidationError`.
//!   - `Movement` / `PartialMove`: the backend reported a fault while moving.
//!     Position is left at its last confirmed value.
//!   - `Resource`: a periodic task could not be armed.
//!   - `Config`: invalid configuration, reported at construction time.
//!
//! Backends speak `anyhow::Error`; the core converts at the boundary so the
//! notification stream always carries a structured, cloneable `StageError`.

use std::fmt;
use thiserror::Error;

use crate::axis::Axis;

/// Convenience alias for results using the core error type.
pub type StageResult<T> = std::result::Result<T, StageError>;

/// Coarse classification of a [`StageError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Link to the control surface is unavailable
    Connection,
    /// Request rejected before any mutation
    Validation,
    /// Backend fault during a move
    Movement,
    /// Timer or runtime unavailable
    Resource,
    /// Invalid configuration
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Validation => "validation",
            ErrorKind::Movement => "movement",
            ErrorKind::Resource => "resource",
            ErrorKind::Config => "config",
        };
        f.write_str(name)
    }
}

/// A request that was rejected before touching any state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Step size {value} is outside [{min}, {max}]")]
    StepOutOfRange { value: f64, min: f64, max: f64 },

    #[error("{field} must be finite, got {value}")]
    NonFinite { field: &'static str, value: f64 },

    #[error("Number of steps must be a positive integer")]
    NoSteps,

    #[error("Number of steps {requested} exceeds the limit of {max}")]
    TooManySteps { requested: u32, max: u32 },

    #[error("Step delay {value_ms}ms is outside [{min_ms}ms, {max_ms}ms]")]
    DelayOutOfRange {
        value_ms: u128,
        min_ms: u128,
        max_ms: u128,
    },

    #[error("Axis {0} is not configured on this stage")]
    UnknownAxis(Axis),

    #[error("'{0}' is not an axis name (expected X, Y or Z)")]
    InvalidAxisName(String),

    #[error("Target {target} on axis {axis} is outside travel range [{min}, {max}]")]
    OutOfTravel {
        axis: Axis,
        target: f64,
        min: f64,
        max: f64,
    },

    #[error("An auto-step sequence is already running")]
    AlreadyRunning,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Primary error type of the core.
#[derive(Error, Debug, Clone)]
pub enum StageError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Movement error on axis {axis}: {message}")]
    Movement { axis: Axis, message: String },

    #[error("Multi-axis move failed on axis {failed} after {completed:?} succeeded: {reason}")]
    PartialMove {
        failed: Axis,
        completed: Vec<Axis>,
        reason: String,
    },

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StageError {
    /// Wrap a backend fault reported while moving `axis`.
    pub fn movement(axis: Axis, err: &anyhow::Error) -> Self {
        StageError::Movement {
            axis,
            message: format!("{err:#}"),
        }
    }

    /// Taxonomy bucket of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Validation(_) => ErrorKind::Validation,
            StageError::Connection(_) => ErrorKind::Connection,
            StageError::Movement { .. } | StageError::PartialMove { .. } => ErrorKind::Movement,
            StageError::Resource(_) => ErrorKind::Resource,
            StageError::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether the caller may simply retry the failed operation.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Config | ErrorKind::Resource)
    }
}

impl From<figment::Error> for StageError {
    fn from(err: figment::Error) -> Self {
        StageError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_every_variant() {
        let cases = [
            (
                StageError::from(ValidationError::NoSteps),
                ErrorKind::Validation,
                true,
            ),
            (
                StageError::Connection("link lost".into()),
                ErrorKind::Connection,
                true,
            ),
            (
                StageError::Movement {
                    axis: Axis::Z,
                    message: "stall".into(),
                },
                ErrorKind::Movement,
                true,
            ),
            (
                StageError::PartialMove {
                    failed: Axis::Y,
                    completed: vec![Axis::X],
                    reason: "limit".into(),
                },
                ErrorKind::Movement,
                true,
            ),
            (
                StageError::Resource("no runtime".into()),
                ErrorKind::Resource,
                false,
            ),
            (
                StageError::Config("bad".into()),
                ErrorKind::Config,
                false,
            ),
        ];

        for (err, kind, recoverable) in cases {
            assert_eq!(err.kind(), kind, "{err}");
            assert_eq!(err.is_recoverable(), recoverable, "{err}");
        }
    }

    #[test]
    fn movement_error_keeps_backend_context() {
        let backend = anyhow::anyhow!("limit switch engaged").context("move_relative Z");
        let err = StageError::movement(Axis::Z, &backend);
        let text = err.to_string();
        assert!(text.contains("axis Z"));
        assert!(text.contains("limit switch engaged"));
    }
}
