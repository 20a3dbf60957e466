//! Axis identifiers, per-axis position state and move requests.
//!
//! Positions are floating point values in physical units (µm). Equality is
//! never tested exactly: two positions are "the same" when they differ by no
//! more than the axis tolerance.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::StepLimits;
use crate::error::ValidationError;

/// A stage axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// Lateral X axis
    X,
    /// Lateral Y axis
    Y,
    /// Focus axis
    Z,
}

impl Axis {
    /// All axes in canonical X, Y, Z order.
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// Single-letter name of the axis.
    pub fn as_str(&self) -> &'static str {
        match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Z => "Z",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Axis {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "X" => Ok(Axis::X),
            "Y" => Ok(Axis::Y),
            "Z" => Ok(Axis::Z),
            other => Err(ValidationError::InvalidAxisName(other.to_string())),
        }
    }
}

/// Target of a reset: one axis or every configured axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisSelector {
    /// A single axis
    One(Axis),
    /// All configured axes
    All,
}

impl From<Axis> for AxisSelector {
    fn from(axis: Axis) -> Self {
        AxisSelector::One(axis)
    }
}

impl FromStr for AxisSelector {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            Ok(AxisSelector::All)
        } else {
            s.parse().map(AxisSelector::One)
        }
    }
}

/// Authoritative position record for one axis.
///
/// Only the motion controller writes these, and only after a backend has
/// confirmed the move (or immediately, when the simulator is active).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct AxisPosition {
    /// Last confirmed position (µm)
    pub current: f64,
    /// Last commanded target (µm)
    pub target: f64,
    /// Maximum deviation still considered "the same position" (µm)
    pub tolerance: f64,
    /// Optional travel range `[min, max]` (µm)
    pub travel: Option<(f64, f64)>,
}

impl AxisPosition {
    /// New axis record at `current` with the target already reached.
    pub fn new(current: f64, tolerance: f64) -> Self {
        Self {
            current,
            target: current,
            tolerance,
            travel: None,
        }
    }

    /// Restrict moves on this axis to `[min, max]`.
    pub fn with_travel(mut self, travel: Option<(f64, f64)>) -> Self {
        self.travel = travel;
        self
    }

    /// `|current - target| <= tolerance`
    pub fn is_settled(&self) -> bool {
        self.within_tolerance(self.target)
    }

    /// Whether `value` is within tolerance of the current position.
    pub fn within_tolerance(&self, value: f64) -> bool {
        (self.current - value).abs() <= self.tolerance
    }
}

/// How a move is expressed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MoveKind {
    /// Signed offset from the current position
    Relative(f64),
    /// Absolute target position
    Absolute(f64),
}

/// A requested stage move, validated before any state is touched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveRequest {
    /// Axis to move
    pub axis: Axis,
    /// Relative or absolute magnitude
    pub kind: MoveKind,
}

impl MoveRequest {
    /// Relative move of `delta` µm.
    pub fn relative(axis: Axis, delta: f64) -> Self {
        Self {
            axis,
            kind: MoveKind::Relative(delta),
        }
    }

    /// Absolute move to `target` µm.
    pub fn absolute(axis: Axis, target: f64) -> Self {
        Self {
            axis,
            kind: MoveKind::Absolute(target),
        }
    }

    /// Signed offset this request implies from `position`.
    pub fn delta_from(&self, position: &AxisPosition) -> f64 {
        match self.kind {
            MoveKind::Relative(delta) => delta,
            MoveKind::Absolute(target) => target - position.current,
        }
    }

    /// Check the request against the step limits and the axis travel range.
    ///
    /// Returns the signed delta to send to the backend.
    pub fn validate(
        &self,
        limits: &StepLimits,
        position: &AxisPosition,
    ) -> Result<f64, ValidationError> {
        let delta = self.delta_from(position);
        if !delta.is_finite() {
            return Err(ValidationError::NonFinite {
                field: "delta",
                value: delta,
            });
        }
        limits.check_step(delta)?;

        if let Some((min, max)) = position.travel {
            let target = position.current + delta;
            if target < min || target > max {
                return Err(ValidationError::OutOfTravel {
                    axis: self.axis,
                    target,
                    min,
                    max,
                });
            }
        }
        Ok(delta)
    }
}
