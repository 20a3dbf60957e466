//! Configuration System using Figment
//!
//! Strongly-typed configuration for the stage core. Configuration is layered:
//! 1. Built-in defaults (every field has one)
//! 2. `config/stage.toml` (or any file passed to [`StageConfig::load_from`])
//! 3. Environment variables prefixed with `STAGE_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use stage_control::config::StageConfig;
//!
//! let config = StageConfig::load()?;
//! config.validate()?;
//! println!("Axes: {:?}", config.axis_list());
//! # Ok::<(), stage_control::StageError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::axis::Axis;
use crate::connection::RetryPolicy;
use crate::error::{StageError, ValidationError};

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/stage.toml";

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "STAGE_";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Axes present on the stage
    pub axes: Vec<AxisConfig>,
    /// Bounds for a single relative step
    pub limits: StepLimits,
    /// Bounds for auto-step sequences
    pub sequencer: SequencerLimits,
    /// Connection retry policy
    pub retry: RetryPolicy,
    /// Connection health monitoring
    pub health: HealthConfig,
    /// Which hardware backend to use
    pub backend: BackendConfig,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            axes: default_axes(),
            limits: StepLimits::default(),
            sequencer: SequencerLimits::default(),
            retry: RetryPolicy::default(),
            health: HealthConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "stage-control".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored (development)
    Pretty,
    /// Single-line, no colors
    Compact,
    /// JSON lines for log aggregation
    Json,
}

/// One configured axis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisConfig {
    /// Axis identifier
    pub axis: Axis,
    /// Settling tolerance in µm
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Optional travel range `[min, max]` in µm
    #[serde(default)]
    pub travel: Option<[f64; 2]>,
}

impl AxisConfig {
    /// Axis with default tolerance and no travel limit.
    pub fn new(axis: Axis) -> Self {
        Self {
            axis,
            tolerance: default_tolerance(),
            travel: None,
        }
    }

    /// Travel range as a tuple.
    pub fn travel_range(&self) -> Option<(f64, f64)> {
        self.travel.map(|[min, max]| (min, max))
    }
}

/// Bounds for a single relative step (MIN_STEP ≤ |delta| ≤ MAX_STEP), µm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepLimits {
    /// Smallest accepted step magnitude
    pub min_step: f64,
    /// Largest accepted step magnitude
    pub max_step: f64,
}

impl Default for StepLimits {
    fn default() -> Self {
        Self {
            min_step: 0.01,
            max_step: 1000.0,
        }
    }
}

impl StepLimits {
    /// Reject step magnitudes outside `[min_step, max_step]`.
    pub fn check_step(&self, delta: f64) -> Result<(), ValidationError> {
        let magnitude = delta.abs();
        if magnitude < self.min_step || magnitude > self.max_step {
            return Err(ValidationError::StepOutOfRange {
                value: delta,
                min: self.min_step,
                max: self.max_step,
            });
        }
        Ok(())
    }
}

/// Bounds for auto-step sequence parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerLimits {
    /// Shortest delay between steps
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    /// Longest delay between steps
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Largest accepted number of steps
    pub max_steps: u32,
}

impl Default for SequencerLimits {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(60),
            max_steps: 10_000,
        }
    }
}

impl SequencerLimits {
    /// Reject delays outside `[min_delay, max_delay]`.
    pub fn check_delay(&self, delay: Duration) -> Result<(), ValidationError> {
        if delay < self.min_delay || delay > self.max_delay {
            return Err(ValidationError::DelayOutOfRange {
                value_ms: delay.as_millis(),
                min_ms: self.min_delay.as_millis(),
                max_ms: self.max_delay.as_millis(),
            });
        }
        Ok(())
    }

    /// Reject zero or too many steps.
    pub fn check_steps(&self, num_steps: u32) -> Result<(), ValidationError> {
        if num_steps == 0 {
            return Err(ValidationError::NoSteps);
        }
        if num_steps > self.max_steps {
            return Err(ValidationError::TooManySteps {
                requested: num_steps,
                max: self.max_steps,
            });
        }
        Ok(())
    }
}

/// Health monitoring of the hardware link
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Period between health probes
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Upper bound for a single probe
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            probe_timeout: Duration::from_millis(500),
        }
    }
}

/// Hardware backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// No control surface attached; always falls back to simulation
    Offline,
    /// Use an in-process simulated stage as if it were hardware
    Simulated,
}

/// Hardware backend configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend kind
    pub kind: BackendKind,
    /// Simulated motion speed in µm/s (0 = instant)
    pub motion_speed: f64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Offline,
            motion_speed: 0.0,
        }
    }
}

fn default_tolerance() -> f64 {
    0.01
}

fn default_axes() -> Vec<AxisConfig> {
    Axis::ALL.into_iter().map(AxisConfig::new).collect()
}

impl StageConfig {
    /// Load configuration from `config/stage.toml` and environment variables.
    ///
    /// A missing file is not an error: defaults and environment still apply.
    pub fn load() -> Result<Self, StageError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// Environment variables override the file, e.g.
    /// `STAGE_LIMITS__MAX_STEP=50`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, StageError> {
        let mut config: StageConfig = Figment::from(Serialized::defaults(StageConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        if config.axes.is_empty() {
            config.axes = default_axes();
        }
        Ok(config)
    }

    /// Axes in configuration order.
    pub fn axis_list(&self) -> Vec<Axis> {
        self.axes.iter().map(|a| a.axis).collect()
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> Result<(), StageError> {
        self.validate_inner().map_err(StageError::Config)
    }

    fn validate_inner(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.axes.is_empty() {
            return Err("At least one axis must be configured".to_string());
        }

        let limits = &self.limits;
        if !(limits.min_step > 0.0) || !limits.max_step.is_finite() {
            return Err(format!(
                "Invalid min_step {}. Must be positive",
                limits.min_step
            ));
        }
        if limits.max_step < limits.min_step {
            return Err(format!(
                "max_step {} is smaller than min_step {}",
                limits.max_step, limits.min_step
            ));
        }

        let mut seen = HashSet::new();
        for axis in &self.axes {
            if !seen.insert(axis.axis) {
                return Err(format!("Duplicate axis: {}", axis.axis));
            }
            if !(axis.tolerance > 0.0) {
                return Err(format!(
                    "Axis {} tolerance must be positive, got {}",
                    axis.axis, axis.tolerance
                ));
            }
            // Any unsettled absolute move must remain a legal relative step.
            if axis.tolerance < limits.min_step {
                return Err(format!(
                    "Axis {} tolerance {} is below min_step {}",
                    axis.axis, axis.tolerance, limits.min_step
                ));
            }
            if let Some([min, max]) = axis.travel {
                if !(min < max) {
                    return Err(format!(
                        "Axis {} travel range [{min}, {max}] is empty",
                        axis.axis
                    ));
                }
            }
        }

        let seq = &self.sequencer;
        if seq.min_delay.is_zero() || seq.max_delay < seq.min_delay {
            return Err(format!(
                "Invalid sequencer delay bounds [{:?}, {:?}]",
                seq.min_delay, seq.max_delay
            ));
        }
        if seq.max_steps == 0 {
            return Err("sequencer.max_steps must be at least 1".to_string());
        }

        self.retry.validate().map_err(|e| e.to_string())?;

        if self.health.interval.is_zero() || self.health.probe_timeout.is_zero() {
            return Err("health.interval and health.probe_timeout must be non-zero".to_string());
        }

        if !(self.backend.motion_speed >= 0.0) {
            return Err(format!(
                "backend.motion_speed must be >= 0, got {}",
                self.backend.motion_speed
            ));
        }

        Ok(())
    }
}
