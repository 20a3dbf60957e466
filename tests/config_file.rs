//! The shipped configuration file loads and matches the built-in defaults.

use serial_test::serial;
use stage_control::axis::Axis;
use stage_control::config::{BackendKind, LogFormat, StageConfig};
use stage_control::logging::LoggingConfig;
use std::path::PathBuf;
use std::time::Duration;

fn shipped_config() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/stage.toml")
}

#[test]
#[serial]
fn shipped_config_is_valid() {
    let config = StageConfig::load_from(shipped_config()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.axis_list(), vec![Axis::X, Axis::Y, Axis::Z]);
    assert_eq!(config.axes[2].travel_range(), Some((-5000.0, 5000.0)));
    assert_eq!(config.application.log_format, LogFormat::Pretty);
    assert_eq!(config.backend.kind, BackendKind::Offline);

    let defaults = StageConfig::default();
    assert_eq!(config.limits, defaults.limits);
    assert_eq!(config.sequencer, defaults.sequencer);
    assert_eq!(config.retry, defaults.retry);
    assert_eq!(config.health, defaults.health);
    assert_eq!(config.retry.delay_for(10), Duration::from_secs(5));

    let logging = LoggingConfig::from_stage_config(&config).unwrap();
    assert_eq!(logging.level, tracing::Level::INFO);
}

#[test]
#[serial]
fn environment_overrides_the_file() {
    std::env::set_var("STAGE_BACKEND__KIND", "simulated");
    std::env::set_var("STAGE_RETRY__MAX_ATTEMPTS", "2");
    let config = StageConfig::load_from(shipped_config());
    std::env::remove_var("STAGE_BACKEND__KIND");
    std::env::remove_var("STAGE_RETRY__MAX_ATTEMPTS");

    let config = config.unwrap();
    assert_eq!(config.backend.kind, BackendKind::Simulated);
    assert_eq!(config.retry.max_attempts, 2);
    config.validate().unwrap();
}
