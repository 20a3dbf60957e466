//! CLI Entry Point for the stage control core
//!
//! Provides command-line access to:
//! - Connection status and current positions
//! - Relative, absolute and multi-axis moves
//! - Axis reset
//! - Auto-step focus scans against a synthetic focus metric
//!
//! # Usage
//!
//! ```bash
//! stagectl status
//! stagectl move z 5
//! stagectl goto --x 10 --y 20 --z 3
//! stagectl reset all
//! stagectl scan z --step 1 --steps 20 --delay-ms 50
//! ```
//!
//! With `backend.kind = "offline"` (the default) every command runs against
//! the built-in simulator.

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rand::Rng;
use stage_control::logging;
use stage_control::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "stagectl")]
#[command(about = "Microscope stage control", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, default_value = stage_control::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Retry the hardware with backoff instead of a single attempt
    #[arg(long, global = true)]
    retry: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show connection state and axis positions
    Status,

    /// Move one axis by a relative amount (µm)
    Move {
        /// Axis name (x, y, z)
        axis: Axis,
        /// Signed distance in µm
        #[arg(allow_hyphen_values = true)]
        delta: f64,
    },

    /// Move axes to absolute positions (µm)
    Goto {
        /// X target
        #[arg(long, allow_hyphen_values = true)]
        x: Option<f64>,
        /// Y target
        #[arg(long, allow_hyphen_values = true)]
        y: Option<f64>,
        /// Z target
        #[arg(long, allow_hyphen_values = true)]
        z: Option<f64>,
    },

    /// Return one axis (or `all`) to 0
    Reset {
        /// Axis name or `all`
        #[arg(default_value = "all")]
        target: AxisSelector,
    },

    /// Step an axis and record a synthetic focus metric
    Scan {
        /// Axis to step
        axis: Axis,
        /// Step size in µm
        #[arg(long, default_value = "1.0")]
        step: f64,
        /// Number of steps
        #[arg(long, default_value = "20")]
        steps: u32,
        /// Delay between steps in milliseconds
        #[arg(long, default_value = "100")]
        delay_ms: u64,
        /// Scan towards decreasing positions
        #[arg(long)]
        down: bool,
        /// Move only, without sampling the metric
        #[arg(long)]
        no_metrics: bool,
        /// Position of best focus for the synthetic metric
        #[arg(long, default_value = "10.0", allow_hyphen_values = true)]
        focus: f64,
        /// Width of the synthetic focus peak in µm
        #[arg(long, default_value = "4.0")]
        width: f64,
    },
}

struct Stage {
    connection: Arc<ConnectionManager>,
    motion: Arc<StageMotionController>,
    sequencer: AutoStepSequencer,
    events: EventBus,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = StageConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(level) = &cli.log_level {
        config.application.log_level = level.clone();
    }
    config.validate()?;
    logging::init_from_config(&config)?;

    let stage = open_stage(&config, cli.retry).await?;

    let result = match cli.command {
        Commands::Status => {
            print_status(&stage).await;
            Ok(())
        }
        Commands::Move { axis, delta } => {
            let position = stage.motion.move_relative(axis, delta).await?;
            println!("{axis} -> {position:.3} µm");
            Ok(())
        }
        Commands::Goto { x, y, z } => goto(&stage, x, y, z).await,
        Commands::Reset { target } => {
            stage.motion.reset_axis(target).await?;
            print_positions(&stage);
            Ok(())
        }
        Commands::Scan {
            axis,
            step,
            steps,
            delay_ms,
            down,
            no_metrics,
            focus,
            width,
        } => {
            let direction = if down { Direction::Down } else { Direction::Up };
            let params = AutoStepParams::new(axis, step, steps, Duration::from_millis(delay_ms))
                .direction(direction)
                .record_metrics(!no_metrics);
            scan(&stage, params, focus, width).await
        }
    };

    stage.connection.disconnect().await;
    result
}

async fn open_stage(config: &StageConfig, retry: bool) -> Result<Stage> {
    let events = EventBus::default();
    let connection = Arc::new(ConnectionManager::from_config(
        config,
        stage_control::backend::from_config(&config.backend),
        Arc::new(SimulatedStage::new()),
        events.clone(),
    )?);

    if retry {
        let task = connection
            .connect_with_retry(connection.retry_policy(), |outcome| {
                tracing::debug!(attempts = outcome.attempts, "retry cycle finished");
            })
            .await?;
        let outcome = task.wait().await;
        println!(
            "connection: {} after {} attempt(s): {}",
            if outcome.success { "ok" } else { "failed" },
            outcome.attempts,
            outcome.message
        );
    } else {
        let (state, message) = connection.connect().await;
        println!("connection: {state} ({message})");
    }

    let motion = Arc::new(StageMotionController::from_config(
        config,
        Arc::clone(&connection),
        events.clone(),
    )?);
    motion.refresh().await?;

    let sequencer = AutoStepSequencer::from_config(config, Arc::clone(&motion), events.clone());

    Ok(Stage {
        connection,
        motion,
        sequencer,
        events,
    })
}

async fn print_status(stage: &Stage) {
    let status = stage.connection.status().await;
    println!("state:    {}", status.state);
    println!("message:  {}", status.message);
    println!("backend:  {}", stage.connection.active_backend().name());
    println!("failures: {}", status.failed_attempts);
    print_positions(stage);
}

fn print_positions(stage: &Stage) {
    for (axis, position) in stage.motion.positions() {
        println!(
            "{axis}: {:>10.3} µm{}",
            position.current,
            if position.is_settled() { "" } else { " (unsettled)" }
        );
    }
}

async fn goto(stage: &Stage, x: Option<f64>, y: Option<f64>, z: Option<f64>) -> Result<()> {
    match (x, y, z) {
        (None, None, None) => bail!("nothing to do: pass at least one of --x, --y, --z"),
        (Some(x), Some(y), Some(z)) => stage.motion.set_multi_axis(x, y, z).await?,
        _ => {
            for (axis, target) in [(Axis::X, x), (Axis::Y, y), (Axis::Z, z)] {
                if let Some(target) = target {
                    stage.motion.move_absolute(axis, target).await?;
                }
            }
        }
    }
    print_positions(stage);
    Ok(())
}

async fn scan(stage: &Stage, params: AutoStepParams, focus: f64, width: f64) -> Result<()> {
    if !(width > 0.0) {
        bail!("--width must be positive");
    }
    let motion = Arc::clone(&stage.motion);
    let axis = params.axis;
    let sampler = move || {
        let z = motion.position(axis).unwrap_or(f64::NAN);
        let signal = (-(z - focus).powi(2) / (2.0 * width * width)).exp();
        signal + rand::thread_rng().gen_range(-0.01..0.01)
    };

    let mut events = stage.events.subscribe();
    stage.sequencer.start(params, sampler).await?;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                stage.sequencer.stop().await;
                println!("scan cancelled");
                break;
            }
            event = events.recv() => match event {
                Ok(StageEvent::AutoStepProgress { current_step, total_steps }) => {
                    tracing::debug!(current_step, total_steps, "scan progress");
                }
                Ok(StageEvent::AutoStepCompleted { samples, peak_position, .. }) => {
                    for sample in &samples {
                        println!("{:>10.3}  {:.4}", sample.position, sample.metric);
                    }
                    match peak_position {
                        Some(peak) => println!("best focus at {peak:.3} µm"),
                        None => print_positions(stage),
                    }
                    break;
                }
                Ok(StageEvent::AutoStepFailed { error }) => {
                    bail!("scan failed: {error}");
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    }
    Ok(())
}
