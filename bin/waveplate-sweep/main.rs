use chrono::Utc;
use clap::Parser;
use env_logger::Env;
use log::{LevelFilter, error, info, warn};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use waveplate_sweep::{
    AcquisitionSession, AppConfig, Logger, SimulatedScope, SimulatedStage, StepLogEntry,
    SweepController, SweepReport, SweepTiming, Termination, export, load_config_or_default,
};

/// Waveplate sweep acquisition tool
#[derive(Parser, Debug)]
#[command(name = "waveplate-sweep")]
#[command(
    about = "Step a rotation stage through an angle range and record scope statistics",
    long_about = None
)]
struct Args {
    /// Path to configuration file (defaults to ./config.toml or ./sweep_config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Override the output directory of the exported table
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,
}

/// Usage:
///   waveplate-sweep --config sweep_config.toml
///   waveplate-sweep --config sweep_config.toml --log-level debug --output ./data
///
/// Runs against the simulated stage and scope; vendor bindings implement
/// `PositionPort` and `AcquisitionPort` and replace them in `build_controller`.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config_or_default(args.config.as_deref());

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.console.verbosity.clone());
    initialize_logging(&log_level)?;
    log_startup_info(&config, args.config.as_deref());

    let shutdown_flag = setup_shutdown_handler()?;
    let mut controller = build_controller(&config)?;
    controller.set_shutdown_flag(shutdown_flag.clone());

    let output_dir = args
        .output
        .unwrap_or_else(|| PathBuf::from(&config.output.directory));
    run_and_report(&mut controller, &config, &output_dir, &shutdown_flag)
}

/// Log startup information
fn log_startup_info(config: &AppConfig, config_path: Option<&Path>) {
    info!("=== Waveplate Sweep ===");
    match config_path {
        Some(path) => info!("Configuration: {}", path.display()),
        None => info!("Configuration: defaults / working directory"),
    }
    let sweep = config.sweep_config();
    info!(
        "Sweep: {:.4} -> {:.4} deg, step {:.4} deg, {} steps x {} records",
        sweep.start_angle,
        sweep.end_angle,
        sweep.step_angle,
        sweep.step_count(),
        sweep.records_per_step
    );
    info!(
        "Stage: serial {}, settle {} ms after start / {} ms per step, {:?} stepping",
        config.stage.serial_number,
        config.stage.settle_after_start_ms,
        config.stage.settle_after_step_ms,
        config.stage.step_strategy
    );
    if let Some(tolerance) = config.stage.position_tolerance_deg {
        info!(
            "Position tolerance: {:.4} deg within {} ms",
            tolerance, config.stage.settle_timeout_ms
        );
    }
    info!(
        "Scope: device {}, capture timeout {:.1} s, polling every {} ms",
        config.acquisition.device_id,
        config.acquisition.timeout_secs,
        config.acquisition.poll_interval_ms
    );
}

/// Wire the stage and scope into a controller
fn build_controller(
    config: &AppConfig,
) -> Result<SweepController<SimulatedStage, SimulatedScope>, Box<dyn std::error::Error>> {
    let stage = SimulatedStage::new(&config.stage.serial_number);
    let scope = SimulatedScope::new().with_angle_source(stage.angle_handle());
    warn!(
        "Using simulated stage and scope module (device {} is not contacted)",
        config.acquisition.device_id
    );

    let acquisition = AcquisitionSession::new(scope)
        .with_timeout(config.acquisition.timeout())
        .with_poll_interval(config.acquisition.poll_interval());

    let mut controller = SweepController::new(stage, acquisition)
        .with_timing(SweepTiming::from(&config.stage))
        .with_clockbase(config.acquisition.clockbase_hz);

    if config.experiment_logging.enabled {
        let log_path = create_log_file_path(&config.experiment_logging.output_path)?;
        info!("Step log: {}", log_path.display());
        controller = controller.with_step_logger(Logger::<StepLogEntry>::new(log_path, 100, false));
    }

    Ok(controller)
}

/// Setup Ctrl+C handler for graceful shutdown
fn setup_shutdown_handler() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received - finishing current step and shutting down...");
        shutdown_flag_clone.store(true, Ordering::SeqCst);
    })?;

    Ok(shutdown_flag)
}

/// Run the sweep, export whatever was collected and report
fn run_and_report(
    controller: &mut SweepController<SimulatedStage, SimulatedScope>,
    config: &AppConfig,
    output_dir: &Path,
    shutdown_flag: &AtomicBool,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting sweep...");

    let report = match controller.run_sweep(&config.sweep_config()) {
        Ok(report) => report,
        Err(e) => {
            error!("✗ Sweep failed: {}", e);
            return Err(e.into());
        }
    };
    log_summary(&report);

    let path = export::output_path(output_dir, &config.output.file_prefix);
    export::write_tsv(&report.result, &path)?;

    match &report.termination {
        Termination::Completed => {
            info!("✓ Sweep completed, data saved to {}", path.display());
            Ok(())
        }
        Termination::Cancelled { .. } => {
            if shutdown_flag.load(Ordering::SeqCst) {
                info!("✓ Sweep stopped by user, partial data saved to {}", path.display());
            }
            Ok(())
        }
        Termination::MotionFault { step, reason } => {
            error!(
                "✗ Sweep aborted by motion fault at step {:?}: {}; partial data saved to {}",
                step,
                reason,
                path.display()
            );
            Err(reason.clone().into())
        }
    }
}

fn log_summary(report: &SweepReport) {
    info!(
        "Collected {} entries over {} steps ({} skipped, {} records dropped)",
        report.result.len(),
        report.steps.len(),
        report.skipped_steps(),
        report.dropped_records()
    );
    for step in report.steps.iter().filter(|s| s.flagged_records > 0) {
        warn!(
            "Step {}: {} of {} records carried warning flags",
            step.index, step.flagged_records, step.records_received
        );
    }
}

/// Initialize logging with configurable level
fn initialize_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
            LevelFilter::Info
        }
    };

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    Ok(())
}

fn create_log_file_path(log_path: &str) -> Result<PathBuf, Box<dyn std::error::Error>> {
    let history_dir = PathBuf::from(log_path);
    fs::create_dir_all(&history_dir)?;

    let filename = format!("waveplate_sweep_{}.jsonl", Utc::now().format("%Y%m%d_%H%M%S"));
    Ok(history_dir.join(filename))
}
