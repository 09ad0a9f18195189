//! IRIS acquisition daemon entry point.
//!
//! Opens the fieldbus session, wires the acquisition and job controller to
//! it, optionally runs one measurement job, and closes everything on
//! SIGINT/SIGTERM.

mod diagnostics;
mod signals;

use anyhow::{Context, Result};
use clap::Parser;
use iris_acquisition::{
    Acquisition, JobController, JobOutcome, JobRequest, MeasurementStore, MemoryStore,
    SyntheticScores,
};
use iris_common::config::{FieldbusDriver, ServiceConfig};
use iris_fieldbus::{BusLink, FieldbusSession, FrameCodes, FrameSink, SessionBuilder, SimulatedMaster};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::diagnostics::{format_status_json, StatusReporter};
use crate::signals::{wait_for_shutdown, SignalHandler};

/// IRIS daemon command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "iris-daemon",
    about = "IRIS acquisition daemon - fieldbus sampling and measurement jobs",
    version,
    long_about = None
)]
struct Args {
    /// Path to a service configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Network adapter (overrides config file).
    #[arg(long, short = 'a')]
    adapter: Option<String>,

    /// Sample file directory (overrides config file).
    #[arg(long, value_name = "DIR")]
    samples_dir: Option<PathBuf>,

    /// Register a device serial number (repeatable).
    #[arg(long = "device", short = 'd', value_name = "SN")]
    devices: Vec<String>,

    /// Run one measurement job for this device at startup.
    #[arg(long, value_name = "SN")]
    run: Option<String>,

    /// Number of cycles of the startup job.
    #[arg(long, default_value = "1")]
    repeat: u32,

    /// Pause between cycles of the startup job (e.g. "5s", "500ms").
    #[arg(long, default_value = "0s", value_parser = humantime::parse_duration)]
    interval: Duration,

    /// Exit once the startup job has finished.
    #[arg(long)]
    exit_after_job: bool,

    /// Log a status report at this period (0s disables).
    #[arg(long, default_value = "60s", value_parser = humantime::parse_duration)]
    status_interval: Duration,

    /// Print the effective configuration and exit.
    #[arg(long)]
    print_config: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting IRIS daemon");

    let mut config = load_config(&args)?;
    if let Some(adapter) = &args.adapter {
        config.fieldbus.adapter = Some(adapter.clone());
    }
    if let Some(dir) = &args.samples_dir {
        config.storage.base_dir = dir.clone();
    }

    if args.print_config {
        println!("{}", config.to_toml().context("Failed to render configuration")?);
        return Ok(());
    }

    info!(
        driver = ?config.fieldbus.driver,
        adapter = config.fieldbus.adapter.as_deref().unwrap_or(iris_fieldbus::DEFAULT_ADAPTER),
        samples = %config.storage.base_dir.display(),
        "Configuration loaded"
    );

    let signal_handler = SignalHandler::new().context("Failed to set up signal handlers")?;

    run_daemon(&config, &args, &signal_handler)
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!(
        "iris_daemon={level},iris_acquisition={level},iris_fieldbus={level},iris_common={level}"
    );

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `IRIS_CONFIG_PATH` environment variable
/// 3. `/etc/iris/config.toml` (system path)
/// 4. `config/default.toml` (local development)
/// 5. Built-in defaults
fn load_config(args: &Args) -> Result<ServiceConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return ServiceConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {config_path:?}"));
    }

    if let Ok(env_path) = std::env::var("IRIS_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from IRIS_CONFIG_PATH");
            return ServiceConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from IRIS_CONFIG_PATH={env_path:?}")
            });
        }
        warn!(
            path = %env_path,
            "IRIS_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    for path in ["/etc/iris/config.toml", "config/default.toml"] {
        let config_path = PathBuf::from(path);
        if config_path.exists() {
            info!(?config_path, "Loading config file");
            return ServiceConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {config_path:?}"));
        }
    }

    info!("No config file found, using built-in defaults");
    Ok(ServiceConfig::default())
}

/// Create the master for the configured driver.
fn create_master(config: &ServiceConfig) -> SimulatedMaster {
    match config.fieldbus.driver {
        FieldbusDriver::Simulated => {
            info!("Using simulated fieldbus master");
            SimulatedMaster::with_iris_codes(&config.acquisition)
        }
    }
}

/// Open the session, serve until shutdown, then tear everything down.
fn run_daemon(config: &ServiceConfig, args: &Args, signals: &SignalHandler) -> Result<()> {
    let link = Arc::new(BusLink::new());
    let acquisition = Arc::new(Acquisition::new(Arc::clone(&link), &config.acquisition));

    let session = SessionBuilder::new(&config.fieldbus)
        .codes(FrameCodes::from(&config.acquisition))
        .link(link)
        .sink(Arc::clone(&acquisition) as Arc<dyn FrameSink>)
        .open(create_master(config))
        .context("Failed to open fieldbus session")?;
    info!(
        adapter = session.adapter(),
        all_op = session.all_op_reached(),
        "Fieldbus session open"
    );

    let store = Arc::new(MemoryStore::with_devices(
        args.devices.iter().chain(args.run.iter()).cloned(),
    ));
    let controller = JobController::from_config(
        acquisition,
        Arc::clone(&store) as Arc<dyn MeasurementStore>,
        Arc::new(SyntheticScores::default()),
        config,
    );

    let startup_job = match &args.run {
        Some(sn) => {
            let request = JobRequest::new(sn.clone(), args.repeat).with_interval(args.interval);
            let job_id = controller
                .start_job(request)
                .with_context(|| format!("Failed to start job for {sn}"))?;
            info!(%sn, job = %job_id, "Startup job running");
            Some(sn.clone())
        }
        None => None,
    };

    serve(&session, &controller, startup_job.as_deref(), args, signals);

    info!("Shutting down...");
    for report in controller.shutdown() {
        info!(sn = %report.sn, job = %report.job_id, outcome = %report.outcome, "Job stopped at shutdown");
    }
    let mut reporter = StatusReporter::new();
    let devices = controller.devices().unwrap_or_default();
    info!(status = %format_status_json(&reporter.snapshot(&session, &devices)), "Final status");

    match session.close() {
        Ok(slaves) => {
            info!(
                slaves = slaves.len(),
                signals = signals.state().signal_count(),
                "Daemon shutdown complete"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Fieldbus session closed with error");
            Err(e).context("Fieldbus session did not shut down cleanly")
        }
    }
}

/// Main loop: status reports and the startup job until shutdown.
fn serve(
    session: &FieldbusSession,
    controller: &JobController,
    startup_job: Option<&str>,
    args: &Args,
    signals: &SignalHandler,
) {
    let mut reporter = StatusReporter::new();
    let mut since_report = Duration::ZERO;
    let tick = Duration::from_millis(100);

    while !wait_for_shutdown(signals, tick) {
        since_report += tick;
        let periodic = !args.status_interval.is_zero() && since_report >= args.status_interval;
        if periodic || signals.take_status_request() {
            since_report = Duration::ZERO;
            let devices = controller.devices().unwrap_or_default();
            info!(status = %format_status_json(&reporter.snapshot(session, &devices)), "Status");
        }

        if let Some(sn) = startup_job.filter(|_| args.exit_after_job) {
            if !controller.is_job_running(sn).unwrap_or(false) {
                match controller.wait_job(sn) {
                    Ok(report) if report.outcome == JobOutcome::Completed => {
                        info!(%sn, recorded = report.recorded, "Startup job completed");
                    }
                    Ok(report) => info!(%sn, outcome = %report.outcome, "Startup job ended"),
                    Err(e) => error!(%sn, error = %e, "Startup job failed"),
                }
                signals.request_shutdown();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parsing() {
        let args = Args::parse_from(["iris-daemon", "-d", "1001", "-d", "1002"]);
        assert_eq!(args.devices, vec!["1001", "1002"]);
        assert!(args.config.is_none());
        assert_eq!(args.repeat, 1);
        assert_eq!(args.interval, Duration::ZERO);
    }

    #[test]
    fn test_args_with_job() {
        let args = Args::parse_from([
            "iris-daemon",
            "-c",
            "iris.toml",
            "--run",
            "1001",
            "--repeat",
            "3",
            "--interval",
            "500ms",
            "--exit-after-job",
        ]);
        assert_eq!(args.config, Some(PathBuf::from("iris.toml")));
        assert_eq!(args.run.as_deref(), Some("1001"));
        assert_eq!(args.repeat, 3);
        assert_eq!(args.interval, Duration::from_millis(500));
        assert!(args.exit_after_job);
    }

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.fieldbus.exchange_period, Duration::from_millis(10));
        assert_eq!(config.fieldbus.driver, FieldbusDriver::Simulated);
    }

    #[test]
    fn test_shipped_config_matches_defaults() {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../config/default.toml");
        let shipped = ServiceConfig::from_file(&path).unwrap();
        let defaults = ServiceConfig::default();
        assert_eq!(shipped.fieldbus.slaves, defaults.fieldbus.slaves);
        assert_eq!(shipped.fieldbus.exchange_period, defaults.fieldbus.exchange_period);
        assert_eq!(shipped.acquisition.full_signal, defaults.acquisition.full_signal);
        assert_eq!(shipped.storage.base_dir, defaults.storage.base_dir);
    }
}
