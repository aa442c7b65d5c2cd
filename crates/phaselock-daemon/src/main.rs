//! Phaselock daemon entry point.
//!
//! Runs a phase-locked periodic loop on the host clock with a heartbeat
//! callback and signal-driven shutdown, or probes alarm wake skid with a
//! single shot.

mod probe;
mod signals;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use phaselock_common::config::LoopConfig;
use phaselock_runtime::{
    AlarmPlatform, HostPlatform, LoopReport, PeriodicLoopBuilder, SimulatedPlatform, TickContext,
    TickHandler,
};
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::probe::run_probe;
use crate::signals::SignalWatcher;

/// Environment variable naming a configuration file.
const CONFIG_PATH_ENV: &str = "PHASELOCK_CONFIG_PATH";

/// Configuration file used during local development.
const LOCAL_CONFIG_PATH: &str = "config/default.toml";

/// Phaselock daemon command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "phaselockd",
    about = "Drift-correcting periodic alarm loop",
    version,
    long_about = None
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to a loop configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file.
    #[arg(long, short = 'l', global = true)]
    log_level: Option<String>,

    /// Write the result as JSON to this file.
    #[arg(long, value_name = "FILE", global = true)]
    report: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the periodic loop until stopped (default).
    Run(RunArgs),
    /// Arm one alarm ahead of now and report the wake skid.
    Probe {
        /// How far ahead to arm the alarm.
        #[arg(long, default_value = "100ms", value_parser = humantime::parse_duration)]
        lead: Duration,
    },
}

#[derive(clap::Args, Debug, Default)]
struct RunArgs {
    /// Tick period, e.g. "20ms" (overrides config file).
    #[arg(long, value_parser = humantime::parse_duration)]
    period: Option<Duration>,

    /// Signed grid offset in microseconds (overrides config file).
    #[arg(long, allow_negative_numbers = true)]
    offset_us: Option<i64>,

    /// Stop after this many ticks (0 = run until signalled).
    #[arg(long)]
    max_ticks: Option<u64>,

    /// Run against a virtual clock instead of the host clock.
    #[arg(long, short = 's')]
    simulated: bool,
}

/// Where the loop configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConfigSource {
    Argument(PathBuf),
    Environment(PathBuf),
    Local(PathBuf),
    Defaults,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Argument(path) => write!(f, "--config {}", path.display()),
            ConfigSource::Environment(path) => {
                write!(f, "{CONFIG_PATH_ENV}={}", path.display())
            }
            ConfigSource::Local(path) => write!(f, "{}", path.display()),
            ConfigSource::Defaults => write!(f, "built-in defaults"),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let env_path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
    let source = resolve_config_source(args.config.as_deref(), env_path.as_deref());
    let mut config = load_config(&source)?;

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level);

    info!(version = env!("CARGO_PKG_VERSION"), config = %source, "Starting phaselock daemon");
    if let (ConfigSource::Defaults, Some(path)) = (&source, &env_path) {
        warn!(
            path = %path.display(),
            "{CONFIG_PATH_ENV} set but file does not exist, using defaults"
        );
    }

    match args.command {
        Some(Command::Probe { lead }) => {
            let lead_us = i64::try_from(lead.as_micros()).context("probe lead too large")?;
            let platform = HostPlatform::new().context("Failed to initialize host clock")?;
            let report = run_probe(&platform, lead_us).context("Probe failed")?;
            println!("scheduled:  {}us", report.scheduled_us);
            println!("woke:       {}us", report.woke_at_us);
            println!("after wake: {}us", report.after_wake_us);
            write_report(args.report.as_deref(), &report)
        }
        Some(Command::Run(run)) => run_daemon(&mut config, &run, args.report.as_deref()),
        None => run_daemon(&mut config, &RunArgs::default(), args.report.as_deref()),
    }
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!("phaselockd={level},phaselock_runtime={level},phaselock_common={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Pick the configuration source.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument (must exist)
/// 2. `PHASELOCK_CONFIG_PATH` environment variable
/// 3. `config/default.toml` (local development)
/// 4. Built-in defaults
fn resolve_config_source(arg: Option<&Path>, env: Option<&Path>) -> ConfigSource {
    if let Some(path) = arg {
        return ConfigSource::Argument(path.to_path_buf());
    }
    if let Some(path) = env.filter(|p| p.exists()) {
        return ConfigSource::Environment(path.to_path_buf());
    }
    let local = PathBuf::from(LOCAL_CONFIG_PATH);
    if local.exists() {
        return ConfigSource::Local(local);
    }
    ConfigSource::Defaults
}

/// Load configuration from the resolved source.
fn load_config(source: &ConfigSource) -> Result<LoopConfig> {
    match source {
        ConfigSource::Argument(path) | ConfigSource::Environment(path) | ConfigSource::Local(path) => {
            LoopConfig::from_file(path)
                .with_context(|| format!("Failed to load config from {source}"))
        }
        ConfigSource::Defaults => Ok(LoopConfig::default()),
    }
}

/// Apply command-line overrides to the loaded configuration.
fn apply_overrides(config: &mut LoopConfig, run: &RunArgs) {
    if let Some(period) = run.period {
        config.period = period;
    }
    if let Some(offset_us) = run.offset_us {
        config.offset_us = offset_us;
    }
    if let Some(max_ticks) = run.max_ticks {
        config.max_ticks = max_ticks;
    }
}

/// Logs the loop start time every `status_interval` ticks.
#[derive(Debug)]
struct Heartbeat {
    status_interval: u64,
    beats: u64,
}

impl Heartbeat {
    fn new(status_interval: u64) -> Self {
        Self {
            status_interval,
            beats: 0,
        }
    }
}

impl TickHandler for Heartbeat {
    type Error = Infallible;

    fn on_tick(&mut self, ctx: &TickContext) -> Result<(), Infallible> {
        if self.status_interval > 0 && ctx.tick % self.status_interval == 0 {
            self.beats += 1;
            info!(
                tick = ctx.tick,
                beat = self.beats,
                loop_start_us = ctx.loop_start_time().as_micros(),
                latency_us = ctx.latency_us(),
                "Heartbeat"
            );
        }
        Ok(())
    }
}

/// Validate the configuration and run the loop on the chosen platform.
fn run_daemon(config: &mut LoopConfig, run: &RunArgs, report_path: Option<&Path>) -> Result<()> {
    apply_overrides(config, run);
    let period = config.validated_period().context("Invalid loop configuration")?;

    info!(
        %period,
        offset_us = config.offset_us,
        max_ticks = config.max_ticks,
        simulated = run.simulated,
        "Configuration loaded"
    );

    let report = if run.simulated {
        if config.max_ticks == 0 {
            bail!("--simulated needs a tick limit (--max-ticks or max_ticks in config)");
        }
        run_loop(SimulatedPlatform::new(0), config)?
    } else {
        let platform = HostPlatform::new().context("Failed to initialize host clock")?;
        run_loop(platform, config)?
    };

    info!(
        ticks = report.ticks,
        skipped_slots = report.metrics.skipped_slots,
        late_ticks = report.metrics.late_ticks,
        max_latency_us = report.metrics.max_latency_us.unwrap_or(0),
        p50_latency_us = report.metrics.p50_latency_us.unwrap_or(0),
        p99_latency_us = report.metrics.p99_latency_us.unwrap_or(0),
        jitter_us = report.metrics.jitter_us().unwrap_or(0),
        final_state = %report.final_state,
        "Daemon shutdown complete"
    );

    write_report(report_path, &report)
}

/// Run one loop with signal-driven shutdown until it stops.
fn run_loop<P: AlarmPlatform + 'static>(platform: P, config: &LoopConfig) -> Result<LoopReport> {
    let mut periodic = PeriodicLoopBuilder::new(platform, Heartbeat::new(config.metrics.status_interval))
        .config(config)?
        .build()?;

    let signals =
        SignalWatcher::install(periodic.stop_handle()).context("Failed to set up signal handlers")?;

    let result = periodic.start().context("Periodic loop failed");
    let signal_count = signals.shutdown();
    if signal_count > 0 {
        info!(signals = signal_count, "Loop stopped by signal");
    }
    result
}

/// Write a serializable result as pretty JSON, if a path was given.
fn write_report<T: serde::Serialize>(path: Option<&Path>, report: &T) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let json = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write report to {}", path.display()))?;
    info!(path = %path.display(), "Report written");
    Ok(())
}
