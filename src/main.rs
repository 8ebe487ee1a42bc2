//! Command-line entry point for the test orchestrator.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use hidtest::bus::HidApiBus;
use hidtest::ci::{exit_code, CiConfig, CiPipeline};
use hidtest::exec::RealCommandExecutor;
use hidtest::monitor::LogLevel;

/// Automated test orchestrator for USB HID connected embedded devices.
#[derive(Parser, Debug)]
#[command(name = "hidtest", version, about)]
struct Cli {
    /// CI configuration file (JSON).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Firmware file to flash before testing.
    #[arg(short, long)]
    firmware: Option<PathBuf>,

    /// Minimum number of devices required.
    #[arg(short, long, default_value_t = 1)]
    devices: usize,

    /// Maximum parallel device operations.
    #[arg(short, long, default_value_t = 4)]
    parallel: usize,

    /// Global timeout in seconds.
    #[arg(short, long, default_value_t = 300.0)]
    timeout: f64,

    /// Output directory for results and artifacts.
    #[arg(short, long, default_value = "ci_test_results")]
    output_dir: PathBuf,

    /// Monitor verbosity: minimal, normal, verbose, or debug.
    #[arg(long, default_value = "normal")]
    log_level: LogLevel,

    /// Enable verbose logging (same as --log-level verbose).
    #[arg(short, long)]
    verbose: bool,

    /// Stop on the first failing stage.
    #[arg(long)]
    fail_fast: bool,

    /// Skip HTML/CSV report and artifact generation.
    #[arg(long)]
    no_artifacts: bool,
}

fn main() {
    let cli = Cli::parse();
    let log_level = if cli.verbose {
        LogLevel::Verbose
    } else {
        cli.log_level
    };

    init_logging(log_level);

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let interrupted = Arc::clone(&interrupted);
        if let Err(e) = ctrlc::set_handler(move || {
            interrupted.store(true, Ordering::SeqCst);
            eprintln!("Interrupt received, finishing current stage...");
        }) {
            eprintln!("Warning: failed to install interrupt handler: {e}");
        }
    }

    let code = match run(&cli, log_level, interrupted) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            exit_code::INTERNAL_ERROR
        }
    };
    std::process::exit(code);
}

fn run(cli: &Cli, log_level: LogLevel, interrupted: Arc<AtomicBool>) -> anyhow::Result<i32> {
    let mut config = CiConfig::load(cli.config.as_deref()).context("loading configuration")?;

    // Command-line arguments override file settings.
    config.required_devices = cli.devices;
    config.max_parallel_devices = cli.parallel;
    config.timeout_seconds = cli.timeout;
    if cli.fail_fast {
        config.fail_fast = true;
    }
    if cli.no_artifacts {
        config.generate_artifacts = false;
    }
    if let Some(firmware) = &cli.firmware {
        config.firmware_path = Some(firmware.clone());
    }

    let bus = Arc::new(HidApiBus::new().context("initialising HID bus")?);
    let executor = Arc::new(RealCommandExecutor);
    let pipeline = CiPipeline::with_components(
        &cli.output_dir,
        bus,
        executor,
        log_level,
        Arc::clone(&interrupted),
    )
    .context("initialising pipeline")?;

    let outcome = pipeline.run(&config);

    println!();
    println!("{}", "=".repeat(60));
    println!("CI PIPELINE COMPLETED");
    println!("{}", "=".repeat(60));
    println!("Success: {}", outcome.success);
    println!("Exit Code: {}", outcome.exit_code);
    println!("Total Tests: {}", outcome.total_tests);
    println!("Passed: {}", outcome.passed_tests);
    println!("Failed: {}", outcome.failed_tests);
    println!("Duration: {:.1}s", outcome.duration_seconds);
    println!("Devices: {}", outcome.devices_tested.len());
    println!("Artifacts: {}", outcome.artifacts_generated.len());
    if let Some(summary) = &outcome.error_summary {
        println!("Error: {summary}");
    }
    if !outcome.artifacts_generated.is_empty() {
        println!();
        println!("Generated Artifacts:");
        for artifact in &outcome.artifacts_generated {
            println!("  - {}", artifact.display());
        }
    }
    println!("{}", "=".repeat(60));

    if interrupted.load(Ordering::SeqCst) && outcome.exit_code == exit_code::SUCCESS {
        return Ok(exit_code::INTERRUPTED);
    }
    Ok(outcome.exit_code)
}

fn init_logging(log_level: LogLevel) {
    let default_filter = match log_level {
        LogLevel::Minimal => "warn",
        LogLevel::Normal => "info",
        LogLevel::Verbose => "debug",
        LogLevel::Debug => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
