//! procstat-topk - version 0.1.0
//!
//! Telegraf `execd` input reporting the top per-process consumers of CPU,
//! memory, block I/O and delays. Reports go to stdout, logs to stderr.

mod cli;
mod commands;
mod config;
mod startup_checks;
mod trigger;

use anyhow::Context;
use clap::Parser;
use std::io::{self, Write};
use std::time::Duration;
use tracing::{debug, error, info, Level};

use cli::{Args, Commands, LogLevel};
use commands::{command_check, command_config, command_test};
use config::{resolve_config, show_config, validate_effective_config, Config};
use procstat_topk::taskstats::Connector;
use procstat_topk::Collector;
use trigger::{SignalTrigger, Trigger};

/// Initializes tracing logging subsystem with configured log level.
fn setup_logging(config: &Config) {
    let level = config.log_level();
    let log_level = match level {
        LogLevel::Off => None,
        LogLevel::Error => Some(Level::ERROR),
        LogLevel::Warn => Some(Level::WARN),
        LogLevel::Info => Some(Level::INFO),
        LogLevel::Debug => Some(Level::DEBUG),
        LogLevel::Trace => Some(Level::TRACE),
    };
    let Some(log_level) = log_level else {
        return;
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    info!("Logging initialized with level: {:?}", level);
}

/// Helper function to load and validate configuration.
/// Exits the process with error code 1 if validation fails.
fn load_validated_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let config = resolve_config(args)?;
    if let Err(e) = validate_effective_config(&config) {
        eprintln!("❌ Configuration invalid: {}", e);
        std::process::exit(1);
    }
    Ok(config)
}

/// Polls once and writes the report, if any, flushing immediately.
fn poll_and_emit<C: Connector, W: Write>(
    collector: &mut Collector<C>,
    out: &mut W,
) -> anyhow::Result<()> {
    let outcome = collector.poll().context("poll failed")?;
    if let Some(report) = outcome.report {
        report.write_to(out).context("failed to write report")?;
        out.flush().context("failed to flush report")?;
    }
    Ok(())
}

/// Runs until SIGTERM or SIGINT.
fn run<C: Connector>(mut collector: Collector<C>, trigger: &SignalTrigger) -> anyhow::Result<()> {
    let stdout = io::stdout();

    // A timer-driven loop primes baselines right away so its first tick reports
    if trigger.interval().is_some() {
        poll_and_emit(&mut collector, &mut stdout.lock())?;
    }

    loop {
        match trigger.next().context("waiting for a trigger signal failed")? {
            Trigger::Poll => {
                debug!("Poll triggered");
                poll_and_emit(&mut collector, &mut stdout.lock())?;
            }
            Trigger::Stop(signal) => {
                info!("Received {}, shutting down", signal);
                return Ok(());
            }
        }
    }
}

/// Main application entry point.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Early config resolution for show/check modes
    if args.show_config || args.show_user_config || args.check_config {
        let config = resolve_config(&args)?;

        if args.check_config {
            if let Err(e) = validate_effective_config(&config) {
                eprintln!("❌ Configuration invalid: {}", e);
                std::process::exit(1);
            }
            println!("✅ Configuration is valid");
            return Ok(());
        }

        return show_config(&config, args.config_format, args.show_user_config);
    }

    // Handle subcommands
    if let Some(command) = &args.command {
        let config = load_validated_config(&args)?;

        return match command {
            Commands::Check {
                proc,
                taskstats,
                all,
            } => command_check(*proc, *taskstats, *all, &config),

            Commands::Config {
                output,
                format,
                commented,
            } => command_config(output.clone(), format.clone(), *commented),

            Commands::Test {
                iterations,
                interval,
                verbose,
            } => {
                setup_logging(&config);
                command_test(*iterations, *interval, *verbose, &config)
            }
        };
    }

    let config = load_validated_config(&args)?;

    setup_logging(&config);

    info!("Starting procstat-topk");

    let settings = config.collector_settings();
    if let Err(e) = startup_checks::validate_requirements(&settings.proc_root, settings.enable_taskstats)
    {
        error!("❌ Startup validation failed: {}", e);
        return Err(e.into());
    }

    // Block the trigger signals before anything else can receive them
    let interval = config.interval_seconds.map(Duration::from_secs);
    let trigger = SignalTrigger::install(interval)?;
    match interval {
        Some(i) => info!("Polling every {:?}", i),
        None => info!("Waiting for SIGUSR1 to poll"),
    }

    let collector = Collector::open(settings).map_err(|e| {
        error!("❌ {}", e);
        e
    })?;

    if let Err(e) = run(collector, &trigger) {
        error!("❌ {:#}", e);
        return Err(e.into());
    }

    info!("procstat-topk stopped");
    Ok(())
}
