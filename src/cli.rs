//! CLI arguments and subcommands for procstat-topk.
//!
//! Every ranking option can also be set through the environment variable
//! names used by telegraf `execd` deployments (`bucket_size`, `minCPU`, ...).

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Log level options for CLI parsing
#[derive(Debug, Clone, ValueEnum)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Configuration format options for output
#[derive(Debug, Clone, ValueEnum)]
pub enum ConfigFormat {
    Yaml,
    Json,
    Toml,
}

/// Main CLI arguments structure
#[derive(Parser, Debug)]
#[command(
    name = "procstat-topk",
    about = "Top-K per-process CPU, memory, block I/O and delay reporter for telegraf",
    long_about = "Top-K per-process CPU, memory, block I/O and delay reporter for telegraf.\n\n\
                  Runs as a telegraf execd input: every SIGUSR1 triggers a poll of /proc and \
                  the kernel taskstats interface, and the top consumers of each metric are \
                  written to stdout in line protocol.",
    author = "Michael Moll <exporter@herakles.now> - Herakles",
    version = "0.1.0",
    propagate_version = true
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Processes reported per metric
    #[arg(long, env = "bucket_size")]
    pub bucket_size: Option<usize>,

    /// Fold processes sharing an executable name into one record
    ///
    /// Only "true" and "True" enable aggregation; any other value disables it.
    #[arg(
        long,
        env = "aggregate",
        action = ArgAction::Set,
        num_args = 0..=1,
        require_equals = true,
        default_value = "false",
        default_missing_value = "true",
        value_parser = parse_switch
    )]
    pub aggregate: bool,

    /// Minimum CPU usage in percent of one core
    #[arg(long, env = "minCPU")]
    pub min_cpu: Option<f64>,

    /// Minimum resident memory in MB
    #[arg(long, env = "minRSS")]
    pub min_rss: Option<u64>,

    /// Minimum read or write rate in KB/s
    #[arg(long = "min-io-bytes", env = "minIObytes")]
    pub min_io_bytes: Option<u64>,

    /// Minimum block I/O, swap-in or CPU delay in ms/s
    #[arg(long = "min-io-delays", env = "minIOdelays")]
    pub min_io_delays: Option<u64>,

    /// Process names always reported, e.g. "[sshd, postgres]"
    #[arg(long, env = "includeProcs")]
    pub include_procs: Option<String>,

    /// Poll every N seconds instead of waiting for SIGUSR1
    ///
    /// Also read from the `interval` environment variable, which must then
    /// hold a whole number of seconds; unset it to keep signal mode.
    #[arg(long, env = "interval")]
    pub interval: Option<u64>,

    /// Root of the proc filesystem
    #[arg(long)]
    pub proc_root: Option<PathBuf>,

    /// Do not query taskstats (I/O and delay metrics read zero)
    #[arg(long)]
    pub disable_taskstats: bool,

    /// Log level, written to stderr [default: warn]
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Config file (YAML/JSON/TOML)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Disable all config file loading
    #[arg(long)]
    pub no_config: bool,

    /// Print effective merged config and exit
    #[arg(long)]
    pub show_config: bool,

    /// Print only the loaded user config file + full path and exit
    #[arg(long)]
    pub show_user_config: bool,

    /// Output format for --show-config*
    #[arg(long, value_enum, default_value = "yaml")]
    pub config_format: ConfigFormat,

    /// Validate config and exit (return code 1 on error)
    #[arg(long)]
    pub check_config: bool,
}

/// Switch values as telegraf passes them: "true" or "True" is on, anything
/// else is off.
fn parse_switch(value: &str) -> Result<bool, String> {
    Ok(value == "true" || value == "True")
}

/// Subcommands for additional functionality
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate configuration and system requirements
    Check {
        /// Check /proc filesystem
        #[arg(long)]
        proc: bool,

        /// Check taskstats netlink access and delay accounting
        #[arg(long)]
        taskstats: bool,

        /// Check all system requirements
        #[arg(long)]
        all: bool,
    },

    /// Generate configuration files
    Config {
        /// Output file path
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,

        /// Output format
        #[arg(long, value_enum, default_value = "yaml")]
        format: ConfigFormat,

        /// Include comments and examples
        #[arg(long)]
        commented: bool,
    },

    /// Run a few polls without waiting for signals
    Test {
        /// Number of reports to produce
        #[arg(short = 'n', long, default_value_t = 1)]
        iterations: usize,

        /// Seconds between polls
        #[arg(long, default_value_t = 1)]
        interval: u64,

        /// Show scan statistics for every poll
        #[arg(long)]
        verbose: bool,
    },
}
