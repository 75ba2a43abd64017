//! Configuration management for procstat-topk.
//!
//! This module handles loading, merging, and validating configuration from files
//! and CLI arguments. It supports YAML, JSON, and TOML formats.

use crate::cli::{Args, ConfigFormat, LogLevel};
use clap::ValueEnum;
use ahash::AHashSet as HashSet;
use procstat_topk::collector::{CollectorSettings, DEFAULT_PROC_ROOT};
use procstat_topk::ranking::{RankingSettings, Thresholds, DEFAULT_BUCKET_SIZE};
use procstat_topk::system::CpuSource;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

// Default configuration constants
pub const DEFAULT_MIN_CPU_PERCENT: f64 = 3.0;
pub const DEFAULT_MIN_RSS_MB: u64 = 20;
pub const DEFAULT_MIN_IO_KB: u64 = 5000;
pub const DEFAULT_MIN_IO_DELAY_MS: u64 = 300;

const BYTES_PER_MB: u64 = 1_000_000;
const BYTES_PER_KB: u64 = 1_000;
const NS_PER_MS: u64 = 1_000_000;

/// Effective configuration; every field optional so files can be partial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Ranking
    #[serde(alias = "bucket-size")]
    pub bucket_size: Option<usize>,
    pub aggregate: Option<bool>,
    #[serde(alias = "min-cpu-percent")]
    pub min_cpu_percent: Option<f64>,
    #[serde(alias = "min-rss-mb")]
    pub min_rss_mb: Option<u64>,
    #[serde(alias = "min-io-kb")]
    pub min_io_kb: Option<u64>,
    #[serde(alias = "min-io-delay-ms")]
    pub min_io_delay_ms: Option<u64>,
    #[serde(alias = "include-procs")]
    pub include_procs: Option<Vec<String>>,

    // Polling
    /// Seconds between polls; unset waits for SIGUSR1
    #[serde(alias = "interval-seconds")]
    pub interval_seconds: Option<u64>,
    #[serde(alias = "proc-root")]
    pub proc_root: Option<PathBuf>,
    /// Only sample this core's line of /proc/stat
    #[serde(alias = "cpu-core")]
    pub cpu_core: Option<u32>,

    // Feature flags
    #[serde(alias = "enable-taskstats")]
    pub enable_taskstats: Option<bool>,

    // Logging
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket_size: Some(DEFAULT_BUCKET_SIZE),
            aggregate: Some(false),
            min_cpu_percent: Some(DEFAULT_MIN_CPU_PERCENT),
            min_rss_mb: Some(DEFAULT_MIN_RSS_MB),
            min_io_kb: Some(DEFAULT_MIN_IO_KB),
            min_io_delay_ms: Some(DEFAULT_MIN_IO_DELAY_MS),
            include_procs: None,
            interval_seconds: None,
            proc_root: Some(PathBuf::from(DEFAULT_PROC_ROOT)),
            cpu_core: None,
            enable_taskstats: Some(true),
            log_level: Some("warn".into()),
        }
    }
}

impl Config {
    /// Effective log level; unset or unknown values fall back to warn.
    pub fn log_level(&self) -> LogLevel {
        self.log_level
            .as_deref()
            .and_then(|l| LogLevel::from_str(l, true).ok())
            .unwrap_or(LogLevel::Warn)
    }

    /// Library settings for the effective configuration.
    pub fn collector_settings(&self) -> CollectorSettings {
        let thresholds = Thresholds {
            min_cpu_percent: self.min_cpu_percent.unwrap_or(DEFAULT_MIN_CPU_PERCENT),
            min_rss_bytes: self
                .min_rss_mb
                .unwrap_or(DEFAULT_MIN_RSS_MB)
                .saturating_mul(BYTES_PER_MB),
            min_io_bytes_per_sec: self
                .min_io_kb
                .unwrap_or(DEFAULT_MIN_IO_KB)
                .saturating_mul(BYTES_PER_KB),
            min_delay_ns_per_sec: self
                .min_io_delay_ms
                .unwrap_or(DEFAULT_MIN_IO_DELAY_MS)
                .saturating_mul(NS_PER_MS),
        };
        let include: HashSet<String> = self
            .include_procs
            .iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect();

        CollectorSettings {
            proc_root: self
                .proc_root
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PROC_ROOT)),
            cpu_source: self.cpu_core.map_or(CpuSource::Total, CpuSource::Core),
            enable_taskstats: self.enable_taskstats.unwrap_or(true),
            ranking: RankingSettings {
                bucket_size: self.bucket_size.unwrap_or(DEFAULT_BUCKET_SIZE),
                aggregate: self.aggregate.unwrap_or(false),
                thresholds,
                include,
            },
        }
    }
}

/// Parses an include list such as `[sshd, postgres]` or `sshd,postgres`.
///
/// Spaces are removed everywhere, one pair of enclosing brackets is
/// stripped, and empty entries are dropped.
pub fn parse_include_list(raw: &str) -> Vec<String> {
    let compact: String = raw.chars().filter(|c| *c != ' ').collect();
    let start = compact.find('[').map_or(0, |i| i + 1);
    let end = compact.rfind(']').unwrap_or(compact.len());
    let inner = if start <= end { &compact[start..end] } else { "" };

    inner
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Validate effective config (used by --check-config and at startup)
pub fn validate_effective_config(cfg: &Config) -> Result<(), Box<dyn std::error::Error>> {
    if cfg.bucket_size == Some(0) {
        return Err("bucket_size must be at least 1".into());
    }

    if let Some(cpu) = cfg.min_cpu_percent {
        if !cpu.is_finite() || cpu < 0.0 {
            return Err(format!(
                "min_cpu_percent must be a non-negative number, got {}",
                cpu
            )
            .into());
        }
    }

    if cfg.interval_seconds == Some(0) {
        return Err("interval_seconds must be greater than 0 when set".into());
    }

    if let Some(level) = cfg.log_level.as_deref() {
        if LogLevel::from_str(level, true).is_err() {
            return Err(format!(
                "Invalid log_level '{}', expected off/error/warn/info/debug/trace",
                level
            )
            .into());
        }
    }

    if let Some(root) = cfg.proc_root.as_deref() {
        if root.as_os_str().is_empty() {
            return Err("proc_root must not be empty".into());
        }
    }

    Ok(())
}

/// Resolves configuration from CLI args, config file, and defaults.
/// This enforces precedence: CLI or environment (if provided) > config file > default.
pub fn resolve_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = if args.no_config {
        Config::default()
    } else {
        load_config(args.config.as_deref().and_then(|p| p.to_str()))?
    };

    if let Some(n) = args.bucket_size {
        config.bucket_size = Some(n);
    }
    if args.aggregate {
        config.aggregate = Some(true);
    }

    // Thresholds
    if let Some(cpu) = args.min_cpu {
        config.min_cpu_percent = Some(cpu);
    }
    if let Some(mb) = args.min_rss {
        config.min_rss_mb = Some(mb);
    }
    if let Some(kb) = args.min_io_bytes {
        config.min_io_kb = Some(kb);
    }
    if let Some(ms) = args.min_io_delays {
        config.min_io_delay_ms = Some(ms);
    }

    if let Some(raw) = &args.include_procs {
        config.include_procs = Some(parse_include_list(raw));
    }

    // Polling
    if let Some(secs) = args.interval {
        config.interval_seconds = Some(secs);
    }
    if let Some(root) = &args.proc_root {
        config.proc_root = Some(root.clone());
    }
    if args.disable_taskstats {
        config.enable_taskstats = Some(false);
    }

    if let Some(level) = args.log_level.as_ref().and_then(ValueEnum::to_possible_value) {
        config.log_level = Some(level.get_name().to_string());
    }

    Ok(config)
}

/// Enhanced configuration loading with multiple format support
pub fn load_config(path: Option<&str>) -> Result<Config, Box<dyn std::error::Error>> {
    let path = if let Some(p) = path {
        PathBuf::from(p)
    } else {
        // Try default locations
        let defaults = [
            "/etc/procstat-topk/procstat-topk.yaml",
            "/etc/procstat-topk/procstat-topk.yml",
            "/etc/procstat-topk/procstat-topk.json",
            "./procstat-topk.yaml",
            "./procstat-topk.yml",
            "./procstat-topk.json",
        ];

        defaults
            .iter()
            .find(|p| Path::new(p).exists())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(""))
    };

    if !path.exists() || path.to_string_lossy().is_empty() {
        return Ok(Config::default());
    }

    let content = fs::read_to_string(&path)?;

    match path.extension().and_then(|s| s.to_str()) {
        Some("json") => {
            let config: Config = serde_json::from_str(&content)?;
            info!("Loaded JSON configuration from: {}", path.display());
            Ok(config)
        }
        Some("toml") => {
            let config: Config = toml::from_str(&content)?;
            info!("Loaded TOML configuration from: {}", path.display());
            Ok(config)
        }
        _ => {
            // Default to YAML
            let config: Config = serde_yaml::from_str(&content)?;
            info!("Loaded YAML configuration from: {}", path.display());
            Ok(config)
        }
    }
}

/// Shows configuration in requested format
pub fn show_config(
    config: &Config,
    format: ConfigFormat,
    user_config: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let output = match format {
        ConfigFormat::Json => serde_json::to_string_pretty(config)?,
        ConfigFormat::Toml => toml::to_string_pretty(config)?,
        ConfigFormat::Yaml => serde_yaml::to_string(config)?,
    };

    if user_config {
        println!("User configuration (effective values):");
    }
    println!("{output}");
    Ok(())
}
