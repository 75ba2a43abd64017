//! Config command implementation.
//!
//! Generates configuration files in various formats.

use std::fs;
use std::path::PathBuf;

use crate::cli::ConfigFormat;
use crate::config::Config;

/// Generates configuration files.
pub fn command_config(
    output: Option<PathBuf>,
    format: ConfigFormat,
    commented: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();
    let output = match output {
        Some(path) => path,
        None => PathBuf::from("procstat-topk.yaml"),
    };

    let content = render_config(&config, format, commented)?;

    if output.to_string_lossy() == "-" {
        print!("{}", content);
    } else {
        fs::write(&output, content)?;
        println!("✅ Configuration written to: {}", output.display());
    }

    Ok(())
}

fn render_config(
    config: &Config,
    format: ConfigFormat,
    commented: bool,
) -> Result<String, Box<dyn std::error::Error>> {
    Ok(match format {
        ConfigFormat::Json => serde_json::to_string_pretty(config)?,
        ConfigFormat::Toml => toml::to_string_pretty(config)?,
        ConfigFormat::Yaml => {
            let mut content = serde_yaml::to_string(config)?;
            if commented {
                content = add_config_comments(content);
            }
            content
        }
    })
}

/// Adds comments to YAML configuration.
fn add_config_comments(yaml: String) -> String {
    let comments = r#"# procstat-topk Configuration
# ===========================
#
# Every key can be overridden by a CLI flag or by the environment variable
# shown in brackets.
#
# Ranking
# -------
# bucket_size: 5               # Processes reported per metric [bucket_size]
# aggregate: false             # Fold processes sharing a name [aggregate]
# include_procs: null          # Always-reported names, e.g. ["sshd"] [includeProcs]
#
# Thresholds (a process must exceed them to earn a rank)
# ----------
# min_cpu_percent: 3.0         # Percent of one core [minCPU]
# min_rss_mb: 20               # Resident memory, 10^6 bytes [minRSS]
# min_io_kb: 5000              # Read or write rate, 10^3 bytes/s [minIObytes]
# min_io_delay_ms: 300         # Block I/O, swap-in or CPU delay, ms/s [minIOdelays]
#
# Polling
# -------
# interval_seconds: null       # Poll every N seconds; null waits for SIGUSR1 [interval]
# proc_root: "/proc"           # Root of the proc filesystem
# cpu_core: null               # Sample one core's line of /proc/stat instead of the total
#
# Feature Flags
# -------------
# enable_taskstats: true       # Query taskstats for I/O and delay metrics
#
# Logging
# -------
# log_level: "warn"            # off, error, warn, info, debug, trace (stderr)
"#;

    format!("{comments}\n{yaml}")
}
