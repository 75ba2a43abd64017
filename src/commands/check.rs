//! Check command implementation.
//!
//! Validates system requirements and configuration.

use std::path::Path;

use procstat_topk::process::collect_proc_entries;
use procstat_topk::system::{online_cores, CpuUsageSampler};
use procstat_topk::taskstats::{NetlinkConnector, QueryOutcome, TaskstatsClient};
use procstat_topk::CollectorSettings;

use crate::config::{validate_effective_config, Config};
use crate::startup_checks::delay_accounting_enabled;

/// Validates system requirements and configuration.
pub fn command_check(
    proc: bool,
    taskstats: bool,
    all: bool,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("🔍 procstat-topk - System Check");
    println!("===============================");

    let settings = config.collector_settings();
    let mut all_ok = true;

    // Check /proc filesystem
    if proc || all {
        println!("\n📁 Checking {} filesystem...", settings.proc_root.display());
        all_ok &= check_proc(&settings);
    }

    // Check taskstats netlink access
    if taskstats || all {
        println!("\n📡 Checking taskstats...");
        all_ok &= check_taskstats(&settings.proc_root);
    }

    // Check configuration
    println!("\n⚙️  Checking configuration...");
    match validate_effective_config(config) {
        Ok(_) => {
            println!("   ✅ Configuration is valid");
        }
        Err(e) => {
            println!("   ❌ Configuration invalid: {}", e);
            all_ok = false;
        }
    }

    println!("\n📋 Summary:");
    if all_ok {
        println!("   ✅ All checks passed - system is ready");
        Ok(())
    } else {
        println!("   ❌ Some checks failed - please review warnings");
        std::process::exit(1);
    }
}

fn check_proc(settings: &CollectorSettings) -> bool {
    let root = settings.proc_root.as_path();
    let mut ok = true;

    match collect_proc_entries(root) {
        Ok(entries) if !entries.is_empty() => {
            println!("   ✅ Can read {} process entries", entries.len());
        }
        Ok(_) => {
            println!("   ❌ No process entries found");
            ok = false;
        }
        Err(e) => {
            println!("   ❌ Cannot enumerate processes: {}", e);
            ok = false;
        }
    }

    match online_cores() {
        Ok(cores) => println!("   ✅ {} online cores", cores),
        Err(e) => {
            println!("   ❌ Cannot determine core count: {}", e);
            ok = false;
        }
    }

    let mut cpu = CpuUsageSampler::new(root.join("stat"), settings.cpu_source);
    match cpu.sample() {
        Ok(()) => println!(
            "   ✅ '{}' line parsed: {} user, {} idle jiffies",
            settings.cpu_source,
            cpu.current().user(),
            cpu.current().idle()
        ),
        Err(e) => {
            println!("   ❌ CPU statistics unusable: {}", e);
            ok = false;
        }
    }

    ok
}

fn check_taskstats(proc_root: &Path) -> bool {
    let mut ok = true;

    if nix::unistd::geteuid().is_root() {
        println!("   ✅ Running as root");
    } else {
        println!("   ⚠️  Not running as root - queries need CAP_NET_ADMIN");
    }

    let mut client = TaskstatsClient::new(NetlinkConnector);
    match client.init() {
        Ok(family) => {
            println!("   ✅ TASKSTATS family resolved (id {})", family);
            let tid = std::process::id();
            match client.query(tid) {
                QueryOutcome::Success(ts) => println!(
                    "   ✅ Query for own pid {} answered: {} bytes read",
                    tid, ts.read_bytes
                ),
                other => {
                    println!("   ❌ Query for own pid {} failed: {:?}", tid, other);
                    ok = false;
                }
            }
        }
        Err(e) => {
            println!("   ❌ Taskstats unavailable: {}", e);
            ok = false;
        }
    }
    client.teardown();

    match delay_accounting_enabled(proc_root) {
        Some(true) => println!("   ✅ Delay accounting enabled"),
        Some(false) => println!("   ⚠️  Delay accounting disabled (kernel.task_delayacct=0)"),
        None => println!("   ℹ️  kernel.task_delayacct not present"),
    }

    ok
}
