//! Startup requirement validation for procstat-topk.
//!
//! Unreadable proc roots stop the collector. Missing privileges or disabled
//! delay accounting only degrade the report, so they are logged as warnings.

use nix::unistd::geteuid;
use std::fs;
use std::path::Path;
use tracing::{debug, error, info, warn};

/// Validate all runtime requirements
pub fn validate_requirements(proc_root: &Path, enable_taskstats: bool) -> Result<(), ValidationError> {
    info!("🔍 Validating runtime requirements...");

    check_proc_access(proc_root)?;

    if enable_taskstats {
        check_user_privileges();
        check_delay_accounting(proc_root);
    }

    info!("✅ All runtime requirements validated");
    Ok(())
}

/// Reads `kernel.task_delayacct`; `None` when the sysctl is absent.
pub fn delay_accounting_enabled(proc_root: &Path) -> Option<bool> {
    let path = proc_root.join("sys/kernel/task_delayacct");
    fs::read_to_string(path)
        .ok()
        .map(|value| value.trim() != "0")
}

/// Taskstats queries need CAP_NET_ADMIN, which in practice means root.
fn check_user_privileges() {
    if !geteuid().is_root() {
        warn!("⚠️  Not running as root - taskstats queries may be refused");
        warn!("   I/O and delay metrics need CAP_NET_ADMIN; CPU and RSS are unaffected");
    } else {
        info!("✅ Running as root (uid=0)");
    }
}

fn check_delay_accounting(proc_root: &Path) {
    match delay_accounting_enabled(proc_root) {
        Some(true) => info!("✅ Delay accounting enabled"),
        Some(false) => {
            warn!("⚠️  Delay accounting is disabled - delay metrics will read zero");
            warn!("   Solution: sysctl -w kernel.task_delayacct=1 or boot with 'delayacct'");
        }
        None => debug!("kernel.task_delayacct not present, assuming delay accounting is on"),
    }
}

/// The proc root must be enumerable and carry a `stat` file.
fn check_proc_access(proc_root: &Path) -> Result<(), ValidationError> {
    if let Err(e) = fs::read_dir(proc_root) {
        error!("❌ Cannot enumerate {}: {}", proc_root.display(), e);
        return Err(ValidationError::ProcUnreadable(format!(
            "{}: {}",
            proc_root.display(),
            e
        )));
    }

    let stat = proc_root.join("stat");
    match fs::metadata(&stat) {
        Ok(_) => {
            info!("✅ {} access: OK", proc_root.display());
            Ok(())
        }
        Err(e) => {
            error!("❌ Cannot access {}: {}", stat.display(), e);
            Err(ValidationError::CpuStatMissing(stat.display().to_string()))
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("proc filesystem not readable: {0}")]
    ProcUnreadable(String),

    #[error("CPU statistics not found at {0}")]
    CpuStatMissing(String),
}
