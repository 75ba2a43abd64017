//! System-wide CPU accounting from `/proc/stat`.
//!
//! This module provides the [`CpuUsageSampler`], which parses the aggregate
//! (or a single core's) CPU jiffie counters and computes the total number of
//! jiffies that elapsed between two consecutive samples. That total is the
//! CPU budget per-process jiffie deltas are compared against.

use std::fmt;
use std::path::PathBuf;
use tracing::{trace, warn};

use crate::procfile::{ProcFile, ProcFileError};

/// Number of counters on a modern kernel's `cpu` line that we consume.
pub const CPU_FIELDS: usize = 8;

/// Counter names in `/proc/stat` column order.
pub const CPU_FIELD_NAMES: [&str; CPU_FIELDS] = [
    "user", "nice", "sys", "idle", "iowait", "irq", "softirq", "stolen",
];

/// Which CPU line of `/proc/stat` to sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuSource {
    /// The aggregate `cpu` line (all cores).
    #[default]
    Total,
    /// A single `cpuN` line.
    Core(u32),
}

impl CpuSource {
    /// Token that precedes the counters. The trailing space keeps `cpu1`
    /// from matching `cpu10`.
    pub fn token(&self) -> String {
        match self {
            CpuSource::Total => "cpu ".to_string(),
            CpuSource::Core(n) => format!("cpu{} ", n),
        }
    }
}

impl fmt::Display for CpuSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuSource::Total => write!(f, "cpu"),
            CpuSource::Core(n) => write!(f, "cpu{}", n),
        }
    }
}

/// CPU counters in jiffies for one source at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuSnapshot {
    fields: [u64; CPU_FIELDS],
}

impl CpuSnapshot {
    pub fn from_fields(fields: [u64; CPU_FIELDS]) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[u64; CPU_FIELDS] {
        &self.fields
    }

    pub fn user(&self) -> u64 {
        self.fields[0]
    }

    pub fn idle(&self) -> u64 {
        self.fields[3]
    }

    pub fn stolen(&self) -> u64 {
        self.fields[7]
    }

    /// An idle count of zero marks a slot that was never filled.
    pub fn is_empty(&self) -> bool {
        self.idle() == 0
    }

    /// Parses the counters following the CPU token.
    ///
    /// Returns the snapshot and the number of counters actually present;
    /// missing tail counters are zero.
    pub fn parse(counters: &str) -> Result<(Self, usize), CpuStatError> {
        let mut fields = [0u64; CPU_FIELDS];
        let mut found = 0;
        // Stop at the end of the line like sscanf stops at the first non-number
        let line = counters.lines().next().unwrap_or("");
        for token in line.split_whitespace().take(CPU_FIELDS) {
            match token.parse::<u64>() {
                Ok(v) => {
                    fields[found] = v;
                    found += 1;
                }
                Err(_) => break,
            }
        }
        if found < 4 {
            return Err(CpuStatError::Incomplete { found });
        }
        Ok((Self { fields }, found))
    }

    /// Sum of the per-counter differences `self - previous`.
    pub fn delta_total(&self, previous: &CpuSnapshot) -> u64 {
        self.fields
            .iter()
            .zip(previous.fields.iter())
            .map(|(cur, prev)| cur.saturating_sub(*prev))
            .sum()
    }
}

/// Errors produced while sampling `/proc/stat`.
#[derive(Debug, thiserror::Error)]
pub enum CpuStatError {
    #[error(transparent)]
    Read(#[from] ProcFileError),

    #[error("{0} line not found in /proc/stat")]
    MissingCpu(CpuSource),

    #[error("cpu info incomplete: {found} counters, at least 4 required")]
    Incomplete { found: usize },

    #[error("no previous CPU sample to compute a delta against")]
    NoBaseline,
}

/// Double-buffered sampler of one CPU line.
#[derive(Debug)]
pub struct CpuUsageSampler {
    source: CpuSource,
    stat: ProcFile,
    snapshots: [CpuSnapshot; 2],
    current: usize,
    warned_short: bool,
    warned_stolen: bool,
}

impl CpuUsageSampler {
    pub fn new(stat_path: impl Into<PathBuf>, source: CpuSource) -> Self {
        Self {
            source,
            stat: ProcFile::new(stat_path),
            snapshots: [CpuSnapshot::default(); 2],
            // The first sample flips this to slot 0
            current: 1,
            warned_short: false,
            warned_stolen: false,
        }
    }

    pub fn source(&self) -> CpuSource {
        self.source
    }

    /// Reads a new snapshot into the slot written two calls ago.
    pub fn sample(&mut self) -> Result<(), CpuStatError> {
        self.current = 1 - self.current;
        // Leave an empty slot behind on failure so no delta spans it
        self.snapshots[self.current] = CpuSnapshot::default();

        self.stat.refresh()?;
        let token = self.source.token();
        let counters = self
            .stat
            .data_after(&token)
            .ok_or(CpuStatError::MissingCpu(self.source))?;
        let (snapshot, found) = CpuSnapshot::parse(counters)?;

        if found < 7 && !self.warned_short {
            warn!(
                "{} line has {} counters: iowait, irq, softirq and stolen read as zero",
                self.source, found
            );
            self.warned_short = true;
        } else if found == 7 && !self.warned_stolen {
            warn!("{} line has no stolen counter: reading it as zero", self.source);
            self.warned_stolen = true;
        }

        trace!(source = %self.source, fields = ?snapshot.fields(), "cpu snapshot");
        self.snapshots[self.current] = snapshot;
        Ok(())
    }

    pub fn current(&self) -> &CpuSnapshot {
        &self.snapshots[self.current]
    }

    pub fn previous(&self) -> &CpuSnapshot {
        &self.snapshots[1 - self.current]
    }

    /// Total jiffies across all counters between the previous and current sample.
    pub fn total_delta(&self) -> Result<u64, CpuStatError> {
        if self.previous().is_empty() || self.current().is_empty() {
            return Err(CpuStatError::NoBaseline);
        }
        Ok(self.current().delta_total(self.previous()))
    }
}

/// Number of online CPU cores.
pub fn online_cores() -> Result<u32, String> {
    // SAFETY: sysconf is safe to call with _SC_NPROCESSORS_ONLN
    // Returns -1 on error; zero is treated as an error too
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n > 0 {
        Ok(n as u32)
    } else {
        Err("Unable to get number of CPU cores".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const STAT_8: &str = "cpu  100 10 50 1000 5 1 2 3 0 0\ncpu0 50 5 25 500 2 0 1 1 0 0\ncpu10 1 1 1 1 1 1 1 1\nintr 12345\n";

    #[test]
    fn test_parse_full_line() {
        let (snap, found) = CpuSnapshot::parse(" 100 10 50 1000 5 1 2 3 0 0\n").expect("parse");
        assert_eq!(found, 8);
        assert_eq!(snap.fields(), &[100, 10, 50, 1000, 5, 1, 2, 3]);
    }

    #[test]
    fn test_parse_short_lines_zero_fill() {
        let (snap, found) = CpuSnapshot::parse("1 2 3 4\nintr 5 6 7").expect("parse");
        assert_eq!(found, 4);
        assert_eq!(snap.fields(), &[1, 2, 3, 4, 0, 0, 0, 0]);

        let (snap, found) = CpuSnapshot::parse("1 2 3 4 5 6 7").expect("parse");
        assert_eq!(found, 7);
        assert_eq!(snap.stolen(), 0);
    }

    #[test]
    fn test_parse_too_few_fields() {
        let err = CpuSnapshot::parse("1 2 3\n").expect_err("should fail");
        assert!(matches!(err, CpuStatError::Incomplete { found: 3 }));
    }

    #[test]
    fn test_delta_total_sums_all_fields() {
        let prev = CpuSnapshot::from_fields([100, 10, 50, 1000, 5, 1, 2, 3]);
        let cur = CpuSnapshot::from_fields([110, 12, 55, 1100, 6, 2, 4, 6]);
        assert_eq!(cur.delta_total(&prev), 10 + 2 + 5 + 100 + 1 + 1 + 2 + 3);
    }

    #[test]
    fn test_core_token_does_not_match_longer_core() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("stat");
        std::fs::write(&path, STAT_8).expect("Failed to write stat");

        let mut sampler = CpuUsageSampler::new(&path, CpuSource::Core(1));
        let err = sampler.sample().expect_err("cpu1 is absent");
        assert!(matches!(err, CpuStatError::MissingCpu(CpuSource::Core(1))));

        let mut sampler = CpuUsageSampler::new(&path, CpuSource::Core(0));
        sampler.sample().expect("cpu0 present");
        assert_eq!(sampler.current().user(), 50);
    }

    #[test]
    fn test_sampler_first_delta_is_failure() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("stat");
        std::fs::write(&path, STAT_8).expect("Failed to write stat");

        let mut sampler = CpuUsageSampler::new(&path, CpuSource::Total);
        sampler.sample().expect("first sample");
        assert!(matches!(sampler.total_delta(), Err(CpuStatError::NoBaseline)));
    }

    #[test]
    fn test_sampler_alternates_snapshots() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("stat");
        std::fs::write(&path, "cpu  100 0 0 1000 0 0 0 0\n").expect("Failed to write stat");

        let mut sampler = CpuUsageSampler::new(&path, CpuSource::Total);
        sampler.sample().expect("first sample");

        std::fs::write(&path, "cpu  150 0 0 1200 0 0 0 0\n").expect("Failed to write stat");
        sampler.sample().expect("second sample");
        assert_eq!(sampler.total_delta().expect("delta"), 250);

        std::fs::write(&path, "cpu  160 0 0 1300 0 0 0 0\n").expect("Failed to write stat");
        sampler.sample().expect("third sample");
        assert_eq!(sampler.previous().user(), 150);
        assert_eq!(sampler.total_delta().expect("delta"), 110);
    }

    #[test]
    fn test_sampler_failed_read_suppresses_next_delta() {
        let dir = tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("stat");
        std::fs::write(&path, "cpu  100 0 0 1000 0 0 0 0\n").expect("Failed to write stat");

        let mut sampler = CpuUsageSampler::new(&path, CpuSource::Total);
        sampler.sample().expect("first sample");

        std::fs::write(&path, "cpu  1 2\n").expect("Failed to write stat");
        assert!(sampler.sample().is_err());

        std::fs::write(&path, "cpu  200 0 0 2000 0 0 0 0\n").expect("Failed to write stat");
        sampler.sample().expect("third sample");
        assert!(matches!(sampler.total_delta(), Err(CpuStatError::NoBaseline)));
    }

    #[test]
    fn test_online_cores_positive() {
        assert!(online_cores().expect("sysconf") >= 1);
    }
}
