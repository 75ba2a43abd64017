//! Per-process sampling of `/proc/<pid>/stat`, `/proc/<pid>/status` and taskstats.

use std::ops::{Index, IndexMut};
use std::path::Path;
use tracing::{debug, trace};

use crate::procfile::{ProcFile, ProcFileError};
use crate::process::io::{IoAccounting, IoFetch};
use crate::taskstats::Connector;

/// Cumulative kernel counters tracked per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// utime + stime, in jiffies.
    CpuJiffies,
    ReadBytes,
    WriteBytes,
    /// Block I/O delay, nanoseconds.
    BlkioDelay,
    /// Swap-in delay, nanoseconds.
    SwapinDelay,
    /// Run-queue wait, nanoseconds.
    CpuDelay,
}

impl Counter {
    pub const COUNT: usize = 6;

    pub const ALL: [Counter; Counter::COUNT] = [
        Counter::CpuJiffies,
        Counter::ReadBytes,
        Counter::WriteBytes,
        Counter::BlkioDelay,
        Counter::SwapinDelay,
        Counter::CpuDelay,
    ];

    /// Counters sourced from taskstats rather than `/proc/<pid>/stat`.
    pub const TASKSTATS: [Counter; 5] = [
        Counter::ReadBytes,
        Counter::WriteBytes,
        Counter::BlkioDelay,
        Counter::SwapinDelay,
        Counter::CpuDelay,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Counter::CpuJiffies => "cpu",
            Counter::ReadBytes => "read_bytes",
            Counter::WriteBytes => "write_bytes",
            Counter::BlkioDelay => "blkio_delay",
            Counter::SwapinDelay => "swapin_delay",
            Counter::CpuDelay => "cpu_delay",
        }
    }
}

/// One value per [`Counter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSet {
    values: [u64; Counter::COUNT],
}

impl CounterSet {
    /// Adds every counter of `other` into `self`.
    pub fn add(&mut self, other: &CounterSet) {
        for counter in Counter::ALL {
            self[counter] = self[counter].saturating_add(other[counter]);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Counter, u64)> + '_ {
        Counter::ALL.into_iter().map(move |c| (c, self[c]))
    }
}

impl Index<Counter> for CounterSet {
    type Output = u64;

    fn index(&self, counter: Counter) -> &u64 {
        &self.values[counter as usize]
    }
}

impl IndexMut<Counter> for CounterSet {
    fn index_mut(&mut self, counter: Counter) -> &mut u64 {
        &mut self.values[counter as usize]
    }
}

/// Why a process could not be sampled this poll.
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    /// The process exited between enumeration and read.
    #[error("process {pid} is gone")]
    Gone { pid: u32 },

    #[error("process {pid}: {source}")]
    Read { pid: u32, source: ProcFileError },

    #[error("process {pid}: malformed stat line: {reason}")]
    Malformed { pid: u32, reason: &'static str },
}

impl SampleError {
    /// Expected under process churn; not worth more than a debug line.
    pub fn is_transient(&self) -> bool {
        matches!(self, SampleError::Gone { .. })
    }

    fn from_proc(pid: u32, err: ProcFileError) -> Self {
        if err.is_open_failure() {
            SampleError::Gone { pid }
        } else {
            SampleError::Read { pid, source: err }
        }
    }
}

/// Fields of `/proc/<pid>/stat` skipped between the name and utime.
const STAT_FIELDS_BEFORE_UTIME: usize = 11;

/// Parses the command name and utime + stime from a `/proc/<pid>/stat` line.
///
/// The name is taken between the first `(` and the last `)` since command
/// names may contain both parentheses and spaces.
pub fn parse_stat(pid: u32, line: &str) -> Result<(&str, u64), SampleError> {
    let open = line.find('(').ok_or(SampleError::Malformed {
        pid,
        reason: "no '(' before the command name",
    })?;
    let close = line.rfind(')').ok_or(SampleError::Malformed {
        pid,
        reason: "no ')' after the command name",
    })?;
    if close < open {
        return Err(SampleError::Malformed {
            pid,
            reason: "')' precedes '('",
        });
    }
    let name = &line[open + 1..close];

    let mut fields = line[close + 1..]
        .split_whitespace()
        .skip(STAT_FIELDS_BEFORE_UTIME);
    let mut jiffies = || -> Result<u64, SampleError> {
        fields
            .next()
            .and_then(|f| f.parse::<u64>().ok())
            .ok_or(SampleError::Malformed {
                pid,
                reason: "missing utime/stime",
            })
    };
    let utime = jiffies()?;
    let stime = jiffies()?;
    Ok((name, utime.saturating_add(stime)))
}

/// Sampling state of one monitored process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSample {
    pid: u32,
    name: String,
    totals: CounterSet,
    deltas: CounterSet,
    rss_bytes: u64,
    found: bool,
    initial_sample: bool,
    io_baseline_pending: bool,
}

impl ProcessSample {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            name: String::new(),
            totals: CounterSet::default(),
            deltas: CounterSet::default(),
            rss_bytes: 0,
            found: false,
            initial_sample: true,
            io_baseline_pending: true,
        }
    }

    /// A sample with preset values, as produced after a poll.
    pub fn synthetic(pid: u32, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            found: true,
            initial_sample: false,
            io_baseline_pending: false,
            ..Self::new(pid)
        }
    }

    pub fn with_delta(mut self, counter: Counter, value: u64) -> Self {
        self.deltas[counter] = value;
        self
    }

    pub fn with_total(mut self, counter: Counter, value: u64) -> Self {
        self.totals[counter] = value;
        self
    }

    pub fn with_rss(mut self, bytes: u64) -> Self {
        self.rss_bytes = bytes;
        self
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total(&self, counter: Counter) -> u64 {
        self.totals[counter]
    }

    pub fn delta(&self, counter: Counter) -> u64 {
        self.deltas[counter]
    }

    pub fn totals(&self) -> &CounterSet {
        &self.totals
    }

    pub fn deltas(&self) -> &CounterSet {
        &self.deltas
    }

    pub fn rss_bytes(&self) -> u64 {
        self.rss_bytes
    }

    pub fn is_found(&self) -> bool {
        self.found
    }

    pub fn set_found(&mut self, found: bool) {
        self.found = found;
    }

    pub fn is_initial_sample(&self) -> bool {
        self.initial_sample
    }

    /// Stores `new` as the cumulative value. Delta is the absolute
    /// difference, or zero when `baseline` is set.
    fn advance(&mut self, counter: Counter, new: u64, baseline: bool) {
        let old = self.totals[counter];
        self.deltas[counter] = if baseline { 0 } else { new.abs_diff(old) };
        self.totals[counter] = new;
    }

    /// Refreshes every counter from `proc_path` (`/proc/<pid>`) and `io`.
    pub fn update<C: Connector>(
        &mut self,
        proc_path: &Path,
        io: &mut IoAccounting<C>,
    ) -> Result<(), SampleError> {
        let pid = self.pid;

        let mut stat = ProcFile::new(proc_path.join("stat"));
        stat.refresh().map_err(|e| SampleError::from_proc(pid, e))?;
        let (name, cpu_total) = parse_stat(pid, stat.data())?;
        if self.name.is_empty() {
            self.name = name.to_string();
        }
        self.found = true;
        self.advance(Counter::CpuJiffies, cpu_total, self.initial_sample);

        let mut status = ProcFile::new(proc_path.join("status"));
        match status.refresh() {
            // Kernel threads have no VmRSS line and read as zero
            Ok(()) => self.rss_bytes = status.value_after("VmRSS:") << 10,
            Err(e) => debug!("pid {}: keeping previous RSS: {}", pid, e),
        }

        match io.fetch(pid, proc_path) {
            IoFetch::Data(snapshot) => {
                let baseline = self.io_baseline_pending;
                for counter in Counter::TASKSTATS {
                    self.advance(counter, snapshot.get(counter), baseline);
                }
                self.io_baseline_pending = false;
            }
            IoFetch::NoData => {
                // Partial thread sums are discarded; the next complete one
                // starts a fresh baseline
                for counter in Counter::TASKSTATS {
                    self.deltas[counter] = 0;
                }
                self.io_baseline_pending = true;
            }
            IoFetch::Unavailable => {
                for counter in Counter::TASKSTATS {
                    self.deltas[counter] = 0;
                }
            }
        }

        self.initial_sample = false;
        self.trace();
        Ok(())
    }

    /// Sums `other` into `self`, keeping the first non-empty name and pid.
    pub fn merge(&mut self, other: &ProcessSample) {
        if self.name.is_empty() {
            self.name = other.name.clone();
        }
        self.totals.add(&other.totals);
        self.deltas.add(&other.deltas);
        self.rss_bytes = self.rss_bytes.saturating_add(other.rss_bytes);
    }

    fn trace(&self) {
        trace!(
            pid = self.pid,
            name = %self.name,
            cpu = self.totals[Counter::CpuJiffies],
            cpu_delta = self.deltas[Counter::CpuJiffies],
            rss_bytes = self.rss_bytes,
            read_bytes = self.totals[Counter::ReadBytes],
            read_bytes_delta = self.deltas[Counter::ReadBytes],
            write_bytes = self.totals[Counter::WriteBytes],
            write_bytes_delta = self.deltas[Counter::WriteBytes],
            blkio_delay_ns = self.totals[Counter::BlkioDelay],
            blkio_delay_delta_ns = self.deltas[Counter::BlkioDelay],
            swapin_delay_ns = self.totals[Counter::SwapinDelay],
            swapin_delay_delta_ns = self.deltas[Counter::SwapinDelay],
            cpu_delay_ns = self.totals[Counter::CpuDelay],
            cpu_delay_delta_ns = self.deltas[Counter::CpuDelay],
            found = self.found,
            "process sample"
        );
    }
}
