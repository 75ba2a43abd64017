//! The table of monitored processes, keyed by pid.

use ahash::AHashMap as HashMap;
use tracing::{debug, warn};

use crate::process::io::IoAccounting;
use crate::process::sample::ProcessSample;
use crate::process::scanner::ProcEntry;
use crate::taskstats::Connector;

/// Counters describing one pass over the proc root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub scanned: usize,
    pub added: usize,
    pub updated: usize,
    /// Exited between enumeration and read.
    pub gone: usize,
    /// Unreadable or malformed.
    pub failed: usize,
    pub evicted: usize,
}

#[derive(Debug, Default)]
pub struct ProcessTable {
    entries: HashMap<u32, ProcessSample>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessSample> {
        self.entries.get(&pid)
    }

    /// Clears every `found` flag ahead of a new scan.
    pub fn begin_poll(&mut self) {
        for sample in self.entries.values_mut() {
            sample.set_found(false);
        }
    }

    /// Updates the known processes in `procs` and adds the new ones, then
    /// evicts every process not seen in this pass.
    pub fn refresh<C: Connector>(
        &mut self,
        procs: &[ProcEntry],
        io: &mut IoAccounting<C>,
    ) -> ScanStats {
        self.begin_poll();

        let mut stats = ScanStats {
            scanned: procs.len(),
            ..ScanStats::default()
        };
        for entry in procs {
            let existing = self.entries.contains_key(&entry.pid);
            let sample = self
                .entries
                .entry(entry.pid)
                .or_insert_with(|| ProcessSample::new(entry.pid));

            match sample.update(&entry.proc_path, io) {
                Ok(()) if existing => stats.updated += 1,
                Ok(()) => stats.added += 1,
                Err(e) if e.is_transient() => {
                    debug!("{}", e);
                    stats.gone += 1;
                }
                Err(e) => {
                    warn!("{}", e);
                    stats.failed += 1;
                }
            }
        }

        stats.evicted = self.evict_missing();
        stats
    }

    /// Drops every entry whose `found` flag is still false.
    pub fn evict_missing(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, sample| sample.is_found());
        before - self.entries.len()
    }

    /// Live samples in pid order.
    pub fn snapshot(&self) -> Vec<ProcessSample> {
        let mut out: Vec<ProcessSample> = self
            .entries
            .values()
            .filter(|s| s.is_found())
            .cloned()
            .collect();
        out.sort_by_key(|s| s.pid());
        out
    }
}
