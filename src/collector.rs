//! The long-lived collector context.
//!
//! A [`Collector`] owns every piece of state that survives between polls:
//! the process table, the CPU sampler, the taskstats accounting and the
//! ranking engine. Each [`Collector::poll`] is one sequential
//! scan, sample, rank pass.

use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::process::{collect_proc_entries, IoAccounting, ProcessTable, ScanStats};
use crate::ranking::{RankingEngine, RankingSettings, Report};
use crate::system::{online_cores, CpuSource, CpuStatError, CpuUsageSampler};
use crate::taskstats::{Connector, NetlinkConnector};

pub const DEFAULT_PROC_ROOT: &str = "/proc";

#[derive(Debug, Clone, PartialEq)]
pub struct CollectorSettings {
    pub proc_root: PathBuf,
    pub cpu_source: CpuSource,
    pub enable_taskstats: bool,
    pub ranking: RankingSettings,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from(DEFAULT_PROC_ROOT),
            cpu_source: CpuSource::Total,
            enable_taskstats: true,
            ranking: RankingSettings::default(),
        }
    }
}

/// Conditions that stop the collector.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("failed to enumerate {path}: {source}")]
    Enumerate { path: PathBuf, source: io::Error },

    #[error("{0}")]
    Cores(String),
}

/// Result of one poll.
#[derive(Debug)]
pub struct PollOutcome {
    /// `None` while CPU baselines are being primed or `/proc/stat` failed.
    pub report: Option<Report>,
    pub stats: ScanStats,
    pub duration: Duration,
}

pub struct Collector<C: Connector> {
    proc_root: PathBuf,
    table: ProcessTable,
    cpu: CpuUsageSampler,
    io: IoAccounting<C>,
    engine: RankingEngine,
}

impl Collector<NetlinkConnector> {
    /// A collector on the kernel's netlink socket, sized for the online cores.
    pub fn open(settings: CollectorSettings) -> Result<Self, CollectorError> {
        let cores = online_cores().map_err(CollectorError::Cores)?;
        Ok(Self::new(settings, NetlinkConnector, cores))
    }
}

impl<C: Connector> Collector<C> {
    pub fn new(settings: CollectorSettings, connector: C, cores: u32) -> Self {
        let io = if settings.enable_taskstats {
            IoAccounting::new(connector)
        } else {
            info!("taskstats disabled: I/O and delay metrics will read zero");
            IoAccounting::disabled(connector)
        };
        Self {
            cpu: CpuUsageSampler::new(settings.proc_root.join("stat"), settings.cpu_source),
            table: ProcessTable::new(),
            io,
            engine: RankingEngine::new(settings.ranking, cores),
            proc_root: settings.proc_root,
        }
    }

    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    pub fn io(&self) -> &IoAccounting<C> {
        &self.io
    }

    pub fn engine(&self) -> &RankingEngine {
        &self.engine
    }

    /// Scans the proc root, samples CPU and, once baselines exist, ranks.
    ///
    /// Failing to enumerate the proc root is fatal. A failed CPU sample only
    /// skips this poll's report.
    #[instrument(skip(self), fields(proc_root = %self.proc_root.display()))]
    pub fn poll(&mut self) -> Result<PollOutcome, CollectorError> {
        let start = Instant::now();

        let procs = collect_proc_entries(&self.proc_root).map_err(|source| {
            CollectorError::Enumerate {
                path: self.proc_root.clone(),
                source,
            }
        })?;
        let stats = self.table.refresh(&procs, &mut self.io);

        let report = match self.cpu.sample().and_then(|_| self.cpu.total_delta()) {
            Ok(jiffies) => {
                let samples = self.table.snapshot();
                Some(self.engine.report(&samples, jiffies))
            }
            Err(CpuStatError::NoBaseline) => {
                debug!("CPU baseline primed, no report this poll");
                None
            }
            Err(e) => {
                warn!("CPU sample failed, skipping report: {}", e);
                None
            }
        };

        let duration = start.elapsed();
        debug!(
            "Poll completed in {:?}: {} scanned, {} new, {} gone, {} evicted, {} lines",
            duration,
            stats.scanned,
            stats.added,
            stats.gone,
            stats.evicted,
            report.as_ref().map_or(0, |r| r.len())
        );
        Ok(PollOutcome {
            report,
            stats,
            duration,
        })
    }
}
