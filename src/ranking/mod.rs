//! Top-K selection of processes across seven metrics.
//!
//! Each poll the live samples are split into rankable and explicitly
//! included processes, optionally folding same-named processes into one
//! record. Every metric then keeps the `bucket_size` largest values above its
//! threshold. Processes that earn no rank are left out of the report;
//! included processes are always reported with [`SENTINEL_RANK`].

pub mod report;

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use std::time::Instant;
use tracing::debug;

use crate::process::{Counter, ProcessSample};

pub use report::{escape_tag, Report, ReportLine, MEASUREMENT};

/// Rank given to every metric of an explicitly included process.
pub const SENTINEL_RANK: u32 = 99;

pub const DEFAULT_BUCKET_SIZE: usize = 5;

/// Minimum values a process must exceed to be ranked.
#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    /// Percent of one core.
    pub min_cpu_percent: f64,
    pub min_rss_bytes: u64,
    /// Applies to read and write bytes separately.
    pub min_io_bytes_per_sec: u64,
    /// Applies to each delay counter separately.
    pub min_delay_ns_per_sec: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_cpu_percent: 3.0,
            min_rss_bytes: 20_000_000,
            min_io_bytes_per_sec: 5_000_000,
            min_delay_ns_per_sec: 300_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankingSettings {
    pub bucket_size: usize,
    /// Fold processes sharing a name into one record before ranking.
    pub aggregate: bool,
    pub thresholds: Thresholds,
    /// Names reported on every poll regardless of thresholds.
    pub include: HashSet<String>,
}

impl Default for RankingSettings {
    fn default() -> Self {
        Self {
            bucket_size: DEFAULT_BUCKET_SIZE,
            aggregate: false,
            thresholds: Thresholds::default(),
            include: HashSet::new(),
        }
    }
}

/// What one poll interval covered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    /// Jiffies elapsed across all cores.
    pub cpu_jiffies: u64,
    pub cores: u32,
    /// Whole seconds since the previous report, at least 1.
    pub seconds: u64,
}

impl Interval {
    pub fn new(cpu_jiffies: u64, cores: u32, seconds: u64) -> Self {
        Self {
            cpu_jiffies,
            cores: cores.max(1),
            seconds: seconds.max(1),
        }
    }
}

/// One ranked metric.
#[derive(Debug, Clone, Copy)]
pub struct MetricSpec {
    pub rank_label: &'static str,
    pub extract: fn(&ProcessSample) -> u64,
    pub threshold: fn(&Thresholds, &Interval) -> f64,
}

fn io_threshold(t: &Thresholds, i: &Interval) -> f64 {
    t.min_io_bytes_per_sec as f64 * i.seconds as f64
}

fn delay_threshold(t: &Thresholds, i: &Interval) -> f64 {
    t.min_delay_ns_per_sec as f64 * i.seconds as f64
}

pub const METRIC_COUNT: usize = 7;

/// The ranked metrics, in report order.
pub const METRICS: [MetricSpec; METRIC_COUNT] = [
    MetricSpec {
        rank_label: "cpu_usage_topk_rank",
        extract: |s: &ProcessSample| s.delta(Counter::CpuJiffies),
        // Jiffies per core that make up min_cpu_percent of one core
        threshold: |t: &Thresholds, i: &Interval| {
            t.min_cpu_percent * i.cpu_jiffies as f64 / 100.0 / i.cores as f64
        },
    },
    MetricSpec {
        rank_label: "memory_rss_topk_rank",
        extract: |s: &ProcessSample| s.rss_bytes(),
        threshold: |t: &Thresholds, _: &Interval| t.min_rss_bytes as f64,
    },
    MetricSpec {
        rank_label: "read_bytes_topk_rank",
        extract: |s: &ProcessSample| s.delta(Counter::ReadBytes),
        threshold: io_threshold,
    },
    MetricSpec {
        rank_label: "write_bytes_topk_rank",
        extract: |s: &ProcessSample| s.delta(Counter::WriteBytes),
        threshold: io_threshold,
    },
    MetricSpec {
        rank_label: "blkio_delay_topk_rank",
        extract: |s: &ProcessSample| s.delta(Counter::BlkioDelay),
        threshold: delay_threshold,
    },
    MetricSpec {
        rank_label: "swapin_delay_topk_rank",
        extract: |s: &ProcessSample| s.delta(Counter::SwapinDelay),
        threshold: delay_threshold,
    },
    MetricSpec {
        rank_label: "cpu_delay_topk_rank",
        extract: |s: &ProcessSample| s.delta(Counter::CpuDelay),
        threshold: delay_threshold,
    },
];

/// Ranks per metric, indexed like [`METRICS`].
pub type Ranks = [Option<u32>; METRIC_COUNT];

/// A process selected for the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ranked {
    pub sample: ProcessSample,
    pub ranks: Ranks,
}

impl Ranked {
    /// `(label, rank)` for every metric this process was ranked on.
    pub fn earned(&self) -> impl Iterator<Item = (&'static str, u32)> + '_ {
        METRICS
            .iter()
            .zip(self.ranks.iter())
            .filter_map(|(m, r)| r.map(|r| (m.rank_label, r)))
    }
}

/// Processes split by how they are ranked.
#[derive(Debug, Default)]
pub struct Partition {
    pub rankable: Vec<ProcessSample>,
    pub included: Vec<ProcessSample>,
}

/// Splits `samples` into rankable and included records.
///
/// With `aggregate`, processes whose name appears more than once are merged
/// into one record per name that keeps the pid of the first instance.
/// Merged records are appended after the unique ones.
pub fn partition(samples: &[ProcessSample], settings: &RankingSettings) -> Partition {
    let mut duplicates: HashSet<&str> = HashSet::new();
    if settings.aggregate {
        let mut seen: HashSet<&str> = HashSet::new();
        for s in samples {
            if !seen.insert(s.name()) {
                duplicates.insert(s.name());
            }
        }
    }

    let mut out = Partition::default();
    let mut merged: Vec<ProcessSample> = Vec::new();
    let mut merged_index: HashMap<&str, usize> = HashMap::new();

    for s in samples {
        if duplicates.contains(s.name()) {
            match merged_index.get(s.name()) {
                Some(&i) => merged[i].merge(s),
                None => {
                    merged_index.insert(s.name(), merged.len());
                    merged.push(s.clone());
                }
            }
        } else if settings.include.contains(s.name()) {
            out.included.push(s.clone());
        } else {
            out.rankable.push(s.clone());
        }
    }

    for m in merged {
        if settings.include.contains(m.name()) {
            out.included.push(m);
        } else {
            out.rankable.push(m);
        }
    }
    out
}

/// The `bucket_size` largest values of `metric` strictly above `threshold`.
///
/// Ties keep their order in `candidates`.
pub fn top_consumers<'a>(
    candidates: &'a [ProcessSample],
    metric: &MetricSpec,
    threshold: f64,
    bucket_size: usize,
) -> Vec<&'a ProcessSample> {
    let mut sorted: Vec<&ProcessSample> = candidates.iter().collect();
    sorted.sort_by(|a, b| (metric.extract)(b).cmp(&(metric.extract)(a)));
    sorted
        .into_iter()
        .take(bucket_size)
        .take_while(|s| (metric.extract)(s) as f64 > threshold)
        .collect()
}

/// Ranks `samples` for one interval.
///
/// The result is in the order processes first entered the selection:
/// metric by metric, rank by rank, then the included processes.
pub fn rank(samples: &[ProcessSample], settings: &RankingSettings, interval: &Interval) -> Vec<Ranked> {
    let parts = partition(samples, settings);

    let mut selected: Vec<Ranked> = Vec::new();
    let mut by_pid: HashMap<u32, usize> = HashMap::new();

    for (slot, metric) in METRICS.iter().enumerate() {
        let threshold = (metric.threshold)(&settings.thresholds, interval);
        let top = top_consumers(&parts.rankable, metric, threshold, settings.bucket_size);
        debug!(
            metric = metric.rank_label,
            threshold,
            selected = top.len(),
            "top consumers"
        );
        for (i, sample) in top.into_iter().enumerate() {
            let idx = *by_pid.entry(sample.pid()).or_insert_with(|| {
                selected.push(Ranked {
                    sample: sample.clone(),
                    ranks: [None; METRIC_COUNT],
                });
                selected.len() - 1
            });
            selected[idx].ranks[slot] = Some(i as u32 + 1);
        }
    }

    for sample in parts.included {
        let ranks = [Some(SENTINEL_RANK); METRIC_COUNT];
        match by_pid.get(&sample.pid()) {
            Some(&idx) => selected[idx] = Ranked { sample, ranks },
            None => {
                by_pid.insert(sample.pid(), selected.len());
                selected.push(Ranked { sample, ranks });
            }
        }
    }
    selected
}

/// Ranks and renders one report per poll, tracking the time between reports.
#[derive(Debug)]
pub struct RankingEngine {
    settings: RankingSettings,
    cores: u32,
    last_report: Instant,
}

impl RankingEngine {
    pub fn new(settings: RankingSettings, cores: u32) -> Self {
        Self::starting_at(settings, cores, Instant::now())
    }

    pub fn starting_at(settings: RankingSettings, cores: u32, start: Instant) -> Self {
        Self {
            settings,
            cores: cores.max(1),
            last_report: start,
        }
    }

    pub fn settings(&self) -> &RankingSettings {
        &self.settings
    }

    pub fn cores(&self) -> u32 {
        self.cores
    }

    /// Builds the report for `samples` as of now.
    pub fn report(&mut self, samples: &[ProcessSample], cpu_jiffies: u64) -> Report {
        self.report_at(samples, cpu_jiffies, Instant::now())
    }

    /// Builds the report for `samples` as of `now`.
    ///
    /// Rates are divided by the whole seconds since the previous report,
    /// floored at one. Sub-second intervals therefore understate rates.
    pub fn report_at(&mut self, samples: &[ProcessSample], cpu_jiffies: u64, now: Instant) -> Report {
        let seconds = now.saturating_duration_since(self.last_report).as_secs();
        self.last_report = now;

        let interval = Interval::new(cpu_jiffies, self.cores, seconds);
        let ranked = rank(samples, &self.settings, &interval);
        Report::build(&ranked, &interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(pid: u32, name: &str, delta: u64) -> ProcessSample {
        ProcessSample::synthetic(pid, name).with_delta(Counter::CpuJiffies, delta)
    }

    fn no_thresholds() -> RankingSettings {
        RankingSettings {
            thresholds: Thresholds {
                min_cpu_percent: 0.0,
                min_rss_bytes: 0,
                min_io_bytes_per_sec: 0,
                min_delay_ns_per_sec: 0,
            },
            ..RankingSettings::default()
        }
    }

    // -------------------------------------------------------------------------
    // Tests for thresholds
    // -------------------------------------------------------------------------

    #[test]
    fn test_cpu_threshold_normalized_by_budget_and_cores() {
        let t = Thresholds::default();
        let i = Interval::new(1_000_000, 4, 1);
        // 3% of one core out of a 4-core budget of 1e6 jiffies
        assert_eq!((METRICS[0].threshold)(&t, &i), 7500.0);
    }

    #[test]
    fn test_io_thresholds_scale_with_seconds() {
        let t = Thresholds::default();
        let i = Interval::new(100, 1, 10);
        assert_eq!((METRICS[2].threshold)(&t, &i), 50_000_000.0);
        assert_eq!((METRICS[6].threshold)(&t, &i), 3_000_000_000.0);
        // RSS is a level, not a rate
        assert_eq!((METRICS[1].threshold)(&t, &i), 20_000_000.0);
    }

    #[test]
    fn test_interval_floors() {
        let i = Interval::new(10, 0, 0);
        assert_eq!(i.cores, 1);
        assert_eq!(i.seconds, 1);
    }

    // -------------------------------------------------------------------------
    // Tests for top_consumers
    // -------------------------------------------------------------------------

    #[test]
    fn test_top_consumers_takes_k_largest_above_threshold() {
        let samples = vec![
            cpu(1, "a", 10),
            cpu(2, "b", 50),
            cpu(3, "c", 30),
            cpu(4, "d", 5),
            cpu(5, "e", 40),
        ];
        let top = top_consumers(&samples, &METRICS[0], 8.0, 3);
        let pids: Vec<u32> = top.iter().map(|s| s.pid()).collect();
        assert_eq!(pids, vec![2, 5, 3]);

        let top = top_consumers(&samples, &METRICS[0], 30.0, 5);
        let pids: Vec<u32> = top.iter().map(|s| s.pid()).collect();
        // 30 is not strictly above the threshold
        assert_eq!(pids, vec![2, 5]);
    }

    #[test]
    fn test_top_consumers_ties_keep_enumeration_order() {
        let samples = vec![cpu(9, "x", 7), cpu(3, "y", 7), cpu(5, "z", 7), cpu(1, "w", 8)];
        let top = top_consumers(&samples, &METRICS[0], 0.0, 3);
        let pids: Vec<u32> = top.iter().map(|s| s.pid()).collect();
        assert_eq!(pids, vec![1, 9, 3]);
    }

    // -------------------------------------------------------------------------
    // Tests for partition
    // -------------------------------------------------------------------------

    #[test]
    fn test_partition_without_aggregation_keeps_duplicates() {
        let samples = vec![cpu(1, "worker", 1), cpu(2, "worker", 2), cpu(3, "db", 3)];
        let parts = partition(&samples, &RankingSettings::default());
        assert_eq!(parts.rankable.len(), 3);
        assert!(parts.included.is_empty());
    }

    #[test]
    fn test_partition_aggregates_duplicates() {
        let samples = vec![
            cpu(1, "worker", 5).with_rss(10_000_000),
            cpu(2, "db", 3),
            cpu(3, "worker", 7).with_rss(15_000_000),
        ];
        let settings = RankingSettings {
            aggregate: true,
            ..RankingSettings::default()
        };
        let parts = partition(&samples, &settings);

        assert_eq!(parts.rankable.len(), 2);
        assert_eq!(parts.rankable[0].name(), "db");
        let worker = &parts.rankable[1];
        assert_eq!(worker.pid(), 1);
        assert_eq!(worker.rss_bytes(), 25_000_000);
        assert_eq!(worker.delta(Counter::CpuJiffies), 12);
    }

    #[test]
    fn test_partition_routes_included_names() {
        let mut settings = RankingSettings {
            aggregate: true,
            ..RankingSettings::default()
        };
        settings.include.insert("sshd".to_string());
        settings.include.insert("nginx".to_string());

        let samples = vec![
            cpu(1, "sshd", 0),
            cpu(2, "nginx", 0),
            cpu(3, "nginx", 0),
            cpu(4, "cron", 0),
        ];
        let parts = partition(&samples, &settings);
        let included: Vec<(u32, &str)> = parts.included.iter().map(|s| (s.pid(), s.name())).collect();
        assert_eq!(included, vec![(1, "sshd"), (2, "nginx")]);
        assert_eq!(parts.rankable.len(), 1);
    }

    // -------------------------------------------------------------------------
    // Tests for rank
    // -------------------------------------------------------------------------

    #[test]
    fn test_rank_records_per_metric_ranks() {
        let samples = vec![
            cpu(1, "a", 100).with_rss(5),
            cpu(2, "b", 200).with_rss(50),
            cpu(3, "c", 0).with_rss(0),
        ];
        let interval = Interval::new(1000, 1, 1);
        let ranked = rank(&samples, &no_thresholds(), &interval);

        let pids: Vec<u32> = ranked.iter().map(|r| r.sample.pid()).collect();
        assert_eq!(pids, vec![2, 1]);
        assert_eq!(ranked[0].ranks[0], Some(1));
        assert_eq!(ranked[0].ranks[1], Some(1));
        assert_eq!(ranked[1].ranks[0], Some(2));
        assert_eq!(ranked[1].ranks[1], Some(2));
        assert_eq!(ranked[1].ranks[2], None);
    }

    #[test]
    fn test_rank_excludes_processes_below_every_threshold() {
        let samples = vec![cpu(1, "idle", 1).with_rss(1_000)];
        let interval = Interval::new(1_000_000, 4, 1);
        let ranked = rank(&samples, &RankingSettings::default(), &interval);
        assert!(ranked.is_empty());
    }

    #[test]
    fn test_rank_included_get_sentinel_even_when_idle() {
        let mut settings = RankingSettings::default();
        settings.include.insert("sshd".to_string());
        let samples = vec![cpu(1, "sshd", 0), cpu(2, "busy", 900_000)];
        let interval = Interval::new(1_000_000, 1, 1);

        let ranked = rank(&samples, &settings, &interval);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].sample.pid(), 2);
        assert_eq!(ranked[1].sample.pid(), 1);
        assert!(ranked[1].ranks.iter().all(|r| *r == Some(SENTINEL_RANK)));
        assert_eq!(ranked[1].earned().count(), METRIC_COUNT);
    }

    #[test]
    fn test_rank_bucket_size_limits_each_metric() {
        let samples: Vec<ProcessSample> = (1..=10).map(|p| cpu(p, "p", p as u64 * 10)).collect();
        let settings = RankingSettings {
            bucket_size: 2,
            ..no_thresholds()
        };
        let ranked = rank(&samples, &settings, &Interval::new(1000, 1, 1));
        let pids: Vec<u32> = ranked.iter().map(|r| r.sample.pid()).collect();
        assert_eq!(pids, vec![10, 9]);
    }
}
