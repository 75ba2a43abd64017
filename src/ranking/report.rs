//! Line-protocol rendering of a ranked poll.

use ahash::AHashMap as HashMap;
use std::fmt;
use std::io::{self, Write};

use super::{Interval, Ranked};
use crate::process::Counter;

/// Measurement name of every line.
pub const MEASUREMENT: &str = "procstat";

const NS_PER_MS: u64 = 1_000_000;

/// Escapes a tag value: space, comma and equals sign get a backslash.
pub fn escape_tag(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ' ' | ',' | '=') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Assigns `name`, `name_1`, `name_2`, ... to distinct pids sharing a name.
#[derive(Debug, Default)]
struct NameIndexer {
    seen: HashMap<String, Vec<u32>>,
}

impl NameIndexer {
    fn display_name(&mut self, name: &str, pid: u32) -> String {
        let pids = self.seen.entry(name.to_string()).or_default();
        let index = match pids.iter().position(|&p| p == pid) {
            Some(i) => i,
            None => {
                pids.push(pid);
                pids.len() - 1
            }
        };
        if index == 0 {
            name.to_string()
        } else {
            format!("{}_{}", name, index)
        }
    }
}

/// One reported process.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportLine {
    pub pid: u32,
    pub process_name: String,
    /// Percent of one core.
    pub cpu_usage: f64,
    pub memory_rss: u64,
    /// Bytes per second.
    pub read_bytes: u64,
    pub write_bytes: u64,
    /// Milliseconds per second.
    pub cpu_delay: u64,
    pub blkio_delay: u64,
    pub swapin_delay: u64,
    pub ranks: Vec<(&'static str, u32)>,
}

impl ReportLine {
    pub fn rank(&self, label: &str) -> Option<u32> {
        self.ranks.iter().find(|(l, _)| *l == label).map(|(_, r)| *r)
    }
}

impl fmt::Display for ReportLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},process_name={} cpu_usage={:.2},memory_rss={}i,read_bytes={}i,write_bytes={}i,cpu_delay={}i,blkio_delay={}i,swapin_delay={}i",
            MEASUREMENT,
            escape_tag(&self.process_name),
            self.cpu_usage,
            self.memory_rss,
            self.read_bytes,
            self.write_bytes,
            self.cpu_delay,
            self.blkio_delay,
            self.swapin_delay,
        )?;
        for (label, rank) in &self.ranks {
            write!(f, ",{}={}i", label, rank)?;
        }
        Ok(())
    }
}

/// The lines of one poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    lines: Vec<ReportLine>,
}

impl Report {
    /// Converts ranked processes into per-second report lines.
    pub fn build(ranked: &[Ranked], interval: &Interval) -> Self {
        let mut names = NameIndexer::default();
        let seconds = interval.seconds.max(1);
        let jiffies = interval.cpu_jiffies.max(1) as f64;

        let lines = ranked
            .iter()
            .map(|r| {
                let s = &r.sample;
                let delay = |c: Counter| s.delta(c) / NS_PER_MS / seconds;
                ReportLine {
                    pid: s.pid(),
                    process_name: names.display_name(s.name(), s.pid()),
                    cpu_usage: 100.0 * interval.cores as f64 * s.delta(Counter::CpuJiffies) as f64
                        / jiffies,
                    memory_rss: s.rss_bytes(),
                    read_bytes: s.delta(Counter::ReadBytes) / seconds,
                    write_bytes: s.delta(Counter::WriteBytes) / seconds,
                    cpu_delay: delay(Counter::CpuDelay),
                    blkio_delay: delay(Counter::BlkioDelay),
                    swapin_delay: delay(Counter::SwapinDelay),
                    ranks: r.earned().collect(),
                }
            })
            .collect();
        Self { lines }
    }

    pub fn lines(&self) -> &[ReportLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Writes every line, newline-terminated.
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for line in &self.lines {
            writeln!(out, "{}", line)?;
        }
        Ok(())
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessSample;
    use crate::ranking::{METRIC_COUNT, SENTINEL_RANK};

    fn ranked(sample: ProcessSample, ranks: &[(usize, u32)]) -> Ranked {
        let mut r = [None; METRIC_COUNT];
        for (slot, rank) in ranks {
            r[*slot] = Some(*rank);
        }
        Ranked { sample, ranks: r }
    }

    #[test]
    fn test_escape_tag() {
        assert_eq!(escape_tag("bash"), "bash");
        assert_eq!(escape_tag("Web Content"), "Web\\ Content");
        assert_eq!(escape_tag("a,b=c"), "a\\,b\\=c");
    }

    #[test]
    fn test_cpu_usage_scaled_by_cores() {
        let sample = ProcessSample::synthetic(1, "p").with_delta(Counter::CpuJiffies, 15_000);
        let report = Report::build(&[ranked(sample, &[(0, 1)])], &Interval::new(1_000_000, 4, 1));
        assert!((report.lines()[0].cpu_usage - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_rates_divided_by_seconds() {
        let sample = ProcessSample::synthetic(1, "p")
            .with_delta(Counter::ReadBytes, 10_000_000)
            .with_delta(Counter::WriteBytes, 999)
            .with_delta(Counter::BlkioDelay, 4_000_000_000)
            .with_delta(Counter::CpuDelay, 1_999_999);
        let report = Report::build(&[ranked(sample, &[(2, 1)])], &Interval::new(100, 1, 2));
        let line = &report.lines()[0];
        assert_eq!(line.read_bytes, 5_000_000);
        assert_eq!(line.write_bytes, 499);
        assert_eq!(line.blkio_delay, 2000);
        // Integer division: 1 ms over 2 s
        assert_eq!(line.cpu_delay, 0);
    }

    #[test]
    fn test_sub_second_interval_is_floored_to_one_second() {
        // Known boundary: a 0.2 s interval reports the raw delta as a per-second rate
        let sample = ProcessSample::synthetic(1, "p").with_delta(Counter::ReadBytes, 1_000_000);
        let report = Report::build(&[ranked(sample, &[(2, 1)])], &Interval::new(100, 1, 0));
        assert_eq!(report.lines()[0].read_bytes, 1_000_000);
    }

    #[test]
    fn test_duplicate_names_disambiguated_in_order() {
        let rows: Vec<Ranked> = [30, 10, 20]
            .iter()
            .map(|&pid| ranked(ProcessSample::synthetic(pid, "worker"), &[(0, 1)]))
            .collect();
        let report = Report::build(&rows, &Interval::new(100, 1, 1));
        let names: Vec<&str> = report.lines().iter().map(|l| l.process_name.as_str()).collect();
        assert_eq!(names, vec!["worker", "worker_1", "worker_2"]);
    }

    #[test]
    fn test_render_line() {
        let sample = ProcessSample::synthetic(7, "my app")
            .with_delta(Counter::CpuJiffies, 15_000)
            .with_rss(123_456)
            .with_delta(Counter::ReadBytes, 2048);
        let report = Report::build(
            &[ranked(sample, &[(0, 1), (2, 3)])],
            &Interval::new(1_000_000, 4, 1),
        );
        assert_eq!(
            report.to_string(),
            "procstat,process_name=my\\ app cpu_usage=6.00,memory_rss=123456i,read_bytes=2048i,write_bytes=0i,cpu_delay=0i,blkio_delay=0i,swapin_delay=0i,cpu_usage_topk_rank=1i,read_bytes_topk_rank=3i\n"
        );
    }

    #[test]
    fn test_render_sentinel_ranks_in_metric_order() {
        let all: Vec<(usize, u32)> = (0..METRIC_COUNT).map(|i| (i, SENTINEL_RANK)).collect();
        let report = Report::build(
            &[ranked(ProcessSample::synthetic(1, "sshd"), &all)],
            &Interval::new(100, 1, 1),
        );
        let line = report.to_string();
        assert!(line.ends_with(
            ",cpu_usage_topk_rank=99i,memory_rss_topk_rank=99i,read_bytes_topk_rank=99i,write_bytes_topk_rank=99i,blkio_delay_topk_rank=99i,swapin_delay_topk_rank=99i,cpu_delay_topk_rank=99i\n"
        ));
        assert_eq!(report.lines()[0].rank("memory_rss_topk_rank"), Some(99));
    }

    #[test]
    fn test_write_to_matches_display() {
        let rows = vec![
            ranked(ProcessSample::synthetic(1, "a"), &[(1, 1)]),
            ranked(ProcessSample::synthetic(2, "b"), &[(1, 2)]),
        ];
        let report = Report::build(&rows, &Interval::new(100, 1, 1));
        let mut buf = Vec::new();
        report.write_to(&mut buf).expect("write");
        assert_eq!(String::from_utf8(buf).expect("utf8"), report.to_string());
        assert_eq!(report.len(), 2);
    }
}
