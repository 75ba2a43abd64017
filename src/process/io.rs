//! Per-process taskstats accounting.
//!
//! Sums the per-thread taskstats of a process and owns the recovery policy
//! of the shared netlink client: one reconnect after a critical failure,
//! then taskstats stays off for the rest of the run.

use std::path::Path;
use tracing::{debug, error, info, warn};

use crate::process::sample::{Counter, CounterSet};
use crate::process::scanner::read_thread_ids;
use crate::taskstats::{Connector, QueryOutcome, Taskstats, TaskstatsClient};

/// Taskstats fields summed per process, with the counter each feeds.
pub const TASKSTATS_FIELDS: [(Counter, fn(&Taskstats) -> u64); 5] = [
    (Counter::ReadBytes, |ts: &Taskstats| ts.read_bytes),
    (Counter::WriteBytes, |ts: &Taskstats| ts.write_bytes),
    (Counter::BlkioDelay, |ts: &Taskstats| ts.blkio_delay_total),
    (Counter::SwapinDelay, |ts: &Taskstats| ts.swapin_delay_total),
    (Counter::CpuDelay, |ts: &Taskstats| ts.cpu_delay_total),
];

/// Taskstats of every thread of one process, summed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskstatsSnapshot {
    counters: CounterSet,
}

impl TaskstatsSnapshot {
    pub fn accumulate(&mut self, ts: &Taskstats) {
        for (counter, read) in TASKSTATS_FIELDS {
            self.counters[counter] = self.counters[counter].saturating_add(read(ts));
        }
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter]
    }

    pub fn read_bytes(&self) -> u64 {
        self.get(Counter::ReadBytes)
    }

    pub fn write_bytes(&self) -> u64 {
        self.get(Counter::WriteBytes)
    }
}

/// Result of fetching one process's taskstats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoFetch {
    Data(TaskstatsSnapshot),
    /// A thread vanished or the kernel had nothing this round.
    NoData,
    /// Taskstats is disabled.
    Unavailable,
}

enum ThreadSum {
    Complete(TaskstatsSnapshot),
    Incomplete,
    Critical,
}

/// Owner of the taskstats client for the whole collector.
pub struct IoAccounting<C: Connector> {
    client: TaskstatsClient<C>,
    disabled: bool,
}

impl<C: Connector> IoAccounting<C> {
    /// Accounting that connects lazily on first use.
    pub fn new(connector: C) -> Self {
        Self {
            client: TaskstatsClient::new(connector),
            disabled: false,
        }
    }

    /// Accounting that never opens a socket.
    pub fn disabled(connector: C) -> Self {
        Self {
            client: TaskstatsClient::new(connector),
            disabled: true,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn client(&self) -> &TaskstatsClient<C> {
        &self.client
    }

    fn disable(&mut self, reason: &str) {
        self.disabled = true;
        self.client.teardown();
        error!("{}. I/O metrics will be excluded", reason);
    }

    /// Sums the taskstats of every thread of `pid`.
    pub fn fetch(&mut self, pid: u32, proc_path: &Path) -> IoFetch {
        if self.disabled {
            return IoFetch::Unavailable;
        }
        if !self.client.is_bound() {
            match self.client.init() {
                Ok(id) => info!("taskstats netlink connection established (family {})", id),
                Err(e) => {
                    self.disable(&format!("Taskstats unavailable: {}", e));
                    return IoFetch::Unavailable;
                }
            }
        }

        match self.sum_threads(pid, proc_path) {
            ThreadSum::Complete(snapshot) => IoFetch::Data(snapshot),
            ThreadSum::Incomplete => IoFetch::NoData,
            ThreadSum::Critical => {
                warn!("Taskstats fetch failed. Re-establishing the netlink connection");
                if let Err(e) = self.client.init() {
                    self.disable(&format!("Taskstats reconnect failed: {}", e));
                    return IoFetch::Unavailable;
                }
                match self.sum_threads(pid, proc_path) {
                    ThreadSum::Complete(snapshot) => IoFetch::Data(snapshot),
                    ThreadSum::Incomplete => IoFetch::NoData,
                    ThreadSum::Critical => {
                        self.disable("Second taskstats attempt after reconnect failed");
                        IoFetch::Unavailable
                    }
                }
            }
        }
    }

    fn sum_threads(&mut self, pid: u32, proc_path: &Path) -> ThreadSum {
        let tids = match read_thread_ids(proc_path) {
            Ok(tids) if !tids.is_empty() => tids,
            Ok(_) => return ThreadSum::Incomplete,
            Err(e) => {
                debug!("pid {}: cannot list threads: {}", pid, e);
                return ThreadSum::Incomplete;
            }
        };

        let mut snapshot = TaskstatsSnapshot::default();
        for tid in tids {
            match self.client.query(tid) {
                QueryOutcome::Success(ts) => snapshot.accumulate(&ts),
                QueryOutcome::Fail => return ThreadSum::Incomplete,
                QueryOutcome::CriticalFail => return ThreadSum::Critical,
            }
        }
        ThreadSum::Complete(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taskstats::testing::FakeKernel;
    use std::fs;
    use tempfile::tempdir;

    fn proc_with_threads(tids: &[u32]) -> tempfile::TempDir {
        let dir = tempdir().expect("Failed to create temp dir");
        for tid in tids {
            fs::create_dir_all(dir.path().join("task").join(tid.to_string()))
                .expect("Failed to create task dir");
        }
        dir
    }

    fn stats(read: u64, write: u64, cpu_delay: u64) -> Taskstats {
        Taskstats {
            read_bytes: read,
            write_bytes: write,
            cpu_delay_total: cpu_delay,
            ..Default::default()
        }
    }

    #[test]
    fn test_fetch_sums_threads() {
        let dir = proc_with_threads(&[10, 11, 12]);
        let (kernel, handle) = FakeKernel::new(0x1c);
        handle.set_thread(10, stats(100, 1, 5));
        handle.set_thread(11, stats(200, 2, 5));
        handle.set_thread(12, stats(300, 3, 5));
        let mut io = IoAccounting::new(kernel);

        match io.fetch(10, dir.path()) {
            IoFetch::Data(s) => {
                assert_eq!(s.read_bytes(), 600);
                assert_eq!(s.write_bytes(), 6);
                assert_eq!(s.get(Counter::CpuDelay), 15);
                assert_eq!(s.get(Counter::BlkioDelay), 0);
            }
            other => panic!("unexpected fetch {:?}", other),
        }
        assert_eq!(handle.connects(), 1);
        assert_eq!(handle.queries(), 3);
    }

    #[test]
    fn test_fetch_stops_at_vanished_thread() {
        let dir = proc_with_threads(&[10, 11, 12]);
        let (kernel, handle) = FakeKernel::new(0x1c);
        handle.set_thread(10, stats(100, 0, 0));
        handle.set_thread(12, stats(100, 0, 0));
        let mut io = IoAccounting::new(kernel);

        assert_eq!(io.fetch(10, dir.path()), IoFetch::NoData);
        // Enumeration stopped at tid 11
        assert_eq!(handle.queries(), 2);
        assert!(!io.is_disabled());
    }

    #[test]
    fn test_initial_init_failure_disables() {
        let dir = proc_with_threads(&[1]);
        let (kernel, handle) = FakeKernel::new(0x1c);
        handle.set_family_available(false);
        let mut io = IoAccounting::new(kernel);

        assert_eq!(io.fetch(1, dir.path()), IoFetch::Unavailable);
        assert!(io.is_disabled());

        handle.set_family_available(true);
        assert_eq!(io.fetch(1, dir.path()), IoFetch::Unavailable);
        assert_eq!(handle.connects(), 1);
    }

    #[test]
    fn test_critical_failure_reconnects_once() {
        let dir = proc_with_threads(&[1]);
        let (kernel, handle) = FakeKernel::new(0x1c);
        handle.set_thread(1, stats(42, 0, 0));
        let mut io = IoAccounting::new(kernel);
        assert!(matches!(io.fetch(1, dir.path()), IoFetch::Data(_)));

        // Stats replies stay malformed, so the retry after reconnecting fails too
        handle.set_truncate_replies(true);
        assert_eq!(io.fetch(1, dir.path()), IoFetch::Unavailable);
        assert_eq!(handle.connects(), 2);
        assert!(io.is_disabled());

        handle.set_truncate_replies(false);
        assert_eq!(io.fetch(1, dir.path()), IoFetch::Unavailable);
        assert_eq!(handle.connects(), 2);
    }

    #[test]
    fn test_reconnect_failure_disables_permanently() {
        let dir = proc_with_threads(&[1]);
        let (kernel, handle) = FakeKernel::new(0x1c);
        handle.set_thread(1, stats(42, 0, 0));
        let mut io = IoAccounting::new(kernel);
        assert!(matches!(io.fetch(1, dir.path()), IoFetch::Data(_)));

        handle.set_recv_fails(true);
        handle.set_connect_fails(true);
        assert_eq!(io.fetch(1, dir.path()), IoFetch::Unavailable);
        assert!(io.is_disabled());

        handle.set_recv_fails(false);
        handle.set_connect_fails(false);
        assert_eq!(io.fetch(1, dir.path()), IoFetch::Unavailable);
        assert_eq!(handle.connects(), 2);
    }

    #[test]
    fn test_send_failures_escalate_to_disable() {
        let dir = proc_with_threads(&[1]);
        let (kernel, handle) = FakeKernel::new(0x1c);
        handle.set_thread(1, stats(42, 0, 0));
        let mut io = IoAccounting::new(kernel);
        assert!(matches!(io.fetch(1, dir.path()), IoFetch::Data(_)));

        handle.set_send_fails(true);
        for _ in 0..crate::taskstats::MAX_SEND_FAILURES {
            assert_eq!(io.fetch(1, dir.path()), IoFetch::NoData);
            assert!(!io.is_disabled());
        }
        // The sixth failure escalates and the reconnect cannot send either
        assert_eq!(io.fetch(1, dir.path()), IoFetch::Unavailable);
        assert_eq!(handle.connects(), 2);
        assert!(io.is_disabled());
    }

    #[test]
    fn test_empty_task_dir_is_no_data() {
        let dir = proc_with_threads(&[]);
        fs::create_dir_all(dir.path().join("task")).expect("Failed to create task dir");
        let (kernel, handle) = FakeKernel::new(0x1c);
        let mut io = IoAccounting::new(kernel);

        assert_eq!(io.fetch(1, dir.path()), IoFetch::NoData);
        assert_eq!(handle.queries(), 0);
    }
}
