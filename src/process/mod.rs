//! Per-process sampling.
//!
//! - `scanner`: PID and thread discovery
//! - `sample`: per-process counters from `/proc/<pid>/{stat,status}`
//! - `io`: per-process taskstats sums and the netlink recovery policy
//! - `table`: the pid-keyed table of monitored processes

pub mod io;
pub mod sample;
pub mod scanner;
pub mod table;

pub use io::{IoAccounting, IoFetch, TaskstatsSnapshot};
pub use sample::{Counter, CounterSet, ProcessSample, SampleError};
pub use scanner::{collect_proc_entries, read_thread_ids, ProcEntry};
pub use table::{ProcessTable, ScanStats};
