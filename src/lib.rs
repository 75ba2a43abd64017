//! procstat-topk library
//!
//! Samples per-process CPU jiffies, resident memory, block I/O bytes and
//! scheduling/I/O delays on Linux and ranks the top consumers of each into a
//! line-protocol report.
//!
//! # Components
//!
//! - [`procfile`]: rewindable reader for small proc files
//! - [`system`]: `/proc/stat` CPU jiffie budget per interval
//! - [`taskstats`]: generic netlink client for per-thread taskstats
//! - [`process`]: per-process samples and the process table
//! - [`ranking`]: top-K selection, aggregation and rendering
//! - [`collector`]: the context owning all of the above
//!
//! # Usage
//!
//! ```no_run
//! use procstat_topk::collector::{Collector, CollectorSettings};
//!
//! let mut collector = Collector::open(CollectorSettings::default())?;
//! // The first poll primes the CPU baselines
//! collector.poll()?;
//! if let Some(report) = collector.poll()?.report {
//!     print!("{}", report);
//! }
//! # Ok::<(), procstat_topk::collector::CollectorError>(())
//! ```

#[cfg(not(target_os = "linux"))]
compile_error!("procstat-topk reads /proc and taskstats and only builds for Linux");

pub mod collector;
pub mod process;
pub mod procfile;
pub mod ranking;
pub mod system;
pub mod taskstats;

pub use collector::{Collector, CollectorError, CollectorSettings, PollOutcome};
pub use ranking::{RankingSettings, Report, Thresholds};
