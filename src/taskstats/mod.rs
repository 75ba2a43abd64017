//! Per-task I/O and delay accounting over the kernel's taskstats interface.

pub mod client;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{
    ClientState, Connector, NetlinkConnector, NetlinkSocket, QueryOutcome, TaskstatsClient,
    TaskstatsError, Transport, MAX_SEND_FAILURES,
};
pub use wire::{Taskstats, WireError};
