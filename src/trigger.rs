//! Poll triggers.
//!
//! SIGUSR1, SIGTERM and SIGINT are blocked on the calling thread and consumed
//! synchronously at the loop boundary, so a poll is never interrupted
//! half-way. Without an interval only SIGUSR1 triggers a poll; with one, the
//! wait also times out into a poll.

use nix::errno::Errno;
use nix::sys::signal::{SigSet, Signal};
use std::time::Duration;
use tracing::debug;

/// What the main loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Poll,
    Stop(Signal),
}

impl Trigger {
    fn from_signal(signal: Signal) -> Self {
        match signal {
            Signal::SIGUSR1 => Trigger::Poll,
            other => Trigger::Stop(other),
        }
    }
}

pub struct SignalTrigger {
    set: SigSet,
    interval: Option<Duration>,
}

impl SignalTrigger {
    /// Blocks the trigger signals on the current thread.
    ///
    /// Must run before any other thread is spawned so that the mask is
    /// inherited and the signals stay pending for [`SignalTrigger::next`].
    pub fn install(interval: Option<Duration>) -> nix::Result<Self> {
        let mut set = SigSet::empty();
        set.add(Signal::SIGUSR1);
        set.add(Signal::SIGTERM);
        set.add(Signal::SIGINT);
        set.thread_block()?;
        Ok(Self { set, interval })
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Waits for the next trigger.
    pub fn next(&self) -> nix::Result<Trigger> {
        match self.interval {
            None => self.set.wait().map(Trigger::from_signal),
            Some(timeout) => self.timed_wait(timeout),
        }
    }

    fn timed_wait(&self, timeout: Duration) -> nix::Result<Trigger> {
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        loop {
            // SAFETY: the set and timespec outlive the call and siginfo may be null.
            let rc = unsafe { libc::sigtimedwait(self.set.as_ref(), std::ptr::null_mut(), &ts) };
            if rc >= 0 {
                return Signal::try_from(rc).map(Trigger::from_signal);
            }
            match Errno::last() {
                Errno::EAGAIN => {
                    debug!("Interval of {:?} elapsed", timeout);
                    return Ok(Trigger::Poll);
                }
                Errno::EINTR => continue,
                e => return Err(e),
            }
        }
    }
}
