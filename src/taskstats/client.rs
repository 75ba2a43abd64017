//! Taskstats session over generic netlink.
//!
//! The client is generic over a [`Connector`] so the socket can be swapped
//! for an in-memory kernel in tests. [`NetlinkConnector`] opens the real
//! `AF_NETLINK`/`NETLINK_GENERIC` socket.
//!
//! `recv` blocks without a timeout: a taskstats subsystem that never answers
//! stalls the poll that asked.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tracing::{debug, error, trace, warn};

use super::wire::{self, FamilyReply, StatsReply, Taskstats, WireError};

/// Consecutive send failures tolerated before the socket is torn down.
pub const MAX_SEND_FAILURES: u32 = 5;

/// Receive buffer size; a taskstats reply is well under 1 KiB.
pub const RECV_BUFFER_SIZE: usize = 4096;

/// Errors raised while setting up or talking to the netlink socket.
#[derive(Debug, thiserror::Error)]
pub enum TaskstatsError {
    #[error("failed to create netlink socket: {0}")]
    Socket(#[source] io::Error),

    #[error("failed to bind netlink socket: {0}")]
    Bind(#[source] io::Error),

    #[error("netlink send failed: {0}")]
    Send(#[source] io::Error),

    #[error("netlink receive failed: {0}")]
    Recv(#[source] io::Error),

    #[error("could not resolve the TASKSTATS family id: {0}")]
    FamilyUnresolved(String),

    #[error("malformed netlink reply: {0}")]
    Wire(#[from] WireError),
}

/// A connected, bound netlink endpoint.
pub trait Transport {
    /// Sends one complete frame.
    fn send(&mut self, frame: &[u8]) -> io::Result<usize>;

    /// Receives one frame into `buf`, returning its length.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Produces fresh transports; called on every `init()`.
pub trait Connector {
    type Transport: Transport;

    fn connect(&mut self) -> Result<Self::Transport, TaskstatsError>;
}

/// Lifecycle of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Uninitialized,
    Bound,
    Failed,
}

/// Result of a per-thread query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    Success(Taskstats),
    /// No data this round (thread exited, transient send error).
    Fail,
    /// The socket is unusable; the caller should re-`init()` once.
    CriticalFail,
}

/// Generic netlink taskstats client.
pub struct TaskstatsClient<C: Connector> {
    connector: C,
    transport: Option<C::Transport>,
    family_id: u16,
    state: ClientState,
    send_failures: u32,
    seq: u32,
    tx: Vec<u8>,
    rx: Vec<u8>,
}

impl<C: Connector> TaskstatsClient<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            transport: None,
            family_id: 0,
            state: ClientState::Uninitialized,
            send_failures: 0,
            seq: 0,
            tx: Vec::with_capacity(64),
            rx: vec![0u8; RECV_BUFFER_SIZE],
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn family_id(&self) -> Option<u16> {
        match self.state {
            ClientState::Bound => Some(self.family_id),
            _ => None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.state == ClientState::Bound
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Opens a new socket and resolves the taskstats family id.
    ///
    /// Any previous socket is closed first. On failure the client is
    /// `Failed` until the next successful `init()`.
    pub fn init(&mut self) -> Result<u16, TaskstatsError> {
        self.teardown();
        match self.connect_and_resolve() {
            Ok((transport, family_id)) => {
                debug!("taskstats family id resolved to {}", family_id);
                self.transport = Some(transport);
                self.family_id = family_id;
                self.send_failures = 0;
                self.state = ClientState::Bound;
                Ok(family_id)
            }
            Err(e) => {
                self.state = ClientState::Failed;
                Err(e)
            }
        }
    }

    fn connect_and_resolve(&mut self) -> Result<(C::Transport, u16), TaskstatsError> {
        let mut transport = self.connector.connect()?;

        self.seq = self.seq.wrapping_add(1);
        wire::encode_family_request(&mut self.tx, self.seq);
        send_frame(&mut transport, &self.tx).map_err(TaskstatsError::Send)?;

        let len = transport.recv(&mut self.rx).map_err(TaskstatsError::Recv)?;
        if len == 0 {
            return Err(TaskstatsError::Recv(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "empty family reply",
            )));
        }

        match wire::parse_family_reply(&self.rx[..len])? {
            FamilyReply::Id(0) => Err(TaskstatsError::FamilyUnresolved(
                "controller returned family id 0".to_string(),
            )),
            FamilyReply::Id(id) => Ok((transport, id)),
            FamilyReply::Error(code) => Err(TaskstatsError::FamilyUnresolved(format!(
                "controller error {}",
                io::Error::from_raw_os_error(-code)
            ))),
            FamilyReply::Missing => Err(TaskstatsError::FamilyUnresolved(
                "no family id attribute in controller reply".to_string(),
            )),
        }
    }

    /// Closes the socket. The client must be re-`init()`ed before use.
    pub fn teardown(&mut self) {
        if self.transport.take().is_some() {
            debug!("taskstats socket closed");
        }
        if self.state == ClientState::Bound {
            self.state = ClientState::Uninitialized;
        }
        self.family_id = 0;
    }

    /// Requests the statistics of one thread.
    pub fn query(&mut self, tid: u32) -> QueryOutcome {
        if self.state != ClientState::Bound || self.family_id == 0 {
            warn!("taskstats query for {} without a bound socket", tid);
            self.teardown();
            return QueryOutcome::CriticalFail;
        }

        self.seq = self.seq.wrapping_add(1);
        wire::encode_stats_request(&mut self.tx, self.family_id, self.seq, tid);
        let transport = match self.transport.as_mut() {
            Some(t) => t,
            None => return QueryOutcome::CriticalFail,
        };
        if let Err(e) = send_frame(transport, &self.tx) {
            self.send_failures += 1;
            warn!("taskstats send for tid {} failed: {}", tid, e);
            if self.send_failures > MAX_SEND_FAILURES {
                error!(
                    "{} successive taskstats send failures, closing socket",
                    self.send_failures
                );
                self.send_failures = 0;
                self.teardown();
                return QueryOutcome::CriticalFail;
            }
            return QueryOutcome::Fail;
        }
        self.send_failures = 0;

        let len = match transport.recv(&mut self.rx) {
            Ok(0) => {
                warn!("taskstats socket returned an empty reply for tid {}", tid);
                return QueryOutcome::CriticalFail;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("taskstats receive for tid {} failed: {}", tid, e);
                return QueryOutcome::CriticalFail;
            }
        };

        match wire::parse_stats_reply(&self.rx[..len]) {
            Ok(StatsReply::Stats(ts)) => {
                trace!(
                    tid,
                    read_bytes = ts.read_bytes,
                    write_bytes = ts.write_bytes,
                    blkio_delay_ms = ts.blkio_delay_total as f64 / 1e6,
                    swapin_delay_ms = ts.swapin_delay_total as f64 / 1e6,
                    cpu_delay_ms = ts.cpu_delay_total as f64 / 1e6,
                    "taskstats reply"
                );
                QueryOutcome::Success(ts)
            }
            Ok(StatsReply::Error(code)) if code == -libc::ESRCH => {
                debug!("tid {} exited before its taskstats query", tid);
                QueryOutcome::Fail
            }
            Ok(StatsReply::Error(code)) => {
                warn!(
                    "taskstats reply error for tid {}: {}",
                    tid,
                    io::Error::from_raw_os_error(-code)
                );
                QueryOutcome::Fail
            }
            Ok(StatsReply::Empty) => {
                debug!("taskstats reply for tid {} carried no stats", tid);
                QueryOutcome::Fail
            }
            Err(e) => {
                warn!("malformed taskstats reply for tid {}: {}", tid, e);
                QueryOutcome::CriticalFail
            }
        }
    }
}

fn send_frame<T: Transport>(transport: &mut T, frame: &[u8]) -> io::Result<()> {
    let sent = transport.send(frame)?;
    if sent < frame.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short netlink send: {} of {} bytes", sent, frame.len()),
        ));
    }
    Ok(())
}

/// Opens kernel netlink sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetlinkConnector;

impl Connector for NetlinkConnector {
    type Transport = NetlinkSocket;

    fn connect(&mut self) -> Result<NetlinkSocket, TaskstatsError> {
        NetlinkSocket::open()
    }
}

/// A bound `NETLINK_GENERIC` socket.
#[derive(Debug)]
pub struct NetlinkSocket {
    fd: OwnedFd,
}

fn kernel_address() -> libc::sockaddr_nl {
    // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value
    let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
    addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    addr
}

impl NetlinkSocket {
    pub fn open() -> Result<Self, TaskstatsError> {
        // SAFETY: socket(2) has no memory preconditions; the result is checked
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_GENERIC,
            )
        };
        if raw < 0 {
            return Err(TaskstatsError::Socket(io::Error::last_os_error()));
        }
        // SAFETY: raw is a valid descriptor that nothing else owns
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // nl_pid 0 lets the kernel assign the port id
        let addr = kernel_address();
        // SAFETY: addr outlives the call and the length matches its type
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(TaskstatsError::Bind(io::Error::last_os_error()));
        }

        Ok(Self { fd })
    }
}

impl Transport for NetlinkSocket {
    fn send(&mut self, frame: &[u8]) -> io::Result<usize> {
        let addr = kernel_address();
        loop {
            // SAFETY: frame and addr are valid for the lengths passed
            let rc = unsafe {
                libc::sendto(
                    self.fd.as_raw_fd(),
                    frame.as_ptr() as *const libc::c_void,
                    frame.len(),
                    0,
                    &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
                )
            };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            // SAFETY: buf is valid for writes of buf.len() bytes
            let rc = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}
