//! In-memory kernel answering taskstats requests, for unit tests.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use ahash::AHashMap as HashMap;

use super::client::{Connector, TaskstatsError, Transport};
use super::wire::testing::{error_message, family_reply, stats_reply};
use super::wire::{Message, Taskstats, GENL_ID_CTRL, TASKSTATS_CMD_ATTR_PID};

#[derive(Debug)]
struct KernelState {
    family_id: u16,
    family_available: bool,
    connect_fails: bool,
    send_fails: bool,
    recv_fails: bool,
    truncate_replies: bool,
    connects: usize,
    queries: usize,
    threads: HashMap<u32, Taskstats>,
}

/// Connector side of the fake; hand it to a `TaskstatsClient`.
#[derive(Debug)]
pub struct FakeKernel {
    state: Rc<RefCell<KernelState>>,
}

/// Test side of the fake; scripts thread stats and failures.
#[derive(Debug, Clone)]
pub struct KernelHandle {
    state: Rc<RefCell<KernelState>>,
}

impl FakeKernel {
    pub fn new(family_id: u16) -> (Self, KernelHandle) {
        let state = Rc::new(RefCell::new(KernelState {
            family_id,
            family_available: true,
            connect_fails: false,
            send_fails: false,
            recv_fails: false,
            truncate_replies: false,
            connects: 0,
            queries: 0,
            threads: HashMap::new(),
        }));
        (
            Self {
                state: Rc::clone(&state),
            },
            KernelHandle { state },
        )
    }
}

impl KernelHandle {
    pub fn set_thread(&self, tid: u32, stats: Taskstats) {
        self.state.borrow_mut().threads.insert(tid, stats);
    }

    pub fn remove_thread(&self, tid: u32) {
        self.state.borrow_mut().threads.remove(&tid);
    }

    pub fn set_family_available(&self, available: bool) {
        self.state.borrow_mut().family_available = available;
    }

    pub fn set_connect_fails(&self, fails: bool) {
        self.state.borrow_mut().connect_fails = fails;
    }

    pub fn set_send_fails(&self, fails: bool) {
        self.state.borrow_mut().send_fails = fails;
    }

    pub fn set_recv_fails(&self, fails: bool) {
        self.state.borrow_mut().recv_fails = fails;
    }

    pub fn set_truncate_replies(&self, truncate: bool) {
        self.state.borrow_mut().truncate_replies = truncate;
    }

    pub fn connects(&self) -> usize {
        self.state.borrow().connects
    }

    /// Stats requests answered so far (family lookups excluded).
    pub fn queries(&self) -> usize {
        self.state.borrow().queries
    }
}

impl Connector for FakeKernel {
    type Transport = FakeSocket;

    fn connect(&mut self) -> Result<FakeSocket, TaskstatsError> {
        let mut state = self.state.borrow_mut();
        state.connects += 1;
        if state.connect_fails {
            return Err(TaskstatsError::Bind(io::Error::from_raw_os_error(
                libc::EPERM,
            )));
        }
        Ok(FakeSocket {
            state: Rc::clone(&self.state),
            pending: None,
        })
    }
}

#[derive(Debug)]
pub struct FakeSocket {
    state: Rc<RefCell<KernelState>>,
    pending: Option<Vec<u8>>,
}

impl FakeSocket {
    fn answer(state: &mut KernelState, request: &[u8]) -> io::Result<Vec<u8>> {
        let msg = Message::parse(request)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        if msg.header.msg_type == GENL_ID_CTRL {
            return Ok(if state.family_available {
                family_reply(state.family_id)
            } else {
                error_message(libc::ENOENT)
            });
        }

        state.queries += 1;
        let tid = msg
            .genl_attributes()
            .and_then(|attrs| attrs.find(TASKSTATS_CMD_ATTR_PID))
            .ok()
            .flatten()
            .and_then(|attr| attr.payload.get(..4))
            .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no pid attribute"))?;

        let mut reply = match state.threads.get(&tid) {
            Some(ts) => stats_reply(state.family_id, tid, ts),
            None => error_message(libc::ESRCH),
        };
        if state.truncate_replies {
            reply.truncate(reply.len() / 2);
        }
        Ok(reply)
    }
}

impl Transport for FakeSocket {
    fn send(&mut self, frame: &[u8]) -> io::Result<usize> {
        let mut state = self.state.borrow_mut();
        if state.send_fails {
            return Err(io::Error::from_raw_os_error(libc::ENOBUFS));
        }
        self.pending = Some(Self::answer(&mut state, frame)?);
        Ok(frame.len())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.state.borrow().recv_fails {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        match self.pending.take() {
            Some(reply) => {
                let len = reply.len().min(buf.len());
                buf[..len].copy_from_slice(&reply[..len]);
                Ok(len)
            }
            None => Ok(0),
        }
    }
}
