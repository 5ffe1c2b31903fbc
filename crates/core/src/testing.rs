//! In-memory sockets and a recording scheduler for unit tests.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use parking_lot::Mutex;

use crate::scheduler::ReadinessScheduler;
use crate::transport::{AsyncRead, AsyncStreamSocket, AsyncWrite, StreamSocket, TransportKey};

enum ReadStep {
    Data(Vec<u8>),
    Eof,
    Error(io::ErrorKind),
}

#[derive(Default)]
struct ScriptState {
    reads: VecDeque<ReadStep>,
    recv_calls: usize,
    written: Vec<u8>,
    blocking: bool,
    blocking_switches: usize,
    nonblocking_budget: Option<usize>,
    blocking_cap: Option<usize>,
    fail_sends: bool,
}

/// Readiness-driven socket fed from a script.
///
/// Reads return queued data in order and `WouldBlock` once the queue is
/// empty. Sends append to [`written`](Self::written).
pub struct ScriptedSocket {
    key: u64,
    state: Mutex<ScriptState>,
}

impl ScriptedSocket {
    pub fn new(key: u64) -> Self {
        Self {
            key,
            state: Mutex::new(ScriptState::default()),
        }
    }

    pub fn push_read(&self, data: &[u8]) {
        self.state.lock().reads.push_back(ReadStep::Data(data.to_vec()));
    }

    pub fn push_eof(&self) {
        self.state.lock().reads.push_back(ReadStep::Eof);
    }

    pub fn push_error(&self, kind: io::ErrorKind) {
        self.state.lock().reads.push_back(ReadStep::Error(kind));
    }

    pub fn recv_calls(&self) -> usize {
        self.state.lock().recv_calls
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    pub fn blocking_switches(&self) -> usize {
        self.state.lock().blocking_switches
    }

    pub fn is_blocking(&self) -> bool {
        self.state.lock().blocking
    }

    /// Total bytes accepted in non-blocking mode before sends report
    /// `WouldBlock`.
    pub fn limit_nonblocking_sends(&self, budget: usize) {
        self.state.lock().nonblocking_budget = Some(budget);
    }

    /// Cap on bytes accepted by each blocking send, simulating a timeout.
    pub fn limit_blocking_sends(&self, cap: usize) {
        self.state.lock().blocking_cap = Some(cap);
    }

    pub fn fail_sends(&self) {
        self.state.lock().fail_sends = true;
    }
}

impl StreamSocket for ScriptedSocket {
    fn key(&self) -> TransportKey {
        TransportKey::Socket(self.key)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut st = self.state.lock();
        st.recv_calls += 1;
        match st.reads.pop_front() {
            None => Err(io::ErrorKind::WouldBlock.into()),
            Some(ReadStep::Eof) => Ok(0),
            Some(ReadStep::Error(kind)) => Err(kind.into()),
            Some(ReadStep::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    data.drain(..n);
                    st.reads.push_front(ReadStep::Data(data));
                }
                Ok(n)
            }
        }
    }

    fn send(&self, data: &[u8]) -> io::Result<usize> {
        let mut st = self.state.lock();
        if st.fail_sends {
            return Err(io::ErrorKind::ConnectionReset.into());
        }
        let n = if st.blocking {
            st.blocking_cap.map_or(data.len(), |cap| cap.min(data.len()))
        } else {
            match st.nonblocking_budget {
                Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
                Some(budget) => {
                    let n = budget.min(data.len());
                    st.nonblocking_budget = Some(budget - n);
                    n
                }
                None => data.len(),
            }
        };
        st.written.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn make_blocking(&self, _timeout: Duration) -> io::Result<()> {
        let mut st = self.state.lock();
        st.blocking = true;
        st.blocking_switches += 1;
        Ok(())
    }

    fn make_nonblocking(&self) -> io::Result<()> {
        self.state.lock().blocking = false;
        Ok(())
    }
}

enum AsyncStep {
    Data(Vec<u8>),
    Pending,
    Closed,
    Fail(io::ErrorKind),
}

#[derive(Default)]
struct AsyncScript {
    reads: VecDeque<AsyncStep>,
    read_calls: usize,
    written: Vec<u8>,
    write_limit: Option<usize>,
    pend_writes: bool,
}

/// Completion-driven socket fed from a script.
///
/// Reads return queued results in order and `Pending` once the queue is
/// empty; the test then plays the completion by hand.
#[derive(Default)]
pub struct ScriptedAsyncSocket {
    state: Mutex<AsyncScript>,
}

impl ScriptedAsyncSocket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_ready(&self, data: &[u8]) {
        self.state.lock().reads.push_back(AsyncStep::Data(data.to_vec()));
    }

    pub fn push_pending(&self) {
        self.state.lock().reads.push_back(AsyncStep::Pending);
    }

    pub fn push_closed(&self) {
        self.state.lock().reads.push_back(AsyncStep::Closed);
    }

    pub fn push_failure(&self, kind: io::ErrorKind) {
        self.state.lock().reads.push_back(AsyncStep::Fail(kind));
    }

    pub fn read_calls(&self) -> usize {
        self.state.lock().read_calls
    }

    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    pub fn limit_write_size(&self, limit: usize) {
        self.state.lock().write_limit = Some(limit);
    }

    pub fn pend_writes(&self) {
        self.state.lock().pend_writes = true;
    }
}

impl AsyncStreamSocket for ScriptedAsyncSocket {
    fn read(&self, max_len: usize) -> AsyncRead {
        let mut st = self.state.lock();
        st.read_calls += 1;
        match st.reads.pop_front() {
            None | Some(AsyncStep::Pending) => AsyncRead::Pending,
            Some(AsyncStep::Closed) => AsyncRead::Closed,
            Some(AsyncStep::Fail(kind)) => AsyncRead::Failed(kind.into()),
            Some(AsyncStep::Data(mut data)) => {
                if data.len() > max_len {
                    let rest = data.split_off(max_len);
                    st.reads.push_front(AsyncStep::Data(rest));
                }
                AsyncRead::Ready(data)
            }
        }
    }

    fn write(&self, data: &[u8]) -> AsyncWrite {
        let mut st = self.state.lock();
        if st.pend_writes {
            return AsyncWrite::Pending;
        }
        let n = st.write_limit.map_or(data.len(), |limit| limit.min(data.len()));
        st.written.extend_from_slice(&data[..n]);
        AsyncWrite::Written(n)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerEvent {
    Watch(TransportKey),
    Unwatch(TransportKey),
}

/// Scheduler that only records what it was asked to do.
#[derive(Default)]
pub struct RecordingScheduler {
    events: Mutex<Vec<SchedulerEvent>>,
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SchedulerEvent> {
        self.events.lock().clone()
    }
}

impl ReadinessScheduler for RecordingScheduler {
    fn watch_readable(&self, key: TransportKey) {
        self.events.lock().push(SchedulerEvent::Watch(key));
    }

    fn unwatch_readable(&self, key: TransportKey) {
        self.events.lock().push(SchedulerEvent::Unwatch(key));
    }
}
