//! Physical transports that interleaved channels ride on.
//!
//! Two I/O models are supported behind one [`StreamTransport`] handle:
//!
//! - **Readiness-driven** ([`StreamSocket`]): a non-blocking socket that a
//!   [`ReadinessScheduler`](crate::ReadinessScheduler) reports as readable.
//!   `std::net::TcpStream` implements it directly.
//!
//! - **Completion-driven** ([`AsyncStreamSocket`]): a socket whose reads may
//!   return [`AsyncRead::Pending`] and finish later. The socket layer then
//!   hands the outcome to
//!   [`SocketRegistry::on_async_read_complete`](crate::SocketRegistry::on_async_read_complete)
//!   on the same thread.
//!
//! [`tcp`] holds the framed send path, [`udp`] the datagram fallback.

pub mod tcp;
pub mod udp;

use std::fmt;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

pub use udp::UdpFallback;

/// Identifies one physical socket.
///
/// Readiness-driven sockets are keyed by their OS descriptor; completion
/// driven sockets have no usable descriptor and are keyed by the address
/// of their shared handle instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportKey {
    /// OS socket descriptor.
    Socket(u64),
    /// Opaque handle of a completion-driven socket object.
    Handle(usize),
}

impl fmt::Display for TransportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(fd) => write!(f, "socket {fd}"),
            Self::Handle(h) => write!(f, "handle {h:#x}"),
        }
    }
}

/// A non-blocking byte stream driven by readiness notifications.
///
/// `recv` must report "no data right now" as [`io::ErrorKind::WouldBlock`]
/// and end-of-stream as `Ok(0)`.
pub trait StreamSocket: Send + Sync {
    fn key(&self) -> TransportKey;

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn send(&self, data: &[u8]) -> io::Result<usize>;

    /// Switch to blocking mode; sends give up after `timeout`.
    fn make_blocking(&self, timeout: Duration) -> io::Result<()>;

    fn make_nonblocking(&self) -> io::Result<()>;
}

impl StreamSocket for TcpStream {
    #[cfg(unix)]
    fn key(&self) -> TransportKey {
        use std::os::fd::AsRawFd;
        TransportKey::Socket(self.as_raw_fd() as u64)
    }

    #[cfg(windows)]
    fn key(&self) -> TransportKey {
        use std::os::windows::io::AsRawSocket;
        TransportKey::Socket(self.as_raw_socket())
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self;
        stream.read(buf)
    }

    fn send(&self, data: &[u8]) -> io::Result<usize> {
        let mut stream = self;
        stream.write(data)
    }

    fn make_blocking(&self, timeout: Duration) -> io::Result<()> {
        TcpStream::set_nonblocking(self, false)?;
        self.set_write_timeout(Some(timeout))
    }

    fn make_nonblocking(&self) -> io::Result<()> {
        self.set_write_timeout(None)?;
        TcpStream::set_nonblocking(self, true)
    }
}

/// Result of a completion-driven read, either immediate or delivered later.
#[derive(Debug)]
pub enum AsyncRead {
    /// Bytes read. Never empty; an empty read is reported as `Closed`.
    Ready(Vec<u8>),
    /// The read is in flight; its outcome arrives through
    /// [`SocketRegistry::on_async_read_complete`](crate::SocketRegistry::on_async_read_complete).
    Pending,
    /// Peer closed the connection.
    Closed,
    Failed(io::Error),
}

/// Result of a completion-driven write.
#[derive(Debug)]
pub enum AsyncWrite {
    Written(usize),
    /// The socket took ownership of the bytes and will finish the write later.
    Pending,
    Failed(io::Error),
}

/// A stream socket with a callback-style API.
///
/// At most one read may be outstanding per socket.
pub trait AsyncStreamSocket: Send + Sync {
    fn read(&self, max_len: usize) -> AsyncRead;

    fn write(&self, data: &[u8]) -> AsyncWrite;
}

/// Shared handle to the physical socket behind a set of channels.
#[derive(Clone)]
pub enum StreamTransport {
    Sync(Arc<dyn StreamSocket>),
    Async(Arc<dyn AsyncStreamSocket>),
}

impl StreamTransport {
    pub fn key(&self) -> TransportKey {
        match self {
            Self::Sync(socket) => socket.key(),
            Self::Async(socket) => TransportKey::Handle(Arc::as_ptr(socket) as *const () as usize),
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }
}

impl fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.is_async() { "Async" } else { "Sync" };
        f.debug_tuple(mode).field(&self.key()).finish()
    }
}

impl From<TcpStream> for StreamTransport {
    fn from(stream: TcpStream) -> Self {
        Self::Sync(Arc::new(stream))
    }
}
