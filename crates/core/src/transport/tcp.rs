//! Framed send path for RTP/RTCP over the RTSP TCP connection.
//!
//! A frame is `$<channel><len>` followed by the payload, written as two
//! sends. A receiver that sees half a header can never resynchronize on
//! its own, so once any byte of a frame is on the wire the rest is forced
//! out with a bounded blocking send. If even that fails the connection is
//! reported broken and the caller tears it down.

use std::io;
use std::time::Duration;

use crate::error::{InterleaveError, Result};
use crate::framing::FrameHeader;
use crate::transport::{AsyncStreamSocket, AsyncWrite, StreamSocket, StreamTransport};

/// Send one interleaved frame on `transport`.
///
/// Errors:
/// - [`InterleaveError::PayloadTooLarge`]: nothing was sent.
/// - [`InterleaveError::WouldBlock`]: the socket buffer was full before the
///   header started; nothing was sent and the connection is still usable.
/// - anything else: the connection is broken.
pub fn send_framed(
    transport: &StreamTransport,
    channel: u8,
    payload: &[u8],
    blocking_timeout: Duration,
) -> Result<()> {
    let header = FrameHeader::new(channel, payload.len())?.to_bytes();
    match transport {
        StreamTransport::Sync(socket) => {
            send_data(socket.as_ref(), &header, false, blocking_timeout)?;
            send_data(socket.as_ref(), payload, true, blocking_timeout)
        }
        StreamTransport::Async(socket) => {
            write_async(socket.as_ref(), &header)?;
            write_async(socket.as_ref(), payload)
        }
    }
}

/// Non-blocking send with blocking fallback.
///
/// With `force` the data must go out even if nothing was accepted yet;
/// without it an untouched would-block is returned as
/// [`InterleaveError::WouldBlock`]. A partial send is always completed.
pub fn send_data(
    socket: &dyn StreamSocket,
    data: &[u8],
    force: bool,
    blocking_timeout: Duration,
) -> Result<()> {
    let sent = loop {
        match socket.send(data) {
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if !force {
                    return Err(InterleaveError::WouldBlock);
                }
                break 0;
            }
            Err(e) => return Err(e.into()),
        }
    };

    if sent == data.len() {
        return Ok(());
    }
    if sent == 0 && !force {
        return Err(InterleaveError::TransportClosed(socket.key()));
    }

    let remaining = &data[sent..];
    tracing::debug!(
        key = %socket.key(),
        sent,
        remaining = remaining.len(),
        "send buffer full, resending in blocking mode"
    );
    socket.make_blocking(blocking_timeout)?;
    let resent = match socket.send(remaining) {
        Ok(n) => n,
        Err(e) if is_timeout(&e) => 0,
        Err(e) => return Err(e.into()),
    };
    if resent != remaining.len() {
        tracing::warn!(
            key = %socket.key(),
            delivered = resent,
            expected = remaining.len(),
            "blocking send failed or timed out"
        );
        return Err(InterleaveError::TransportClosed(socket.key()));
    }
    socket.make_nonblocking()?;
    Ok(())
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Write all of `data` to a completion-driven socket.
///
/// A pending write means the socket layer owns the rest of the buffer,
/// which counts as delivered from this layer's point of view.
fn write_async(socket: &dyn AsyncStreamSocket, data: &[u8]) -> Result<()> {
    let mut rest = data;
    while !rest.is_empty() {
        match socket.write(rest) {
            AsyncWrite::Written(0) => {
                return Err(io::Error::from(io::ErrorKind::WriteZero).into());
            }
            AsyncWrite::Written(n) => rest = &rest[n.min(rest.len())..],
            AsyncWrite::Pending => return Ok(()),
            AsyncWrite::Failed(e) => return Err(e.into()),
        }
    }
    Ok(())
}
