//! Error types for the interleaving layer.

use crate::transport::TransportKey;

/// Errors that can occur while framing or moving interleaved data.
///
/// Variants map to specific failure modes:
///
/// - **Transport**: [`Io`](Self::Io) and [`TransportClosed`](Self::TransportClosed).
///   The socket is unusable and its descriptor gets torn down.
/// - **Backpressure**: [`WouldBlock`](Self::WouldBlock). The kernel send
///   buffer was full before any byte of a frame went out. The frame is
///   dropped but the connection stays healthy.
/// - **Framing**: [`PayloadTooLarge`](Self::PayloadTooLarge). The payload
///   cannot be described by the 16-bit length field (RFC 2326 §10.12).
/// - **Lookup**: [`UnknownTransport`](Self::UnknownTransport).
#[derive(Debug, thiserror::Error)]
pub enum InterleaveError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload length exceeds the 65535-byte interleaved frame limit.
    #[error("payload of {0} bytes does not fit an interleaved frame")]
    PayloadTooLarge(usize),

    /// No socket descriptor is registered for this transport.
    #[error("no socket descriptor for {0}")]
    UnknownTransport(TransportKey),

    /// The transport stopped accepting data part-way through a frame.
    #[error("{0} closed while a frame was in flight")]
    TransportClosed(TransportKey),

    /// Non-blocking send found the socket buffer full.
    #[error("send would block")]
    WouldBlock,
}

/// Convenience alias for `Result<T, InterleaveError>`.
pub type Result<T> = std::result::Result<T, InterleaveError>;
