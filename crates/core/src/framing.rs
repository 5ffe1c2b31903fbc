//! Interleaved frame codec (RFC 2326 §10.12).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   "$" = 36    |   Channel ID  |        Length in octets       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! :         Binary data (Length according to Length field)        :
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Decoding is a pure, allocation-free [`step`] over one byte at a time.
//! The same function backs both the blocking read loop and the
//! completion-driven one, so the two drivers cannot drift apart.
//!
//! Bytes seen while waiting for `$` belong to the RTSP request/response
//! stream sharing the socket and are reported as
//! [`FramingEvent::Passthrough`].

use crate::error::{InterleaveError, Result};

/// The `$` byte that opens every interleaved frame.
pub const DOLLAR_SIGN: u8 = 0x24;

/// Size of the `$<channel><len_hi><len_lo>` prefix.
pub const HEADER_LEN: usize = 4;

/// Largest payload a 16-bit length field can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Handed to the passthrough handler when the descriptor dies from a read error.
pub const ERROR_SENTINEL: u8 = 0xFF;

/// Handed to the passthrough handler when the descriptor is released
/// without error and the RTSP side should take the socket back.
pub const CLOSE_SENTINEL: u8 = 0xFE;

/// Whether `byte` is reserved for hand-back signalling and must never be
/// forwarded as ordinary RTSP data.
pub fn is_sentinel(byte: u8) -> bool {
    byte == ERROR_SENTINEL || byte == CLOSE_SENTINEL
}

/// A fully parsed framing header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub channel: u8,
    pub len: u16,
}

impl FrameHeader {
    /// Header for `payload_len` bytes on `channel`.
    ///
    /// Fails with [`InterleaveError::PayloadTooLarge`] above 65535 bytes.
    pub fn new(channel: u8, payload_len: usize) -> Result<Self> {
        let len = u16::try_from(payload_len)
            .map_err(|_| InterleaveError::PayloadTooLarge(payload_len))?;
        Ok(Self { channel, len })
    }

    /// Serialize as `'$', channel, len_hi, len_lo`.
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let [hi, lo] = self.len.to_be_bytes();
        [DOLLAR_SIGN, self.channel, hi, lo]
    }
}

/// Encode one complete frame (header followed by payload) as a single buffer.
pub fn encode_frame(channel: u8, payload: &[u8]) -> Result<Vec<u8>> {
    let header = FrameHeader::new(channel, payload.len())?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Position of the byte scanner within the interleaved stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParserState {
    /// Scanning RTSP bytes for the next `$`.
    #[default]
    AwaitingDollar,
    AwaitingChannelId,
    AwaitingSizeHigh { channel: u8 },
    AwaitingSizeLow { channel: u8, high: u8 },
    /// Inside a payload with `remaining` bytes still to come (never 0).
    AwaitingPayload { channel: u8, remaining: u16 },
}

impl ParserState {
    /// Channel and outstanding byte count while inside a payload.
    pub fn payload_remaining(&self) -> Option<(u8, usize)> {
        match *self {
            Self::AwaitingPayload { channel, remaining } => Some((channel, remaining as usize)),
            _ => None,
        }
    }

    /// Account for `n` payload bytes consumed in bulk.
    ///
    /// Returns to [`AwaitingDollar`](Self::AwaitingDollar) once the payload
    /// is exhausted. Outside a payload this is the identity.
    pub fn advance_payload(self, n: usize) -> Self {
        match self {
            Self::AwaitingPayload { channel, remaining } => {
                let left = (remaining as usize).saturating_sub(n);
                if left == 0 {
                    Self::AwaitingDollar
                } else {
                    Self::AwaitingPayload {
                        channel,
                        remaining: left as u16,
                    }
                }
            }
            other => other,
        }
    }
}

/// What a single [`step`] produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingEvent {
    /// Byte was absorbed into a header under construction.
    None,
    /// Byte belongs to the co-resident RTSP stream.
    Passthrough(u8),
    /// Reserved sentinel byte seen outside a frame; dropped.
    SentinelDropped(u8),
    /// Channel id after `$` is not registered; scanner went back to
    /// looking for `$`.
    Resync(u8),
    /// A header is complete. Payload bytes follow unless `len == 0`.
    Header(FrameHeader),
    /// One payload byte; `last` marks the end of the frame.
    Payload { channel: u8, byte: u8, last: bool },
}

/// Advance the scanner by one byte.
///
/// `is_known_channel` answers whether a channel id has a registered
/// endpoint. Unknown ids force a resync so garbage can at worst cost a scan
/// for the next `$`. A zero-length frame completes at its last header byte.
pub fn step(
    state: ParserState,
    byte: u8,
    is_known_channel: impl Fn(u8) -> bool,
) -> (ParserState, FramingEvent) {
    match state {
        ParserState::AwaitingDollar if byte == DOLLAR_SIGN => {
            (ParserState::AwaitingChannelId, FramingEvent::None)
        }
        ParserState::AwaitingDollar if is_sentinel(byte) => {
            (state, FramingEvent::SentinelDropped(byte))
        }
        ParserState::AwaitingDollar => (state, FramingEvent::Passthrough(byte)),
        ParserState::AwaitingChannelId => {
            if is_known_channel(byte) {
                (
                    ParserState::AwaitingSizeHigh { channel: byte },
                    FramingEvent::None,
                )
            } else {
                (ParserState::AwaitingDollar, FramingEvent::Resync(byte))
            }
        }
        ParserState::AwaitingSizeHigh { channel } => (
            ParserState::AwaitingSizeLow {
                channel,
                high: byte,
            },
            FramingEvent::None,
        ),
        ParserState::AwaitingSizeLow { channel, high } => {
            let len = u16::from_be_bytes([high, byte]);
            let next = if len == 0 {
                ParserState::AwaitingDollar
            } else {
                ParserState::AwaitingPayload {
                    channel,
                    remaining: len,
                }
            };
            (next, FramingEvent::Header(FrameHeader { channel, len }))
        }
        ParserState::AwaitingPayload { channel, .. } => {
            let next = state.advance_payload(1);
            let last = next == ParserState::AwaitingDollar;
            (next, FramingEvent::Payload { channel, byte, last })
        }
    }
}
