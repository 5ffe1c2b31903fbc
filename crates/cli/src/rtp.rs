//! Just enough RTP (RFC 3550 §5.1) to generate and label test traffic.

pub const RTP_HEADER_LEN: usize = 12;

/// Dynamic payload type used for generated packets.
pub const DEFAULT_PAYLOAD_TYPE: u8 = 96;

/// 90 kHz clock at 30 packets per second.
const TIMESTAMP_STEP: u32 = 3000;

/// Produces numbered RTP packets with a filler payload.
#[derive(Debug)]
pub struct RtpSource {
    payload_type: u8,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    payload_len: usize,
}

impl RtpSource {
    pub fn new(payload_type: u8, ssrc: u32, payload_len: usize) -> Self {
        Self {
            payload_type: payload_type & 0x7f,
            ssrc,
            sequence: 0,
            timestamp: 0,
            payload_len,
        }
    }

    /// SSRC chosen at random so independent senders do not collide (RFC 3550 §8.1).
    pub fn with_random_ssrc(payload_type: u8, payload_len: usize) -> Self {
        Self::new(payload_type, rand::random::<u32>(), payload_len)
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn next_packet(&mut self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(RTP_HEADER_LEN + self.payload_len);
        packet.push(2 << 6);
        packet.push(self.payload_type);
        packet.extend_from_slice(&self.sequence.to_be_bytes());
        packet.extend_from_slice(&self.timestamp.to_be_bytes());
        packet.extend_from_slice(&self.ssrc.to_be_bytes());
        let fill = self.sequence as u8;
        packet.resize(RTP_HEADER_LEN + self.payload_len, fill);

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(TIMESTAMP_STEP);
        packet
    }
}

/// Fixed-header fields of a received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpSummary {
    pub payload_type: u8,
    pub marker: bool,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

/// Read the fixed header, or `None` if `packet` is not RTP version 2.
pub fn parse_header(packet: &[u8]) -> Option<RtpSummary> {
    let header: &[u8; RTP_HEADER_LEN] = packet.get(..RTP_HEADER_LEN)?.try_into().ok()?;
    if header[0] >> 6 != 2 {
        return None;
    }
    Some(RtpSummary {
        payload_type: header[1] & 0x7f,
        marker: header[1] & 0x80 != 0,
        sequence: u16::from_be_bytes([header[2], header[3]]),
        timestamp: u32::from_be_bytes([header[4], header[5], header[6], header[7]]),
        ssrc: u32::from_be_bytes([header[8], header[9], header[10], header[11]]),
    })
}
