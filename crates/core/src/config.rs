use std::time::Duration;

/// Default number of bytes requested per socket read.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;

/// Default cap on socket reads per readiness notification.
pub const DEFAULT_MAX_READS_PER_WAKEUP: usize = 2000;

/// Default timeout for the blocking resend of a partially written frame.
pub const DEFAULT_BLOCKING_SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// Tuning knobs shared by every [`SocketDescriptor`](crate::SocketDescriptor)
/// created by one [`SocketRegistry`](crate::SocketRegistry).
#[derive(Debug, Clone)]
pub struct InterleaveConfig {
    /// Bytes requested from the socket on each read.
    pub read_chunk_size: usize,
    /// Upper bound on reads performed by one `drive_read_loop` call, so a
    /// busy socket cannot starve the others sharing a cooperative scheduler.
    pub max_reads_per_wakeup: usize,
    /// How long a partially sent frame may block while its remainder is
    /// forced out. When this expires the connection is considered broken.
    pub blocking_send_timeout: Duration,
}

impl Default for InterleaveConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_reads_per_wakeup: DEFAULT_MAX_READS_PER_WAKEUP,
            blocking_send_timeout: DEFAULT_BLOCKING_SEND_TIMEOUT,
        }
    }
}
