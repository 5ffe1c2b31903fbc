//! Per-socket demultiplexer for interleaved RTP/RTCP (RFC 2326 §10.12).
//!
//! A [`SocketDescriptor`] exists while at least one [`MediaEndpoint`]
//! listens on a channel of its socket. It pulls bytes from the socket,
//! runs them through [`framing::step`], routes payloads to the endpoint
//! registered for the frame's channel, and hands everything outside a
//! frame to the passthrough handler (the RTSP parser sharing the socket).
//!
//! ## Reentrancy
//!
//! Delivering a packet runs endpoint code, which may deregister channels
//! on this very descriptor, including the last one. While a read loop is
//! on the stack that only marks the descriptor for teardown; the loop
//! notices after the current step and the teardown runs once the loop has
//! unwound. No lock is held while endpoint or passthrough code runs.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::InterleaveConfig;
use crate::endpoint::{Binding, MediaEndpoint, PendingFrame};
use crate::framing::{self, CLOSE_SENTINEL, ERROR_SENTINEL, FramingEvent, ParserState};
use crate::registry::SocketRegistry;
use crate::transport::{AsyncRead, AsyncStreamSocket, StreamSocket, StreamTransport, TransportKey};

/// Receives every byte that is not part of an interleaved frame.
///
/// When the descriptor goes away the handler gets one final
/// [`ERROR_SENTINEL`] (read error or EOF) or [`CLOSE_SENTINEL`] (last
/// channel released) meaning the socket is handed back to it.
pub type PassthroughHandler = Arc<dyn Fn(u8) + Send + Sync>;

pub struct SocketDescriptor {
    key: TransportKey,
    transport: StreamTransport,
    config: Arc<InterleaveConfig>,
    state: Mutex<DescriptorState>,
}

#[derive(Default)]
struct DescriptorState {
    parser: ParserState,
    /// Reassembly state of the payload being read; `None` while skipping.
    frame: Option<PendingFrame>,
    channels: BTreeMap<u8, Weak<MediaEndpoint>>,
    passthrough: Option<PassthroughHandler>,
    /// Bytes read but not examined when teardown was requested mid-chunk.
    unprocessed: Vec<u8>,
    read_error: bool,
    pending_self_destruct: bool,
    in_read_loop: bool,
    io_pending: bool,
    destroyed: bool,
}

/// Work decided under the state lock and carried out after releasing it.
enum Step {
    Advance(usize),
    Passthrough(PassthroughHandler, u8),
    Deliver {
        endpoint: Arc<MediaEndpoint>,
        frame: PendingFrame,
        header_bytes: usize,
    },
}

impl DescriptorState {
    fn endpoint(&self, channel: u8) -> Option<Arc<MediaEndpoint>> {
        self.channels.get(&channel).and_then(Weak::upgrade)
    }

    /// Decide what to do with the front of `data` (never empty).
    fn next_step(&mut self, key: TransportKey, data: &[u8]) -> Step {
        if let Some((channel, remaining)) = self.parser.payload_remaining() {
            if let Some(frame) = self.frame.take() {
                if let Some(endpoint) = self.endpoint(channel) {
                    return Step::Deliver {
                        endpoint,
                        frame,
                        header_bytes: 0,
                    };
                }
            }
            let skipped = remaining.min(data.len());
            self.parser = self.parser.advance_payload(skipped);
            tracing::trace!(%key, channel, skipped, "skipping payload with no endpoint");
            return Step::Advance(skipped);
        }

        let channels = &self.channels;
        let (next, event) = framing::step(self.parser, data[0], |c| channels.contains_key(&c));
        self.parser = next;
        match event {
            FramingEvent::Passthrough(byte) => match &self.passthrough {
                Some(handler) => Step::Passthrough(handler.clone(), byte),
                None => Step::Advance(1),
            },
            FramingEvent::Resync(channel) => {
                tracing::warn!(%key, channel, "unknown channel id after '$', resynchronizing");
                Step::Advance(1)
            }
            FramingEvent::Header(header) => {
                tracing::trace!(%key, channel = header.channel, size = header.len, "frame header");
                let binding = Binding {
                    key,
                    channel: header.channel,
                };
                let frame = PendingFrame::new(binding, header.len as usize);
                match self.endpoint(header.channel) {
                    Some(endpoint) if header.len == 0 => Step::Deliver {
                        endpoint,
                        frame,
                        header_bytes: 1,
                    },
                    Some(_) => {
                        self.frame = Some(frame);
                        Step::Advance(1)
                    }
                    None => Step::Advance(1),
                }
            }
            FramingEvent::None
            | FramingEvent::SentinelDropped(_)
            | FramingEvent::Payload { .. } => Step::Advance(1),
        }
    }
}

impl SocketDescriptor {
    /// `read_pending` carries over a read a previous descriptor of the same
    /// socket left in flight; its completion is delivered to this one.
    pub(crate) fn new(
        transport: StreamTransport,
        config: Arc<InterleaveConfig>,
        read_pending: bool,
    ) -> Self {
        Self {
            key: transport.key(),
            transport,
            config,
            state: Mutex::new(DescriptorState {
                io_pending: read_pending,
                ..DescriptorState::default()
            }),
        }
    }

    pub fn key(&self) -> TransportKey {
        self.key
    }

    pub fn transport(&self) -> &StreamTransport {
        &self.transport
    }

    pub fn channel_count(&self) -> usize {
        self.state.lock().channels.len()
    }

    pub fn has_channel(&self, channel: u8) -> bool {
        self.state.lock().channels.contains_key(&channel)
    }

    /// Endpoint currently registered for `channel`, if it is still alive.
    pub fn lookup(&self, channel: u8) -> Option<Arc<MediaEndpoint>> {
        self.state.lock().endpoint(channel)
    }

    pub fn parser_state(&self) -> ParserState {
        self.state.lock().parser
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Whether a completion-driven read is in flight.
    pub fn is_read_pending(&self) -> bool {
        self.state.lock().io_pending
    }

    pub fn set_passthrough_handler(&self, handler: Option<PassthroughHandler>) {
        self.state.lock().passthrough = handler;
    }

    /// Route frames on `channel` to `endpoint`.
    ///
    /// The first registration arms reading: readiness-driven sockets are
    /// handed to the scheduler, completion-driven ones become eligible for
    /// [`drive_read_loop`](Self::drive_read_loop).
    ///
    /// # Panics
    ///
    /// If `channel` is already registered to a different live endpoint.
    pub(crate) fn register_endpoint(
        &self,
        registry: &SocketRegistry,
        channel: u8,
        endpoint: &Arc<MediaEndpoint>,
    ) {
        let first = {
            let mut st = self.state.lock();
            let candidate = Arc::downgrade(endpoint);
            if let Some(existing) = st.channels.get(&channel) {
                assert!(
                    existing.strong_count() == 0 || existing.ptr_eq(&candidate),
                    "channel {channel} on {} is already bound to another endpoint",
                    self.key
                );
            }
            let first = st.channels.is_empty();
            st.channels.insert(channel, candidate);
            if !st.read_error {
                st.pending_self_destruct = false;
            }
            first
        };

        tracing::debug!(key = %self.key, channel, first, "endpoint registered");
        if first {
            match &self.transport {
                StreamTransport::Sync(_) => registry.scheduler().watch_readable(self.key),
                StreamTransport::Async(_) => {
                    tracing::trace!(key = %self.key, "descriptor is now the active reader")
                }
            }
        }
    }

    /// Stop routing `channel` to `owner`. An entry held by another live
    /// endpoint is left alone.
    ///
    /// Releasing the last channel tears the descriptor down, deferred to
    /// the end of the read loop if one is running.
    pub(crate) fn deregister_endpoint(
        self: &Arc<Self>,
        registry: &SocketRegistry,
        channel: u8,
        owner: &Weak<MediaEndpoint>,
    ) {
        let destroy_now = {
            let mut st = self.state.lock();
            match st.channels.get(&channel) {
                Some(existing) if existing.ptr_eq(owner) || existing.strong_count() == 0 => {
                    st.channels.remove(&channel);
                }
                Some(_) => {
                    tracing::debug!(
                        key = %self.key,
                        channel,
                        "channel held by another endpoint, not released"
                    );
                    return;
                }
                None => return,
            }
            tracing::debug!(key = %self.key, channel, remaining = st.channels.len(), "endpoint deregistered");
            if !st.channels.is_empty() {
                false
            } else if st.in_read_loop {
                st.pending_self_destruct = true;
                false
            } else {
                true
            }
        };
        if destroy_now {
            registry.destroy(self);
        }
    }

    /// Treat the transport as broken (e.g. a failed send) and tear down.
    pub(crate) fn fail(self: &Arc<Self>, registry: &SocketRegistry) {
        let destroy_now = {
            let mut st = self.state.lock();
            if st.destroyed {
                return;
            }
            st.read_error = true;
            st.pending_self_destruct = true;
            !st.in_read_loop
        };
        if destroy_now {
            registry.destroy(self);
        }
    }

    /// Consume whatever the socket has to offer, up to the configured cap.
    ///
    /// Readiness-driven sockets are read until they report `WouldBlock`.
    /// Completion-driven sockets are read until a read goes pending; the
    /// rest arrives through [`on_async_read_complete`](Self::on_async_read_complete).
    /// Calls made while a loop is already running are ignored.
    pub fn drive_read_loop(self: &Arc<Self>, registry: &SocketRegistry) {
        if !self.enter_read_loop() {
            return;
        }
        match &self.transport {
            StreamTransport::Sync(socket) => self.read_sync(socket.as_ref()),
            StreamTransport::Async(socket) => self.read_async(socket.as_ref()),
        }
        self.leave_read_loop(registry);
    }

    /// Resume after a pending read finished.
    ///
    /// # Panics
    ///
    /// If called from inside this descriptor's own read loop.
    pub fn on_async_read_complete(self: &Arc<Self>, registry: &SocketRegistry, result: AsyncRead) {
        {
            let mut st = self.state.lock();
            if st.destroyed {
                return;
            }
            assert!(
                !st.in_read_loop,
                "read completion for {} delivered re-entrantly",
                self.key
            );
            if !st.io_pending {
                tracing::warn!(key = %self.key, "read completion with no read outstanding");
            }
            st.io_pending = false;
            st.in_read_loop = true;
        }

        match result {
            AsyncRead::Ready(data) if !data.is_empty() => {
                self.process_chunk(&data);
                if let StreamTransport::Async(socket) = &self.transport {
                    self.read_async(socket.as_ref());
                }
            }
            AsyncRead::Pending => self.state.lock().io_pending = true,
            AsyncRead::Ready(_) | AsyncRead::Closed => {
                tracing::debug!(key = %self.key, "connection closed by peer");
                self.mark_read_error();
            }
            AsyncRead::Failed(e) => {
                tracing::warn!(key = %self.key, error = %e, "read failed");
                self.mark_read_error();
            }
        }
        self.leave_read_loop(registry);
    }

    fn enter_read_loop(&self) -> bool {
        let mut st = self.state.lock();
        if st.destroyed || st.in_read_loop {
            return false;
        }
        st.in_read_loop = true;
        true
    }

    fn leave_read_loop(self: &Arc<Self>, registry: &SocketRegistry) {
        let destroy = {
            let mut st = self.state.lock();
            st.in_read_loop = false;
            st.pending_self_destruct
        };
        if destroy {
            registry.destroy(self);
        }
    }

    fn is_closing(&self) -> bool {
        self.state.lock().pending_self_destruct
    }

    fn mark_read_error(&self) {
        let mut st = self.state.lock();
        st.read_error = true;
        st.pending_self_destruct = true;
    }

    fn read_sync(&self, socket: &dyn StreamSocket) {
        let mut buf = vec![0u8; self.config.read_chunk_size.max(1)];
        for _ in 0..self.config.max_reads_per_wakeup {
            if self.is_closing() {
                break;
            }
            match socket.recv(&mut buf) {
                Ok(0) => {
                    tracing::debug!(key = %self.key, "connection closed by peer");
                    self.mark_read_error();
                    break;
                }
                Ok(n) => self.process_chunk(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(key = %self.key, error = %e, "read failed");
                    self.mark_read_error();
                    break;
                }
            }
        }
    }

    fn read_async(&self, socket: &dyn AsyncStreamSocket) {
        for _ in 0..self.config.max_reads_per_wakeup {
            if self.is_closing() {
                break;
            }
            let pending = self.state.lock().io_pending;
            assert!(!pending, "second read issued on {} while one is pending", self.key);

            match socket.read(self.config.read_chunk_size.max(1)) {
                AsyncRead::Ready(data) if !data.is_empty() => self.process_chunk(&data),
                AsyncRead::Pending => {
                    self.state.lock().io_pending = true;
                    break;
                }
                AsyncRead::Ready(_) | AsyncRead::Closed => {
                    tracing::debug!(key = %self.key, "connection closed by peer");
                    self.mark_read_error();
                    break;
                }
                AsyncRead::Failed(e) => {
                    tracing::warn!(key = %self.key, error = %e, "read failed");
                    self.mark_read_error();
                    break;
                }
            }
        }
    }

    /// Run one chunk of socket data through the scanner.
    fn process_chunk(&self, data: &[u8]) {
        let mut pos = 0;
        while pos < data.len() {
            let step = {
                let mut st = self.state.lock();
                if st.pending_self_destruct {
                    st.unprocessed.extend_from_slice(&data[pos..]);
                    return;
                }
                st.next_step(self.key, &data[pos..])
            };

            match step {
                Step::Advance(n) => pos += n,
                Step::Passthrough(handler, byte) => {
                    pos += 1;
                    handler(byte);
                }
                Step::Deliver {
                    endpoint,
                    frame,
                    header_bytes,
                } => {
                    pos += header_bytes;
                    let progress = endpoint.consume_payload_bytes(frame, &data[pos..]);
                    pos += progress.consumed;
                    {
                        let mut st = self.state.lock();
                        st.parser = st.parser.advance_payload(progress.consumed);
                        if st.parser.payload_remaining().is_some() {
                            st.frame = progress.frame;
                        }
                    }
                }
            }
        }
    }

    /// Release every channel and hand the socket back. Runs at most once.
    pub(crate) fn tear_down(&self, registry: &SocketRegistry) {
        let (channels, passthrough, leftover, read_error) = {
            let mut st = self.state.lock();
            if st.destroyed {
                return;
            }
            st.destroyed = true;
            st.pending_self_destruct = false;
            st.frame = None;
            (
                std::mem::take(&mut st.channels),
                st.passthrough.take(),
                std::mem::take(&mut st.unprocessed),
                st.read_error,
            )
        };

        if !self.transport.is_async() {
            registry.scheduler().unwatch_readable(self.key);
        }
        tracing::debug!(
            key = %self.key,
            read_error,
            bound_channels = channels.len(),
            "socket descriptor torn down"
        );

        for (channel, endpoint) in channels {
            if let Some(endpoint) = endpoint.upgrade() {
                endpoint.forget_binding(Binding {
                    key: self.key,
                    channel,
                });
            }
        }

        if let Some(handler) = passthrough {
            if !read_error {
                for byte in leftover.into_iter().filter(|b| !framing::is_sentinel(*b)) {
                    handler(byte);
                }
            }
            handler(if read_error {
                ERROR_SENTINEL
            } else {
                CLOSE_SENTINEL
            });
        }
    }
}

impl std::fmt::Debug for SocketDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("SocketDescriptor")
            .field("key", &self.key)
            .field("parser", &st.parser)
            .field("channels", &st.channels.keys().collect::<Vec<_>>())
            .field("read_error", &st.read_error)
            .field("destroyed", &st.destroyed)
            .finish()
    }
}
