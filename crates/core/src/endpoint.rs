//! The media-session side of interleaving: one RTP or RTCP stream.
//!
//! A [`MediaEndpoint`] can be reachable on any number of `(socket,
//! channel)` pairs plus an optional UDP fallback. Sending fans out to all
//! of them. Receiving is driven by the [`SocketDescriptor`](crate::SocketDescriptor)
//! of each bound socket, which hands payload bytes over as a
//! [`PendingFrame`] until the packet is complete.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::error::{InterleaveError, Result};
use crate::registry::SocketRegistry;
use crate::transport::tcp;
use crate::transport::{StreamTransport, TransportKey, UdpFallback};

/// One `(socket, channel)` pair an endpoint is reachable on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Binding {
    pub key: TransportKey,
    pub channel: u8,
}

/// A fully reassembled interleaved packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub binding: Binding,
    pub payload: Vec<u8>,
}

/// Payload of a frame whose header has been parsed but whose bytes have
/// not all arrived yet. Owned by whoever is currently feeding it bytes.
#[derive(Debug)]
pub struct PendingFrame {
    binding: Binding,
    remaining: usize,
    payload: Vec<u8>,
    /// No packet handler was installed while bytes arrived.
    discarding: bool,
}

impl PendingFrame {
    pub(crate) fn new(binding: Binding, len: usize) -> Self {
        Self {
            binding,
            remaining: len,
            payload: Vec::with_capacity(len),
            discarding: false,
        }
    }

    pub fn binding(&self) -> Binding {
        self.binding
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

/// Outcome of one [`MediaEndpoint::consume_payload_bytes`] call.
#[derive(Debug)]
pub struct PayloadProgress {
    pub consumed: usize,
    /// The frame to resume with, `None` once it is complete.
    pub frame: Option<PendingFrame>,
}

impl PayloadProgress {
    pub fn is_complete(&self) -> bool {
        self.frame.is_none()
    }
}

pub type PacketHandler = Arc<dyn Fn(ReceivedPacket) + Send + Sync>;

/// Sees every packet before the packet handler does.
pub type AuxHandler = Arc<dyn Fn(&ReceivedPacket) + Send + Sync>;

/// Told about every binding that goes away, for whatever reason.
pub type UnbindHandler = Arc<dyn Fn(Binding) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    packet: Option<PacketHandler>,
    aux: Option<AuxHandler>,
    unbind: Option<UnbindHandler>,
}

pub struct MediaEndpoint {
    label: String,
    registry: SocketRegistry,
    self_ref: Weak<MediaEndpoint>,
    bindings: Mutex<Vec<(StreamTransport, u8)>>,
    udp: RwLock<Option<UdpFallback>>,
    handlers: Mutex<Handlers>,
}

impl MediaEndpoint {
    pub fn new(registry: &SocketRegistry, label: &str) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            label: label.to_string(),
            registry: registry.clone(),
            self_ref: self_ref.clone(),
            bindings: Mutex::new(Vec::new()),
            udp: RwLock::new(None),
            handlers: Mutex::new(Handlers::default()),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.bindings
            .lock()
            .iter()
            .map(|(transport, channel)| Binding {
                key: transport.key(),
                channel: *channel,
            })
            .collect()
    }

    pub fn is_bound(&self, key: TransportKey, channel: u8) -> bool {
        self.bindings
            .lock()
            .iter()
            .any(|(t, c)| t.key() == key && *c == channel)
    }

    pub fn is_reading(&self) -> bool {
        self.handlers.lock().packet.is_some()
    }

    pub fn set_udp_fallback(&self, udp: Option<UdpFallback>) {
        *self.udp.write() = udp;
    }

    pub fn has_udp_fallback(&self) -> bool {
        self.udp.read().is_some()
    }

    pub fn set_aux_handler(&self, handler: Option<AuxHandler>) {
        self.handlers.lock().aux = handler;
    }

    pub fn set_unbind_handler(&self, handler: Option<UnbindHandler>) {
        self.handlers.lock().unbind = handler;
    }

    /// Make this endpoint reachable on `channel` of `transport`.
    ///
    /// Binding the same pair twice is a no-op.
    ///
    /// # Panics
    ///
    /// If another live endpoint already listens on that channel.
    pub fn bind_to_socket(&self, transport: StreamTransport, channel: u8) {
        let key = transport.key();
        {
            let mut bindings = self.bindings.lock();
            if bindings.iter().any(|(t, c)| t.key() == key && *c == channel) {
                return;
            }
            bindings.push((transport.clone(), channel));
        }
        tracing::debug!(endpoint = %self.label, %key, channel, "bound to socket");
        self.register(&transport, channel);
    }

    /// Switch from UDP to interleaved TCP.
    pub fn set_stream_socket(&self, transport: StreamTransport, channel: u8) {
        self.set_udp_fallback(None);
        self.bind_to_socket(transport, channel);
    }

    /// Release one `(socket, channel)` pair.
    pub fn unbind_from_socket(&self, key: TransportKey, channel: u8) {
        let removed = {
            let mut bindings = self.bindings.lock();
            match bindings
                .iter()
                .position(|(t, c)| t.key() == key && *c == channel)
            {
                Some(pos) => {
                    bindings.remove(pos);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.release(Binding { key, channel });
        }
    }

    /// Release every channel this endpoint has on `key`.
    pub fn remove_stream_socket(&self, key: TransportKey) {
        let channels: Vec<u8> = {
            let mut bindings = self.bindings.lock();
            let channels = bindings
                .iter()
                .filter(|(t, _)| t.key() == key)
                .map(|(_, c)| *c)
                .collect();
            bindings.retain(|(t, _)| t.key() != key);
            channels
        };
        for channel in channels {
            self.release(Binding { key, channel });
        }
    }

    /// Install the packet handler and (re)register every binding.
    pub fn start_network_reading(&self, handler: PacketHandler) {
        self.handlers.lock().packet = Some(handler);
        let bindings = self.bindings.lock().clone();
        for (transport, channel) in &bindings {
            self.register(transport, *channel);
        }
        for (transport, _) in &bindings {
            self.registry.start_reading(transport.key());
        }
    }

    /// Clear the packet handler and deregister every binding. The bindings
    /// themselves are kept, so reading can be restarted.
    pub fn stop_network_reading(&self) {
        self.handlers.lock().packet = None;
        let bindings = self.bindings();
        for binding in bindings {
            self.registry.deregister(binding.key, binding.channel, &self.self_ref);
        }
    }

    /// Send `payload` on the UDP fallback and on every bound channel.
    ///
    /// Every path is attempted; returns `false` if any of them failed.
    pub fn send_packet(&self, payload: &[u8]) -> bool {
        let mut ok = true;
        if let Some(udp) = self.udp.read().as_ref() {
            ok &= udp.send(payload);
        }
        let bindings = self.bindings.lock().clone();
        for (transport, channel) in &bindings {
            ok &= self.send_on(transport, *channel, payload);
        }
        ok
    }

    /// Send one frame on `channel` of the socket identified by `key`.
    pub fn send_framed_over_tcp(&self, key: TransportKey, channel: u8, payload: &[u8]) -> bool {
        match self.transport_for(key) {
            Ok(transport) => self.send_on(&transport, channel, payload),
            Err(e) => {
                tracing::warn!(endpoint = %self.label, error = %e, "cannot send framed packet");
                false
            }
        }
    }

    /// Take up to `data.len()` bytes of `frame`'s payload.
    ///
    /// Delivers the packet when the last byte arrives. Without a packet
    /// handler the bytes are consumed and thrown away.
    pub fn consume_payload_bytes(&self, mut frame: PendingFrame, data: &[u8]) -> PayloadProgress {
        let consumed = frame.remaining.min(data.len());
        if !self.is_reading() && !frame.discarding {
            frame.discarding = true;
            frame.payload = Vec::new();
        }
        if !frame.discarding {
            frame.payload.extend_from_slice(&data[..consumed]);
        }
        frame.remaining -= consumed;

        if frame.remaining > 0 {
            return PayloadProgress {
                consumed,
                frame: Some(frame),
            };
        }

        if frame.discarding {
            tracing::trace!(
                endpoint = %self.label,
                channel = frame.binding.channel,
                "no packet handler, payload discarded"
            );
        } else {
            self.deliver(ReceivedPacket {
                binding: frame.binding,
                payload: frame.payload,
            });
        }
        PayloadProgress {
            consumed,
            frame: None,
        }
    }

    /// The descriptor behind `binding` is gone; drop the binding without
    /// talking to the registry again.
    pub(crate) fn forget_binding(&self, binding: Binding) {
        let removed = {
            let mut bindings = self.bindings.lock();
            let before = bindings.len();
            bindings.retain(|(t, c)| !(t.key() == binding.key && *c == binding.channel));
            bindings.len() != before
        };
        if removed {
            tracing::debug!(
                endpoint = %self.label,
                key = %binding.key,
                channel = binding.channel,
                "binding lost with its socket"
            );
            self.notify_unbound(binding);
        }
    }

    fn register(&self, transport: &StreamTransport, channel: u8) {
        if let Some(this) = self.self_ref.upgrade() {
            self.registry.register(transport, channel, &this);
        }
    }

    fn release(&self, binding: Binding) {
        tracing::debug!(
            endpoint = %self.label,
            key = %binding.key,
            channel = binding.channel,
            "unbound from socket"
        );
        self.registry.deregister(binding.key, binding.channel, &self.self_ref);
        self.notify_unbound(binding);
    }

    fn notify_unbound(&self, binding: Binding) {
        let handler = self.handlers.lock().unbind.clone();
        if let Some(handler) = handler {
            handler(binding);
        }
    }

    fn deliver(&self, packet: ReceivedPacket) {
        let (aux, packet_handler) = {
            let handlers = self.handlers.lock();
            (handlers.aux.clone(), handlers.packet.clone())
        };
        tracing::trace!(
            endpoint = %self.label,
            channel = packet.binding.channel,
            size = packet.payload.len(),
            "packet received"
        );
        if let Some(aux) = aux {
            aux(&packet);
        }
        if let Some(handler) = packet_handler {
            handler(packet);
        }
    }

    fn transport_for(&self, key: TransportKey) -> Result<StreamTransport> {
        let bound = self
            .bindings
            .lock()
            .iter()
            .find(|(t, _)| t.key() == key)
            .map(|(t, _)| t.clone());
        bound
            .or_else(|| self.registry.find(key).map(|d| d.transport().clone()))
            .ok_or(InterleaveError::UnknownTransport(key))
    }

    fn send_on(&self, transport: &StreamTransport, channel: u8, payload: &[u8]) -> bool {
        let timeout = self.registry.config().blocking_send_timeout;
        match tcp::send_framed(transport, channel, payload, timeout) {
            Ok(()) => true,
            Err(InterleaveError::WouldBlock) => {
                tracing::trace!(endpoint = %self.label, key = %transport.key(), channel, "send buffer full, frame dropped");
                false
            }
            Err(e @ InterleaveError::PayloadTooLarge(_)) => {
                tracing::warn!(endpoint = %self.label, channel, error = %e, "frame not sent");
                false
            }
            Err(e) => {
                let key = transport.key();
                tracing::warn!(endpoint = %self.label, %key, channel, error = %e, "send failed, dropping socket");
                self.registry.fail_transport(key);
                self.remove_stream_socket(key);
                false
            }
        }
    }
}

impl Drop for MediaEndpoint {
    fn drop(&mut self) {
        let bindings = std::mem::take(self.bindings.get_mut());
        for (transport, channel) in bindings {
            self.registry.deregister(transport.key(), channel, &self.self_ref);
        }
    }
}

impl std::fmt::Debug for MediaEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaEndpoint")
            .field("label", &self.label)
            .field("bindings", &self.bindings())
            .field("udp", &*self.udp.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{ERROR_SENTINEL, encode_frame};
    use crate::testing::{RecordingScheduler, ScriptedSocket};
    use std::net::UdpSocket;
    use std::time::Duration;

    fn setup() -> (SocketRegistry, Arc<ScriptedSocket>, StreamTransport) {
        let registry = SocketRegistry::new(Arc::new(RecordingScheduler::new()));
        let socket = Arc::new(ScriptedSocket::new(5));
        let transport = StreamTransport::Sync(socket.clone());
        (registry, socket, transport)
    }

    fn collect(endpoint: &MediaEndpoint) -> Arc<Mutex<Vec<ReceivedPacket>>> {
        let packets = Arc::new(Mutex::new(Vec::new()));
        let sink = packets.clone();
        endpoint.start_network_reading(Arc::new(move |p| sink.lock().push(p)));
        packets
    }

    #[test]
    fn bind_twice_is_noop() {
        let (registry, _socket, transport) = setup();
        let rtp = MediaEndpoint::new(&registry, "rtp");
        rtp.bind_to_socket(transport.clone(), 0);
        rtp.bind_to_socket(transport.clone(), 0);
        assert_eq!(rtp.bindings().len(), 1);
        assert_eq!(registry.find(transport.key()).unwrap().channel_count(), 1);
    }

    #[test]
    fn unbind_last_channel_releases_descriptor() {
        let (registry, _socket, transport) = setup();
        let rtp = MediaEndpoint::new(&registry, "rtp");
        let lost = Arc::new(Mutex::new(Vec::new()));
        let sink = lost.clone();
        rtp.set_unbind_handler(Some(Arc::new(move |b| sink.lock().push(b))));

        rtp.bind_to_socket(transport.clone(), 0);
        rtp.bind_to_socket(transport.clone(), 1);
        rtp.unbind_from_socket(transport.key(), 0);
        assert!(registry.find(transport.key()).is_some());
        rtp.unbind_from_socket(transport.key(), 1);
        assert!(registry.find(transport.key()).is_none());
        assert_eq!(lost.lock().len(), 2);
    }

    #[test]
    fn remove_stream_socket_drops_every_channel_on_key() {
        let (registry, _socket, transport) = setup();
        let other = StreamTransport::Sync(Arc::new(ScriptedSocket::new(6)));
        let rtp = MediaEndpoint::new(&registry, "rtp");
        rtp.bind_to_socket(transport.clone(), 0);
        rtp.bind_to_socket(transport.clone(), 1);
        rtp.bind_to_socket(other.clone(), 0);

        rtp.remove_stream_socket(transport.key());
        assert_eq!(
            rtp.bindings(),
            vec![Binding {
                key: other.key(),
                channel: 0
            }]
        );
        assert!(registry.find(transport.key()).is_none());
        assert!(registry.find(other.key()).is_some());
    }

    #[test]
    fn set_stream_socket_replaces_udp() {
        let (registry, _socket, transport) = setup();
        let rtp = MediaEndpoint::new(&registry, "rtp");
        rtp.set_udp_fallback(Some(UdpFallback::bind("127.0.0.1:0").unwrap()));
        rtp.set_stream_socket(transport, 2);
        assert!(!rtp.has_udp_fallback());
        assert_eq!(rtp.bindings().len(), 1);
    }

    #[test]
    fn drop_deregisters_bindings() {
        let (registry, _socket, transport) = setup();
        let rtp = MediaEndpoint::new(&registry, "rtp");
        rtp.bind_to_socket(transport.clone(), 0);
        drop(rtp);
        assert!(registry.is_empty());
    }

    #[test]
    fn stop_reading_keeps_bindings() {
        let (registry, socket, transport) = setup();
        let rtp = MediaEndpoint::new(&registry, "rtp");
        rtp.bind_to_socket(transport.clone(), 0);
        let packets = collect(&rtp);

        rtp.stop_network_reading();
        assert!(registry.find(transport.key()).is_none());
        assert_eq!(rtp.bindings().len(), 1);

        let sink = packets.clone();
        rtp.start_network_reading(Arc::new(move |p| sink.lock().push(p)));
        socket.push_read(&encode_frame(0, b"back").unwrap());
        registry.handle_readable(transport.key());
        assert_eq!(packets.lock()[0].payload, b"back");
    }

    #[test]
    fn payload_without_handler_is_discarded() {
        let (registry, socket, transport) = setup();
        let rtp = MediaEndpoint::new(&registry, "rtp");
        let rtcp = MediaEndpoint::new(&registry, "rtcp");
        rtp.bind_to_socket(transport.clone(), 0);
        rtcp.bind_to_socket(transport.clone(), 1);
        let rtcp_packets = collect(&rtcp);

        let mut stream = encode_frame(0, b"ignored").unwrap();
        stream.extend(encode_frame(1, b"report").unwrap());
        socket.push_read(&stream);
        registry.handle_readable(transport.key());

        let got = rtcp_packets.lock();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, b"report");
    }

    #[test]
    fn aux_handler_sees_packet_first() {
        let (registry, socket, transport) = setup();
        let rtp = MediaEndpoint::new(&registry, "rtp");
        rtp.bind_to_socket(transport.clone(), 0);
        let order = Arc::new(Mutex::new(Vec::new()));
        let aux_order = order.clone();
        rtp.set_aux_handler(Some(Arc::new(move |_| aux_order.lock().push("aux"))));
        let main_order = order.clone();
        rtp.start_network_reading(Arc::new(move |_| main_order.lock().push("main")));

        socket.push_read(&encode_frame(0, b"x").unwrap());
        registry.handle_readable(transport.key());
        assert_eq!(*order.lock(), vec!["aux", "main"]);
    }

    #[test]
    fn consume_reports_progress() {
        let (registry, _socket, transport) = setup();
        let rtp = MediaEndpoint::new(&registry, "rtp");
        let packets = collect(&rtp);
        let binding = Binding {
            key: transport.key(),
            channel: 0,
        };

        let progress = rtp.consume_payload_bytes(PendingFrame::new(binding, 5), b"abc");
        assert_eq!(progress.consumed, 3);
        let frame = progress.frame.unwrap();
        assert_eq!(frame.remaining(), 2);

        let progress = rtp.consume_payload_bytes(frame, b"defgh");
        assert_eq!(progress.consumed, 2);
        assert!(progress.is_complete());
        assert_eq!(packets.lock()[0].payload, b"abcde");
    }

    #[test]
    fn send_fans_out_to_udp_and_every_binding() {
        let (registry, socket, transport) = setup();
        let second = Arc::new(ScriptedSocket::new(6));
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let rtp = MediaEndpoint::new(&registry, "rtp");
        let udp = UdpFallback::bind("127.0.0.1:0").unwrap();
        udp.add_destination(receiver.local_addr().unwrap());
        rtp.set_udp_fallback(Some(udp));
        rtp.bind_to_socket(transport, 0);
        rtp.bind_to_socket(StreamTransport::Sync(second.clone()), 4);

        assert!(rtp.send_packet(b"pkt"));
        assert_eq!(socket.written(), encode_frame(0, b"pkt").unwrap());
        assert_eq!(second.written(), encode_frame(4, b"pkt").unwrap());
        let mut buf = [0u8; 8];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pkt");
    }

    #[test]
    fn send_failure_unbinds_and_tears_down_socket() {
        let (registry, socket, transport) = setup();
        let healthy = Arc::new(ScriptedSocket::new(6));
        let rtp = MediaEndpoint::new(&registry, "rtp");
        let rtcp = MediaEndpoint::new(&registry, "rtcp");
        rtp.bind_to_socket(transport.clone(), 0);
        rtcp.bind_to_socket(transport.clone(), 1);
        rtp.bind_to_socket(StreamTransport::Sync(healthy.clone()), 0);

        let lost = Arc::new(Mutex::new(Vec::new()));
        let sink = lost.clone();
        rtcp.set_unbind_handler(Some(Arc::new(move |b| sink.lock().push(b))));
        let bytes = Arc::new(Mutex::new(Vec::new()));
        let sink = bytes.clone();
        registry
            .set_passthrough_handler(transport.key(), Arc::new(move |b| sink.lock().push(b)))
            .unwrap();

        socket.fail_sends();
        assert!(!rtp.send_packet(b"pkt"));

        assert_eq!(healthy.written(), encode_frame(0, b"pkt").unwrap());
        assert_eq!(rtp.bindings().len(), 1);
        assert!(rtcp.bindings().is_empty());
        assert_eq!(
            *lost.lock(),
            vec![Binding {
                key: transport.key(),
                channel: 1
            }]
        );
        assert!(registry.find(transport.key()).is_none());
        assert_eq!(*bytes.lock(), vec![ERROR_SENTINEL]);
    }

    #[test]
    fn would_block_drops_frame_but_keeps_binding() {
        let (registry, socket, transport) = setup();
        let rtp = MediaEndpoint::new(&registry, "rtp");
        rtp.bind_to_socket(transport.clone(), 0);
        socket.limit_nonblocking_sends(0);
        assert!(!rtp.send_framed_over_tcp(transport.key(), 0, b"pkt"));
        assert_eq!(rtp.bindings().len(), 1);
        assert!(registry.find(transport.key()).is_some());
    }

    #[test]
    fn framed_send_to_unknown_socket_fails() {
        let (registry, _socket, _transport) = setup();
        let rtp = MediaEndpoint::new(&registry, "rtp");
        assert!(!rtp.send_framed_over_tcp(TransportKey::Socket(99), 0, b"x"));
    }

    #[test]
    #[should_panic(expected = "already bound to another endpoint")]
    fn double_registration_panics() {
        let (registry, _socket, transport) = setup();
        let a = MediaEndpoint::new(&registry, "a");
        let b = MediaEndpoint::new(&registry, "b");
        a.bind_to_socket(transport.clone(), 0);
        b.bind_to_socket(transport, 0);
    }

    #[test]
    fn dropping_stopped_endpoint_leaves_new_owner_bound() {
        let (registry, socket, transport) = setup();
        let a = MediaEndpoint::new(&registry, "a");
        a.bind_to_socket(transport.clone(), 0);
        let _a_packets = collect(&a);
        a.stop_network_reading();

        let b = MediaEndpoint::new(&registry, "b");
        b.bind_to_socket(transport.clone(), 0);
        let b_packets = collect(&b);

        drop(a);
        let descriptor = registry.find(transport.key()).unwrap();
        assert!(descriptor.has_channel(0));
        assert!(Arc::ptr_eq(&descriptor.lookup(0).unwrap(), &b));

        socket.push_read(&encode_frame(0, b"for-b").unwrap());
        registry.handle_readable(transport.key());
        assert_eq!(b_packets.lock().len(), 1);
        assert_eq!(b_packets.lock()[0].payload, b"for-b");
    }

    #[test]
    fn stale_unbind_does_not_release_other_endpoint() {
        let (registry, _socket, transport) = setup();
        let a = MediaEndpoint::new(&registry, "a");
        a.bind_to_socket(transport.clone(), 0);
        a.stop_network_reading();

        let b = MediaEndpoint::new(&registry, "b");
        b.bind_to_socket(transport.clone(), 0);

        a.unbind_from_socket(transport.key(), 0);
        assert!(a.bindings().is_empty());
        assert!(b.is_bound(transport.key(), 0));
        let owner = registry.find(transport.key()).unwrap().lookup(0).unwrap();
        assert_eq!(owner.label(), "b");

        b.stop_network_reading();
        assert!(registry.is_empty());
    }
}
