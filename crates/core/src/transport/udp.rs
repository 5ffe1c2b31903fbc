use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::Result;

/// Datagram path used by a [`MediaEndpoint`](crate::MediaEndpoint) that is
/// not (or not only) interleaved over TCP.
///
/// Sends every packet to each configured destination. This layer is
/// address-only; it knows nothing about channels or framing.
pub struct UdpFallback {
    socket: Arc<UdpSocket>,
    destinations: RwLock<Vec<SocketAddr>>,
}

impl UdpFallback {
    /// Bind a non-blocking socket at `addr` (use port 0 for an ephemeral one).
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self::from_socket(Arc::new(socket)))
    }

    pub fn from_socket(socket: Arc<UdpSocket>) -> Self {
        Self {
            socket,
            destinations: RwLock::new(Vec::new()),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn add_destination(&self, addr: SocketAddr) {
        let mut destinations = self.destinations.write();
        if !destinations.contains(&addr) {
            destinations.push(addr);
        }
    }

    pub fn remove_all_destinations(&self) {
        self.destinations.write().clear();
    }

    pub fn destinations(&self) -> Vec<SocketAddr> {
        self.destinations.read().clone()
    }

    /// Send `payload` to every destination. Returns `false` if any send failed.
    pub fn send(&self, payload: &[u8]) -> bool {
        let mut ok = true;
        for addr in self.destinations.read().iter() {
            if let Err(e) = self.socket.send_to(payload, addr) {
                tracing::debug!(%addr, error = %e, "UDP send failed");
                ok = false;
            }
        }
        ok
    }
}

impl std::fmt::Debug for UdpFallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpFallback")
            .field("local_addr", &self.socket.local_addr().ok())
            .field("destinations", &*self.destinations.read())
            .finish()
    }
}
