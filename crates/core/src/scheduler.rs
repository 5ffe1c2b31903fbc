//! Readiness notification for readiness-driven sockets.
//!
//! A descriptor asks to be watched when its first channel registers and
//! stops being watched when it is torn down. Whoever owns the event loop
//! answers a readable socket by calling
//! [`SocketRegistry::handle_readable`](crate::SocketRegistry::handle_readable).

use parking_lot::Mutex;

use crate::registry::SocketRegistry;
use crate::transport::TransportKey;

/// Level-triggered "socket became readable" registration.
pub trait ReadinessScheduler: Send + Sync {
    fn watch_readable(&self, key: TransportKey);

    fn unwatch_readable(&self, key: TransportKey);
}

/// A cooperative scheduler that simply polls every watched socket.
///
/// Meant for a thread that owns one connection: call [`poll`](Self::poll)
/// in a loop with a short sleep. Sockets that have no data report
/// `WouldBlock` and cost one syscall.
#[derive(Debug, Default)]
pub struct PollingScheduler {
    watched: Mutex<Vec<TransportKey>>,
}

impl PollingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently watched, in registration order.
    pub fn watched(&self) -> Vec<TransportKey> {
        self.watched.lock().clone()
    }

    pub fn is_idle(&self) -> bool {
        self.watched.lock().is_empty()
    }

    /// Drive every watched socket once. Returns how many were driven.
    ///
    /// The watch list is snapshotted first, so handlers may register or
    /// drop sockets while this runs.
    pub fn poll(&self, registry: &SocketRegistry) -> usize {
        let keys = self.watched();
        for key in &keys {
            registry.handle_readable(*key);
        }
        keys.len()
    }
}

impl ReadinessScheduler for PollingScheduler {
    fn watch_readable(&self, key: TransportKey) {
        let mut watched = self.watched.lock();
        if !watched.contains(&key) {
            watched.push(key);
            tracing::trace!(%key, "watching for readability");
        }
    }

    fn unwatch_readable(&self, key: TransportKey) {
        let mut watched = self.watched.lock();
        if let Some(pos) = watched.iter().position(|k| *k == key) {
            watched.remove(pos);
            tracing::trace!(%key, "stopped watching");
        }
    }
}
