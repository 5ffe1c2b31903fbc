//! Lookup from physical socket to its [`SocketDescriptor`].
//!
//! One registry serves one event loop. It is a cheap, cloneable handle;
//! endpoints keep a clone so they can register and release channels, and
//! the event loop uses it to dispatch readiness and read completions.
//!
//! The registry holds the only strong reference to each descriptor.
//! Teardown removes the entry first and then lets the descriptor release
//! its channels, so a handler that reacts to the teardown by binding the
//! same socket again gets a fresh descriptor.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::InterleaveConfig;
use crate::descriptor::{PassthroughHandler, SocketDescriptor};
use crate::endpoint::MediaEndpoint;
use crate::error::{InterleaveError, Result};
use crate::scheduler::ReadinessScheduler;
use crate::transport::{AsyncRead, StreamTransport, TransportKey};

#[derive(Clone)]
pub struct SocketRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    descriptors: Mutex<HashMap<TransportKey, Arc<SocketDescriptor>>>,
    /// Completion-driven sockets released with a read still in flight.
    orphaned_reads: Mutex<HashSet<TransportKey>>,
    scheduler: Arc<dyn ReadinessScheduler>,
    config: Arc<InterleaveConfig>,
}

impl SocketRegistry {
    pub fn new(scheduler: Arc<dyn ReadinessScheduler>) -> Self {
        Self::with_config(scheduler, InterleaveConfig::default())
    }

    pub fn with_config(scheduler: Arc<dyn ReadinessScheduler>, config: InterleaveConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                descriptors: Mutex::new(HashMap::new()),
                orphaned_reads: Mutex::new(HashSet::new()),
                scheduler,
                config: Arc::new(config),
            }),
        }
    }

    pub fn config(&self) -> &InterleaveConfig {
        &self.inner.config
    }

    pub(crate) fn scheduler(&self) -> &dyn ReadinessScheduler {
        self.inner.scheduler.as_ref()
    }

    pub fn find(&self, key: TransportKey) -> Option<Arc<SocketDescriptor>> {
        self.inner.descriptors.lock().get(&key).cloned()
    }

    /// Descriptor for `transport`, created on first use.
    ///
    /// A new descriptor adopts a read its predecessor left in flight, so the
    /// socket never has two reads outstanding.
    pub fn find_or_create(&self, transport: &StreamTransport) -> Arc<SocketDescriptor> {
        let key = transport.key();
        let mut descriptors = self.inner.descriptors.lock();
        descriptors
            .entry(key)
            .or_insert_with(|| {
                let read_pending = self.inner.orphaned_reads.lock().remove(&key);
                tracing::debug!(%key, read_pending, "socket descriptor created");
                Arc::new(SocketDescriptor::new(
                    transport.clone(),
                    self.inner.config.clone(),
                    read_pending,
                ))
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner.descriptors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.descriptors.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<TransportKey> {
        let mut keys: Vec<_> = self.inner.descriptors.lock().keys().copied().collect();
        keys.sort();
        keys
    }

    /// The scheduler reports `key` readable.
    pub fn handle_readable(&self, key: TransportKey) {
        match self.find(key) {
            Some(descriptor) => descriptor.drive_read_loop(self),
            None => tracing::trace!(%key, "readable socket has no descriptor"),
        }
    }

    /// A pending read on a completion-driven socket finished.
    pub fn on_async_read_complete(&self, key: TransportKey, result: AsyncRead) {
        match self.find(key) {
            Some(descriptor) => descriptor.on_async_read_complete(self, result),
            None => {
                self.inner.orphaned_reads.lock().remove(&key);
                tracing::debug!(%key, "read completion for a released socket, data dropped");
            }
        }
    }

    /// Issue reads on a completion-driven socket unless one is already in
    /// flight. Readiness-driven sockets are read by the scheduler instead.
    pub fn start_reading(&self, key: TransportKey) {
        if let Some(descriptor) = self.find(key) {
            if descriptor.transport().is_async() && !descriptor.is_read_pending() {
                descriptor.drive_read_loop(self);
            }
        }
    }

    /// Route non-frame bytes of `key` to `handler`.
    ///
    /// Fails with [`InterleaveError::UnknownTransport`] when no channel is
    /// bound on that socket.
    pub fn set_passthrough_handler(&self, key: TransportKey, handler: PassthroughHandler) -> Result<()> {
        let descriptor = self.find(key).ok_or(InterleaveError::UnknownTransport(key))?;
        descriptor.set_passthrough_handler(Some(handler));
        Ok(())
    }

    /// Stop routing non-frame bytes of `key`; they are discarded from now on.
    pub fn clear_passthrough_handler(&self, key: TransportKey) {
        if let Some(descriptor) = self.find(key) {
            descriptor.set_passthrough_handler(None);
        }
    }

    pub(crate) fn register(&self, transport: &StreamTransport, channel: u8, endpoint: &Arc<MediaEndpoint>) {
        self.find_or_create(transport)
            .register_endpoint(self, channel, endpoint);
    }

    pub(crate) fn deregister(&self, key: TransportKey, channel: u8, owner: &Weak<MediaEndpoint>) {
        if let Some(descriptor) = self.find(key) {
            descriptor.deregister_endpoint(self, channel, owner);
        }
    }

    /// Tear down `key` after a send failed on it.
    pub(crate) fn fail_transport(&self, key: TransportKey) {
        if let Some(descriptor) = self.find(key) {
            tracing::debug!(%key, "transport failed, releasing descriptor");
            descriptor.fail(self);
        }
    }

    pub(crate) fn destroy(&self, descriptor: &Arc<SocketDescriptor>) {
        let key = descriptor.key();
        {
            let mut descriptors = self.inner.descriptors.lock();
            if descriptors
                .get(&key)
                .is_some_and(|current| Arc::ptr_eq(current, descriptor))
            {
                descriptors.remove(&key);
                if descriptor.transport().is_async() && descriptor.is_read_pending() {
                    tracing::debug!(%key, "released with a read in flight");
                    self.inner.orphaned_reads.lock().insert(key);
                }
            }
        }
        descriptor.tear_down(self);
    }
}

impl std::fmt::Debug for SocketRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketRegistry")
            .field("descriptors", &self.keys())
            .field("config", &self.inner.config)
            .finish()
    }
}
