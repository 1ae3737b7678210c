//! In-process relay transport.
//!
//! [`MemoryConnection`] is a reliable, ordered byte pipe. [`MemoryRelayHub`]
//! plays the relay: an authority registers its connection data, and a
//! participant whose descriptor names that data as `host_connection_data` is
//! paired with it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};

use tokio::sync::{Mutex, mpsc};

use crate::{Connection, ConnectionDescriptor, ConnectionId, Incoming, PeerTransport, TransportError};

static NEXT_MEMORY_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> ConnectionId {
    ConnectionId::new(NEXT_MEMORY_ID.fetch_add(1, Ordering::Relaxed))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// One end of an in-memory connection.
pub struct MemoryConnection {
    id: ConnectionId,
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl MemoryConnection {
    /// Creates two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let a = Self {
            id: next_id(),
            tx: Mutex::new(Some(a_tx)),
            rx: Mutex::new(a_rx),
        };
        let b = Self {
            id: next_id(),
            tx: Mutex::new(Some(b_tx)),
            rx: Mutex::new(b_rx),
        };
        (a, b)
    }
}

impl Connection for MemoryConnection {
    type Error = TransportError;

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let tx = self.tx.lock().await;
        match tx.as_ref() {
            Some(tx) => tx
                .send(data.to_vec())
                .map_err(|_| TransportError::ConnectionClosed("peer dropped the connection".into())),
            None => Err(TransportError::ConnectionClosed("connection closed locally".into())),
        }
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.rx.lock().await.recv().await)
    }

    // Only the sending half is dropped, so a reader blocked in `recv` is not
    // contended. The peer observes end of stream after draining.
    async fn close(&self) -> Result<(), TransportError> {
        if self.tx.lock().await.take().is_some() {
            tracing::debug!(id = %self.id, "memory connection closed");
        }
        Ok(())
    }

    fn id(&self) -> ConnectionId {
        self.id
    }
}

// ---------------------------------------------------------------------------
// Relay hub
// ---------------------------------------------------------------------------

/// Routes participants to the authority registered under their host
/// connection data.
#[derive(Default)]
pub struct MemoryRelayHub {
    authorities: std::sync::Mutex<HashMap<String, mpsc::UnboundedSender<MemoryConnection>>>,
}

impl MemoryRelayHub {
    /// Creates an empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn authorities(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<MemoryConnection>>> {
        self.authorities.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, connection_data: &[u8]) -> Result<Incoming<MemoryConnection>, TransportError> {
        let key = hex(connection_data);
        let mut authorities = self.authorities();
        if authorities.get(&key).is_some_and(|tx| !tx.is_closed()) {
            return Err(TransportError::StartFailed(format!(
                "authority already registered for {key}"
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        authorities.insert(key.clone(), tx);
        tracing::info!(authority = %key, "authority registered on relay");
        Ok(rx)
    }

    fn unregister(&self, connection_data: &[u8]) {
        let key = hex(connection_data);
        if self.authorities().remove(&key).is_some() {
            tracing::info!(authority = %key, "authority removed from relay");
        }
    }

    fn connect(&self, host_connection_data: &[u8]) -> Result<MemoryConnection, TransportError> {
        let key = hex(host_connection_data);
        let mut authorities = self.authorities();
        let Some(accept) = authorities.get(&key) else {
            return Err(TransportError::NoAuthority(key));
        };
        let (local, remote) = MemoryConnection::pair();
        if accept.send(remote).is_err() {
            authorities.remove(&key);
            return Err(TransportError::NoAuthority(key));
        }
        tracing::debug!(authority = %key, id = %local.id(), "participant paired through relay");
        Ok(local)
    }

    /// Returns the number of registered authorities.
    pub fn authority_count(&self) -> usize {
        self.authorities().len()
    }
}

/// A [`PeerTransport`] backed by a [`MemoryRelayHub`].
pub struct MemoryTransport {
    hub: Arc<MemoryRelayHub>,
    registered: std::sync::Mutex<Option<Vec<u8>>>,
}

impl MemoryTransport {
    /// Creates a transport that reaches peers through `hub`.
    pub fn new(hub: Arc<MemoryRelayHub>) -> Self {
        Self {
            hub,
            registered: std::sync::Mutex::new(None),
        }
    }

    fn validate(descriptor: &ConnectionDescriptor) -> Result<(), TransportError> {
        if descriptor.key.is_empty() || descriptor.connection_data.is_empty() {
            return Err(TransportError::StartFailed(
                "descriptor is missing key material or connection data".into(),
            ));
        }
        Ok(())
    }
}

impl PeerTransport for MemoryTransport {
    type Connection = MemoryConnection;

    async fn start_as_authority(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Incoming<MemoryConnection>, TransportError> {
        Self::validate(descriptor)?;
        if !descriptor.is_authority() {
            return Err(TransportError::StartFailed(
                "participant descriptor used to start an authority".into(),
            ));
        }
        let incoming = self.hub.register(&descriptor.connection_data)?;
        *self.registered.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(descriptor.connection_data.clone());
        Ok(incoming)
    }

    async fn start_as_participant(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<MemoryConnection, TransportError> {
        Self::validate(descriptor)?;
        let Some(host) = descriptor.host_connection_data.as_deref() else {
            return Err(TransportError::StartFailed(
                "descriptor has no host connection data".into(),
            ));
        };
        self.hub.connect(host)
    }

    async fn shutdown(&self) {
        let registered = self
            .registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(data) = registered {
            self.hub.unregister(&data);
        }
    }
}
