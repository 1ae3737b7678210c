//! Transport boundary for hostlink.
//!
//! The core never speaks a network protocol itself. It is handed a reliable,
//! ordered, bidirectional [`Connection`] once a relay
//! [`ConnectionDescriptor`] has been obtained. A [`PeerTransport`] turns a
//! descriptor into either an authority-side accept queue or a single
//! participant-side connection.
//!
//! # Feature Flags
//!
//! - `websocket` (default): WebSocket connections via `tokio-tungstenite`

#![allow(async_fn_in_trait)]

mod error;
pub mod memory;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
pub use memory::{MemoryConnection, MemoryRelayHub, MemoryTransport};
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketClientConnection, WebSocketConnection, WebSocketTransport};

use std::fmt;
use std::future::Future;

use tokio::sync::mpsc;

/// Opaque identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Accepts new incoming connections on a listening socket.
pub trait Transport: Send + Sync + 'static {
    /// The connection type produced by this transport.
    type Connection: Connection;
    /// The error type for transport operations.
    type Error: std::error::Error + Send + Sync;

    /// Waits for and accepts the next incoming connection.
    async fn accept(&mut self) -> Result<Self::Connection, Self::Error>;

    /// Gracefully shuts down the transport, stopping new connections.
    async fn shutdown(&self) -> Result<(), Self::Error>;
}

/// A single reliable, ordered connection that can send and receive bytes.
///
/// The returned futures are `Send` so connections can be driven from
/// spawned tasks. Implementations may still use `async fn`.
pub trait Connection: Send + Sync + 'static {
    /// The error type for connection operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Sends data to the remote peer.
    fn send(&self, data: &[u8]) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Receives the next message from the remote peer.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed.
    fn recv(&self) -> impl Future<Output = Result<Option<Vec<u8>>, Self::Error>> + Send;

    /// Closes the connection.
    fn close(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;
}

// ---------------------------------------------------------------------------
// Relay handoff
// ---------------------------------------------------------------------------

/// Everything a transport needs to reach the relay.
///
/// Built from a host's relay allocation (no `host_connection_data`) or from
/// a joiner's join descriptor (with the host's connection data).
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    /// Relay endpoint host.
    pub endpoint: String,
    /// Relay endpoint port.
    pub port: u16,
    /// Raw allocation id bytes.
    pub allocation_id: Vec<u8>,
    /// Key material for the relay session.
    pub key: Vec<u8>,
    /// This peer's connection data.
    pub connection_data: Vec<u8>,
    /// The authority's connection data, present only for participants.
    pub host_connection_data: Option<Vec<u8>>,
    /// Whether the relay path should be secured.
    pub secure: bool,
}

impl ConnectionDescriptor {
    /// Returns `true` if this descriptor configures the authority side.
    pub fn is_authority(&self) -> bool {
        self.host_connection_data.is_none()
    }
}

// Key material stays out of logs.
impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("endpoint", &self.endpoint)
            .field("port", &self.port)
            .field("allocation_id_len", &self.allocation_id.len())
            .field("key_len", &self.key.len())
            .field("authority", &self.is_authority())
            .field("secure", &self.secure)
            .finish()
    }
}

/// Queue of connections accepted by an authority-side transport.
pub type Incoming<C> = mpsc::UnboundedReceiver<C>;

/// A started transport, handed from the session layer to the peer runtime.
pub enum TransportLink<C> {
    /// The host side: new participants arrive on `incoming`.
    Authority {
        /// Connections accepted through the relay.
        incoming: Incoming<C>,
    },
    /// The joiner side: one connection to the authority.
    Participant {
        /// The connection to the authority.
        connection: C,
    },
}

impl<C> TransportLink<C> {
    /// Returns `true` for the authority side.
    pub fn is_authority(&self) -> bool {
        matches!(self, Self::Authority { .. })
    }
}

impl<C> fmt::Debug for TransportLink<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authority { .. } => f.write_str("TransportLink::Authority"),
            Self::Participant { .. } => f.write_str("TransportLink::Participant"),
        }
    }
}

/// Starts a relayed transport from a [`ConnectionDescriptor`].
pub trait PeerTransport: Send + Sync + 'static {
    /// The connection type this transport produces.
    type Connection: Connection;

    /// Starts as the session authority and returns the accept queue.
    fn start_as_authority(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> impl Future<Output = Result<Incoming<Self::Connection>, TransportError>> + Send;

    /// Starts as a participant and returns the connection to the authority.
    fn start_as_participant(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> impl Future<Output = Result<Self::Connection, TransportError>> + Send;

    /// Stops the transport. Existing connections are left to their owners.
    fn shutdown(&self) -> impl Future<Output = ()> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(host: Option<Vec<u8>>) -> ConnectionDescriptor {
        ConnectionDescriptor {
            endpoint: "127.0.0.1".into(),
            port: 7777,
            allocation_id: vec![1; 16],
            key: vec![9; 64],
            connection_data: vec![2; 16],
            host_connection_data: host,
            secure: true,
        }
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId::new(7);
        assert_eq!(id.to_string(), "conn-7");
        assert_eq!(id.into_inner(), 7);
    }

    #[test]
    fn test_connection_id_hash_works_as_map_key() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(ConnectionId::new(1), "host");
        map.insert(ConnectionId::new(2), "client");
        assert_eq!(map[&ConnectionId::new(1)], "host");
    }

    #[test]
    fn test_descriptor_is_authority_without_host_data() {
        assert!(descriptor(None).is_authority());
        assert!(!descriptor(Some(vec![3; 16])).is_authority());
    }

    #[test]
    fn test_descriptor_debug_hides_key_material() {
        let rendered = format!("{:?}", descriptor(None));
        assert!(rendered.contains("key_len: 64"));
        assert!(!rendered.contains("[9, 9"));
    }

    #[test]
    fn test_transport_link_is_authority() {
        let (_tx, rx) = mpsc::unbounded_channel::<MemoryConnection>();
        let link = TransportLink::Authority { incoming: rx };
        assert!(link.is_authority());
        assert_eq!(format!("{link:?}"), "TransportLink::Authority");
    }
}
