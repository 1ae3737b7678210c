//! Unified error type for the hostlink crates.

use hostlink_protocol::ProtocolError;
use hostlink_replication::{NodeError, ReplicationError, RpcError};
use hostlink_session::SessionError;
use hostlink_transport::TransportError;

/// Top-level error wrapping every crate-specific error.
///
/// The `#[from]` conversions let `?` lift sub-crate errors directly.
#[derive(Debug, thiserror::Error)]
pub enum HostlinkError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Sign-in, directory, relay, or coordinator state.
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Peer runtime handshake or link failure.
    #[error(transparent)]
    Node(#[from] NodeError),
}
