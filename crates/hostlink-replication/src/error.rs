//! Error types for the replication layer.

use hostlink_protocol::{EntityId, ParticipantId, ProtocolError, VarKey};

/// Errors from [`ReplicationManager`](crate::ReplicationManager) and the
/// reconciler.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// The key was declared before. Each (entity, slot) is declared once.
    #[error("variable {0} is already declared")]
    AlreadyDeclared(VarKey),

    /// No variable is declared under this key (or it was despawned).
    #[error("variable {0} is not declared")]
    UnknownVariable(VarKey),

    /// The handle's type does not match the declared type.
    #[error("variable {0} was declared with a different type")]
    TypeMismatch(VarKey),

    /// The writer does not hold the variable's write role.
    #[error("{writer} may not write {key}")]
    PermissionViolation { key: VarKey, writer: ParticipantId },

    /// Encoding or decoding a value failed.
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),

    /// The snapshot reply never arrived (the session ended first).
    #[error("reconciliation for {0} was abandoned")]
    ReconcileAbandoned(EntityId),
}

/// Errors from [`RpcDispatcher`](crate::RpcDispatcher).
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// An `AuthorityOnly` call from a participant that is not the
    /// authority.
    #[error("{sender} may not invoke {opcode}")]
    PermissionViolation { opcode: String, sender: ParticipantId },

    /// The target participant is not connected.
    #[error("participant {0} is not connected")]
    UnknownParticipant(ParticipantId),

    /// Encoding or decoding a payload failed.
    #[error("codec error: {0}")]
    Codec(#[from] ProtocolError),
}

/// Errors from [`PeerNode`](crate::PeerNode).
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The authority did not welcome us in time, or sent something else.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The link closed.
    #[error("link closed: {0}")]
    Closed(String),
}
