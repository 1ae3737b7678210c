//! Error types for the session layer.

use hostlink_protocol::SessionId;
use hostlink_transport::TransportError;

use crate::SessionState;

/// Errors that can occur while establishing or maintaining a session.
///
/// Service implementations report failures with the variant matching the
/// step that failed. The coordinator turns every one of them into a
/// [`StatusEvent`](crate::StatusEvent) before returning it.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Anonymous sign-in was rejected or could not be reached.
    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),

    /// The directory could not be queried.
    #[error("directory query failed: {0}")]
    DirectoryQueryFailure(String),

    /// The directory refused to create the session.
    #[error("directory create failed: {0}")]
    DirectoryCreateFailure(String),

    /// The directory refused the join (unknown or full session).
    #[error("directory join failed: {0}")]
    DirectoryJoinFailure(String),

    /// A liveness ping was not accepted.
    #[error("heartbeat failed: {0}")]
    HeartbeatFailure(String),

    /// The relay could not allocate, or the allocation has expired.
    #[error("relay allocation failed: {0}")]
    AllocationFailure(String),

    /// The join code is malformed, unknown, expired, or its allocation is
    /// full.
    #[error("invalid join code: {0}")]
    InvalidJoinCode(String),

    /// The chosen session does not publish a relay join code.
    #[error("session {0} has no relay join code")]
    MissingJoinToken(SessionId),

    /// The transport could not be started from the relay descriptor.
    #[error("transport start failed: {0}")]
    TransportStartFailure(#[source] TransportError),

    /// A session needs room for the host and at least one other peer.
    #[error("capacity must be at least 2, got {0}")]
    InvalidCapacity(usize),

    /// The operation is not allowed in the coordinator's current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// The signaling connection failed or timed out.
    #[error("signaling failed: {0}")]
    SignalingFailure(String),
}

/// Copyable category of a [`SessionError`], carried by status events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    AuthenticationFailure,
    DirectoryQueryFailure,
    DirectoryCreateFailure,
    DirectoryJoinFailure,
    HeartbeatFailure,
    AllocationFailure,
    InvalidJoinCode,
    MissingJoinToken,
    TransportStartFailure,
    InvalidCapacity,
    InvalidState,
    SignalingFailure,
}

impl SessionError {
    /// Returns the category of this error.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::AuthenticationFailure(_) => FailureKind::AuthenticationFailure,
            Self::DirectoryQueryFailure(_) => FailureKind::DirectoryQueryFailure,
            Self::DirectoryCreateFailure(_) => FailureKind::DirectoryCreateFailure,
            Self::DirectoryJoinFailure(_) => FailureKind::DirectoryJoinFailure,
            Self::HeartbeatFailure(_) => FailureKind::HeartbeatFailure,
            Self::AllocationFailure(_) => FailureKind::AllocationFailure,
            Self::InvalidJoinCode(_) => FailureKind::InvalidJoinCode,
            Self::MissingJoinToken(_) => FailureKind::MissingJoinToken,
            Self::TransportStartFailure(_) => FailureKind::TransportStartFailure,
            Self::InvalidCapacity(_) => FailureKind::InvalidCapacity,
            Self::InvalidState { .. } => FailureKind::InvalidState,
            Self::SignalingFailure(_) => FailureKind::SignalingFailure,
        }
    }
}
