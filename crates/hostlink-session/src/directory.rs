//! Session directory boundary.

use std::future::Future;

use hostlink_protocol::{CreateSessionRequest, PlayerId, SessionDescriptor, SessionId, SessionQuery};

use crate::SessionError;

/// A directory of joinable sessions.
///
/// Implementations answer queries with snapshots, create sessions with a
/// directory-assigned id and shareable code, keep them alive on heartbeat,
/// and record joins.
pub trait DirectoryClient: Send + Sync + 'static {
    /// Lists sessions matching `query`, oldest first.
    fn query(
        &self,
        query: &SessionQuery,
    ) -> impl Future<Output = Result<Vec<SessionDescriptor>, SessionError>> + Send;

    /// Creates a session. Fails with `DirectoryCreateFailure`.
    fn create(
        &self,
        request: CreateSessionRequest,
    ) -> impl Future<Output = Result<SessionDescriptor, SessionError>> + Send;

    /// Keeps a session alive. Must be called by the session's `host` at
    /// least once per liveness window or the directory may expire the
    /// session. Pings from anyone else fail with `HeartbeatFailure`.
    fn heartbeat(
        &self,
        session_id: &SessionId,
        host: &PlayerId,
    ) -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Records `player` as a participant and returns the updated descriptor.
    fn join(
        &self,
        session_id: &SessionId,
        player: &PlayerId,
    ) -> impl Future<Output = Result<SessionDescriptor, SessionError>> + Send;
}
