//! Per-connection signaling handler.
//!
//! Each accepted connection gets its own task running this loop:
//!   1. Wait for a request (closing the connection when idle too long)
//!   2. Serve it against `LocalServices`
//!   3. Answer with a response carrying the request's id

use std::sync::Arc;

use hostlink_protocol::{Codec, Envelope, Payload, SignalErrorKind, SignalMessage, SignalRequest, SignalResponse};
use hostlink_session::{Authenticator, DirectoryClient, LocalServices, RelayNegotiator, SessionError};
use hostlink_transport::{Connection, TransportError};
use tokio::time::Instant;

use crate::HostlinkError;
use crate::server::ServerState;

/// Handles a single signaling connection from accept to close.
pub(crate) async fn handle_connection<C>(conn: C, state: Arc<ServerState>) -> Result<(), HostlinkError>
where
    C: Connection<Error = TransportError>,
{
    let conn_id = conn.id();
    tracing::debug!(%conn_id, "signaling connection opened");
    let start = Instant::now();
    let mut seq: u64 = 0;

    loop {
        let data = match tokio::time::timeout(state.config.idle_timeout, conn.recv()).await {
            Ok(Ok(Some(data))) => data,
            Ok(Ok(None)) => {
                tracing::debug!(%conn_id, "signaling connection closed by client");
                break;
            }
            Ok(Err(e)) => {
                tracing::debug!(%conn_id, error = %e, "signaling recv error");
                break;
            }
            Err(_) => {
                tracing::info!(%conn_id, "signaling connection idle, closing");
                let _ = conn.close().await;
                break;
            }
        };

        let (id, response) = match state.codec.decode::<Envelope>(&data) {
            Ok(Envelope {
                payload: Payload::Signal(SignalMessage::Request { id, body }),
                ..
            }) => {
                tracing::debug!(%conn_id, id, request = request_name(&body), "signaling request");
                (id, serve(&state.services, body).await)
            }
            Ok(_) => (0, malformed("expected a signaling request")),
            Err(e) => {
                tracing::debug!(%conn_id, error = %e, "failed to decode signaling frame");
                (0, malformed(&e.to_string()))
            }
        };

        seq += 1;
        let reply = Envelope {
            seq,
            timestamp: start.elapsed().as_millis() as u64,
            payload: Payload::Signal(SignalMessage::Response { id, body: response }),
        };
        conn.send(&state.codec.encode(&reply)?).await?;
    }

    Ok(())
}

async fn serve(services: &LocalServices, request: SignalRequest) -> SignalResponse {
    let result = match request {
        SignalRequest::SignIn => services
            .sign_in_anonymously()
            .await
            .map(|player| SignalResponse::SignedIn { player }),
        SignalRequest::QuerySessions { query } => services
            .query(&query)
            .await
            .map(|sessions| SignalResponse::Sessions { sessions }),
        SignalRequest::CreateSession { request } => services
            .create(request)
            .await
            .map(|session| SignalResponse::SessionCreated { session }),
        SignalRequest::JoinSession { session_id, player } => services
            .join(&session_id, &player)
            .await
            .map(|session| SignalResponse::SessionJoined { session }),
        SignalRequest::Heartbeat { session_id, player } => services
            .heartbeat(&session_id, &player)
            .await
            .map(|()| SignalResponse::HeartbeatAck),
        SignalRequest::CreateAllocation { max_peers } => services
            .create_allocation(max_peers)
            .await
            .map(|allocation| SignalResponse::AllocationCreated { allocation }),
        SignalRequest::GetJoinCode { allocation_id } => match services.allocation(&allocation_id) {
            Some(allocation) => services
                .join_code(&allocation)
                .await
                .map(|code| SignalResponse::JoinCode { code }),
            None => Err(SessionError::AllocationFailure(format!("unknown allocation {allocation_id}"))),
        },
        SignalRequest::JoinAllocation { join_code } => services
            .join_by_code(&join_code)
            .await
            .map(|descriptor| SignalResponse::AllocationJoined { descriptor }),
        SignalRequest::LeaveAllocation { allocation_id } => {
            services.release_slot(&allocation_id);
            Ok(SignalResponse::AllocationLeft)
        }
    };

    result.unwrap_or_else(|e| {
        tracing::debug!(error = %e, "signaling request failed");
        let (kind, message) = to_wire(e);
        SignalResponse::Error { kind, message }
    })
}

fn malformed(message: &str) -> SignalResponse {
    SignalResponse::Error {
        kind: SignalErrorKind::Malformed,
        message: message.to_string(),
    }
}

fn request_name(request: &SignalRequest) -> &'static str {
    match request {
        SignalRequest::SignIn => "sign_in",
        SignalRequest::QuerySessions { .. } => "query_sessions",
        SignalRequest::CreateSession { .. } => "create_session",
        SignalRequest::JoinSession { .. } => "join_session",
        SignalRequest::Heartbeat { .. } => "heartbeat",
        SignalRequest::CreateAllocation { .. } => "create_allocation",
        SignalRequest::GetJoinCode { .. } => "get_join_code",
        SignalRequest::JoinAllocation { .. } => "join_allocation",
        SignalRequest::LeaveAllocation { .. } => "leave_allocation",
    }
}

/// Splits a service error into its wire category and bare message.
pub(crate) fn to_wire(error: SessionError) -> (SignalErrorKind, String) {
    match error {
        SessionError::AuthenticationFailure(m) => (SignalErrorKind::Authentication, m),
        SessionError::DirectoryQueryFailure(m) => (SignalErrorKind::DirectoryQuery, m),
        SessionError::DirectoryCreateFailure(m) => (SignalErrorKind::DirectoryCreate, m),
        SessionError::DirectoryJoinFailure(m) => (SignalErrorKind::DirectoryJoin, m),
        SessionError::HeartbeatFailure(m) => (SignalErrorKind::Heartbeat, m),
        SessionError::AllocationFailure(m) => (SignalErrorKind::Allocation, m),
        SessionError::InvalidJoinCode(m) => (SignalErrorKind::InvalidJoinCode, m),
        other => (SignalErrorKind::Malformed, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostlink_protocol::{CreateSessionRequest, JOIN_CODE_KEY, PlayerId, SessionQuery, Visibility};
    use hostlink_session::FaultPoint;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_serve_sign_in_returns_player() {
        let services = LocalServices::default();
        let response = serve(&services, SignalRequest::SignIn).await;
        assert!(matches!(response, SignalResponse::SignedIn { .. }));
    }

    #[tokio::test]
    async fn test_serve_fault_maps_to_error_kind() {
        let services = LocalServices::default();
        services.inject_fault(FaultPoint::Query);

        let response = serve(&services, SignalRequest::QuerySessions {
            query: SessionQuery::default(),
        })
        .await;

        assert_eq!(response, SignalResponse::Error {
            kind: SignalErrorKind::DirectoryQuery,
            message: "service unavailable".into(),
        });
    }

    #[tokio::test]
    async fn test_serve_join_code_for_unknown_allocation_fails() {
        let services = LocalServices::default();
        let response = serve(&services, SignalRequest::GetJoinCode {
            allocation_id: hostlink_protocol::AllocationId("nope".into()),
        })
        .await;
        assert!(matches!(response, SignalResponse::Error {
            kind: SignalErrorKind::Allocation,
            ..
        }));
    }

    #[tokio::test]
    async fn test_serve_create_then_query() {
        let services = LocalServices::default();
        let created = serve(&services, SignalRequest::CreateSession {
            request: CreateSessionRequest {
                name: "Test Lobby".into(),
                max_participants: 4,
                visibility: Visibility::Public,
                host: PlayerId("player-1".into()),
                metadata: BTreeMap::new(),
            },
        })
        .await;
        assert!(matches!(created, SignalResponse::SessionCreated { .. }));

        let listed = serve(&services, SignalRequest::QuerySessions {
            query: SessionQuery::default(),
        })
        .await;
        match listed {
            SignalResponse::Sessions { sessions } => assert_eq!(sessions.len(), 1),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_serve_heartbeat_from_other_player_rejected() {
        let services = LocalServices::default();
        let session = services
            .create(CreateSessionRequest {
                name: "Test Lobby".into(),
                max_participants: 4,
                visibility: Visibility::Public,
                host: PlayerId("player-1".into()),
                metadata: BTreeMap::new(),
            })
            .await
            .unwrap();

        let response = serve(&services, SignalRequest::Heartbeat {
            session_id: session.id.clone(),
            player: PlayerId("player-2".into()),
        })
        .await;
        assert!(matches!(response, SignalResponse::Error {
            kind: SignalErrorKind::Heartbeat,
            ..
        }));

        let response = serve(&services, SignalRequest::Heartbeat {
            session_id: session.id.clone(),
            player: PlayerId("player-1".into()),
        })
        .await;
        assert_eq!(response, SignalResponse::HeartbeatAck);
        assert_eq!(services.heartbeat_count(&session.id), 1);
    }

    #[tokio::test]
    async fn test_serve_leave_allocation_frees_the_slot() {
        let services = LocalServices::default();
        let allocation = services.create_allocation(1).await.unwrap();
        let code = services.join_code(&allocation).await.unwrap();
        let mut metadata = BTreeMap::new();
        metadata.insert(JOIN_CODE_KEY.to_string(), code.clone());
        services
            .create(CreateSessionRequest {
                name: "Duo".into(),
                max_participants: 2,
                visibility: Visibility::Public,
                host: PlayerId("player-1".into()),
                metadata,
            })
            .await
            .unwrap();

        let first = match serve(&services, SignalRequest::JoinAllocation { join_code: code.clone() }).await {
            SignalResponse::AllocationJoined { descriptor } => descriptor,
            other => panic!("unexpected response: {other:?}"),
        };
        let full = serve(&services, SignalRequest::JoinAllocation { join_code: code.clone() }).await;
        assert!(matches!(full, SignalResponse::Error {
            kind: SignalErrorKind::InvalidJoinCode,
            ..
        }));

        let left = serve(&services, SignalRequest::LeaveAllocation {
            allocation_id: first.allocation_id,
        })
        .await;
        assert_eq!(left, SignalResponse::AllocationLeft);

        let again = serve(&services, SignalRequest::JoinAllocation { join_code: code }).await;
        assert!(matches!(again, SignalResponse::AllocationJoined { .. }));
    }
}
