//! Remote implementation of the session service traits.
//!
//! A [`SignalingClient`] sends each service call as a numbered
//! [`SignalRequest`] over one connection and matches the response by id.
//! Responses can arrive in any order; a reader task routes each one to the
//! call waiting for it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use hostlink_protocol::{
    Codec, CreateSessionRequest, Envelope, JoinDescriptor, JsonCodec, Payload, PlayerId, RelayAllocation,
    SessionDescriptor, SessionId, SessionQuery, SignalErrorKind, SignalMessage, SignalRequest, SignalResponse,
};
use hostlink_session::{Authenticator, DirectoryClient, RelayNegotiator, SessionError};
use hostlink_transport::{Connection, WebSocketClientConnection};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::SignalingConfig;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<SignalResponse>>>>;

struct Shared<Co> {
    connection: Arc<Co>,
    pending: Pending,
    codec: JsonCodec,
    next_id: AtomicU64,
    started: Instant,
    config: SignalingConfig,
    reader: JoinHandle<()>,
}

impl<Co> Drop for Shared<Co> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Talks to a [`SignalingServer`](crate::SignalingServer). Clones share one
/// connection.
pub struct SignalingClient<Co: Connection = WebSocketClientConnection> {
    shared: Arc<Shared<Co>>,
}

impl<Co: Connection> Clone for SignalingClient<Co> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl SignalingClient<WebSocketClientConnection> {
    /// Connects to a signaling server at `url` (e.g. `ws://127.0.0.1:7780`).
    pub async fn connect(url: &str, config: SignalingConfig) -> Result<Self, SessionError> {
        let connection = WebSocketClientConnection::connect(url)
            .await
            .map_err(|e| SessionError::SignalingFailure(e.to_string()))?;
        tracing::info!(url, "connected to signaling server");
        Ok(Self::from_connection(connection, config))
    }
}

impl<Co: Connection> SignalingClient<Co> {
    /// Wraps an open connection and starts its reader task.
    pub fn from_connection(connection: Co, config: SignalingConfig) -> Self {
        let connection = Arc::new(connection);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_responses(Arc::clone(&connection), Arc::clone(&pending)));

        Self {
            shared: Arc::new(Shared {
                connection,
                pending,
                codec: JsonCodec,
                next_id: AtomicU64::new(1),
                started: Instant::now(),
                config,
                reader,
            }),
        }
    }

    /// Sends one request and waits for its response.
    ///
    /// A service-side failure comes back as the matching [`SessionError`];
    /// a lost connection or a timeout as `SignalingFailure`. The service
    /// trait methods report the latter under their own step's kind.
    pub async fn request(&self, body: SignalRequest) -> Result<SignalResponse, SessionError> {
        let shared = &self.shared;
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope {
            seq: id,
            timestamp: shared.started.elapsed().as_millis() as u64,
            payload: Payload::Signal(SignalMessage::Request { id, body }),
        };
        let bytes = shared
            .codec
            .encode(&envelope)
            .map_err(|e| SessionError::SignalingFailure(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        shared.pending.lock().await.insert(id, tx);

        if let Err(e) = shared.connection.send(&bytes).await {
            shared.pending.lock().await.remove(&id);
            return Err(SessionError::SignalingFailure(e.to_string()));
        }

        let response = match tokio::time::timeout(shared.config.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(SessionError::SignalingFailure("connection closed".into())),
            Err(_) => {
                shared.pending.lock().await.remove(&id);
                tracing::warn!(id, "signaling request timed out");
                return Err(SessionError::SignalingFailure("request timed out".into()));
            }
        };

        match response {
            SignalResponse::Error { kind, message } => Err(from_wire(kind, message)),
            other => Ok(other),
        }
    }

    /// Closes the connection. Outstanding requests fail.
    pub async fn close(&self) {
        let _ = self.shared.connection.close().await;
    }
}

async fn read_responses<Co: Connection>(connection: Arc<Co>, pending: Pending) {
    let codec = JsonCodec;
    loop {
        let data = match connection.recv().await {
            Ok(Some(data)) => data,
            Ok(None) => {
                tracing::debug!("signaling connection closed");
                break;
            }
            Err(e) => {
                tracing::debug!(error = %e, "signaling recv error");
                break;
            }
        };

        match codec.decode::<Envelope>(&data) {
            Ok(Envelope {
                payload: Payload::Signal(SignalMessage::Response { id, body }),
                ..
            }) => match pending.lock().await.remove(&id) {
                Some(waiter) => {
                    let _ = waiter.send(body);
                }
                None => tracing::debug!(id, "response for no pending request"),
            },
            Ok(_) => tracing::debug!("ignoring non-response signaling frame"),
            Err(e) => tracing::debug!(error = %e, "failed to decode signaling frame"),
        }
    }

    // Waiters see a closed channel.
    pending.lock().await.clear();
}

fn from_wire(kind: SignalErrorKind, message: String) -> SessionError {
    match kind {
        SignalErrorKind::Authentication => SessionError::AuthenticationFailure(message),
        SignalErrorKind::DirectoryQuery => SessionError::DirectoryQueryFailure(message),
        SignalErrorKind::DirectoryCreate => SessionError::DirectoryCreateFailure(message),
        SignalErrorKind::DirectoryJoin => SessionError::DirectoryJoinFailure(message),
        SignalErrorKind::Heartbeat => SessionError::HeartbeatFailure(message),
        SignalErrorKind::Allocation => SessionError::AllocationFailure(message),
        SignalErrorKind::InvalidJoinCode => SessionError::InvalidJoinCode(message),
        SignalErrorKind::Malformed => SessionError::SignalingFailure(message),
    }
}

fn unexpected(response: SignalResponse) -> SessionError {
    SessionError::SignalingFailure(format!("unexpected response: {response:?}"))
}

/// Reports a signaling-level failure as the failing step's kind.
fn as_step(kind: fn(String) -> SessionError) -> impl FnOnce(SessionError) -> SessionError {
    move |error| match error {
        SessionError::SignalingFailure(message) => kind(message),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Service traits
// ---------------------------------------------------------------------------

impl<Co: Connection> Authenticator for SignalingClient<Co> {
    async fn sign_in_anonymously(&self) -> Result<PlayerId, SessionError> {
        let response = self
            .request(SignalRequest::SignIn)
            .await
            .map_err(as_step(SessionError::AuthenticationFailure))?;
        match response {
            SignalResponse::SignedIn { player } => Ok(player),
            other => Err(unexpected(other)),
        }
    }
}

impl<Co: Connection> DirectoryClient for SignalingClient<Co> {
    async fn query(&self, query: &SessionQuery) -> Result<Vec<SessionDescriptor>, SessionError> {
        let request = SignalRequest::QuerySessions { query: query.clone() };
        let response = self
            .request(request)
            .await
            .map_err(as_step(SessionError::DirectoryQueryFailure))?;
        match response {
            SignalResponse::Sessions { sessions } => Ok(sessions),
            other => Err(unexpected(other)),
        }
    }

    async fn create(&self, request: CreateSessionRequest) -> Result<SessionDescriptor, SessionError> {
        let response = self
            .request(SignalRequest::CreateSession { request })
            .await
            .map_err(as_step(SessionError::DirectoryCreateFailure))?;
        match response {
            SignalResponse::SessionCreated { session } => Ok(session),
            other => Err(unexpected(other)),
        }
    }

    async fn heartbeat(&self, session_id: &SessionId, host: &PlayerId) -> Result<(), SessionError> {
        let request = SignalRequest::Heartbeat {
            session_id: session_id.clone(),
            player: host.clone(),
        };
        let response = self
            .request(request)
            .await
            .map_err(as_step(SessionError::HeartbeatFailure))?;
        match response {
            SignalResponse::HeartbeatAck => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn join(&self, session_id: &SessionId, player: &PlayerId) -> Result<SessionDescriptor, SessionError> {
        let request = SignalRequest::JoinSession {
            session_id: session_id.clone(),
            player: player.clone(),
        };
        let response = self
            .request(request)
            .await
            .map_err(as_step(SessionError::DirectoryJoinFailure))?;
        match response {
            SignalResponse::SessionJoined { session } => Ok(session),
            other => Err(unexpected(other)),
        }
    }
}

impl<Co: Connection> RelayNegotiator for SignalingClient<Co> {
    async fn create_allocation(&self, max_peers: usize) -> Result<RelayAllocation, SessionError> {
        let response = self
            .request(SignalRequest::CreateAllocation { max_peers })
            .await
            .map_err(as_step(SessionError::AllocationFailure))?;
        match response {
            SignalResponse::AllocationCreated { allocation } => Ok(allocation),
            other => Err(unexpected(other)),
        }
    }

    async fn join_code(&self, allocation: &RelayAllocation) -> Result<String, SessionError> {
        let request = SignalRequest::GetJoinCode {
            allocation_id: allocation.allocation_id.clone(),
        };
        let response = self
            .request(request)
            .await
            .map_err(as_step(SessionError::AllocationFailure))?;
        match response {
            SignalResponse::JoinCode { code } => Ok(code),
            other => Err(unexpected(other)),
        }
    }

    async fn join_by_code(&self, code: &str) -> Result<JoinDescriptor, SessionError> {
        let request = SignalRequest::JoinAllocation {
            join_code: code.to_string(),
        };
        let response = self
            .request(request)
            .await
            .map_err(as_step(SessionError::InvalidJoinCode))?;
        match response {
            SignalResponse::AllocationJoined { descriptor } => Ok(descriptor),
            other => Err(unexpected(other)),
        }
    }

    async fn release(&self, join: &JoinDescriptor) -> Result<(), SessionError> {
        let request = SignalRequest::LeaveAllocation {
            allocation_id: join.allocation_id.clone(),
        };
        let response = self
            .request(request)
            .await
            .map_err(as_step(SessionError::AllocationFailure))?;
        match response {
            SignalResponse::AllocationLeft => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostlink_transport::MemoryConnection;
    use std::time::Duration;

    fn response_frame(id: u64, body: SignalResponse) -> Vec<u8> {
        JsonCodec
            .encode(&Envelope {
                seq: id,
                timestamp: 0,
                payload: Payload::Signal(SignalMessage::Response { id, body }),
            })
            .unwrap()
    }

    async fn request_id(server: &MemoryConnection) -> u64 {
        let frame = server.recv().await.unwrap().unwrap();
        match JsonCodec.decode::<Envelope>(&frame).unwrap().payload {
            Payload::Signal(SignalMessage::Request { id, .. }) => id,
            other => panic!("expected a request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_out_of_order_responses_reach_their_callers() {
        let (client_end, server) = MemoryConnection::pair();
        let client = SignalingClient::from_connection(client_end, SignalingConfig::default());

        let first = tokio::spawn({
            let client = client.clone();
            async move { client.request(SignalRequest::SignIn).await }
        });
        let first_id = request_id(&server).await;
        let second = tokio::spawn({
            let client = client.clone();
            async move { client.request(SignalRequest::CreateAllocation { max_peers: 2 }).await }
        });
        let second_id = request_id(&server).await;

        server
            .send(&response_frame(second_id, SignalResponse::JoinCode { code: "B".into() }))
            .await
            .unwrap();
        server
            .send(&response_frame(first_id, SignalResponse::JoinCode { code: "A".into() }))
            .await
            .unwrap();

        assert_eq!(first.await.unwrap().unwrap(), SignalResponse::JoinCode { code: "A".into() });
        assert_eq!(second.await.unwrap().unwrap(), SignalResponse::JoinCode { code: "B".into() });
    }

    #[tokio::test]
    async fn test_request_error_response_maps_to_session_error() {
        let (client_end, server) = MemoryConnection::pair();
        let client = SignalingClient::from_connection(client_end, SignalingConfig::default());

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.join_by_code("NOPE").await }
        });
        let id = request_id(&server).await;
        server
            .send(&response_frame(id, SignalResponse::Error {
                kind: SignalErrorKind::InvalidJoinCode,
                message: "unknown code".into(),
            }))
            .await
            .unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::InvalidJoinCode(ref m) if m == "unknown code"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_without_response_times_out() {
        let (client_end, _server) = MemoryConnection::pair();
        let client = SignalingClient::from_connection(client_end, SignalingConfig {
            request_timeout: Duration::from_secs(10),
            ..SignalingConfig::default()
        });

        let err = client.request(SignalRequest::SignIn).await.unwrap_err();
        assert!(matches!(err, SessionError::SignalingFailure(ref m) if m.contains("timed out")));

        let err = client.sign_in_anonymously().await.unwrap_err();
        assert!(matches!(err, SessionError::AuthenticationFailure(ref m) if m.contains("timed out")));
    }

    #[tokio::test]
    async fn test_request_after_server_closes_fails() {
        let (client_end, server) = MemoryConnection::pair();
        let client = SignalingClient::from_connection(client_end, SignalingConfig::default());

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.request(SignalRequest::SignIn).await }
        });
        request_id(&server).await;
        drop(server);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::SignalingFailure(_)));
    }

    #[tokio::test]
    async fn test_unexpected_response_kind_is_signaling_failure() {
        let (client_end, server) = MemoryConnection::pair();
        let client = SignalingClient::from_connection(client_end, SignalingConfig::default());

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.sign_in_anonymously().await }
        });
        let id = request_id(&server).await;
        server.send(&response_frame(id, SignalResponse::HeartbeatAck)).await.unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::SignalingFailure(_)));
    }

    #[tokio::test]
    async fn test_dropped_connection_fails_with_step_kind() {
        let (client_end, server) = MemoryConnection::pair();
        drop(server);
        let client = SignalingClient::from_connection(client_end, SignalingConfig::default());

        let err = client.create_allocation(3).await.unwrap_err();
        assert!(matches!(err, SessionError::AllocationFailure(_)), "got {err:?}");

        let err = client.query(&SessionQuery::default()).await.unwrap_err();
        assert!(matches!(err, SessionError::DirectoryQueryFailure(_)), "got {err:?}");

        let err = client
            .heartbeat(&SessionId("session-1".into()), &PlayerId("player-1".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::HeartbeatFailure(_)), "got {err:?}");

        let err = client.join_by_code("ABC123").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidJoinCode(_)), "got {err:?}");
    }
}
