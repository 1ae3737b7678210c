//! `SignalingServer` builder and accept loop.
//!
//! The signaling server exposes a [`LocalServices`] instance to remote
//! [`SignalingClient`](crate::SignalingClient)s over WebSocket: sign-in,
//! the session directory, and relay allocation. Peer traffic never goes
//! through it.

use std::sync::Arc;
use std::time::Duration;

use hostlink_protocol::JsonCodec;
use hostlink_session::LocalServices;
use hostlink_transport::{Transport, WebSocketTransport};

use crate::HostlinkError;
use crate::handler::handle_connection;

/// Timeouts shared by the signaling server and client.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// A server connection with no request for this long is closed.
    pub idle_timeout: Duration,
    /// A client request with no response for this long fails.
    pub request_timeout: Duration,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// State shared by every connection task.
pub(crate) struct ServerState {
    pub(crate) services: LocalServices,
    pub(crate) codec: JsonCodec,
    pub(crate) config: SignalingConfig,
}

/// Builder for a [`SignalingServer`].
///
/// # Example
///
/// ```rust,no_run
/// # async fn run() -> Result<(), hostlink::HostlinkError> {
/// use hostlink::prelude::*;
///
/// let server = SignalingServer::builder()
///     .bind("0.0.0.0:7780")
///     .build(LocalServices::default())
///     .await?;
/// server.run().await
/// # }
/// ```
pub struct SignalingServerBuilder {
    bind_addr: String,
    config: SignalingConfig,
}

impl SignalingServerBuilder {
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:7780".to_string(),
            config: SignalingConfig::default(),
        }
    }

    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    pub fn config(mut self, config: SignalingConfig) -> Self {
        self.config = config;
        self
    }

    /// Binds the listener and serves `services` to every connection.
    pub async fn build(self, services: LocalServices) -> Result<SignalingServer, HostlinkError> {
        let transport = WebSocketTransport::bind(&self.bind_addr).await?;
        let state = Arc::new(ServerState {
            services,
            codec: JsonCodec,
            config: self.config,
        });
        Ok(SignalingServer { transport, state })
    }
}

impl Default for SignalingServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound signaling server. Call [`run`](Self::run) to serve.
pub struct SignalingServer {
    transport: WebSocketTransport,
    state: Arc<ServerState>,
}

impl SignalingServer {
    pub fn builder() -> SignalingServerBuilder {
        SignalingServerBuilder::new()
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, HostlinkError> {
        Ok(self.transport.local_addr()?)
    }

    /// The services behind the server.
    pub fn services(&self) -> &LocalServices {
        &self.state.services
    }

    /// Accepts connections and spawns one handler task per connection.
    /// Runs until the task is dropped.
    pub async fn run(mut self) -> Result<(), HostlinkError> {
        tracing::info!(addr = ?self.transport.local_addr().ok(), "signaling server running");

        loop {
            match self.transport.accept().await {
                Ok(conn) => {
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(conn, state).await {
                            tracing::debug!(error = %e, "signaling connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }
    }
}
