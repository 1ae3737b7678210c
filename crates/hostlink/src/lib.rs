//! # hostlink
//!
//! Host-authoritative multiplayer sessions for small games.
//!
//! One player hosts: they sign in, publish a session in a directory, and
//! allocate a relay. Others discover the session, join through its relay
//! code, and connect to the host, which becomes the session authority. On
//! top of that link, replicated variables and targeted RPCs keep every
//! participant in step.
//!
//! This crate re-exports the layers and adds the signaling service, which
//! puts the directory and relay behind a WebSocket:
//!
//! ```text
//! hostlink-replication   PeerNode, ReplicationManager, RpcDispatcher
//!        ↑ TransportLink
//! hostlink-session       SessionCoordinator, LocalServices
//!        ↑ SignalingClient ⇄ SignalingServer (this crate)
//! hostlink-protocol      wire types, Codec
//! hostlink-transport     Connection, PeerTransport
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hostlink::prelude::*;
//!
//! # async fn run() -> Result<(), HostlinkError> {
//! let services = LocalServices::default();
//! let hub = MemoryRelayHub::new();
//! let mut host = SessionCoordinator::new(
//!     services.clone(),
//!     Arc::new(services.clone()),
//!     services.clone(),
//!     MemoryTransport::new(hub),
//!     CoordinatorConfig::default(),
//! );
//! host.initialize().await?;
//! host.create_session("Test Lobby", 4).await?;
//! let link = host.take_link().ok_or(NodeError::Closed("no link".into()))?;
//! let mut node = PeerNode::from_link(link, JsonCodec, NodeConfig::default()).await?;
//! node.tick();
//! # Ok(())
//! # }
//! ```

#![allow(async_fn_in_trait)]

mod client;
mod error;
mod handler;
mod server;

pub use client::SignalingClient;
pub use error::HostlinkError;
pub use server::{SignalingConfig, SignalingServer, SignalingServerBuilder};

pub use hostlink_protocol as protocol;
pub use hostlink_replication as replication;
pub use hostlink_session as session;
pub use hostlink_tick as tick;
pub use hostlink_transport as transport;

pub mod prelude {
    pub use crate::{HostlinkError, SignalingClient, SignalingConfig, SignalingServer};

    pub use hostlink_protocol::{
        Codec, EntityId, InvocationPermission, JsonCodec, ParticipantId, PlayerId, QueryFilter, RpcEnvelope,
        SessionDescriptor, SessionId, SessionQuery, TargetSelector, VarKey, Visibility,
    };
    pub use hostlink_replication::{
        NodeConfig, NodeError, NodeEvent, PeerNode, ReconcilePolicy, ReplicatedVar, ReplicationError,
        ReplicationManager, RpcError, RpcRequest, VarDeclaration,
    };
    pub use hostlink_session::{
        Authenticator, CoordinatorConfig, DirectoryClient, LocalServices, RelayNegotiator, SessionCoordinator,
        SessionError, SessionState, StatusEvent,
    };
    pub use hostlink_tick::{TickConfig, TickInfo, TickLoop};
    pub use hostlink_transport::{MemoryConnection, MemoryRelayHub, MemoryTransport, TransportLink};
}
