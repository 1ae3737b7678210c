//! Session establishment for hostlink.
//!
//! This crate takes a process from "not signed in" to "holding a started
//! transport link":
//!
//! 1. **Sign-in**: anonymous identity through an [`Authenticator`]
//! 2. **Discovery**: listing joinable sessions through a [`DirectoryClient`]
//! 3. **Create / join**: relay negotiation through a [`RelayNegotiator`],
//!    then starting a [`PeerTransport`](hostlink_transport::PeerTransport)
//!    as authority or participant
//! 4. **Liveness**: heartbeats for a self-created session
//!
//! [`SessionCoordinator`] drives all of it and reports progress on a status
//! stream. [`LocalServices`] is an in-process implementation of the three
//! service traits.
//!
//! ```text
//! Replication (above)  ← takes the TransportLink once Connected
//!     ↕
//! Session (this crate) ← directory, relay, heartbeat, transport handoff
//!     ↕
//! Protocol / Transport (below)
//! ```

#![allow(async_fn_in_trait)]

mod auth;
mod coordinator;
mod directory;
mod error;
mod heartbeat;
mod local;
mod relay;
mod status;

pub use auth::Authenticator;
pub use coordinator::{ActiveRelay, ActiveSession, CoordinatorConfig, SessionCoordinator};
pub use directory::DirectoryClient;
pub use error::{FailureKind, SessionError};
pub use local::{FaultPoint, LocalServices, LocalServicesConfig};
pub use relay::RelayNegotiator;
pub use status::{ReadySignal, SessionState, StatusEvent};
