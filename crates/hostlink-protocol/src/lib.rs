//! Wire protocol for hostlink.
//!
//! This crate defines what travels between processes:
//!
//! - **Identity** ([`ParticipantId`], [`EntityId`], [`SessionId`], ...):
//!   newtype ids that serialize as their inner value.
//! - **Directory and relay** ([`SessionDescriptor`], [`SessionQuery`],
//!   [`RelayAllocation`], [`JoinDescriptor`]): what the session layer
//!   exchanges with its services.
//! - **Envelopes** ([`Envelope`], [`SignalMessage`], [`PeerMessage`]):
//!   the framing for signaling and peer traffic.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]): how those messages are
//!   converted to and from bytes.
//!
//! ```text
//! Transport (bytes) → Protocol (Envelope) → Session / Replication
//! ```

// ---------------------------------------------------------------------------
// Module declarations
// ---------------------------------------------------------------------------

mod codec;
mod directory;
mod error;
mod relay;
mod types;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use directory::{
    CreateSessionRequest, JOIN_CODE_KEY, QueryFilter, SessionDescriptor, SessionQuery, Visibility,
};
pub use error::ProtocolError;
pub use relay::{JoinDescriptor, RelayAllocation};
pub use types::{
    AllocationId, EntityId, Envelope, InvocationPermission, ParticipantId, Payload, PeerMessage,
    PlayerId, ReplicationUpdate, RpcEnvelope, SessionId, SignalErrorKind, SignalMessage,
    SignalRequest, SignalResponse, TargetSelector, VarKey,
};
