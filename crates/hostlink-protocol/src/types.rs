//! Identity types and the wire envelope.
//!
//! Every structure here travels on the wire, either between a signaling
//! client and its directory service or between peers of one session.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::directory::{CreateSessionRequest, SessionDescriptor, SessionQuery};
use crate::relay::{JoinDescriptor, RelayAllocation};

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// Identifies a participant within one session.
///
/// The authority is always `P-0`. Other ids are handed out by the authority
/// in connection order starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub u64);

impl ParticipantId {
    /// The session authority (the host).
    pub const AUTHORITY: ParticipantId = ParticipantId(0);

    /// Returns `true` if this is the authority's id.
    pub fn is_authority(self) -> bool {
        self == Self::AUTHORITY
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P-{}", self.0)
    }
}

/// Identifies a replicated game object (a duck, a ball, a scoreboard).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E-{}", self.0)
    }
}

/// Directory-assigned session id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity returned by the authenticator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub String);

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Relay-assigned allocation id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllocationId(pub String);

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The outermost wrapper for every message on a link.
///
/// `seq` is a per-link counter and `timestamp` is milliseconds since the
/// sender started. Both are diagnostic; ordering comes from the link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    pub timestamp: u64,
    pub payload: Payload,
}

/// What an envelope carries.
///
/// Adjacently tagged: `{ "kind": "Peer", "data": { ... } }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum Payload {
    /// Directory, relay, and authentication traffic.
    Signal(SignalMessage),
    /// Traffic between the peers of one session.
    Peer(PeerMessage),
}

// ---------------------------------------------------------------------------
// Signaling
// ---------------------------------------------------------------------------

/// A request or a response, correlated by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalMessage {
    Request { id: u64, body: SignalRequest },
    Response { id: u64, body: SignalResponse },
}

/// Operations a signaling client can ask of the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum SignalRequest {
    SignIn,
    QuerySessions { query: SessionQuery },
    CreateSession { request: CreateSessionRequest },
    JoinSession { session_id: SessionId, player: PlayerId },
    /// Sent by the session's host only.
    Heartbeat { session_id: SessionId, player: PlayerId },
    CreateAllocation { max_peers: usize },
    GetJoinCode { allocation_id: AllocationId },
    JoinAllocation { join_code: String },
    /// Gives back the slot taken by `JoinAllocation`.
    LeaveAllocation { allocation_id: AllocationId },
}

/// Answers to [`SignalRequest`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum SignalResponse {
    SignedIn { player: PlayerId },
    Sessions { sessions: Vec<SessionDescriptor> },
    SessionCreated { session: SessionDescriptor },
    SessionJoined { session: SessionDescriptor },
    HeartbeatAck,
    AllocationCreated { allocation: RelayAllocation },
    JoinCode { code: String },
    AllocationJoined { descriptor: JoinDescriptor },
    AllocationLeft,
    Error { kind: SignalErrorKind, message: String },
}

/// Failure categories reported by the signaling service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalErrorKind {
    Authentication,
    DirectoryQuery,
    DirectoryCreate,
    DirectoryJoin,
    Heartbeat,
    Allocation,
    InvalidJoinCode,
    /// The request could not be understood.
    Malformed,
}

// ---------------------------------------------------------------------------
// Peer traffic
// ---------------------------------------------------------------------------

/// Messages exchanged between the peers of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PeerMessage {
    /// Authority → participant: your id, and who the authority is.
    Welcome { participant: ParticipantId, authority: ParticipantId },
    /// A remote procedure call.
    Rpc(RpcEnvelope),
    /// A replicated variable changed.
    Replicate(ReplicationUpdate),
    /// Either direction: the sender is leaving.
    Goodbye { reason: String },
}

/// Who an RPC is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetSelector {
    Authority,
    AllParticipants,
    SpecificParticipant(ParticipantId),
}

/// Who may invoke an RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvocationPermission {
    AuthorityOnly,
    Everyone,
}

/// A remote procedure call on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcEnvelope {
    /// Rewritten by the authority to the id of the link it arrived on.
    pub sender: ParticipantId,
    pub target: TargetSelector,
    pub permission: InvocationPermission,
    pub opcode: String,
    pub payload: Vec<u8>,
}

/// Address of a replicated variable: an entity plus a named slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarKey {
    pub entity: EntityId,
    pub slot: String,
}

impl VarKey {
    pub fn new(entity: EntityId, slot: impl Into<String>) -> Self {
        Self {
            entity,
            slot: slot.into(),
        }
    }
}

impl fmt::Display for VarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity, self.slot)
    }
}

/// A new value for a replicated variable, stamped with the writer's version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationUpdate {
    pub key: VarKey,
    pub version: u64,
    pub value: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_id_display_and_authority() {
        assert_eq!(ParticipantId(3).to_string(), "P-3");
        assert!(ParticipantId::AUTHORITY.is_authority());
        assert!(!ParticipantId(1).is_authority());
    }

    #[test]
    fn test_var_key_display() {
        let key = VarKey::new(EntityId(7), "colour");
        assert_eq!(key.to_string(), "E-7/colour");
    }

    #[test]
    fn test_ids_serialize_transparently() {
        assert_eq!(serde_json::to_string(&ParticipantId(4)).unwrap(), "4");
        assert_eq!(
            serde_json::to_string(&SessionId("abc".into())).unwrap(),
            "\"abc\""
        );
    }

    #[test]
    fn test_peer_message_welcome_json_shape() {
        let msg = PeerMessage::Welcome {
            participant: ParticipantId(2),
            authority: ParticipantId::AUTHORITY,
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "Welcome");
        assert_eq!(json["participant"], 2);
        assert_eq!(json["authority"], 0);
    }

    #[test]
    fn test_payload_is_adjacently_tagged() {
        let payload = Payload::Peer(PeerMessage::Goodbye {
            reason: "bye".into(),
        });
        let json: serde_json::Value = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "Peer");
        assert_eq!(json["data"]["type"], "Goodbye");
        assert_eq!(json["data"]["reason"], "bye");
    }

    #[test]
    fn test_signal_request_json_shape() {
        let msg = SignalMessage::Request {
            id: 9,
            body: SignalRequest::Heartbeat {
                session_id: SessionId("s-1".into()),
                player: PlayerId("player-1".into()),
            },
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "Request");
        assert_eq!(json["id"], 9);
        assert_eq!(json["body"]["op"], "Heartbeat");
        assert_eq!(json["body"]["session_id"], "s-1");
        assert_eq!(json["body"]["player"], "player-1");
    }

    #[test]
    fn test_rpc_envelope_target_json_shape() {
        let msg = PeerMessage::Rpc(RpcEnvelope {
            sender: ParticipantId(1),
            target: TargetSelector::SpecificParticipant(ParticipantId(2)),
            permission: InvocationPermission::Everyone,
            opcode: "ping".into(),
            payload: vec![1, 2],
        });
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "Rpc");
        assert_eq!(json["opcode"], "ping");
        assert_eq!(json["target"]["SpecificParticipant"], 2);
        assert_eq!(json["permission"], "Everyone");
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let result: Result<PeerMessage, _> =
            serde_json::from_str(r#"{"type":"Teleport","x":1}"#);
        assert!(result.is_err());
    }
}
