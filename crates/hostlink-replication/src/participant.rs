//! Participants and the permission model.

use hostlink_protocol::{EntityId, ParticipantId, VarKey};

/// One peer of a session as seen from this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Participant {
    pub id: ParticipantId,
    pub is_authority: bool,
    /// `true` for the participant this process drives.
    pub is_local: bool,
}

impl Participant {
    /// The session authority.
    pub fn authority(is_local: bool) -> Self {
        Self {
            id: ParticipantId::AUTHORITY,
            is_authority: true,
            is_local,
        }
    }

    /// A participant identified by `id`. Id 0 is always the authority.
    pub fn new(id: ParticipantId, is_local: bool) -> Self {
        Self {
            id,
            is_authority: id.is_authority(),
            is_local,
        }
    }
}

/// Who may read a replicated variable. Every participant, in this system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadPermission {
    #[default]
    Everyone,
}

impl ReadPermission {
    /// Returns `true` if `reader` may see the variable's value.
    pub fn permits(self, _reader: ParticipantId) -> bool {
        match self {
            Self::Everyone => true,
        }
    }
}

/// Who may write a replicated variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePermission {
    /// Only the session authority (a server-owned score).
    AuthorityOnly,
    /// Only the owning participant (a player-chosen colour).
    OwnerOnly,
}

impl WritePermission {
    /// Returns `true` if `writer` may write a variable owned by `owner`.
    pub fn permits(self, owner: ParticipantId, writer: &Participant) -> bool {
        match self {
            Self::AuthorityOnly => writer.is_authority,
            Self::OwnerOnly => writer.id == owner,
        }
    }
}

/// Everything needed to declare a replicated variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarDeclaration {
    pub key: VarKey,
    pub owner: ParticipantId,
    pub read: ReadPermission,
    pub write: WritePermission,
}

impl VarDeclaration {
    /// An authority-owned, authority-written variable.
    pub fn authority(entity: EntityId, slot: impl Into<String>) -> Self {
        Self {
            key: VarKey::new(entity, slot),
            owner: ParticipantId::AUTHORITY,
            read: ReadPermission::Everyone,
            write: WritePermission::AuthorityOnly,
        }
    }

    /// A variable only `owner` may write.
    pub fn owned_by(entity: EntityId, slot: impl Into<String>, owner: ParticipantId) -> Self {
        Self {
            key: VarKey::new(entity, slot),
            owner,
            read: ReadPermission::Everyone,
            write: WritePermission::OwnerOnly,
        }
    }
}
