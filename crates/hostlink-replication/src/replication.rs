//! Replicated variables with a single write role.
//!
//! Every variable has exactly one legal writer role ([`WritePermission`]),
//! so there is no concurrent-write conflict to arbitrate: the permission
//! check is the whole consistency mechanism. Writes bump a per-variable
//! version; receivers ignore anything not newer than what they hold, which
//! gives FIFO-per-variable application on top of ordered links.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use hostlink_protocol::{Codec, EntityId, ParticipantId, ProtocolError, ReplicationUpdate, VarKey};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{Participant, ReadPermission, ReplicationError, VarDeclaration, WritePermission};

/// Typed handle to a declared variable.
pub struct ReplicatedVar<T> {
    key: VarKey,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ReplicatedVar<T> {
    pub fn key(&self) -> &VarKey {
        &self.key
    }
}

impl<T> Clone for ReplicatedVar<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for ReplicatedVar<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReplicatedVar({})", self.key)
    }
}

/// Identifies one observer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// An update waiting to be sent. `exclude` names the participant the
/// update came from, which must not receive it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingUpdate {
    pub update: ReplicationUpdate,
    pub exclude: Option<ParticipantId>,
}

/// Values a replicated variable can hold.
pub trait Replicable: Serialize + DeserializeOwned + Send + 'static {}

impl<T> Replicable for T where T: Serialize + DeserializeOwned + Send + 'static {}

type Observer<T> = Box<dyn FnMut(&T, &T) + Send>;

// ---------------------------------------------------------------------------
// Type-erased slots
// ---------------------------------------------------------------------------

trait Slot<C: Codec>: Send {
    fn apply_bytes(&mut self, codec: &C, bytes: &[u8]) -> Result<(), ProtocolError>;
    fn encode(&self, codec: &C) -> Result<Vec<u8>, ProtocolError>;
    fn remove_observer(&mut self, id: ObserverId) -> bool;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct TypedSlot<T> {
    value: T,
    observers: Vec<(ObserverId, Observer<T>)>,
}

impl<T> TypedSlot<T> {
    /// Replaces the value and notifies every observer once.
    fn replace(&mut self, new: T) {
        let old = std::mem::replace(&mut self.value, new);
        for (_, observer) in &mut self.observers {
            observer(&old, &self.value);
        }
    }
}

impl<T: Replicable, C: Codec> Slot<C> for TypedSlot<T> {
    fn apply_bytes(&mut self, codec: &C, bytes: &[u8]) -> Result<(), ProtocolError> {
        let value: T = codec.decode(bytes)?;
        self.replace(value);
        Ok(())
    }

    fn encode(&self, codec: &C) -> Result<Vec<u8>, ProtocolError> {
        codec.encode(&self.value)
    }

    fn remove_observer(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer, _)| *observer != id);
        self.observers.len() != before
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct Entry<C: Codec> {
    owner: ParticipantId,
    read: ReadPermission,
    write: WritePermission,
    version: u64,
    slot: Box<dyn Slot<C>>,
}

struct Pending {
    update: ReplicationUpdate,
    origin: ParticipantId,
}

// ---------------------------------------------------------------------------
// ReplicationManager
// ---------------------------------------------------------------------------

/// Registry of replicated variables for one process.
pub struct ReplicationManager<C: Codec> {
    local: Participant,
    codec: Arc<C>,
    entries: HashMap<VarKey, Entry<C>>,
    /// Updates that arrived before their variable was declared.
    pending: HashMap<VarKey, Pending>,
    observers: HashMap<ObserverId, VarKey>,
    outgoing: Vec<OutgoingUpdate>,
    next_observer: u64,
    violations: u64,
}

impl<C: Codec> ReplicationManager<C> {
    pub fn new(local: Participant, codec: Arc<C>) -> Self {
        Self {
            local,
            codec,
            entries: HashMap::new(),
            pending: HashMap::new(),
            observers: HashMap::new(),
            outgoing: Vec::new(),
            next_observer: 1,
            violations: 0,
        }
    }

    /// The participant this process drives.
    pub fn local(&self) -> Participant {
        self.local
    }

    pub fn codec(&self) -> &Arc<C> {
        &self.codec
    }

    /// Number of rejected writes so far.
    pub fn violations(&self) -> u64 {
        self.violations
    }

    /// Declares a variable with an initial value at version 0.
    ///
    /// An update that arrived for this key before declaration is applied
    /// now (re-checked against the write role on the authority).
    pub fn declare<T: Replicable>(
        &mut self,
        declaration: VarDeclaration,
        initial: T,
    ) -> Result<ReplicatedVar<T>, ReplicationError> {
        let VarDeclaration {
            key,
            owner,
            read,
            write,
        } = declaration;
        if self.entries.contains_key(&key) {
            return Err(ReplicationError::AlreadyDeclared(key));
        }

        let mut entry = Entry {
            owner,
            read,
            write,
            version: 0,
            slot: Box::new(TypedSlot {
                value: initial,
                observers: Vec::new(),
            }) as Box<dyn Slot<C>>,
        };

        if let Some(Pending { update, origin }) = self.pending.remove(&key) {
            let origin_participant = Participant::new(origin, false);
            if self.local.is_authority && !write.permits(owner, &origin_participant) {
                self.violations += 1;
                tracing::warn!(%key, writer = %origin, "dropping early update from participant without write role");
            } else {
                match entry.slot.apply_bytes(&self.codec, &update.value) {
                    Ok(()) => {
                        entry.version = update.version;
                        tracing::debug!(%key, version = update.version, "absorbed early update");
                        if self.local.is_authority {
                            self.outgoing.push(OutgoingUpdate {
                                update,
                                exclude: Some(origin),
                            });
                        }
                    }
                    Err(e) => tracing::warn!(%key, error = %e, "dropping undecodable early update"),
                }
            }
        }

        tracing::debug!(%key, %owner, ?write, "variable declared");
        self.entries.insert(key.clone(), entry);
        Ok(ReplicatedVar {
            key,
            _marker: PhantomData,
        })
    }

    /// Current value.
    pub fn get<T: Replicable>(&self, var: &ReplicatedVar<T>) -> Result<&T, ReplicationError> {
        let entry = self
            .entries
            .get(&var.key)
            .ok_or_else(|| ReplicationError::UnknownVariable(var.key.clone()))?;
        entry
            .slot
            .as_any()
            .downcast_ref::<TypedSlot<T>>()
            .map(|slot| &slot.value)
            .ok_or_else(|| ReplicationError::TypeMismatch(var.key.clone()))
    }

    /// Current version, or `None` if the key is not declared.
    pub fn version(&self, key: &VarKey) -> Option<u64> {
        self.entries.get(key).map(|e| e.version)
    }

    pub fn is_declared(&self, key: &VarKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Declared keys of `entity`, sorted.
    pub fn keys_for(&self, entity: EntityId) -> Vec<VarKey> {
        let mut keys: Vec<VarKey> = self.entries.keys().filter(|k| k.entity == entity).cloned().collect();
        keys.sort();
        keys
    }

    /// Writes `value` on behalf of `by`.
    ///
    /// A writer without the write role changes nothing, notifies nobody,
    /// and gets `PermissionViolation`. Otherwise the value is applied, the
    /// version bumped, observers called with (old, new), and an update
    /// queued for every other participant.
    pub fn write<T: Replicable>(
        &mut self,
        var: &ReplicatedVar<T>,
        value: T,
        by: &Participant,
    ) -> Result<(), ReplicationError> {
        let key = &var.key;
        let entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| ReplicationError::UnknownVariable(key.clone()))?;

        if !entry.write.permits(entry.owner, by) {
            self.violations += 1;
            tracing::warn!(%key, writer = %by.id, "write rejected: no write role");
            return Err(ReplicationError::PermissionViolation {
                key: key.clone(),
                writer: by.id,
            });
        }

        let bytes = self.codec.encode(&value)?;
        let slot = entry
            .slot
            .as_any_mut()
            .downcast_mut::<TypedSlot<T>>()
            .ok_or_else(|| ReplicationError::TypeMismatch(key.clone()))?;
        slot.replace(value);
        entry.version += 1;

        tracing::debug!(%key, version = entry.version, "variable written");
        self.outgoing.push(OutgoingUpdate {
            update: ReplicationUpdate {
                key: key.clone(),
                version: entry.version,
                value: bytes,
            },
            exclude: None,
        });
        Ok(())
    }

    /// Writes as the local participant.
    pub fn write_local<T: Replicable>(&mut self, var: &ReplicatedVar<T>, value: T) -> Result<(), ReplicationError> {
        let local = self.local;
        self.write(var, value, &local)
    }

    /// Applies an update received from `origin`.
    ///
    /// Returns `Ok(true)` if the value changed hands. Stale or duplicate
    /// versions are ignored. On the authority the origin's write role is
    /// re-checked and accepted updates are queued for every other
    /// participant.
    pub fn apply_remote(&mut self, update: ReplicationUpdate, origin: ParticipantId) -> Result<bool, ReplicationError> {
        let Some(entry) = self.entries.get_mut(&update.key) else {
            let newer = self
                .pending
                .get(&update.key)
                .is_none_or(|p| update.version > p.update.version);
            if newer {
                tracing::debug!(key = %update.key, version = update.version, "holding update for undeclared variable");
                self.pending.insert(update.key.clone(), Pending { update, origin });
            }
            return Ok(false);
        };

        if self.local.is_authority {
            let writer = Participant::new(origin, false);
            if !entry.write.permits(entry.owner, &writer) {
                self.violations += 1;
                tracing::warn!(key = %update.key, writer = %origin, "remote write rejected: no write role");
                return Err(ReplicationError::PermissionViolation {
                    key: update.key,
                    writer: origin,
                });
            }
        }

        if update.version <= entry.version {
            tracing::debug!(key = %update.key, version = update.version, current = entry.version, "ignoring stale update");
            return Ok(false);
        }

        entry.slot.apply_bytes(&self.codec, &update.value)?;
        entry.version = update.version;
        tracing::debug!(key = %update.key, version = update.version, from = %origin, "remote update applied");

        if self.local.is_authority {
            self.outgoing.push(OutgoingUpdate {
                update,
                exclude: Some(origin),
            });
        }
        Ok(true)
    }

    /// Applies an authoritative snapshot entry. Never re-propagated.
    ///
    /// Applied when the entry is newer than the local version, or at the
    /// same version with a different value (a late joiner whose initial
    /// value differs from the authority's).
    pub fn apply_snapshot(&mut self, entry: ReplicationUpdate) -> Result<bool, ReplicationError> {
        let Some(local) = self.entries.get_mut(&entry.key) else {
            let newer = self
                .pending
                .get(&entry.key)
                .is_none_or(|p| entry.version >= p.update.version);
            if newer {
                self.pending.insert(
                    entry.key.clone(),
                    Pending {
                        update: entry,
                        origin: ParticipantId::AUTHORITY,
                    },
                );
            }
            return Ok(false);
        };

        if entry.version < local.version {
            return Ok(false);
        }
        if entry.version == local.version && local.slot.encode(&self.codec)? == entry.value {
            return Ok(false);
        }

        local.slot.apply_bytes(&self.codec, &entry.value)?;
        local.version = entry.version;
        tracing::debug!(key = %entry.key, version = entry.version, "snapshot applied");
        Ok(true)
    }

    /// Current values of `keys` as snapshot entries for `reader`.
    /// Undeclared keys and keys `reader` may not read are skipped.
    pub fn snapshot(&self, reader: ParticipantId, keys: &[VarKey]) -> Vec<ReplicationUpdate> {
        keys.iter()
            .filter_map(|key| {
                let entry = self.entries.get(key)?;
                if !entry.read.permits(reader) {
                    return None;
                }
                match entry.slot.encode(&self.codec) {
                    Ok(value) => Some(ReplicationUpdate {
                        key: key.clone(),
                        version: entry.version,
                        value,
                    }),
                    Err(e) => {
                        tracing::warn!(%key, error = %e, "failed to encode snapshot entry");
                        None
                    }
                }
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Observers
    // -----------------------------------------------------------------------

    /// Registers `observer`, called with (old, new) once per applied change.
    pub fn subscribe<T, F>(&mut self, var: &ReplicatedVar<T>, observer: F) -> Result<ObserverId, ReplicationError>
    where
        T: Replicable,
        F: FnMut(&T, &T) + Send + 'static,
    {
        let entry = self
            .entries
            .get_mut(&var.key)
            .ok_or_else(|| ReplicationError::UnknownVariable(var.key.clone()))?;
        let slot = entry
            .slot
            .as_any_mut()
            .downcast_mut::<TypedSlot<T>>()
            .ok_or_else(|| ReplicationError::TypeMismatch(var.key.clone()))?;

        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        slot.observers.push((id, Box::new(observer)));
        self.observers.insert(id, var.key.clone());
        Ok(id)
    }

    /// Removes an observer. Returns `false` if it was not registered.
    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let Some(key) = self.observers.remove(&id) else {
            return false;
        };
        self.entries
            .get_mut(&key)
            .is_some_and(|entry| entry.slot.remove_observer(id))
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Removes every variable of `entity` together with its observers and
    /// held updates. Returns how many variables were removed.
    pub fn despawn(&mut self, entity: EntityId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.entity != entity);
        self.pending.retain(|key, _| key.entity != entity);
        self.observers.retain(|_, key| key.entity != entity);
        self.outgoing.retain(|o| o.update.key.entity != entity);
        let removed = before - self.entries.len();
        tracing::debug!(%entity, removed, "entity despawned");
        removed
    }

    /// Takes the updates queued for sending.
    pub fn take_outgoing(&mut self) -> Vec<OutgoingUpdate> {
        std::mem::take(&mut self.outgoing)
    }

    /// Drops every variable, observer, and queued update.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.pending.clear();
        self.observers.clear();
        self.outgoing.clear();
    }
}
