//! Late-join reconciliation.
//!
//! A participant that attaches to an entity after the authority already
//! wrote some of its variables never saw those writes. It asks the
//! authority for a snapshot of the entity over RPC and applies the reply
//! with [`ReplicationManager::apply_snapshot`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use hostlink_protocol::{
    Codec, EntityId, InvocationPermission, ParticipantId, ReplicationUpdate, RpcEnvelope, TargetSelector, VarKey,
};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::{ReplicationError, ReplicationManager, RpcDispatcher, RpcRequest};

pub const SNAPSHOT_REQUEST: &str = "hostlink.snapshot.request";
pub const SNAPSHOT_REPLY: &str = "hostlink.snapshot.reply";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub request_id: u64,
    pub keys: Vec<VarKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotReply {
    pub request_id: u64,
    pub entries: Vec<ReplicationUpdate>,
}

/// Which variables of an attached entity to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconcilePolicy {
    /// Only variables that never observed a write (still at version 0).
    #[default]
    WhenUnobserved,
    /// Every declared variable of the entity.
    Always,
}

type Waiters = Arc<Mutex<HashMap<u64, oneshot::Sender<()>>>>;

/// Requests and applies entity snapshots for a late joiner.
#[derive(Debug)]
pub struct LateJoinReconciler {
    policy: ReconcilePolicy,
    next_request: u64,
    waiters: Waiters,
}

impl LateJoinReconciler {
    pub fn new(policy: ReconcilePolicy) -> Self {
        Self {
            policy,
            next_request: 1,
            waiters: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn policy(&self) -> ReconcilePolicy {
        self.policy
    }

    /// Registers the snapshot request and reply handlers on `dispatcher`.
    pub fn install<C: Codec>(&self, dispatcher: &mut RpcDispatcher<ReplicationManager<C>>) {
        dispatcher.register_handler(SNAPSHOT_REQUEST, answer_snapshot::<C>);

        let waiters = Arc::clone(&self.waiters);
        dispatcher.register_handler(
            SNAPSHOT_REPLY,
            move |replication: &mut ReplicationManager<C>, call: &RpcEnvelope| {
                apply_reply(replication, call, &waiters);
                Vec::new()
            },
        );
    }

    /// Starts reconciling `entity`.
    ///
    /// Resolves at once on the authority, or when there is nothing to
    /// request. Otherwise a snapshot request goes to the authority and the
    /// returned [`Reconciliation`] resolves once the reply is applied.
    pub fn attach<C: Codec>(
        &mut self,
        entity: EntityId,
        replication: &ReplicationManager<C>,
        dispatcher: &mut RpcDispatcher<ReplicationManager<C>>,
    ) -> Result<Reconciliation, ReplicationError> {
        if replication.local().is_authority {
            return Ok(Reconciliation::converged_now(entity));
        }

        let keys: Vec<VarKey> = replication
            .keys_for(entity)
            .into_iter()
            .filter(|key| match self.policy {
                ReconcilePolicy::WhenUnobserved => replication.version(key) == Some(0),
                ReconcilePolicy::Always => true,
            })
            .collect();
        if keys.is_empty() {
            tracing::debug!(%entity, "nothing to reconcile");
            return Ok(Reconciliation::converged_now(entity));
        }

        let request_id = self.next_request;
        self.next_request += 1;
        let payload = replication.codec().encode(&SnapshotRequest {
            request_id,
            keys: keys.clone(),
        })?;

        let (tx, rx) = oneshot::channel();
        self.lock_waiters().insert(request_id, tx);

        let request = RpcRequest::new(
            TargetSelector::Authority,
            InvocationPermission::Everyone,
            SNAPSHOT_REQUEST,
            payload,
        );
        if let Err(e) = dispatcher.invoke(request) {
            tracing::warn!(%entity, error = %e, "snapshot request failed");
            self.lock_waiters().remove(&request_id);
            return Err(ReplicationError::ReconcileAbandoned(entity));
        }

        tracing::info!(%entity, request_id, keys = keys.len(), "requested snapshot");
        Ok(Reconciliation {
            entity,
            waiter: Some(rx),
        })
    }

    /// Abandons every outstanding reconciliation.
    pub fn clear(&self) {
        self.lock_waiters().clear();
    }

    /// Outstanding snapshot requests.
    pub fn outstanding(&self) -> usize {
        self.lock_waiters().len()
    }

    fn lock_waiters(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<()>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LateJoinReconciler {
    fn default() -> Self {
        Self::new(ReconcilePolicy::default())
    }
}

fn answer_snapshot<C: Codec>(replication: &mut ReplicationManager<C>, call: &RpcEnvelope) -> Vec<RpcRequest> {
    if !replication.local().is_authority {
        return Vec::new();
    }
    let request: SnapshotRequest = match replication.codec().decode(&call.payload) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(sender = %call.sender, error = %e, "malformed snapshot request");
            return Vec::new();
        }
    };

    let reply = SnapshotReply {
        request_id: request.request_id,
        entries: replication.snapshot(call.sender, &request.keys),
    };
    tracing::debug!(to = %call.sender, entries = reply.entries.len(), "answering snapshot request");
    match RpcRequest::encode(
        replication.codec().as_ref(),
        TargetSelector::SpecificParticipant(call.sender),
        InvocationPermission::AuthorityOnly,
        SNAPSHOT_REPLY,
        &reply,
    ) {
        Ok(request) => vec![request],
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode snapshot reply");
            Vec::new()
        }
    }
}

fn apply_reply<C: Codec>(replication: &mut ReplicationManager<C>, call: &RpcEnvelope, waiters: &Waiters) {
    if call.sender != ParticipantId::AUTHORITY {
        tracing::warn!(sender = %call.sender, "ignoring snapshot reply not sent by the authority");
        return;
    }
    let reply: SnapshotReply = match replication.codec().decode(&call.payload) {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(error = %e, "malformed snapshot reply");
            return;
        }
    };

    let mut applied = 0;
    for entry in reply.entries {
        let key = entry.key.clone();
        match replication.apply_snapshot(entry) {
            Ok(true) => applied += 1,
            Ok(false) => {}
            Err(e) => tracing::warn!(%key, error = %e, "failed to apply snapshot entry"),
        }
    }
    tracing::info!(request_id = reply.request_id, applied, "snapshot applied");

    let waiter = waiters
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&reply.request_id);
    if let Some(tx) = waiter {
        let _ = tx.send(());
    }
}

/// Completion of one [`LateJoinReconciler::attach`].
#[derive(Debug)]
pub struct Reconciliation {
    entity: EntityId,
    waiter: Option<oneshot::Receiver<()>>,
}

impl Reconciliation {
    fn converged_now(entity: EntityId) -> Self {
        Self { entity, waiter: None }
    }

    pub fn entity(&self) -> EntityId {
        self.entity
    }

    /// Waits for the snapshot reply to be applied.
    pub async fn converged(self) -> Result<(), ReplicationError> {
        match self.waiter {
            None => Ok(()),
            Some(rx) => rx
                .await
                .map_err(|_| ReplicationError::ReconcileAbandoned(self.entity)),
        }
    }

    /// Non-blocking check. `None` while the reply is still outstanding.
    pub fn try_converged(&mut self) -> Option<Result<(), ReplicationError>> {
        let Some(rx) = self.waiter.as_mut() else {
            return Some(Ok(()));
        };
        match rx.try_recv() {
            Ok(()) => {
                self.waiter = None;
                Some(Ok(()))
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(ReplicationError::ReconcileAbandoned(self.entity))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Participant, VarDeclaration};
    use hostlink_protocol::JsonCodec;

    struct Side {
        replication: ReplicationManager<JsonCodec>,
        dispatcher: RpcDispatcher<ReplicationManager<JsonCodec>>,
        reconciler: LateJoinReconciler,
    }

    fn side(local: Participant, policy: ReconcilePolicy) -> Side {
        let mut dispatcher = RpcDispatcher::new(local);
        let reconciler = LateJoinReconciler::new(policy);
        reconciler.install(&mut dispatcher);
        Side {
            replication: ReplicationManager::new(local, Arc::new(JsonCodec)),
            dispatcher,
            reconciler,
        }
    }

    /// One round trip: client calls reach the authority, the authority
    /// handles them, its replies reach the client, the client handles them.
    fn round_trip(authority: &mut Side, client: &mut Side, client_id: ParticipantId) {
        for routed in client.dispatcher.take_outgoing() {
            authority.dispatcher.receive(routed.envelope, client_id).unwrap();
        }
        authority.dispatcher.drain(&mut authority.replication);
        for routed in authority.dispatcher.take_outgoing() {
            assert_eq!(routed.to, client_id);
            client.dispatcher.receive(routed.envelope, ParticipantId::AUTHORITY).unwrap();
        }
        client.dispatcher.drain(&mut client.replication);
    }

    fn setup(policy: ReconcilePolicy) -> (Side, Side) {
        let mut authority = side(Participant::authority(true), policy);
        authority.dispatcher.add_participant(ParticipantId(1));
        let client = side(Participant::new(ParticipantId(1), true), policy);
        (authority, client)
    }

    #[tokio::test]
    async fn test_attach_converges_on_values_written_before_join() {
        let (mut authority, mut client) = setup(ReconcilePolicy::WhenUnobserved);
        let score = authority
            .replication
            .declare(VarDeclaration::authority(EntityId(1), "score"), 0u32)
            .unwrap();
        authority.replication.write_local(&score, 42).unwrap();

        let c_score = client
            .replication
            .declare(VarDeclaration::authority(EntityId(1), "score"), 0u32)
            .unwrap();
        let mut reconciliation = client
            .reconciler
            .attach(EntityId(1), &client.replication, &mut client.dispatcher)
            .unwrap();
        assert!(reconciliation.try_converged().is_none());

        round_trip(&mut authority, &mut client, ParticipantId(1));

        reconciliation.converged().await.unwrap();
        assert_eq!(*client.replication.get(&c_score).unwrap(), 42);
        assert_eq!(client.replication.version(c_score.key()), Some(1));
        assert_eq!(client.reconciler.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_attach_on_authority_is_immediately_converged() {
        let (mut authority, _) = setup(ReconcilePolicy::Always);
        authority
            .replication
            .declare(VarDeclaration::authority(EntityId(1), "score"), 0u32)
            .unwrap();
        let reconciliation = authority
            .reconciler
            .attach(EntityId(1), &authority.replication, &mut authority.dispatcher)
            .unwrap();

        reconciliation.converged().await.unwrap();
        assert!(authority.dispatcher.take_outgoing().is_empty());
    }

    #[test]
    fn test_attach_when_unobserved_skips_written_variables() {
        let (_, mut client) = setup(ReconcilePolicy::WhenUnobserved);
        let colour = client
            .replication
            .declare(VarDeclaration::owned_by(EntityId(1), "colour", ParticipantId(1)), 0u32)
            .unwrap();
        client.replication.write_local(&colour, 3).unwrap();

        let mut reconciliation = client
            .reconciler
            .attach(EntityId(1), &client.replication, &mut client.dispatcher)
            .unwrap();

        assert!(matches!(reconciliation.try_converged(), Some(Ok(()))));
        assert!(client.dispatcher.take_outgoing().is_empty());
    }

    #[test]
    fn test_attach_always_requests_written_variables_too() {
        let (_, mut client) = setup(ReconcilePolicy::Always);
        let colour = client
            .replication
            .declare(VarDeclaration::owned_by(EntityId(1), "colour", ParticipantId(1)), 0u32)
            .unwrap();
        client.replication.write_local(&colour, 3).unwrap();

        client
            .reconciler
            .attach(EntityId(1), &client.replication, &mut client.dispatcher)
            .unwrap();

        let out = client.dispatcher.take_outgoing();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].envelope.opcode, SNAPSHOT_REQUEST);
    }

    #[tokio::test]
    async fn test_clear_abandons_outstanding_reconciliation() {
        let (_, mut client) = setup(ReconcilePolicy::WhenUnobserved);
        client
            .replication
            .declare(VarDeclaration::authority(EntityId(4), "score"), 0u32)
            .unwrap();
        let reconciliation = client
            .reconciler
            .attach(EntityId(4), &client.replication, &mut client.dispatcher)
            .unwrap();

        client.reconciler.clear();

        let result = reconciliation.converged().await;
        assert!(matches!(result, Err(ReplicationError::ReconcileAbandoned(EntityId(4)))));
    }

    #[test]
    fn test_reply_from_non_authority_ignored() {
        let (_, mut client) = setup(ReconcilePolicy::WhenUnobserved);
        let score = client
            .replication
            .declare(VarDeclaration::authority(EntityId(1), "score"), 0u32)
            .unwrap();
        let reply = SnapshotReply {
            request_id: 1,
            entries: vec![ReplicationUpdate {
                key: score.key().clone(),
                version: 9,
                value: JsonCodec.encode(&1000u32).unwrap(),
            }],
        };
        let forged = RpcEnvelope {
            sender: ParticipantId(2),
            target: TargetSelector::SpecificParticipant(ParticipantId(1)),
            permission: InvocationPermission::Everyone,
            opcode: SNAPSHOT_REPLY.into(),
            payload: JsonCodec.encode(&reply).unwrap(),
        };

        client.dispatcher.receive(forged, ParticipantId::AUTHORITY).unwrap();
        client.dispatcher.drain(&mut client.replication);

        assert_eq!(*client.replication.get(&score).unwrap(), 0);
    }
}
