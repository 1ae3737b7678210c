//! # hostlink-replication
//!
//! Authority-validated state replication and targeted RPC for one session.
//!
//! - [`ReplicationManager`] holds typed variables keyed by (entity, slot),
//!   each with a single legal writer role.
//! - [`RpcDispatcher`] routes calls by target selector through the
//!   authority and runs handlers once per tick.
//! - [`LateJoinReconciler`] brings a late joiner up to date with a snapshot
//!   round trip.
//! - [`PeerNode`] ties the three to the links of a started transport.

pub mod error;
pub mod node;
pub mod participant;
pub mod reconcile;
pub mod replication;
pub mod rpc;

pub use error::{NodeError, ReplicationError, RpcError};
pub use node::{NodeConfig, NodeEvent, PeerNode};
pub use participant::{Participant, ReadPermission, VarDeclaration, WritePermission};
pub use reconcile::{
    LateJoinReconciler, ReconcilePolicy, Reconciliation, SNAPSHOT_REPLY, SNAPSHOT_REQUEST, SnapshotReply,
    SnapshotRequest,
};
pub use replication::{ObserverId, OutgoingUpdate, Replicable, ReplicatedVar, ReplicationManager};
pub use rpc::{RoutedEnvelope, RpcDispatcher, RpcHandler, RpcRequest};
