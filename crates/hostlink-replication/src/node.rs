//! Per-process peer runtime.
//!
//! A [`PeerNode`] owns the replication manager, the RPC dispatcher, and the
//! reconciler of one process, plus one link per connected peer. Each link
//! runs a reader task and a writer task; everything else happens inside
//! [`PeerNode::tick`], synchronously, in receipt order.
//!
//! The session is a star: the authority holds a link to every participant
//! and forwards between them; a participant holds one link, to the
//! authority.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hostlink_protocol::{
    Codec, EntityId, Envelope, ParticipantId, Payload, PeerMessage, RpcEnvelope,
};
use hostlink_transport::{Connection, Incoming, TransportLink};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::replication::Replicable;
use crate::{
    LateJoinReconciler, NodeError, ObserverId, Participant, ReconcilePolicy, Reconciliation, ReplicatedVar,
    ReplicationError, ReplicationManager, RpcDispatcher, RpcError, RpcHandler, RpcRequest, VarDeclaration,
};

/// Runtime settings for a [`PeerNode`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// How long a joiner waits for the authority's `Welcome`.
    pub welcome_timeout: Duration,
    pub reconcile_policy: ReconcilePolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            welcome_timeout: Duration::from_secs(5),
            reconcile_policy: ReconcilePolicy::default(),
        }
    }
}

/// Something that happened to the node's links during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A participant connected (authority only).
    PeerJoined(ParticipantId),
    /// A participant left or its link dropped (authority only).
    PeerLeft(ParticipantId),
    /// The link to the authority is gone (participant only).
    Disconnected(String),
}

#[derive(Debug)]
enum LinkEvent {
    Frame { from: ParticipantId, bytes: Vec<u8> },
    Closed { from: ParticipantId, reason: String },
}

/// Outbound queue of one link. Dropping it lets the writer flush and close
/// the connection, and stops the reader.
struct LinkHandle {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
}

impl Drop for LinkHandle {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// One participant's view of a running session.
pub struct PeerNode<C: Codec, Co: Connection> {
    local: Participant,
    codec: Arc<C>,
    replication: ReplicationManager<C>,
    dispatcher: RpcDispatcher<ReplicationManager<C>>,
    reconciler: LateJoinReconciler,
    incoming: Option<Incoming<Co>>,
    links: HashMap<ParticipantId, LinkHandle>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: mpsc::UnboundedReceiver<LinkEvent>,
    next_participant: u64,
    started: Instant,
    seq: u64,
    disconnected: bool,
}

impl<C: Codec, Co: Connection> PeerNode<C, Co> {
    fn new(local: Participant, codec: C, config: &NodeConfig) -> Self {
        let codec = Arc::new(codec);
        let mut dispatcher = RpcDispatcher::new(local);
        let reconciler = LateJoinReconciler::new(config.reconcile_policy);
        reconciler.install(&mut dispatcher);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            local,
            replication: ReplicationManager::new(local, Arc::clone(&codec)),
            codec,
            dispatcher,
            reconciler,
            incoming: None,
            links: HashMap::new(),
            events_tx,
            events_rx,
            next_participant: 1,
            started: Instant::now(),
            seq: 0,
            disconnected: false,
        }
    }

    /// Starts the authority side. Participants are admitted on `tick`.
    pub fn host(incoming: Incoming<Co>, codec: C, config: NodeConfig) -> Self {
        let mut node = Self::new(Participant::authority(true), codec, &config);
        node.incoming = Some(incoming);
        tracing::info!("peer node hosting");
        node
    }

    /// Joins through `connection`, waiting for the authority's `Welcome`.
    pub async fn join(connection: Co, codec: C, config: NodeConfig) -> Result<Self, NodeError> {
        let frame = match tokio::time::timeout(config.welcome_timeout, connection.recv()).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => return Err(NodeError::Closed("authority closed before welcome".into())),
            Ok(Err(e)) => return Err(NodeError::Closed(e.to_string())),
            Err(_) => return Err(NodeError::Handshake("timed out waiting for welcome".into())),
        };

        let envelope: Envelope = codec.decode(&frame)?;
        let participant = match envelope.payload {
            Payload::Peer(PeerMessage::Welcome { participant, authority }) if authority.is_authority() => participant,
            other => {
                tracing::debug!(?other, "unexpected first frame");
                return Err(NodeError::Handshake("expected welcome".into()));
            }
        };
        if participant.is_authority() {
            return Err(NodeError::Handshake("welcomed with the authority's id".into()));
        }

        let mut node = Self::new(Participant::new(participant, true), codec, &config);
        node.open_link(ParticipantId::AUTHORITY, connection);
        tracing::info!(%participant, "joined session");
        Ok(node)
    }

    /// Starts from a link handed over by the session coordinator.
    pub async fn from_link(link: TransportLink<Co>, codec: C, config: NodeConfig) -> Result<Self, NodeError> {
        match link {
            TransportLink::Authority { incoming } => Ok(Self::host(incoming, codec, config)),
            TransportLink::Participant { connection } => Self::join(connection, codec, config).await,
        }
    }

    // -----------------------------------------------------------------------
    // Links
    // -----------------------------------------------------------------------

    fn open_link(&mut self, peer: ParticipantId, connection: Co) {
        let connection = Arc::new(connection);
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let writer_conn = Arc::clone(&connection);
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = writer_conn.send(&frame).await {
                    tracing::debug!(%peer, error = %e, "link send failed");
                    break;
                }
            }
            let _ = writer_conn.close().await;
        });

        let events = self.events_tx.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match connection.recv().await {
                    Ok(Some(bytes)) => {
                        if events.send(LinkEvent::Frame { from: peer, bytes }).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break "connection closed".to_string(),
                    Err(e) => break e.to_string(),
                }
            };
            let _ = events.send(LinkEvent::Closed { from: peer, reason });
        });

        self.links.insert(peer, LinkHandle { outbound, reader });
    }

    fn send_to(&mut self, to: ParticipantId, message: PeerMessage) {
        self.seq += 1;
        let envelope = Envelope {
            seq: self.seq,
            timestamp: self.started.elapsed().as_millis() as u64,
            payload: Payload::Peer(message),
        };
        let bytes = match self.codec.encode(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(%to, error = %e, "failed to encode peer message");
                return;
            }
        };
        match self.links.get(&to) {
            Some(link) => {
                if link.outbound.send(bytes).is_err() {
                    tracing::debug!(%to, "link writer gone");
                }
            }
            None => tracing::debug!(%to, "no link to participant"),
        }
    }

    fn admit(&mut self, connection: Co, events: &mut Vec<NodeEvent>) {
        let id = ParticipantId(self.next_participant);
        self.next_participant += 1;
        self.open_link(id, connection);
        self.dispatcher.add_participant(id);
        self.send_to(id, PeerMessage::Welcome {
            participant: id,
            authority: ParticipantId::AUTHORITY,
        });
        tracing::info!(participant = %id, "participant admitted");
        events.push(NodeEvent::PeerJoined(id));
    }

    fn drop_link(&mut self, from: ParticipantId, reason: String, events: &mut Vec<NodeEvent>) {
        if self.links.remove(&from).is_none() {
            return;
        }
        if self.local.is_authority {
            self.dispatcher.remove_participant(from);
            tracing::info!(participant = %from, %reason, "participant left");
            events.push(NodeEvent::PeerLeft(from));
        } else {
            self.disconnected = true;
            self.reconciler.clear();
            tracing::warn!(%reason, "disconnected from authority");
            events.push(NodeEvent::Disconnected(reason));
        }
    }

    fn handle_frame(&mut self, from: ParticipantId, bytes: &[u8], events: &mut Vec<NodeEvent>) {
        let envelope: Envelope = match self.codec.decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(%from, error = %e, "failed to decode envelope");
                return;
            }
        };

        match envelope.payload {
            Payload::Peer(PeerMessage::Rpc(call)) => {
                if let Err(e) = self.dispatcher.receive(call, from) {
                    tracing::debug!(%from, error = %e, "call rejected");
                }
            }
            Payload::Peer(PeerMessage::Replicate(update)) => {
                if let Err(e) = self.replication.apply_remote(update, from) {
                    tracing::debug!(%from, error = %e, "update rejected");
                }
            }
            Payload::Peer(PeerMessage::Goodbye { reason }) => self.drop_link(from, reason, events),
            Payload::Peer(PeerMessage::Welcome { .. }) => {
                tracing::debug!(%from, "ignoring repeated welcome");
            }
            Payload::Signal(_) => {
                tracing::debug!(%from, "ignoring signaling message on a peer link");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Runs one step: admits new participants, applies received frames in
    /// receipt order, runs RPC handlers, then flushes replication and RPC
    /// output.
    pub fn tick(&mut self) -> Vec<NodeEvent> {
        let mut events = Vec::new();

        let mut accepted = Vec::new();
        let mut incoming_closed = false;
        if let Some(incoming) = self.incoming.as_mut() {
            loop {
                match incoming.try_recv() {
                    Ok(connection) => accepted.push(connection),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        incoming_closed = true;
                        break;
                    }
                }
            }
        }
        if incoming_closed {
            tracing::debug!("accept queue closed");
            self.incoming = None;
        }
        for connection in accepted {
            self.admit(connection, &mut events);
        }

        while let Ok(event) = self.events_rx.try_recv() {
            match event {
                LinkEvent::Frame { from, bytes } => {
                    if self.links.contains_key(&from) {
                        self.handle_frame(from, &bytes, &mut events);
                    }
                }
                LinkEvent::Closed { from, reason } => self.drop_link(from, reason, &mut events),
            }
        }

        self.dispatcher.drain(&mut self.replication);
        self.flush();
        events
    }

    fn flush(&mut self) {
        for outgoing in self.replication.take_outgoing() {
            if self.local.is_authority {
                let targets: Vec<ParticipantId> = self
                    .links
                    .keys()
                    .copied()
                    .filter(|p| Some(*p) != outgoing.exclude)
                    .collect();
                for to in targets {
                    self.send_to(to, PeerMessage::Replicate(outgoing.update.clone()));
                }
            } else {
                self.send_to(ParticipantId::AUTHORITY, PeerMessage::Replicate(outgoing.update));
            }
        }

        for routed in self.dispatcher.take_outgoing() {
            self.send_to(routed.to, PeerMessage::Rpc(routed.envelope));
        }
    }

    // -----------------------------------------------------------------------
    // Replication and RPC
    // -----------------------------------------------------------------------

    pub fn declare<T: Replicable>(
        &mut self,
        declaration: VarDeclaration,
        initial: T,
    ) -> Result<ReplicatedVar<T>, ReplicationError> {
        self.replication.declare(declaration, initial)
    }

    /// Writes as the local participant. Sent on the next tick.
    pub fn write<T: Replicable>(&mut self, var: &ReplicatedVar<T>, value: T) -> Result<(), ReplicationError> {
        self.replication.write_local(var, value)
    }

    pub fn get<T: Replicable>(&self, var: &ReplicatedVar<T>) -> Result<&T, ReplicationError> {
        self.replication.get(var)
    }

    pub fn subscribe<T, F>(&mut self, var: &ReplicatedVar<T>, observer: F) -> Result<ObserverId, ReplicationError>
    where
        T: Replicable,
        F: FnMut(&T, &T) + Send + 'static,
    {
        self.replication.subscribe(var, observer)
    }

    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        self.replication.unsubscribe(id)
    }

    /// Invokes a call. Remote delivery happens on the next tick.
    pub fn invoke(&mut self, request: RpcRequest) -> Result<(), RpcError> {
        self.dispatcher.invoke(request)
    }

    pub fn register_handler<F>(
        &mut self,
        opcode: impl Into<String>,
        handler: F,
    ) -> Option<RpcHandler<ReplicationManager<C>>>
    where
        F: FnMut(&mut ReplicationManager<C>, &RpcEnvelope) -> Vec<RpcRequest> + Send + 'static,
    {
        self.dispatcher.register_handler(opcode, handler)
    }

    /// Reconciles `entity` with the authority. Call after declaring its
    /// variables.
    pub fn attach(&mut self, entity: EntityId) -> Result<Reconciliation, ReplicationError> {
        self.reconciler.attach(entity, &self.replication, &mut self.dispatcher)
    }

    pub fn despawn(&mut self, entity: EntityId) -> usize {
        self.replication.despawn(entity)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn local(&self) -> Participant {
        self.local
    }

    pub fn is_authority(&self) -> bool {
        self.local.is_authority
    }

    /// `true` once the link to the authority is gone.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Participants this node knows of, including itself, ascending. A
    /// participant only knows itself and the authority.
    pub fn participants(&self) -> Vec<ParticipantId> {
        let mut ids = vec![ParticipantId::AUTHORITY];
        if self.local.is_authority {
            ids.extend(self.dispatcher.participants());
        } else {
            ids.push(self.local.id);
        }
        ids
    }

    pub fn replication(&self) -> &ReplicationManager<C> {
        &self.replication
    }

    pub fn replication_mut(&mut self) -> &mut ReplicationManager<C> {
        &mut self.replication
    }

    /// Says goodbye on every link and drops all replicated state.
    pub fn shutdown(&mut self, reason: &str) {
        let peers: Vec<ParticipantId> = self.links.keys().copied().collect();
        for peer in peers {
            self.send_to(peer, PeerMessage::Goodbye { reason: reason.to_string() });
        }
        self.links.clear();
        self.incoming = None;
        self.replication.clear();
        self.dispatcher.clear();
        self.reconciler.clear();
        self.disconnected = !self.local.is_authority;
        tracing::info!(%reason, "peer node shut down");
    }
}
