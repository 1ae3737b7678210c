use std::sync::Arc;

use hostlink::prelude::*;
use tracing_subscriber::EnvFilter;

type Coordinator = SessionCoordinator<LocalServices, LocalServices, LocalServices, MemoryTransport>;
type Node = PeerNode<JsonCodec, MemoryConnection>;

const DUCK: EntityId = EntityId(1);
const SCOREBOARD: EntityId = EntityId(100);

// ---------------------------------------------------------------------------
// Setup helpers
// ---------------------------------------------------------------------------

async fn signed_in(services: &LocalServices, hub: &Arc<MemoryRelayHub>) -> Result<Coordinator, HostlinkError> {
    let mut coordinator = SessionCoordinator::new(
        services.clone(),
        Arc::new(services.clone()),
        services.clone(),
        MemoryTransport::new(Arc::clone(hub)),
        CoordinatorConfig::default(),
    );
    coordinator.initialize().await?;
    Ok(coordinator)
}

async fn node_for(coordinator: &mut Coordinator) -> Result<Node, HostlinkError> {
    let link = coordinator
        .take_link()
        .ok_or_else(|| NodeError::Closed("coordinator holds no link".into()))?;
    Ok(PeerNode::from_link(link, JsonCodec, NodeConfig::default()).await?)
}

async fn join_first_listed(coordinator: &mut Coordinator, query: SessionQuery) -> Result<(), HostlinkError> {
    let sessions = coordinator.list_sessions(query).await;
    for session in &sessions {
        println!(
            "found '{}' {}/{}",
            session.name,
            session.participants.len(),
            session.max_participants
        );
    }
    let target = sessions
        .first()
        .ok_or_else(|| SessionError::DirectoryQueryFailure("no joinable session found".into()))?;
    coordinator.join_session(target).await?;
    Ok(())
}

/// The authority admits new links on its tick, so tick it once before the
/// joiner waits for its welcome.
async fn joined_node(coordinator: &mut Coordinator, authority: &mut Node) -> Result<Node, HostlinkError> {
    let link = coordinator
        .take_link()
        .ok_or_else(|| NodeError::Closed("coordinator holds no link".into()))?;
    authority.tick();
    Ok(PeerNode::from_link(link, JsonCodec, NodeConfig::default()).await?)
}

/// Declares the demo's variables: one duck whose colour participant 1
/// picks, and a scoreboard only the host writes.
fn declare_world(node: &mut Node) -> Result<(ReplicatedVar<[u8; 3]>, ReplicatedVar<u32>), HostlinkError> {
    let colour = node.declare(VarDeclaration::owned_by(DUCK, "colour", ParticipantId(1)), [255, 255, 255])?;
    let score = node.declare(VarDeclaration::authority(SCOREBOARD, "score"), 0)?;
    Ok((colour, score))
}

async fn run_ticks(ticks: &mut TickLoop, nodes: &mut [&mut Node], count: u64) {
    for _ in 0..count {
        let info = ticks.wait_for_tick().await;
        for node in nodes.iter_mut() {
            for event in node.tick() {
                tracing::info!(tick = info.tick, node = %node.local().id, ?event, "node event");
            }
        }
        ticks.record_tick_end();
    }
}

// ---------------------------------------------------------------------------
// Demo
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let services = LocalServices::default();
    let hub = MemoryRelayHub::new();

    // --- Host: sign in, create the lobby ---
    let mut host = signed_in(&services, &hub).await?;
    let lobby = host.create_session("Test Lobby", 4).await?;
    println!("hosting '{}' (code {})", lobby.name, lobby.code);

    // --- Guest: discover and join ---
    let mut guest = signed_in(&services, &hub).await?;
    join_first_listed(
        &mut guest,
        SessionQuery::default().with_filter(QueryFilter::NameContains("lobby".into())),
    )
    .await?;

    let mut authority = node_for(&mut host).await?;
    let mut participant = joined_node(&mut guest, &mut authority).await?;
    println!("guest joined as {}", participant.local().id);

    let (a_colour, a_score) = declare_world(&mut authority)?;
    let (p_colour, p_score) = declare_world(&mut participant)?;

    // --- RPC: ping/pong and a host-owned score ---
    authority.register_handler("ping", |replication: &mut ReplicationManager<JsonCodec>, call: &RpcEnvelope| {
        let n: u32 = replication.codec().decode(&call.payload).unwrap_or_default();
        RpcRequest::encode(
            replication.codec().as_ref(),
            TargetSelector::SpecificParticipant(call.sender),
            InvocationPermission::AuthorityOnly,
            "pong",
            &(n + 1),
        )
        .into_iter()
        .collect()
    });
    let score_var = a_score.clone();
    authority.register_handler("score.add", move |replication: &mut ReplicationManager<JsonCodec>, call: &RpcEnvelope| {
        let current = replication.get(&score_var).copied().unwrap_or(0);
        match replication.write_local(&score_var, current + 1) {
            Ok(()) => tracing::info!(by = %call.sender, score = current + 1, "score added"),
            Err(e) => tracing::warn!(error = %e, "score write failed"),
        }
        Vec::new()
    });
    participant.register_handler("pong", |replication: &mut ReplicationManager<JsonCodec>, call: &RpcEnvelope| {
        let n: u32 = replication.codec().decode(&call.payload).unwrap_or_default();
        println!("pong {n} from {}", call.sender);
        Vec::new()
    });
    participant.subscribe(&p_score, |old: &u32, new: &u32| println!("score {old} -> {new}"))?;

    participant.invoke(RpcRequest::encode(
        &JsonCodec,
        TargetSelector::Authority,
        InvocationPermission::Everyone,
        "ping",
        &1u32,
    )?)?;
    participant.invoke(RpcRequest::new(
        TargetSelector::Authority,
        InvocationPermission::Everyone,
        "score.add",
        Vec::new(),
    ))?;

    // Only the host writes the score; the guest's attempt is refused locally.
    if let Err(e) = participant.write(&p_score, 1000) {
        println!("guest write refused: {e}");
    }
    // Only participant 1 writes the duck's colour.
    participant.write(&p_colour, [255, 200, 0])?;
    if let Err(e) = authority.write(&a_colour, [0, 0, 0]) {
        println!("host write refused: {e}");
    }

    let mut ticks = TickLoop::new(TickConfig::with_rate(30));
    run_ticks(&mut ticks, &mut [&mut authority, &mut participant], 15).await;
    println!(
        "host sees colour {:?}, score {}",
        authority.get(&a_colour)?,
        authority.get(&a_score)?
    );

    // --- Late joiner: reconcile state written before it arrived ---
    let mut late = signed_in(&services, &hub).await?;
    join_first_listed(&mut late, SessionQuery::default()).await?;
    let mut late_node = joined_node(&mut late, &mut authority).await?;
    let (l_colour, l_score) = declare_world(&mut late_node)?;
    let duck = late_node.attach(DUCK)?;
    let scoreboard = late_node.attach(SCOREBOARD)?;
    run_ticks(&mut ticks, &mut [&mut authority, &mut participant, &mut late_node], 15).await;
    duck.converged().await?;
    scoreboard.converged().await?;
    println!(
        "late joiner {} sees colour {:?}, score {}",
        late_node.local().id,
        late_node.get(&l_colour)?,
        late_node.get(&l_score)?
    );

    // --- Teardown ---
    late_node.shutdown("demo over");
    participant.shutdown("demo over");
    authority.shutdown("demo over");
    late.shutdown().await;
    guest.shutdown().await;
    host.shutdown().await;
    Ok(())
}
