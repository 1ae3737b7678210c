//! In-process directory, relay, and authenticator.
//!
//! [`LocalServices`] implements all three service traits over shared
//! in-memory state. It backs the signaling server, the demo, and the
//! tests. It enforces the same rules a hosted service would:
//!
//! - sessions that miss heartbeats for a liveness window disappear, and
//!   the allocation they published goes with them
//! - allocations no session published and nobody joined expire after a TTL
//! - join codes are validated and allocations have a peer quota
//! - only a session's host keeps it alive
//!
//! [`LocalServices::inject_fault`] makes the next call at a given point
//! fail once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use hostlink_protocol::{
    AllocationId, CreateSessionRequest, JOIN_CODE_KEY, JoinDescriptor, PlayerId, RelayAllocation, SessionDescriptor,
    SessionId, SessionQuery,
};
use rand::Rng;
use tokio::time::Instant;

use crate::{Authenticator, DirectoryClient, RelayNegotiator, SessionError};

/// Characters used for join codes and session codes. No `0/O` or `1/I`.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 6;
const KEY_LEN: usize = 64;

/// Configuration for [`LocalServices`].
#[derive(Debug, Clone)]
pub struct LocalServicesConfig {
    /// Sessions without a heartbeat for this long are expired.
    pub liveness_window: Duration,
    /// Allocations no session published and nobody joined expire after
    /// this long.
    pub allocation_ttl: Duration,
    /// Upper bound on `max_peers` per allocation.
    pub max_peers: usize,
    /// Endpoint reported in allocations.
    pub relay_endpoint: String,
    pub relay_port: u16,
}

impl Default for LocalServicesConfig {
    fn default() -> Self {
        Self {
            liveness_window: Duration::from_secs(30),
            allocation_ttl: Duration::from_secs(60),
            max_peers: 100,
            relay_endpoint: "127.0.0.1".to_string(),
            relay_port: 7777,
        }
    }
}

/// Service calls that can be made to fail with [`LocalServices::inject_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    SignIn,
    Query,
    Create,
    Join,
    Heartbeat,
    CreateAllocation,
    JoinCode,
    JoinByCode,
}

struct StoredSession {
    descriptor: SessionDescriptor,
    last_heartbeat: Instant,
    heartbeats: u64,
    // Host allocation published through the join-code metadata.
    allocation: Option<AllocationId>,
}

struct StoredAllocation {
    allocation: RelayAllocation,
    created: Instant,
    join_code: Option<String>,
    joined: usize,
    // Published by a live session; exempt from the TTL.
    bound: bool,
}

#[derive(Default)]
struct State {
    // Creation order.
    sessions: Vec<StoredSession>,
    allocations: HashMap<AllocationId, StoredAllocation>,
    codes: HashMap<String, AllocationId>,
    // Participant allocation -> host allocation.
    joins: HashMap<AllocationId, AllocationId>,
    faults: Vec<FaultPoint>,
}

impl State {
    fn take_fault(&mut self, point: FaultPoint) -> bool {
        match self.faults.iter().position(|f| *f == point) {
            Some(index) => {
                self.faults.remove(index);
                tracing::debug!(?point, "injected fault triggered");
                true
            }
            None => false,
        }
    }

    fn session_mut(&mut self, id: &SessionId) -> Option<&mut StoredSession> {
        self.sessions.iter_mut().find(|s| &s.descriptor.id == id)
    }

    fn remove_allocation(&mut self, id: &AllocationId) {
        if let Some(removed) = self.allocations.remove(id) {
            if let Some(code) = removed.join_code {
                self.codes.remove(&code);
            }
            self.joins.retain(|_, host| host != id);
            tracing::info!(allocation_id = %id, "allocation expired");
        }
    }
}

/// In-memory implementation of [`Authenticator`], [`DirectoryClient`], and
/// [`RelayNegotiator`]. Clones share state.
#[derive(Clone)]
pub struct LocalServices {
    state: Arc<Mutex<State>>,
    config: Arc<LocalServicesConfig>,
}

impl Default for LocalServices {
    fn default() -> Self {
        Self::new(LocalServicesConfig::default())
    }
}

impl LocalServices {
    pub fn new(config: LocalServicesConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            config: Arc::new(config),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next call at `point` fail once.
    pub fn inject_fault(&self, point: FaultPoint) {
        self.lock().faults.push(point);
    }

    /// Removes sessions that missed the liveness window (with the
    /// allocations they published) and unpublished allocations nobody
    /// joined within their TTL. Returns the expired session ids.
    pub fn expire_stale(&self) -> Vec<SessionId> {
        let now = Instant::now();
        let mut state = self.lock();
        let mut expired = Vec::new();
        let mut released = Vec::new();

        state.sessions.retain(|s| {
            if now.duration_since(s.last_heartbeat) > self.config.liveness_window {
                tracing::info!(session_id = %s.descriptor.id, "session expired (no heartbeat)");
                expired.push(s.descriptor.id.clone());
                released.extend(s.allocation.clone());
                false
            } else {
                true
            }
        });

        let ttl = self.config.allocation_ttl;
        released.extend(
            state
                .allocations
                .iter()
                .filter(|(_, a)| !a.bound && a.joined == 0 && now.duration_since(a.created) > ttl)
                .map(|(id, _)| id.clone()),
        );
        for id in released {
            state.remove_allocation(&id);
        }

        expired
    }

    /// Current descriptor of a session, if the directory still has it.
    pub fn session(&self, id: &SessionId) -> Option<SessionDescriptor> {
        self.lock()
            .sessions
            .iter()
            .find(|s| &s.descriptor.id == id)
            .map(|s| s.descriptor.clone())
    }

    /// Heartbeats accepted for a session so far.
    pub fn heartbeat_count(&self, id: &SessionId) -> u64 {
        self.lock()
            .sessions
            .iter()
            .find(|s| &s.descriptor.id == id)
            .map_or(0, |s| s.heartbeats)
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// A live allocation by id.
    pub fn allocation(&self, id: &AllocationId) -> Option<RelayAllocation> {
        self.lock().allocations.get(id).map(|a| a.allocation.clone())
    }

    /// Frees the relay slot held by a participant's join allocation.
    /// Unknown ids are ignored.
    pub fn release_slot(&self, join_allocation: &AllocationId) {
        let mut state = self.lock();
        let Some(host_id) = state.joins.remove(join_allocation) else {
            return;
        };
        if let Some(stored) = state.allocations.get_mut(&host_id) {
            stored.joined = stored.joined.saturating_sub(1);
            tracing::info!(host_allocation = %host_id, joined = stored.joined, "relay slot released");
        }
    }
}

// ---------------------------------------------------------------------------
// Authenticator
// ---------------------------------------------------------------------------

impl Authenticator for LocalServices {
    async fn sign_in_anonymously(&self) -> Result<PlayerId, SessionError> {
        tokio::task::yield_now().await;
        if self.lock().take_fault(FaultPoint::SignIn) {
            return Err(SessionError::AuthenticationFailure("service unavailable".into()));
        }
        let player = PlayerId(format!("player-{}", random_hex(4)));
        tracing::debug!(%player, "anonymous sign-in");
        Ok(player)
    }
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

impl DirectoryClient for LocalServices {
    async fn query(&self, query: &SessionQuery) -> Result<Vec<SessionDescriptor>, SessionError> {
        tokio::task::yield_now().await;
        if self.lock().take_fault(FaultPoint::Query) {
            return Err(SessionError::DirectoryQueryFailure("service unavailable".into()));
        }
        self.expire_stale();

        let state = self.lock();
        Ok(state
            .sessions
            .iter()
            .map(|s| &s.descriptor)
            .filter(|d| query.matches(d))
            .take(query.max_results)
            .cloned()
            .collect())
    }

    async fn create(&self, request: CreateSessionRequest) -> Result<SessionDescriptor, SessionError> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        if state.take_fault(FaultPoint::Create) {
            return Err(SessionError::DirectoryCreateFailure("service unavailable".into()));
        }
        if request.name.trim().is_empty() {
            return Err(SessionError::DirectoryCreateFailure("session name is empty".into()));
        }
        if request.max_participants == 0 {
            return Err(SessionError::DirectoryCreateFailure("max participants is zero".into()));
        }

        let allocation = request
            .metadata
            .get(JOIN_CODE_KEY)
            .and_then(|code| state.codes.get(code).cloned());
        if let Some(stored) = allocation.as_ref().and_then(|id| state.allocations.get_mut(id)) {
            stored.bound = true;
        }

        let descriptor = SessionDescriptor {
            id: SessionId(format!("s-{}", random_hex(8))),
            name: request.name,
            code: random_code(),
            max_participants: request.max_participants,
            participants: vec![request.host.clone()],
            visibility: request.visibility,
            host: request.host,
            metadata: request.metadata,
        };
        state.sessions.push(StoredSession {
            descriptor: descriptor.clone(),
            last_heartbeat: Instant::now(),
            heartbeats: 0,
            allocation,
        });
        tracing::info!(session_id = %descriptor.id, name = %descriptor.name, "session created");
        Ok(descriptor)
    }

    async fn heartbeat(&self, session_id: &SessionId, host: &PlayerId) -> Result<(), SessionError> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        if state.take_fault(FaultPoint::Heartbeat) {
            return Err(SessionError::HeartbeatFailure("service unavailable".into()));
        }
        let Some(session) = state.session_mut(session_id) else {
            return Err(SessionError::HeartbeatFailure(format!("unknown session {session_id}")));
        };
        if &session.descriptor.host != host {
            return Err(SessionError::HeartbeatFailure(format!(
                "{host} is not the host of session {session_id}"
            )));
        }
        session.last_heartbeat = Instant::now();
        session.heartbeats += 1;
        Ok(())
    }

    async fn join(&self, session_id: &SessionId, player: &PlayerId) -> Result<SessionDescriptor, SessionError> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        if state.take_fault(FaultPoint::Join) {
            return Err(SessionError::DirectoryJoinFailure("service unavailable".into()));
        }
        let Some(session) = state.session_mut(session_id) else {
            return Err(SessionError::DirectoryJoinFailure(format!("unknown session {session_id}")));
        };
        let descriptor = &mut session.descriptor;
        if !descriptor.participants.contains(player) {
            if descriptor.is_full() {
                return Err(SessionError::DirectoryJoinFailure(format!("session {session_id} is full")));
            }
            descriptor.participants.push(player.clone());
        }
        tracing::info!(%session_id, %player, "player joined session");
        Ok(descriptor.clone())
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

impl RelayNegotiator for LocalServices {
    async fn create_allocation(&self, max_peers: usize) -> Result<RelayAllocation, SessionError> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        if state.take_fault(FaultPoint::CreateAllocation) {
            return Err(SessionError::AllocationFailure("service unavailable".into()));
        }
        if max_peers == 0 || max_peers > self.config.max_peers {
            return Err(SessionError::AllocationFailure(format!(
                "max peers must be between 1 and {}, got {max_peers}",
                self.config.max_peers
            )));
        }

        let allocation = RelayAllocation {
            allocation_id: AllocationId(format!("alloc-{}", random_hex(8))),
            endpoint: self.config.relay_endpoint.clone(),
            port: self.config.relay_port,
            allocation_id_bytes: random_bytes(16),
            key: random_bytes(KEY_LEN),
            connection_data: random_bytes(16),
            max_peers,
        };
        state.allocations.insert(
            allocation.allocation_id.clone(),
            StoredAllocation {
                allocation: allocation.clone(),
                created: Instant::now(),
                join_code: None,
                joined: 0,
                bound: false,
            },
        );
        tracing::info!(allocation_id = %allocation.allocation_id, max_peers, "relay allocation created");
        Ok(allocation)
    }

    async fn join_code(&self, allocation: &RelayAllocation) -> Result<String, SessionError> {
        tokio::task::yield_now().await;
        self.expire_stale();
        let mut state = self.lock();
        if state.take_fault(FaultPoint::JoinCode) {
            return Err(SessionError::AllocationFailure("service unavailable".into()));
        }
        let id = &allocation.allocation_id;
        let Some(stored) = state.allocations.get(id) else {
            return Err(SessionError::AllocationFailure(format!(
                "allocation {id} is unknown or expired"
            )));
        };
        if let Some(code) = &stored.join_code {
            return Ok(code.clone());
        }

        let code = loop {
            let candidate = random_code();
            if !state.codes.contains_key(&candidate) {
                break candidate;
            }
        };
        state.codes.insert(code.clone(), id.clone());
        if let Some(stored) = state.allocations.get_mut(id) {
            stored.join_code = Some(code.clone());
        }
        tracing::debug!(allocation_id = %id, %code, "join code issued");
        Ok(code)
    }

    async fn join_by_code(&self, code: &str) -> Result<JoinDescriptor, SessionError> {
        tokio::task::yield_now().await;
        self.expire_stale();
        let mut state = self.lock();
        if state.take_fault(FaultPoint::JoinByCode) {
            return Err(SessionError::InvalidJoinCode("service unavailable".into()));
        }

        let code = code.trim().to_ascii_uppercase();
        if !is_well_formed_code(&code) {
            return Err(SessionError::InvalidJoinCode(format!("malformed code {code:?}")));
        }
        let Some(id) = state.codes.get(&code).cloned() else {
            return Err(SessionError::InvalidJoinCode(format!("unknown or expired code {code}")));
        };
        let Some(stored) = state.allocations.get_mut(&id) else {
            return Err(SessionError::InvalidJoinCode(format!("unknown or expired code {code}")));
        };
        if stored.joined >= stored.allocation.max_peers {
            return Err(SessionError::InvalidJoinCode(format!("allocation for {code} is full")));
        }
        stored.joined += 1;

        let host = &stored.allocation;
        let join = JoinDescriptor {
            allocation_id: AllocationId(format!("alloc-{}", random_hex(8))),
            endpoint: host.endpoint.clone(),
            port: host.port,
            allocation_id_bytes: random_bytes(16),
            key: host.key.clone(),
            connection_data: random_bytes(16),
            host_connection_data: host.connection_data.clone(),
        };
        state.joins.insert(join.allocation_id.clone(), id.clone());
        tracing::info!(%code, host_allocation = %id, "joined relay allocation");
        Ok(join)
    }

    async fn release(&self, join: &JoinDescriptor) -> Result<(), SessionError> {
        tokio::task::yield_now().await;
        self.release_slot(&join.allocation_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Randomness
// ---------------------------------------------------------------------------

fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::rng();
    (0..len).map(|_| rng.random()).collect()
}

fn random_hex(len: usize) -> String {
    random_bytes(len).iter().map(|b| format!("{b:02x}")).collect()
}

fn random_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

fn is_well_formed_code(code: &str) -> bool {
    code.len() == CODE_LEN && code.bytes().all(|b| CODE_ALPHABET.contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostlink_protocol::{QueryFilter, Visibility};
    use std::collections::BTreeMap;

    fn request(name: &str, max: usize) -> CreateSessionRequest {
        CreateSessionRequest {
            name: name.into(),
            max_participants: max,
            visibility: Visibility::Public,
            host: PlayerId("host".into()),
            metadata: BTreeMap::new(),
        }
    }

    // =====================================================================
    // Codes
    // =====================================================================

    #[test]
    fn test_random_code_is_well_formed() {
        for _ in 0..100 {
            let code = random_code();
            assert!(is_well_formed_code(&code), "bad code {code}");
        }
    }

    #[test]
    fn test_is_well_formed_code_rejects_ambiguous_characters() {
        assert!(!is_well_formed_code("ABCDE0"));
        assert!(!is_well_formed_code("ABCDEI"));
        assert!(!is_well_formed_code("ABCDE"));
        assert!(is_well_formed_code("KX7P2M"));
    }

    // =====================================================================
    // Directory
    // =====================================================================

    #[tokio::test]
    async fn test_query_returns_sessions_in_creation_order() {
        let services = LocalServices::default();
        services.create(request("first", 4)).await.unwrap();
        services.create(request("second", 4)).await.unwrap();

        let sessions = services.query(&SessionQuery::default()).await.unwrap();
        let names: Vec<_> = sessions.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["first", "second"]);
    }

    #[tokio::test]
    async fn test_query_filters_full_sessions() {
        let services = LocalServices::default();
        let full = services.create(request("full", 2)).await.unwrap();
        services.join(&full.id, &PlayerId("guest".into())).await.unwrap();
        services.create(request("open", 2)).await.unwrap();

        let query = SessionQuery::default().with_filter(QueryFilter::AvailableSlotsAbove(0));
        let sessions = services.query(&query).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name, "open");
    }

    #[tokio::test]
    async fn test_join_full_session_fails() {
        let services = LocalServices::default();
        let session = services.create(request("duo", 2)).await.unwrap();
        services.join(&session.id, &PlayerId("a".into())).await.unwrap();
        let result = services.join(&session.id, &PlayerId("b".into())).await;
        assert!(matches!(result, Err(SessionError::DirectoryJoinFailure(_))));
    }

    #[tokio::test]
    async fn test_join_same_player_twice_is_idempotent() {
        let services = LocalServices::default();
        let session = services.create(request("room", 4)).await.unwrap();
        services.join(&session.id, &PlayerId("a".into())).await.unwrap();
        let updated = services.join(&session.id, &PlayerId("a".into())).await.unwrap();
        assert_eq!(updated.participants.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_without_heartbeat_expires() {
        let services = LocalServices::default();
        let session = services.create(request("quiet", 4)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(20)).await;
        services.heartbeat(&session.id, &session.host).await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(services.query(&SessionQuery::default()).await.unwrap().len(), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(services.query(&SessionQuery::default()).await.unwrap().is_empty());
        assert!(services.heartbeat(&session.id, &session.host).await.is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_from_non_host_rejected() {
        let services = LocalServices::default();
        let session = services.create(request("guarded", 4)).await.unwrap();

        let result = services.heartbeat(&session.id, &PlayerId("intruder".into())).await;

        assert!(matches!(result, Err(SessionError::HeartbeatFailure(_))));
        assert_eq!(services.heartbeat_count(&session.id), 0);
        services.heartbeat(&session.id, &session.host).await.unwrap();
        assert_eq!(services.heartbeat_count(&session.id), 1);
    }

    #[tokio::test]
    async fn test_injected_fault_fails_once() {
        let services = LocalServices::default();
        services.inject_fault(FaultPoint::Query);
        assert!(services.query(&SessionQuery::default()).await.is_err());
        assert!(services.query(&SessionQuery::default()).await.is_ok());
    }

    // =====================================================================
    // Relay
    // =====================================================================

    #[tokio::test]
    async fn test_join_code_is_stable_per_allocation() {
        let services = LocalServices::default();
        let allocation = services.create_allocation(3).await.unwrap();
        assert_eq!(allocation.key.len(), KEY_LEN);
        let first = services.join_code(&allocation).await.unwrap();
        let second = services.join_code(&allocation).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(services.allocation(&allocation.allocation_id), Some(allocation));
    }

    #[tokio::test]
    async fn test_join_by_code_routes_to_host_connection_data() {
        let services = LocalServices::default();
        let allocation = services.create_allocation(3).await.unwrap();
        let code = services.join_code(&allocation).await.unwrap();

        let join = services.join_by_code(&code.to_lowercase()).await.unwrap();
        assert_eq!(join.host_connection_data, allocation.connection_data);
        assert_ne!(join.connection_data, allocation.connection_data);
    }

    #[tokio::test]
    async fn test_join_by_code_rejects_malformed_and_unknown() {
        let services = LocalServices::default();
        assert!(matches!(
            services.join_by_code("nope").await,
            Err(SessionError::InvalidJoinCode(_))
        ));
        assert!(matches!(
            services.join_by_code("ZZZZZZ").await,
            Err(SessionError::InvalidJoinCode(_))
        ));
    }

    #[tokio::test]
    async fn test_join_by_code_rejects_full_allocation() {
        let services = LocalServices::default();
        let allocation = services.create_allocation(1).await.unwrap();
        let code = services.join_code(&allocation).await.unwrap();
        services.join_by_code(&code).await.unwrap();
        assert!(matches!(
            services.join_by_code(&code).await,
            Err(SessionError::InvalidJoinCode(_))
        ));
    }

    #[tokio::test]
    async fn test_release_gives_the_slot_back() {
        let services = LocalServices::default();
        let allocation = services.create_allocation(1).await.unwrap();
        let code = services.join_code(&allocation).await.unwrap();
        let join = services.join_by_code(&code).await.unwrap();

        services.release(&join).await.unwrap();
        // A second release of the same join changes nothing.
        services.release(&join).await.unwrap();

        let again = services.join_by_code(&code).await.unwrap();
        assert!(matches!(
            services.join_by_code(&code).await,
            Err(SessionError::InvalidJoinCode(_))
        ));
        services.release(&again).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_allocation_enforces_quota() {
        let services = LocalServices::default();
        assert!(matches!(
            services.create_allocation(0).await,
            Err(SessionError::AllocationFailure(_))
        ));
        assert!(matches!(
            services.create_allocation(101).await,
            Err(SessionError::AllocationFailure(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unjoined_allocation_expires() {
        let services = LocalServices::default();
        let allocation = services.create_allocation(3).await.unwrap();
        let code = services.join_code(&allocation).await.unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(matches!(
            services.join_code(&allocation).await,
            Err(SessionError::AllocationFailure(_))
        ));
        assert!(matches!(
            services.join_by_code(&code).await,
            Err(SessionError::InvalidJoinCode(_))
        ));
    }

    async fn published_session(services: &LocalServices) -> (SessionDescriptor, String) {
        let allocation = services.create_allocation(3).await.unwrap();
        let code = services.join_code(&allocation).await.unwrap();
        let mut req = request("published", 4);
        req.metadata.insert(JOIN_CODE_KEY.to_string(), code.clone());
        (services.create(req).await.unwrap(), code)
    }

    #[tokio::test(start_paused = true)]
    async fn test_published_allocation_outlives_ttl_while_session_is_alive() {
        let services = LocalServices::default();
        let (session, code) = published_session(&services).await;

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(20)).await;
            services.heartbeat(&session.id, &session.host).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        let join = services.join_by_code(&code).await.unwrap();
        assert_eq!(join.host_connection_data.len(), 16);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_takes_its_allocation() {
        let services = LocalServices::default();
        let (session, code) = published_session(&services).await;

        tokio::time::sleep(Duration::from_secs(31)).await;

        assert_eq!(services.expire_stale(), vec![session.id]);
        assert!(matches!(
            services.join_by_code(&code).await,
            Err(SessionError::InvalidJoinCode(_))
        ));
    }
}
