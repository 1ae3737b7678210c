//! The session coordinator: sign-in, discovery, create/join, heartbeat, and
//! transport handoff.
//!
//! The coordinator is owned by a single task (the caller's update loop) and
//! takes `&mut self` for every transition. Progress and failures are
//! published on a broadcast status stream; readiness is published on a
//! watch channel so other tasks can await it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hostlink_protocol::{
    CreateSessionRequest, JOIN_CODE_KEY, JoinDescriptor, PlayerId, QueryFilter, RelayAllocation,
    SessionDescriptor, SessionQuery, Visibility,
};
use hostlink_transport::{PeerTransport, TransportLink};
use tokio::sync::{broadcast, watch};

use crate::heartbeat::Heartbeat;
use crate::{
    Authenticator, DirectoryClient, FailureKind, ReadySignal, RelayNegotiator, SessionError, SessionState,
    StatusEvent,
};

const STATUS_CAPACITY: usize = 64;

/// Configuration for a [`SessionCoordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Interval between liveness pings for a hosted session.
    pub heartbeat_interval: Duration,
    /// Upper bound on sessions returned by [`SessionCoordinator::list_sessions`].
    pub max_results: usize,
    /// Passed to the transport as the descriptor's security flag.
    pub secure: bool,
    /// Visibility of sessions this coordinator creates.
    pub visibility: Visibility,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            max_results: 10,
            secure: true,
            visibility: Visibility::Public,
        }
    }
}

/// The relay side of an active session, kept for diagnostics.
#[derive(Debug, Clone)]
pub enum ActiveRelay {
    Host {
        allocation: RelayAllocation,
        join_code: String,
    },
    Participant {
        join: JoinDescriptor,
    },
}

/// The session this process is currently part of.
#[derive(Debug, Clone)]
pub struct ActiveSession {
    /// The directory entry. `None` after joining directly by relay code.
    pub session: Option<SessionDescriptor>,
    pub relay: ActiveRelay,
}

impl ActiveSession {
    /// Returns `true` if this process created the session.
    pub fn is_host(&self) -> bool {
        matches!(self.relay, ActiveRelay::Host { .. })
    }

    /// The relay join code to hand out, when hosting.
    pub fn join_code(&self) -> Option<&str> {
        match &self.relay {
            ActiveRelay::Host { join_code, .. } => Some(join_code),
            ActiveRelay::Participant { .. } => None,
        }
    }
}

/// Drives session establishment against a directory, a relay, and a
/// transport.
pub struct SessionCoordinator<A, D, R, T>
where
    A: Authenticator,
    D: DirectoryClient,
    R: RelayNegotiator,
    T: PeerTransport,
{
    auth: A,
    directory: Arc<D>,
    relay: R,
    transport: T,
    config: CoordinatorConfig,
    player: Option<PlayerId>,
    state: watch::Sender<SessionState>,
    status: broadcast::Sender<StatusEvent>,
    active: Option<ActiveSession>,
    link: Option<TransportLink<T::Connection>>,
    heartbeat: Option<Heartbeat>,
}

impl<A, D, R, T> SessionCoordinator<A, D, R, T>
where
    A: Authenticator,
    D: DirectoryClient,
    R: RelayNegotiator,
    T: PeerTransport,
{
    /// Creates an uninitialized coordinator.
    pub fn new(auth: A, directory: Arc<D>, relay: R, transport: T, config: CoordinatorConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Uninitialized);
        let (status, _) = broadcast::channel(STATUS_CAPACITY);
        Self {
            auth,
            directory,
            relay,
            transport,
            config,
            player: None,
            state,
            status,
            active: None,
            link: None,
            heartbeat: None,
        }
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// The signed-in identity, once `Ready`.
    pub fn player(&self) -> Option<&PlayerId> {
        self.player.as_ref()
    }

    /// The session this process is part of, while `Connected`.
    pub fn active_session(&self) -> Option<&ActiveSession> {
        self.active.as_ref()
    }

    /// Subscribes to status events emitted from now on.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    /// Returns a handle that resolves once sign-in has succeeded.
    pub fn readiness(&self) -> ReadySignal {
        ReadySignal::new(self.state.subscribe())
    }

    /// Waits until sign-in has succeeded.
    pub async fn wait_ready(&self) -> Result<(), SessionError> {
        self.readiness().wait().await
    }

    // -----------------------------------------------------------------------
    // Sign-in
    // -----------------------------------------------------------------------

    /// Signs in anonymously.
    ///
    /// A no-op returning the existing identity once `Ready`. Re-invoking
    /// after a failure retries.
    pub async fn initialize(&mut self) -> Result<PlayerId, SessionError> {
        if let Some(player) = &self.player {
            return Ok(player.clone());
        }

        self.set_state(SessionState::Authenticating);
        self.emit("Signing in anonymously...");

        match self.auth.sign_in_anonymously().await {
            Ok(player) => {
                self.player = Some(player.clone());
                self.set_state(SessionState::Ready);
                self.emit(format!("Signed in as: {player}"));
                tracing::info!(%player, "signed in");
                Ok(player)
            }
            Err(e) => {
                let e = match e {
                    SessionError::AuthenticationFailure(_) => e,
                    other => SessionError::AuthenticationFailure(other.to_string()),
                };
                self.set_state(SessionState::Failed);
                self.report(&e, format!("Failed to initialize services: {e}"));
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// Lists joinable sessions.
    ///
    /// Always restricts to sessions with a free slot and re-applies every
    /// filter to the directory's answer. Never fails: errors yield an empty
    /// list and a status event.
    pub async fn list_sessions(&self, query: SessionQuery) -> Vec<SessionDescriptor> {
        if !self.state().is_ready() {
            let e = SessionError::InvalidState {
                operation: "list sessions",
                state: self.state(),
            };
            self.report(&e, "Not ready yet (sign-in still in progress).".to_string());
            return Vec::new();
        }

        let cap = query.max_results.min(self.config.max_results);
        let query = SessionQuery {
            max_results: cap,
            ..query
        }
        .with_filter(QueryFilter::AvailableSlotsAbove(0));

        self.emit("Refreshing sessions...");
        match self.directory.query(&query).await {
            Ok(sessions) => {
                let found: Vec<SessionDescriptor> = sessions
                    .into_iter()
                    .filter(|s| query.matches(s))
                    .take(cap)
                    .collect();
                self.emit(format!("Found {} sessions.", found.len()));
                found
            }
            Err(e) => {
                self.report(&e, format!("Failed to query sessions: {e}"));
                Vec::new()
            }
        }
    }

    // -----------------------------------------------------------------------
    // Create / join
    // -----------------------------------------------------------------------

    /// Creates a session for `capacity` participants (host included) and
    /// starts the transport as authority.
    ///
    /// On success the coordinator is `Connected` and the heartbeat is
    /// running. On failure it is back in `Ready`.
    pub async fn create_session(&mut self, name: &str, capacity: usize) -> Result<SessionDescriptor, SessionError> {
        let player = self.begin("create a session")?;
        if capacity < 2 {
            let e = SessionError::InvalidCapacity(capacity);
            self.report(&e, format!("Failed to create session: {e}"));
            return Err(e);
        }

        self.set_state(SessionState::Hosting);
        match self.host(name, capacity, player).await {
            Ok(session) => Ok(session),
            Err(e) => {
                self.set_state(SessionState::Ready);
                self.report(&e, format!("Failed to create session: {e}"));
                Err(e)
            }
        }
    }

    async fn host(&mut self, name: &str, capacity: usize, player: PlayerId) -> Result<SessionDescriptor, SessionError> {
        self.emit("Creating relay allocation...");
        let allocation = self.relay.create_allocation(capacity - 1).await?;
        let join_code = self.relay.join_code(&allocation).await?;

        self.emit("Creating session...");
        let request = CreateSessionRequest {
            name: name.to_string(),
            max_participants: capacity,
            visibility: self.config.visibility,
            host: player,
            metadata: BTreeMap::from([(JOIN_CODE_KEY.to_string(), join_code.clone())]),
        };
        let session = self.directory.create(request).await?;
        let host = session.host.clone();

        let descriptor = allocation.connection_descriptor(self.config.secure);
        let incoming = self
            .transport
            .start_as_authority(&descriptor)
            .await
            .map_err(SessionError::TransportStartFailure)?;

        self.link = Some(TransportLink::Authority { incoming });
        self.heartbeat = Some(Heartbeat::spawn(
            Arc::clone(&self.directory),
            session.id.clone(),
            host,
            self.config.heartbeat_interval,
            self.status.clone(),
        ));
        self.active = Some(ActiveSession {
            session: Some(session.clone()),
            relay: ActiveRelay::Host {
                allocation,
                join_code: join_code.clone(),
            },
        });
        self.set_state(SessionState::Connected);
        self.emit(format!("Session '{}' created. Code: {}", session.name, session.code));
        tracing::info!(session_id = %session.id, code = %session.code, %join_code, "hosting session");
        Ok(session)
    }

    /// Joins `session` through its published relay join code and starts the
    /// transport as participant.
    ///
    /// On failure the coordinator is back in `Ready`.
    pub async fn join_session(&mut self, session: &SessionDescriptor) -> Result<(), SessionError> {
        let player = self.begin("join a session")?;

        self.set_state(SessionState::Joining);
        self.emit(format!("Joining session '{}'...", session.name));
        let result = match session.join_token() {
            Some(code) => self.join(code, Some(session), &player).await,
            None => Err(SessionError::MissingJoinToken(session.id.clone())),
        };
        self.finish_join(result, "Failed to join session")
    }

    /// Joins a host's relay directly with a join code it handed out, without
    /// the directory, and starts the transport as participant.
    ///
    /// On failure the coordinator is back in `Ready`.
    pub async fn join_by_code(&mut self, code: &str) -> Result<(), SessionError> {
        let player = self.begin("join by code")?;

        self.set_state(SessionState::Joining);
        self.emit(format!("Joining with code {code}..."));
        let result = self.join(code, None, &player).await;
        self.finish_join(result, "Failed to join with code")
    }

    fn finish_join(&mut self, result: Result<(), SessionError>, context: &str) -> Result<(), SessionError> {
        if let Err(e) = &result {
            self.set_state(SessionState::Ready);
            self.report(e, format!("{context}: {e}"));
        }
        result
    }

    /// Takes a relay slot, then records the join in the directory (if any)
    /// and starts the transport. The slot is released if either fails.
    async fn join(
        &mut self,
        code: &str,
        session: Option<&SessionDescriptor>,
        player: &PlayerId,
    ) -> Result<(), SessionError> {
        self.emit("Joining relay allocation...");
        let join = self.relay.join_by_code(code).await?;

        let connected = match session {
            Some(session) => match self.directory.join(&session.id, player).await {
                Ok(updated) => self.start_participant(&join).await.map(|c| (c, Some(updated))),
                Err(e) => Err(e),
            },
            None => self.start_participant(&join).await.map(|c| (c, None)),
        };
        let (connection, updated) = match connected {
            Ok(connected) => connected,
            Err(e) => {
                self.release(&join).await;
                return Err(e);
            }
        };

        self.link = Some(TransportLink::Participant { connection });
        match &updated {
            Some(session) => tracing::info!(session_id = %session.id, %player, "joined session"),
            None => tracing::info!(%code, %player, "joined relay by code"),
        }
        self.active = Some(ActiveSession {
            session: updated,
            relay: ActiveRelay::Participant { join },
        });
        self.set_state(SessionState::Connected);
        self.emit("Connecting to host...");
        Ok(())
    }

    async fn start_participant(&self, join: &JoinDescriptor) -> Result<T::Connection, SessionError> {
        let descriptor = join.connection_descriptor(self.config.secure);
        self.transport
            .start_as_participant(&descriptor)
            .await
            .map_err(SessionError::TransportStartFailure)
    }

    async fn release(&self, join: &JoinDescriptor) {
        if let Err(e) = self.relay.release(join).await {
            tracing::warn!(error = %e, "failed to release relay slot");
        }
    }

    /// Hands the started transport to the caller. Returns `None` if there
    /// is no link or it was already taken.
    pub fn take_link(&mut self) -> Option<TransportLink<T::Connection>> {
        self.link.take()
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Records loss of the reliable channel. No reconnection is attempted.
    pub fn mark_disconnected(&mut self, reason: &str) {
        if self.state() != SessionState::Connected {
            return;
        }
        self.stop_heartbeat();
        self.active = None;
        self.link = None;
        self.set_state(SessionState::Disconnected);
        self.emit(format!("Disconnected: {reason}"));
        tracing::warn!(reason, "session channel lost");
    }

    /// Leaves the current session: heartbeat stopped, relay slot given back
    /// (as participant), transport shut down.
    pub async fn leave(&mut self) {
        self.stop_heartbeat();
        let active = self.active.take();
        if let Some(ActiveSession {
            relay: ActiveRelay::Participant { join },
            ..
        }) = &active
        {
            self.release(join).await;
        }
        let was_active = active.is_some();
        self.link = None;
        self.transport.shutdown().await;
        if self.state() == SessionState::Connected {
            self.set_state(SessionState::Disconnected);
        }
        if was_active {
            self.emit("Left session.");
            tracing::info!("left session");
        }
    }

    /// Tears everything down for process exit. The coordinator returns to
    /// `Uninitialized`.
    pub async fn shutdown(&mut self) {
        self.leave().await;
        self.player = None;
        self.set_state(SessionState::Uninitialized);
        tracing::info!("session coordinator shut down");
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Checks that a create/join may start and returns the signed-in player.
    fn begin(&self, operation: &'static str) -> Result<PlayerId, SessionError> {
        let state = self.state();
        match (&self.player, state.accepts_new_session()) {
            (Some(player), true) => Ok(player.clone()),
            _ => {
                let e = SessionError::InvalidState { operation, state };
                self.report(&e, format!("Cannot {operation} while {state}."));
                Err(e)
            }
        }
    }

    fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "session state changed");
        }
    }

    fn emit(&self, message: impl Into<String>) {
        self.publish(message.into(), None);
    }

    fn report(&self, error: &SessionError, message: String) {
        tracing::warn!(error = %error, "{message}");
        self.publish(message, Some(error.kind()));
    }

    fn publish(&self, message: String, failure: Option<FailureKind>) {
        // No subscribers is fine.
        let _ = self.status.send(StatusEvent {
            state: self.state(),
            message,
            failure,
        });
    }
}
