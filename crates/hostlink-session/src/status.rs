//! Coordinator state and the status stream.

use std::fmt;

use tokio::sync::watch;

use crate::{FailureKind, SessionError};

/// Lifecycle of a [`SessionCoordinator`](crate::SessionCoordinator).
///
/// ```text
/// Uninitialized ──→ Authenticating ──→ Ready ──→ Hosting ──┐
///                        │               ▲  └──→ Joining ──┤
///                        ▼               │ (step failed)   ▼
///                      Failed            └────────────  Connected ──→ Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Uninitialized,
    Authenticating,
    Ready,
    Hosting,
    Joining,
    Connected,
    Disconnected,
    Failed,
}

impl SessionState {
    /// Returns `true` once sign-in has succeeded (`Ready` or later).
    pub fn is_ready(self) -> bool {
        !matches!(self, Self::Uninitialized | Self::Authenticating | Self::Failed)
    }

    /// Returns `true` if a new create or join attempt may start.
    pub fn accepts_new_session(self) -> bool {
        matches!(self, Self::Ready | Self::Disconnected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Hosting => "hosting",
            Self::Joining => "joining",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One entry on the status stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// State after the event.
    pub state: SessionState,
    /// Human-readable progress or failure text.
    pub message: String,
    /// Set when the event reports a failure.
    pub failure: Option<FailureKind>,
}

/// Awaitable readiness, replacing poll-until-initialized loops.
#[derive(Debug, Clone)]
pub struct ReadySignal {
    rx: watch::Receiver<SessionState>,
}

impl ReadySignal {
    pub(crate) fn new(rx: watch::Receiver<SessionState>) -> Self {
        Self { rx }
    }

    /// Resolves once sign-in has succeeded.
    ///
    /// # Errors
    /// `AuthenticationFailure` if initialization failed, `InvalidState` if
    /// the coordinator was dropped first.
    pub async fn wait(&mut self) -> Result<(), SessionError> {
        let failed = {
            let state = self
                .rx
                .wait_for(|s| s.is_ready() || *s == SessionState::Failed)
                .await
                .map_err(|_| SessionError::InvalidState {
                    operation: "wait for readiness",
                    state: SessionState::Uninitialized,
                })?;
            *state == SessionState::Failed
        };
        if failed {
            return Err(SessionError::AuthenticationFailure(
                "initialization failed".into(),
            ));
        }
        Ok(())
    }
}
