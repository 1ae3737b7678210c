//! Session directory types.
//!
//! A [`SessionDescriptor`] is what a directory lists and what a joiner
//! picks. The relay join code travels inside its public metadata under
//! [`JOIN_CODE_KEY`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{PlayerId, SessionId};

/// Metadata key under which a host publishes its relay join code.
pub const JOIN_CODE_KEY: &str = "joinCode";

/// Whether a session shows up in directory queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

/// A session as the directory knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub id: SessionId,
    /// Human-readable name shown in listings.
    pub name: String,
    /// Short human-shareable code (not the relay join code).
    pub code: String,
    pub max_participants: usize,
    /// Players currently in the session, host first.
    pub participants: Vec<PlayerId>,
    pub visibility: Visibility,
    pub host: PlayerId,
    /// Public metadata, readable by anyone who can see the session.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl SessionDescriptor {
    /// The relay join code published by the host, if any.
    pub fn join_token(&self) -> Option<&str> {
        self.metadata.get(JOIN_CODE_KEY).map(String::as_str)
    }

    /// Free slots left in the session.
    pub fn available_slots(&self) -> usize {
        self.max_participants.saturating_sub(self.participants.len())
    }

    /// Returns `true` when no more participants can join.
    pub fn is_full(&self) -> bool {
        self.available_slots() == 0
    }
}

/// Parameters for creating a session in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub name: String,
    pub max_participants: usize,
    pub visibility: Visibility,
    pub host: PlayerId,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// A predicate over [`SessionDescriptor`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryFilter {
    /// More than `n` free slots.
    AvailableSlotsAbove(usize),
    /// Public metadata `key` equals `value`.
    MetadataEquals { key: String, value: String },
    /// Name contains the substring (case-insensitive).
    NameContains(String),
}

impl QueryFilter {
    /// Returns `true` if `session` satisfies this filter.
    pub fn matches(&self, session: &SessionDescriptor) -> bool {
        match self {
            Self::AvailableSlotsAbove(n) => session.available_slots() > *n,
            Self::MetadataEquals { key, value } => session.metadata.get(key) == Some(value),
            Self::NameContains(needle) => session
                .name
                .to_lowercase()
                .contains(&needle.to_lowercase()),
        }
    }
}

/// A directory query: filters combined with AND, capped to `max_results`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionQuery {
    pub max_results: usize,
    pub filters: Vec<QueryFilter>,
}

impl Default for SessionQuery {
    fn default() -> Self {
        Self {
            max_results: 10,
            filters: Vec::new(),
        }
    }
}

impl SessionQuery {
    /// Adds a filter unless an identical one is already present.
    pub fn with_filter(mut self, filter: QueryFilter) -> Self {
        if !self.filters.contains(&filter) {
            self.filters.push(filter);
        }
        self
    }

    /// Returns `true` if `session` is public and satisfies every filter.
    pub fn matches(&self, session: &SessionDescriptor) -> bool {
        session.visibility == Visibility::Public && self.filters.iter().all(|f| f.matches(session))
    }
}
