//! Session Lifecycle
//!
//! Local cache of the authoritative session directory. Status only ever
//! changes in response to directory events; local intents (dismiss,
//! reactivate) are turned into requests and wait for the server's answer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::error::MuxError;
use crate::protocol::{ClientMessage, ServerMessage, SessionId, SessionRecord};

/// Server-reported status of a managed session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Working,
    Waiting,
    Offline,
    /// Hidden from active views until reactivated by the server
    Dismissed,
}

impl SessionStatus {
    /// Whether the session belongs in active views.
    pub fn is_visible(&self) -> bool {
        !matches!(self, SessionStatus::Dismissed)
    }
}

/// Locally cached view of one directory entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManagedSession {
    pub id: SessionId,
    pub correlation_key: Option<String>,
    pub status: SessionStatus,
    pub last_activity: DateTime<Utc>,
}

/// A status transition applied from a directory event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusChange {
    pub session_id: SessionId,
    /// `None` when the session was not known before
    pub from: Option<SessionStatus>,
    /// `None` when the session was removed
    pub to: Option<SessionStatus>,
}

#[derive(Default)]
pub struct SessionDirectory {
    sessions: HashMap<SessionId, ManagedSession>,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &SessionId) -> Option<&ManagedSession> {
        self.sessions.get(id)
    }

    pub fn status(&self, id: &SessionId) -> Option<SessionStatus> {
        self.sessions.get(id).map(|s| s.status)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Sessions that belong in active views, most recently active first.
    pub fn active(&self) -> Vec<&ManagedSession> {
        let mut sessions: Vec<_> = self
            .sessions
            .values()
            .filter(|s| s.status.is_visible())
            .collect();
        sessions.sort_by(|a, b| b.last_activity.cmp(&a.last_activity).then(a.id.cmp(&b.id)));
        sessions
    }

    pub fn dismissed(&self) -> Vec<&ManagedSession> {
        let mut sessions: Vec<_> = self
            .sessions
            .values()
            .filter(|s| !s.status.is_visible())
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    pub fn all(&self) -> Vec<ManagedSession> {
        let mut sessions: Vec<_> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    /// Apply a directory event. Returns the transition when status changed.
    ///
    /// Events carrying an older `last_activity` than the cached record are
    /// reordered deliveries and are ignored.
    pub fn apply(&mut self, event: &ServerMessage) -> Option<StatusChange> {
        match event {
            ServerMessage::SessionCreated { session } | ServerMessage::SessionUpdated { session } => {
                self.upsert(session)
            }
            ServerMessage::SessionRemoved { session_id } => {
                let removed = self.sessions.remove(session_id)?;
                Some(StatusChange {
                    session_id: session_id.clone(),
                    from: Some(removed.status),
                    to: None,
                })
            }
            _ => None,
        }
    }

    fn upsert(&mut self, record: &SessionRecord) -> Option<StatusChange> {
        let now = Utc::now();
        match self.sessions.get_mut(&record.id) {
            Some(existing) => {
                if let Some(at) = record.last_activity {
                    if at < existing.last_activity {
                        debug!(session = %record.id, "ignoring stale directory update");
                        return None;
                    }
                }
                let from = existing.status;
                existing.status = record.status;
                existing.last_activity = record.last_activity.unwrap_or(now);
                if record.correlation_key.is_some() {
                    existing.correlation_key = record.correlation_key.clone();
                }
                (from != record.status).then(|| StatusChange {
                    session_id: record.id.clone(),
                    from: Some(from),
                    to: Some(record.status),
                })
            }
            None => {
                self.sessions.insert(
                    record.id.clone(),
                    ManagedSession {
                        id: record.id.clone(),
                        correlation_key: record.correlation_key.clone(),
                        status: record.status,
                        last_activity: record.last_activity.unwrap_or(now),
                    },
                );
                Some(StatusChange {
                    session_id: record.id.clone(),
                    from: None,
                    to: Some(record.status),
                })
            }
        }
    }

    /// Build the request that asks the server to bring a dismissed session
    /// back. Local status is untouched until the server confirms.
    pub fn reactivate_request(&self, id: &SessionId) -> Result<ClientMessage, MuxError> {
        if !self.sessions.contains_key(id) {
            return Err(MuxError::UnknownDirectorySession(id.clone()));
        }
        Ok(ClientMessage::Reactivate {
            session_id: id.clone(),
        })
    }

    /// Build the request that asks the server to dismiss a session.
    pub fn dismiss_request(&self, id: &SessionId) -> Result<ClientMessage, MuxError> {
        if !self.sessions.contains_key(id) {
            return Err(MuxError::UnknownDirectorySession(id.clone()));
        }
        Ok(ClientMessage::Dismiss {
            session_id: id.clone(),
        })
    }
}
