//! Wire Protocol Types
//!
//! Message types exchanged with the server over the shared connection.
//! Frames are JSON objects internally tagged with `"type"`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

use crate::error::TransportError;
use crate::lifecycle::SessionStatus;

/// Opaque, stable identifier of a remote session.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Messages sent FROM the client TO the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start (or resume) streaming a session's output to this client.
    /// Idempotent on the server side.
    Subscribe { session_id: SessionId },
    /// Stop streaming a session's output to this client
    Unsubscribe { session_id: SessionId },
    /// Keystrokes for a session
    Input { session_id: SessionId, data: String },
    /// New terminal dimensions for a session
    Resize {
        session_id: SessionId,
        cols: u16,
        rows: u16,
    },
    /// Ask the directory to bring a dismissed session back
    Reactivate { session_id: SessionId },
    /// Ask the directory to hide a session from active views
    Dismiss { session_id: SessionId },
}

impl ClientMessage {
    pub fn subscribe(session_id: &SessionId) -> Self {
        ClientMessage::Subscribe {
            session_id: session_id.clone(),
        }
    }

    pub fn unsubscribe(session_id: &SessionId) -> Self {
        ClientMessage::Unsubscribe {
            session_id: session_id.clone(),
        }
    }

    /// Encode as a JSON text frame.
    pub fn to_frame(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::Encode(e.to_string()))
    }

    /// True for messages that only carry subscription bookkeeping.
    ///
    /// The server forgets these on disconnect, so queued copies are
    /// superseded by the resubscription sweep.
    pub fn is_subscription(&self) -> bool {
        matches!(
            self,
            ClientMessage::Subscribe { .. } | ClientMessage::Unsubscribe { .. }
        )
    }

    pub fn session_id(&self) -> &SessionId {
        match self {
            ClientMessage::Subscribe { session_id }
            | ClientMessage::Unsubscribe { session_id }
            | ClientMessage::Input { session_id, .. }
            | ClientMessage::Resize { session_id, .. }
            | ClientMessage::Reactivate { session_id }
            | ClientMessage::Dismiss { session_id } => session_id,
        }
    }
}

/// Authoritative description of a session as published by the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    /// Value chosen before creation (e.g. the human-entered name) that links
    /// this record back to an optimistic placeholder.
    #[serde(default, alias = "name", skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<String>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

/// Messages sent FROM the server TO the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Live terminal output
    Output { session_id: SessionId, data: String },
    /// Replayed history after a fresh or resumed subscription
    Buffer { session_id: SessionId, data: String },
    /// The remote process is still alive but this link to it was severed
    Detached { session_id: SessionId },
    /// The remote process terminated
    Exit {
        session_id: SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    /// Directory: a session came into existence
    SessionCreated { session: SessionRecord },
    /// Directory: a session's status or activity changed
    SessionUpdated { session: SessionRecord },
    /// Directory: a session no longer exists
    SessionRemoved { session_id: SessionId },
    /// Any message type this client does not understand
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Decode a JSON text frame.
    pub fn from_frame(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// The session a terminal-stream message is addressed to, if any.
    pub fn terminal_session(&self) -> Option<&SessionId> {
        match self {
            ServerMessage::Output { session_id, .. }
            | ServerMessage::Buffer { session_id, .. }
            | ServerMessage::Detached { session_id }
            | ServerMessage::Exit { session_id, .. } => Some(session_id),
            _ => None,
        }
    }
}
