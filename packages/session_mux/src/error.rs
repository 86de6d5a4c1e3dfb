use thiserror::Error;

use crate::protocol::SessionId;

/// Errors surfaced to callers of the multiplexer and core handle.
///
/// Delivery anomalies (late messages, duplicates, connection loss) are
/// absorbed internally and never show up here.
#[derive(Debug, Error)]
pub enum MuxError {
    /// The UI layer has nowhere to mount a surface for this session
    #[error("no surface mount target for session {session_id}")]
    NoMountTarget { session_id: SessionId },
    /// No channel is registered for the session
    #[error("no channel for session {0}")]
    UnknownSession(SessionId),
    /// The session directory has no record of the session
    #[error("session {0} is not in the directory")]
    UnknownDirectorySession(SessionId),
    /// The core event loop has shut down
    #[error("session core is gone")]
    CoreGone,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors reported by a [`Transport`](crate::link::Transport) implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The connection is down; the message should be queued and retried
    #[error("transport is not connected")]
    NotConnected,
    /// The transport has shut down for good
    #[error("transport closed")]
    Closed,
    /// The message could not be encoded for the wire
    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// Failure to allocate a visual surface.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MountError {
    #[error("no mount target available")]
    NoMountTarget,
}
