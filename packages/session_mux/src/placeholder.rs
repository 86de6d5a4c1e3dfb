//! Placeholder Reconciliation
//!
//! Tracks speculative entities the UI shows before the server has confirmed
//! them. Each placeholder ends exactly once: either an authoritative event
//! resolves it, or its deadline passes. Both paths remove the registry entry
//! and cancel the other, so whichever fires second finds nothing and is a
//! no-op.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::poll_fn;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::time::DelayQueue;
use tokio_util::time::delay_queue::Key;
use tracing::debug;
use uuid::Uuid;

use crate::config::clamp_delay;
use crate::protocol::SessionId;

/// Default time a placeholder may wait for confirmation.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

/// Value shared between a placeholder and the authoritative event that
/// eventually confirms it.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationKey(String);

impl CorrelationKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

/// Identifies a provisional UI object standing in for a not-yet-real entity.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CleanupToken(Uuid);

impl CleanupToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CleanupToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CleanupToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stand-in-{}", self.0)
    }
}

/// Ground-plane position of a session's visual anchor.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub x: f64,
    pub z: f64,
}

/// Receives the UI effects of placeholder outcomes.
pub trait StandInHost {
    type Speculative;

    /// Finalize the confirmed session's presentation from the speculative data
    /// so it does not jump when it appears.
    fn seed(&mut self, session_id: &SessionId, speculative: Self::Speculative);

    /// Remove a provisional object. Unknown tokens are ignored.
    fn remove_stand_in(&mut self, token: &CleanupToken);
}

/// A pending speculative entity.
#[derive(Clone, Debug, PartialEq)]
pub struct Placeholder<D> {
    pub key: CorrelationKey,
    pub speculative: D,
    pub cleanup_token: Option<CleanupToken>,
    pub deadline: Instant,
}

/// A placeholder matched by an authoritative event.
#[derive(Clone, Debug, PartialEq)]
pub struct Resolved<D> {
    pub session_id: SessionId,
    pub placeholder: Placeholder<D>,
}

struct Entry<D> {
    placeholder: Placeholder<D>,
    timer: Key,
}

pub struct PlaceholderRegistry<D> {
    entries: HashMap<CorrelationKey, Entry<D>>,
    deadlines: DelayQueue<CorrelationKey>,
}

impl<D> PlaceholderRegistry<D> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            deadlines: DelayQueue::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &CorrelationKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &CorrelationKey) -> Option<&Placeholder<D>> {
        self.entries.get(key).map(|e| &e.placeholder)
    }

    /// Pending keys, soonest deadline first.
    pub fn keys(&self) -> Vec<CorrelationKey> {
        let mut pending: Vec<_> = self.entries.values().map(|e| &e.placeholder).collect();
        pending.sort_by_key(|p| p.deadline);
        pending.into_iter().map(|p| p.key.clone()).collect()
    }

    /// Record a placeholder without a provisional stand-in.
    pub fn record(
        &mut self,
        key: CorrelationKey,
        speculative: D,
        ttl: Duration,
    ) -> Option<Placeholder<D>> {
        self.record_with_stand_in(key, speculative, None, ttl)
    }

    /// Record a placeholder expiring after `ttl`, clamped to
    /// [`MAX_TIMER_DELAY`](crate::config::MAX_TIMER_DELAY).
    ///
    /// A key maps to at most one live placeholder: recording an existing key
    /// supersedes it, cancels its deadline, and hands it back so the caller
    /// can remove its stand-in.
    pub fn record_with_stand_in(
        &mut self,
        key: CorrelationKey,
        speculative: D,
        cleanup_token: Option<CleanupToken>,
        ttl: Duration,
    ) -> Option<Placeholder<D>> {
        let superseded = self.take(&key);
        if superseded.is_some() {
            debug!(key = %key, "placeholder superseded");
        }

        let timer = self.deadlines.insert(key.clone(), clamp_delay(ttl));
        let placeholder = Placeholder {
            key: key.clone(),
            speculative,
            cleanup_token,
            deadline: self.deadlines.deadline(&timer),
        };
        self.entries.insert(key, Entry { placeholder, timer });
        superseded
    }

    /// Match an authoritative event. `None` when nothing is pending for the
    /// key, which is normal after expiry or a duplicate delivery.
    pub fn resolve(
        &mut self,
        key: &CorrelationKey,
        session_id: &SessionId,
    ) -> Option<Resolved<D>> {
        let placeholder = self.take(key)?;
        debug!(key = %key, session = %session_id, "placeholder resolved");
        Some(Resolved {
            session_id: session_id.clone(),
            placeholder,
        })
    }

    /// Wait for the next deadline to pass and return the expired placeholder.
    ///
    /// Returns `None` immediately when nothing is pending.
    pub async fn next_expired(&mut self) -> Option<Placeholder<D>> {
        loop {
            if self.entries.is_empty() {
                return None;
            }
            let expired = poll_fn(|cx| self.deadlines.poll_expired(cx)).await?;
            let key = expired.into_inner();
            if let Some(entry) = self.entries.remove(&key) {
                debug!(key = %key, "placeholder expired unconfirmed");
                return Some(entry.placeholder);
            }
        }
    }

    fn take(&mut self, key: &CorrelationKey) -> Option<Placeholder<D>> {
        let entry = self.entries.remove(key)?;
        self.deadlines.try_remove(&entry.timer);
        Some(entry.placeholder)
    }
}

impl<D> Default for PlaceholderRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}
