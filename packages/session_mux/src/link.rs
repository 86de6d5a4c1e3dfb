//! Outbound link: queue until ready, flush in order.
//!
//! The transport underneath may drop out at any time. Messages sent while it
//! is down are queued and flushed once it reports ready; a send that fails on
//! a link believed to be up is requeued at the front and the link goes down.

use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::protocol::ClientMessage;

/// Default bound on queued outbound messages.
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// The connection's outbound half. Framing and sockets live behind this.
pub trait Transport {
    fn send(&mut self, message: &ClientMessage) -> Result<(), TransportError>;
}

pub struct Link<T> {
    transport: T,
    ready: bool,
    pending: VecDeque<ClientMessage>,
    max_pending: usize,
}

impl<T: Transport> Link<T> {
    pub fn new(transport: T, max_pending: usize) -> Self {
        Self {
            transport,
            ready: false,
            pending: VecDeque::new(),
            max_pending: max_pending.max(1),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Send now if possible, otherwise queue behind anything already waiting.
    pub fn send(&mut self, message: ClientMessage) {
        if self.ready && self.pending.is_empty() {
            match self.transport.send(&message) {
                Ok(()) => return,
                Err(e) => {
                    warn!(error = %e, "send failed, link going down");
                    self.ready = false;
                }
            }
        }
        self.enqueue(message);
    }

    /// The transport dropped. Nothing queued is discarded.
    pub fn mark_down(&mut self) {
        self.ready = false;
    }

    /// The transport is ready again.
    ///
    /// Queued subscription traffic is dropped because `resubscribe` is the
    /// authoritative replacement for it; `resubscribe` goes out first, then
    /// the surviving queue in its original order.
    pub fn reopen(&mut self, resubscribe: Vec<ClientMessage>) {
        let before = self.pending.len();
        self.pending.retain(|m| !m.is_subscription());
        let superseded = before - self.pending.len();
        if superseded > 0 {
            debug!(count = superseded, "dropped queued subscription messages");
        }
        for message in resubscribe.into_iter().rev() {
            self.pending.push_front(message);
        }
        self.ready = true;
        self.flush();
    }

    /// Drain the queue in order while the transport accepts messages.
    pub fn flush(&mut self) {
        while self.ready {
            let Some(message) = self.pending.pop_front() else {
                break;
            };
            if let Err(e) = self.transport.send(&message) {
                warn!(error = %e, queued = self.pending.len() + 1, "flush interrupted");
                self.pending.push_front(message);
                self.ready = false;
            }
        }
    }

    fn enqueue(&mut self, message: ClientMessage) {
        if self.pending.len() >= self.max_pending {
            if let Some(dropped) = self.pending.pop_front() {
                warn!(
                    session = %dropped.session_id(),
                    max_pending = self.max_pending,
                    "outbound queue full, dropping oldest message"
                );
            }
        }
        self.pending.push_back(message);
    }
}
