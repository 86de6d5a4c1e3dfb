//! Connection Reconciler
//!
//! Follows the transport's connect/disconnect lifecycle. The client is the
//! durable record of what should be subscribed: the server forgets its
//! subscription bookkeeping when the connection drops, so every (re)connect
//! replays one `subscribe` per live channel.

use tokio::time::Instant;
use tracing::{debug, info};

use crate::link::Transport;
use crate::multiplexer::Multiplexer;
use crate::surface::SurfaceHost;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected yet
    Connecting,
    Connected { since: Instant },
    Disconnected { since: Instant },
}

pub struct ConnectionReconciler {
    state: ConnectionState,
    /// Completed connects, the first one included
    connects: u64,
}

impl ConnectionReconciler {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Connecting,
            connects: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected { .. })
    }

    pub fn connects(&self) -> u64 {
        self.connects
    }

    /// The transport is ready to send. Resubscribes every registered channel
    /// once, in registry order, and returns how many subscribes went out.
    ///
    /// A duplicate ready notification while already connected is ignored.
    pub fn on_connected<H: SurfaceHost, T: Transport>(
        &mut self,
        mux: &mut Multiplexer<H, T>,
    ) -> Option<usize> {
        if self.is_connected() {
            debug!("duplicate connect notification ignored");
            return None;
        }
        let reconnect = self.connects > 0;
        self.state = ConnectionState::Connected {
            since: Instant::now(),
        };
        self.connects += 1;

        let count = mux.resubscribe_all();
        if reconnect {
            info!(channels = count, "reconnected, resubscribed live channels");
        } else {
            info!(channels = count, "connected");
        }
        Some(count)
    }

    /// The transport dropped. Channels keep their content and their
    /// (now stale) status; outbound traffic queues until the next connect.
    pub fn on_disconnected<H: SurfaceHost, T: Transport>(
        &mut self,
        mux: &mut Multiplexer<H, T>,
        reason: Option<&str>,
    ) {
        if !self.is_connected() {
            debug!("disconnect while not connected");
            mux.suspend();
            return;
        }
        self.state = ConnectionState::Disconnected {
            since: Instant::now(),
        };
        mux.suspend();
        info!(reason = reason.unwrap_or("unknown"), "connection lost");
    }
}

impl Default for ConnectionReconciler {
    fn default() -> Self {
        Self::new()
    }
}
