//! Channel Multiplexer
//!
//! Owns every live channel keyed by session id, speaks the subscription
//! protocol through the outbound [`Link`], and routes inbound stream messages
//! to the right channel. Closing a channel is how interest in a session is
//! cancelled: anything that arrives for it afterwards finds no channel and is
//! dropped.

use std::collections::HashMap;
use std::future::poll_fn;
use std::time::Duration;
use tokio_util::time::DelayQueue;
use tokio_util::time::delay_queue::Key;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelInfo, SubscriptionStatus};
use crate::config::{MuxConfig, clamp_delay};
use crate::error::MuxError;
use crate::link::{Link, Transport};
use crate::protocol::{ClientMessage, ServerMessage, SessionId};
use crate::surface::{Dimensions, SurfaceHost};

/// What happened to an inbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Applied to a channel; `changed` is true when its status moved
    Applied {
        status: SubscriptionStatus,
        changed: bool,
    },
    /// Addressed to a session with no channel (closed or never opened)
    Dropped,
    /// Not a terminal-stream message
    NotTerminal,
}

pub struct Multiplexer<H: SurfaceHost, T> {
    host: H,
    link: Link<T>,
    channels: HashMap<SessionId, Channel<H::Surface>>,
    active: Option<SessionId>,
    next_ordinal: u64,
    refit_delays: Vec<Duration>,
    refits: DelayQueue<SessionId>,
    /// Timers belonging to the most recent `show`
    pending_refits: Vec<Key>,
}

impl<H: SurfaceHost, T: Transport> Multiplexer<H, T> {
    pub fn new(host: H, transport: T, config: &MuxConfig) -> Self {
        Self {
            host,
            link: Link::new(transport, config.max_pending),
            channels: HashMap::new(),
            active: None,
            next_ordinal: 0,
            refit_delays: config.refit_delays.iter().map(|d| clamp_delay(*d)).collect(),
            refits: DelayQueue::new(),
            pending_refits: Vec::new(),
        }
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn link(&self) -> &Link<T> {
        &self.link
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.channels.contains_key(session_id)
    }

    pub fn get(&self, session_id: &SessionId) -> Option<&Channel<H::Surface>> {
        self.channels.get(session_id)
    }

    /// The foregrounded channel, if any.
    pub fn active(&self) -> Option<&SessionId> {
        self.active.as_ref()
    }

    /// Registered session ids in registry order (creation order).
    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut channels: Vec<_> = self.channels.values().collect();
        channels.sort_by_key(|c| c.ordinal());
        channels.into_iter().map(|c| c.session_id().clone()).collect()
    }

    pub fn channel_infos(&self) -> Vec<ChannelInfo> {
        let mut infos: Vec<_> = self.channels.values().map(|c| c.info()).collect();
        infos.sort_by_key(|i| i.ordinal);
        infos
    }

    /// Return the channel for `session_id`, creating it if needed.
    ///
    /// Creation mounts a surface (showing its loading affordance) and sends
    /// exactly one `subscribe`. Calling again for a live id is a no-op that
    /// returns the same channel.
    pub fn get_or_create(
        &mut self,
        session_id: &SessionId,
    ) -> Result<&Channel<H::Surface>, MuxError> {
        if !self.channels.contains_key(session_id) {
            let surface = self.host.mount(session_id).map_err(|e| {
                warn!(session = %session_id, error = %e, "cannot mount surface");
                MuxError::NoMountTarget {
                    session_id: session_id.clone(),
                }
            })?;

            let mut channel = Channel::new(session_id.clone(), surface, self.next_ordinal);
            self.next_ordinal += 1;
            channel.mark_subscribing();
            self.link.send(ClientMessage::subscribe(session_id));
            self.channels.insert(session_id.clone(), channel);
            info!(session = %session_id, "channel opened");
        }
        self.channels
            .get(session_id)
            .ok_or_else(|| MuxError::UnknownSession(session_id.clone()))
    }

    /// Foreground exactly one channel: show it, hide all others, re-fit and
    /// focus it, and schedule follow-up re-fits while layout settles.
    pub fn show(&mut self, session_id: &SessionId) -> Result<(), MuxError> {
        if !self.channels.contains_key(session_id) {
            return Err(MuxError::UnknownSession(session_id.clone()));
        }

        self.cancel_refits();
        for (id, channel) in self.channels.iter_mut() {
            channel.set_visible(id == session_id);
        }
        self.active = Some(session_id.clone());

        self.refit(session_id);
        if let Some(channel) = self.channels.get_mut(session_id) {
            channel.focus();
        }
        for delay in &self.refit_delays {
            let key = self.refits.insert(session_id.clone(), *delay);
            self.pending_refits.push(key);
        }
        debug!(session = %session_id, "channel shown");
        Ok(())
    }

    /// Close a channel: unsubscribe, dispose its surface, forget it.
    ///
    /// When the active channel closes, the earliest-created remaining channel
    /// is foregrounded. Returns false if no channel existed.
    pub fn close(&mut self, session_id: &SessionId) -> bool {
        let Some(channel) = self.channels.remove(session_id) else {
            debug!(session = %session_id, "close for unknown channel");
            return false;
        };

        self.link.send(ClientMessage::unsubscribe(session_id));
        let was_active = self.active.as_ref() == Some(session_id);
        if was_active {
            self.cancel_refits();
            self.active = None;
        }
        channel.dispose();
        info!(session = %session_id, "channel closed");

        if was_active {
            if let Some(next) = self.session_ids().into_iter().next() {
                // Cannot fail: `next` was just read from the registry
                let _ = self.show(&next);
            }
        }
        true
    }

    /// Route an inbound message to its channel, in arrival order.
    pub fn handle_message(&mut self, msg: &ServerMessage) -> Delivery {
        let Some(session_id) = msg.terminal_session() else {
            return Delivery::NotTerminal;
        };
        let Some(channel) = self.channels.get_mut(session_id) else {
            debug!(session = %session_id, "dropping message for unknown channel");
            return Delivery::Dropped;
        };

        let before = channel.status();
        match msg {
            ServerMessage::Output { data, .. } | ServerMessage::Buffer { data, .. } => {
                channel.apply_stream(data)
            }
            ServerMessage::Detached { .. } => {
                info!(session = %session_id, "remote session detached");
                channel.apply_detached()
            }
            ServerMessage::Exit { exit_code, .. } => {
                info!(session = %session_id, exit_code = ?exit_code, "remote process exited");
                channel.apply_exit(*exit_code)
            }
            _ => return Delivery::NotTerminal,
        }
        let status = channel.status();
        Delivery::Applied {
            status,
            changed: status != before,
        }
    }

    /// Forward keystrokes. Returns false (and sends nothing) if the channel
    /// is gone.
    pub fn input(&mut self, session_id: &SessionId, data: &str) -> bool {
        if !self.channels.contains_key(session_id) {
            debug!(session = %session_id, "input for unknown channel dropped");
            return false;
        }
        self.link.send(ClientMessage::Input {
            session_id: session_id.clone(),
            data: data.to_string(),
        });
        true
    }

    /// Forward a resize reported by the UI.
    pub fn resize(&mut self, session_id: &SessionId, cols: u16, rows: u16) -> bool {
        let Some(channel) = self.channels.get_mut(session_id) else {
            debug!(session = %session_id, "resize for unknown channel dropped");
            return false;
        };
        channel.record_dimensions(Dimensions::new(cols, rows));
        self.link.send(ClientMessage::Resize {
            session_id: session_id.clone(),
            cols,
            rows,
        });
        true
    }

    /// Immediately re-fit the foregrounded channel, e.g. when the host
    /// reports its layout settled.
    pub fn relayout(&mut self) {
        if let Some(active) = self.active.clone() {
            self.refit(&active);
        }
    }

    /// Send a non-channel request (directory traffic) through the link.
    pub fn send_request(&mut self, message: ClientMessage) {
        self.link.send(message);
    }

    /// The connection dropped. Channels keep their content and status.
    pub fn suspend(&mut self) {
        self.link.mark_down();
    }

    /// The connection is ready again: subscribe every live channel once, in
    /// registry order, ahead of any queued input. Returns how many
    /// subscriptions were issued.
    pub fn resubscribe_all(&mut self) -> usize {
        let ids = self.session_ids();
        let mut messages = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(channel) = self.channels.get_mut(id) {
                channel.mark_subscribing();
                messages.push(ClientMessage::subscribe(id));
            }
        }
        let count = messages.len();
        self.link.reopen(messages);
        count
    }

    pub fn has_pending_refits(&self) -> bool {
        !self.pending_refits.is_empty()
    }

    /// Wait for the next scheduled re-fit. `None` immediately if none pending.
    pub async fn next_refit(&mut self) -> Option<SessionId> {
        if self.pending_refits.is_empty() {
            return None;
        }
        let expired = poll_fn(|cx| self.refits.poll_expired(cx)).await?;
        let key = expired.key();
        self.pending_refits.retain(|k| *k != key);
        Some(expired.into_inner())
    }

    /// Run a scheduled re-fit. Skipped if the channel was closed or is no
    /// longer foregrounded.
    pub fn apply_refit(&mut self, session_id: &SessionId) {
        if self.active.as_ref() != Some(session_id) || !self.channels.contains_key(session_id) {
            debug!(session = %session_id, "stale re-fit skipped");
            return;
        }
        self.refit(session_id);
    }

    fn refit(&mut self, session_id: &SessionId) {
        let Some(channel) = self.channels.get_mut(session_id) else {
            return;
        };
        if let Some(dims) = channel.refit() {
            self.link.send(ClientMessage::Resize {
                session_id: session_id.clone(),
                cols: dims.cols,
                rows: dims.rows,
            });
        }
    }

    fn cancel_refits(&mut self) {
        for key in self.pending_refits.drain(..) {
            self.refits.try_remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryHost, RecordingTransport};

    fn mux() -> (
        Multiplexer<MemoryHost, RecordingTransport>,
        MemoryHost,
        RecordingTransport,
    ) {
        let host = MemoryHost::new();
        let transport = RecordingTransport::new();
        let mut mux = Multiplexer::new(host.clone(), transport.clone(), &MuxConfig::default());
        mux.resubscribe_all();
        (mux, host, transport)
    }

    fn output(id: &str, data: &str) -> ServerMessage {
        ServerMessage::Output {
            session_id: id.into(),
            data: data.into(),
        }
    }

    fn subscribes(transport: &RecordingTransport) -> Vec<String> {
        transport
            .sent()
            .into_iter()
            .filter_map(|m| match m {
                ClientMessage::Subscribe { session_id } => Some(session_id.to_string()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let (mut mux, _host, transport) = mux();
        let id = SessionId::from("shell-1");

        let first = mux.get_or_create(&id).unwrap().ordinal();
        let second = mux.get_or_create(&id).unwrap().ordinal();
        assert_eq!(first, second);
        assert_eq!(mux.len(), 1);
        assert_eq!(subscribes(&transport), vec!["shell-1"]);
        assert_eq!(
            mux.get(&id).unwrap().status(),
            SubscriptionStatus::Subscribing
        );
    }

    #[tokio::test]
    async fn missing_mount_target_fails_without_side_effects() {
        let (mut mux, host, transport) = mux();
        host.set_mount_available(false);

        let err = mux.get_or_create(&"a".into()).unwrap_err();
        assert!(matches!(err, MuxError::NoMountTarget { .. }));
        assert!(mux.is_empty());
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn show_makes_exactly_one_visible() {
        let (mut mux, host, _transport) = mux();
        for id in ["a", "b", "c"] {
            mux.get_or_create(&id.into()).unwrap();
        }
        mux.show(&"b".into()).unwrap();
        assert_eq!(mux.active().map(|s| s.as_str()), Some("b"));
        assert!(host.surface("b").unwrap().is_visible());
        assert!(host.surface("b").unwrap().focus_count() >= 1);
        assert!(!host.surface("a").unwrap().is_visible());
        assert!(!host.surface("c").unwrap().is_visible());

        mux.show(&"c".into()).unwrap();
        assert!(!host.surface("b").unwrap().is_visible());
        assert!(host.surface("c").unwrap().is_visible());
    }

    #[tokio::test]
    async fn show_unknown_is_an_error() {
        let (mut mux, _host, _transport) = mux();
        assert!(matches!(
            mux.show(&"nope".into()),
            Err(MuxError::UnknownSession(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn refits_follow_layout_and_send_resize_on_change() {
        let (mut mux, host, transport) = mux();
        let id = SessionId::from("a");
        mux.get_or_create(&id).unwrap();
        let surface = host.surface("a").unwrap();
        surface.set_fit(None);

        mux.show(&id).unwrap();
        assert_eq!(surface.fit_count(), 1);
        assert!(mux.has_pending_refits());

        // Layout settles between the immediate fit and the first delayed one
        surface.set_fit(Some(Dimensions::new(132, 43)));
        let mut fired = 0;
        while let Some(due) = mux.next_refit().await {
            mux.apply_refit(&due);
            fired += 1;
        }
        assert_eq!(fired, 3);
        assert_eq!(surface.fit_count(), 4);
        let resizes: Vec<_> = transport
            .sent()
            .into_iter()
            .filter(|m| matches!(m, ClientMessage::Resize { .. }))
            .collect();
        assert_eq!(
            resizes,
            vec![ClientMessage::Resize {
                session_id: id.clone(),
                cols: 132,
                rows: 43
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_pending_refits() {
        let (mut mux, host, _transport) = mux();
        let id = SessionId::from("a");
        mux.get_or_create(&id).unwrap();
        mux.show(&id).unwrap();
        let surface = host.surface("a").unwrap();

        assert!(mux.close(&id));
        assert!(!mux.has_pending_refits());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(mux.next_refit().await.is_none());
        assert!(surface.is_disposed());
        assert_eq!(surface.fit_count(), 1);
    }

    #[tokio::test]
    async fn close_sends_unsubscribe_and_reselects_earliest() {
        let (mut mux, host, transport) = mux();
        for id in ["a", "b", "c"] {
            mux.get_or_create(&id.into()).unwrap();
        }
        mux.show(&"b".into()).unwrap();

        assert!(mux.close(&"b".into()));
        assert!(
            transport
                .sent()
                .contains(&ClientMessage::unsubscribe(&"b".into()))
        );
        assert_eq!(mux.active().map(|s| s.as_str()), Some("a"));
        assert!(host.surface("a").unwrap().is_visible());

        mux.close(&"a".into());
        assert_eq!(mux.active().map(|s| s.as_str()), Some("c"));
        mux.close(&"c".into());
        assert!(mux.active().is_none());
        assert!(!mux.close(&"c".into()));
    }

    #[tokio::test]
    async fn closing_inactive_channel_keeps_active() {
        let (mut mux, _host, _transport) = mux();
        mux.get_or_create(&"a".into()).unwrap();
        mux.get_or_create(&"b".into()).unwrap();
        mux.show(&"b".into()).unwrap();
        mux.close(&"a".into());
        assert_eq!(mux.active().map(|s| s.as_str()), Some("b"));
    }

    #[tokio::test]
    async fn scenario_shell_session() {
        let (mut mux, host, transport) = mux();
        let id = SessionId::from("shell-1");
        mux.get_or_create(&id).unwrap();
        assert_eq!(subscribes(&transport), vec!["shell-1"]);
        let surface = host.surface("shell-1").unwrap();
        assert!(surface.is_loading());

        mux.handle_message(&ServerMessage::Buffer {
            session_id: id.clone(),
            data: "$ ".into(),
        });
        assert_eq!(surface.transcript(), "$ ");
        assert!(!surface.is_loading());

        assert!(mux.input(&id, "ls\n"));
        assert_eq!(
            transport.sent().last(),
            Some(&ClientMessage::Input {
                session_id: id.clone(),
                data: "ls\n".into()
            })
        );

        mux.handle_message(&output("shell-1", "file.txt\n$ "));
        assert_eq!(surface.transcript(), "$ file.txt\n$ ");
        assert_eq!(mux.get(&id).unwrap().status(), SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn post_close_messages_are_dropped() {
        let (mut mux, host, _transport) = mux();
        let id = SessionId::from("a");
        mux.get_or_create(&id).unwrap();
        mux.handle_message(&output("a", "before"));
        mux.close(&id);

        let surface = host.surface("a").unwrap();
        assert_eq!(mux.handle_message(&output("a", "after")), Delivery::Dropped);
        assert_eq!(surface.transcript(), "before");
        assert!(!mux.input(&id, "x"));
        assert!(!mux.resize(&id, 80, 24));
    }

    #[tokio::test]
    async fn detach_and_exit_show_distinct_notices() {
        let (mut mux, host, _transport) = mux();
        mux.get_or_create(&"a".into()).unwrap();
        mux.get_or_create(&"b".into()).unwrap();

        let d = mux.handle_message(&ServerMessage::Detached {
            session_id: "a".into(),
        });
        assert_eq!(
            d,
            Delivery::Applied {
                status: SubscriptionStatus::Detached,
                changed: true
            }
        );
        mux.handle_message(&ServerMessage::Exit {
            session_id: "b".into(),
            exit_code: Some(137),
        });

        assert_eq!(
            host.surface("a").unwrap().notices(),
            vec![crate::surface::Notice::Detached]
        );
        assert_eq!(
            host.surface("b").unwrap().notices(),
            vec![crate::surface::Notice::Exited { code: Some(137) }]
        );
        // Exited channels stay inspectable until closed
        assert!(mux.contains(&"b".into()));
        assert_eq!(mux.get(&"b".into()).unwrap().exit_code(), Some(137));
    }

    #[tokio::test]
    async fn directory_messages_are_not_routed() {
        let (mut mux, _host, _transport) = mux();
        let delivery = mux.handle_message(&ServerMessage::SessionRemoved {
            session_id: "a".into(),
        });
        assert_eq!(delivery, Delivery::NotTerminal);
    }

    #[tokio::test]
    async fn resubscribe_all_covers_live_channels_in_order() {
        let (mut mux, _host, transport) = mux();
        for id in ["c", "a", "b"] {
            mux.get_or_create(&id.into()).unwrap();
        }
        mux.close(&"a".into());
        transport.clear();

        mux.suspend();
        assert_eq!(mux.resubscribe_all(), 2);
        assert_eq!(subscribes(&transport), vec!["c", "b"]);
    }
}
