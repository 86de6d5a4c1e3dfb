//! Core actor
//!
//! One task owns the multiplexer, the reconciler, the placeholder registry
//! and the session directory, and is the only place any of them is mutated.
//! UI callers talk to it through a [`CoreHandle`]; the transport feeds it
//! [`TransportEvent`]s. Re-fit timers and placeholder deadlines are polled in
//! the same loop, so every mutation is serialized.

use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};

use crate::channel::{ChannelInfo, SubscriptionStatus};
use crate::config::MuxConfig;
use crate::error::MuxError;
use crate::lifecycle::{ManagedSession, SessionDirectory, SessionStatus};
use crate::link::Transport;
use crate::multiplexer::{Delivery, Multiplexer};
use crate::placeholder::{
    CleanupToken, CorrelationKey, Placeholder, PlaceholderRegistry, StandInHost,
};
use crate::protocol::{ServerMessage, SessionId, SessionRecord};
use crate::reconciler::{ConnectionReconciler, ConnectionState};
use crate::surface::SurfaceHost;

#[cfg(feature = "introspection")]
use crate::introspect::MuxSnapshot;

const COMMAND_CAPACITY: usize = 64;
const INBOUND_CAPACITY: usize = 1024;
const EVENT_CAPACITY: usize = 256;

/// Lifecycle and traffic reported by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Ready to send
    Connected,
    Disconnected { reason: Option<String> },
    Message(ServerMessage),
}

/// Notifications broadcast to UI observers.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    Connection(ConnectionState),
    ChannelStatus {
        session_id: SessionId,
        status: SubscriptionStatus,
    },
    /// `status` is `None` when the session left the directory
    SessionStatus {
        session_id: SessionId,
        status: Option<SessionStatus>,
    },
    PlaceholderResolved {
        key: CorrelationKey,
        session_id: SessionId,
    },
    PlaceholderExpired {
        key: CorrelationKey,
    },
}

/// Commands sent to the core actor
pub enum CoreCommand<D> {
    Open {
        session_id: SessionId,
        respond_to: oneshot::Sender<Result<ChannelInfo, MuxError>>,
    },
    Show {
        session_id: SessionId,
        respond_to: oneshot::Sender<Result<(), MuxError>>,
    },
    Close {
        session_id: SessionId,
        respond_to: oneshot::Sender<bool>,
    },
    Input {
        session_id: SessionId,
        data: String,
        respond_to: oneshot::Sender<bool>,
    },
    Resize {
        session_id: SessionId,
        cols: u16,
        rows: u16,
        respond_to: oneshot::Sender<bool>,
    },
    Relayout {
        respond_to: oneshot::Sender<()>,
    },
    Record {
        key: CorrelationKey,
        speculative: D,
        cleanup_token: Option<CleanupToken>,
        ttl: Option<Duration>,
        respond_to: oneshot::Sender<()>,
    },
    Resolve {
        key: CorrelationKey,
        session_id: SessionId,
        respond_to: oneshot::Sender<bool>,
    },
    Reactivate {
        session_id: SessionId,
        respond_to: oneshot::Sender<Result<(), MuxError>>,
    },
    Dismiss {
        session_id: SessionId,
        respond_to: oneshot::Sender<Result<(), MuxError>>,
    },
    Channels {
        respond_to: oneshot::Sender<Vec<ChannelInfo>>,
    },
    Active {
        respond_to: oneshot::Sender<Option<SessionId>>,
    },
    Sessions {
        respond_to: oneshot::Sender<Vec<ManagedSession>>,
    },
    Placeholders {
        respond_to: oneshot::Sender<Vec<CorrelationKey>>,
    },
    Connection {
        respond_to: oneshot::Sender<ConnectionState>,
    },
    #[cfg(feature = "introspection")]
    Snapshot {
        respond_to: oneshot::Sender<MuxSnapshot>,
    },
}

/// Handle to communicate with a core actor
pub struct CoreHandle<D> {
    sender: mpsc::Sender<CoreCommand<D>>,
    events: broadcast::Sender<CoreEvent>,
}

impl<D> Clone for CoreHandle<D> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            events: self.events.clone(),
        }
    }
}

impl<D> CoreHandle<D> {
    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> CoreCommand<D>,
    ) -> Result<R, MuxError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| MuxError::CoreGone)?;
        rx.await.map_err(|_| MuxError::CoreGone)
    }

    /// Get or create the channel for `session_id`.
    pub async fn open(&self, session_id: impl Into<SessionId>) -> Result<ChannelInfo, MuxError> {
        let session_id = session_id.into();
        self.request(|respond_to| CoreCommand::Open {
            session_id,
            respond_to,
        })
        .await?
    }

    pub async fn show(&self, session_id: impl Into<SessionId>) -> Result<(), MuxError> {
        let session_id = session_id.into();
        self.request(|respond_to| CoreCommand::Show {
            session_id,
            respond_to,
        })
        .await?
    }

    /// Returns false if no channel was open for the id.
    pub async fn close(&self, session_id: impl Into<SessionId>) -> Result<bool, MuxError> {
        let session_id = session_id.into();
        self.request(|respond_to| CoreCommand::Close {
            session_id,
            respond_to,
        })
        .await
    }

    pub async fn input(
        &self,
        session_id: impl Into<SessionId>,
        data: impl Into<String>,
    ) -> Result<bool, MuxError> {
        let session_id = session_id.into();
        let data = data.into();
        self.request(|respond_to| CoreCommand::Input {
            session_id,
            data,
            respond_to,
        })
        .await
    }

    pub async fn resize(
        &self,
        session_id: impl Into<SessionId>,
        cols: u16,
        rows: u16,
    ) -> Result<bool, MuxError> {
        let session_id = session_id.into();
        self.request(|respond_to| CoreCommand::Resize {
            session_id,
            cols,
            rows,
            respond_to,
        })
        .await
    }

    /// The host's layout settled; re-fit the foregrounded surface now.
    pub async fn relayout(&self) -> Result<(), MuxError> {
        self.request(|respond_to| CoreCommand::Relayout { respond_to })
            .await
    }

    /// Record a placeholder. `ttl` defaults to the configured placeholder TTL.
    pub async fn record(
        &self,
        key: impl Into<CorrelationKey>,
        speculative: D,
        cleanup_token: Option<CleanupToken>,
        ttl: Option<Duration>,
    ) -> Result<(), MuxError> {
        let key = key.into();
        self.request(|respond_to| CoreCommand::Record {
            key,
            speculative,
            cleanup_token,
            ttl,
            respond_to,
        })
        .await
    }

    /// Confirm a placeholder from outside the server event stream.
    ///
    /// Returns false when nothing was pending for `key` (already resolved,
    /// expired, or never recorded).
    pub async fn resolve(
        &self,
        key: impl Into<CorrelationKey>,
        session_id: impl Into<SessionId>,
    ) -> Result<bool, MuxError> {
        let key = key.into();
        let session_id = session_id.into();
        self.request(|respond_to| CoreCommand::Resolve {
            key,
            session_id,
            respond_to,
        })
        .await
    }

    /// Ask the server to bring a dismissed session back.
    pub async fn reactivate(&self, session_id: impl Into<SessionId>) -> Result<(), MuxError> {
        let session_id = session_id.into();
        self.request(|respond_to| CoreCommand::Reactivate {
            session_id,
            respond_to,
        })
        .await?
    }

    pub async fn dismiss(&self, session_id: impl Into<SessionId>) -> Result<(), MuxError> {
        let session_id = session_id.into();
        self.request(|respond_to| CoreCommand::Dismiss {
            session_id,
            respond_to,
        })
        .await?
    }

    /// Open channels in creation order.
    pub async fn channels(&self) -> Result<Vec<ChannelInfo>, MuxError> {
        self.request(|respond_to| CoreCommand::Channels { respond_to })
            .await
    }

    pub async fn active(&self) -> Result<Option<SessionId>, MuxError> {
        self.request(|respond_to| CoreCommand::Active { respond_to })
            .await
    }

    pub async fn sessions(&self) -> Result<Vec<ManagedSession>, MuxError> {
        self.request(|respond_to| CoreCommand::Sessions { respond_to })
            .await
    }

    /// Correlation keys still waiting for confirmation.
    pub async fn placeholders(&self) -> Result<Vec<CorrelationKey>, MuxError> {
        self.request(|respond_to| CoreCommand::Placeholders { respond_to })
            .await
    }

    pub async fn connection(&self) -> Result<ConnectionState, MuxError> {
        self.request(|respond_to| CoreCommand::Connection { respond_to })
            .await
    }

    #[cfg(feature = "introspection")]
    pub async fn snapshot(&self) -> Result<MuxSnapshot, MuxError> {
        self.request(|respond_to| CoreCommand::Snapshot { respond_to })
            .await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }
}

/// The single sequencer. Build with [`Core::new`], then drive with
/// [`Core::run`] (usually via `tokio::spawn`).
pub struct Core<U: SurfaceHost + StandInHost, T> {
    mux: Multiplexer<U, T>,
    reconciler: ConnectionReconciler,
    placeholders: PlaceholderRegistry<U::Speculative>,
    directory: SessionDirectory,
    placeholder_ttl: Duration,
    commands: mpsc::Receiver<CoreCommand<U::Speculative>>,
    inbound: mpsc::Receiver<TransportEvent>,
    events: broadcast::Sender<CoreEvent>,
}

impl<U, T> Core<U, T>
where
    U: SurfaceHost + StandInHost,
    T: Transport,
{
    /// Returns the core, a handle for UI callers, and the sender the
    /// transport uses to report connection lifecycle and inbound messages.
    pub fn new(
        host: U,
        transport: T,
        config: MuxConfig,
    ) -> (
        Self,
        CoreHandle<U::Speculative>,
        mpsc::Sender<TransportEvent>,
    ) {
        let (command_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let core = Self {
            mux: Multiplexer::new(host, transport, &config),
            reconciler: ConnectionReconciler::new(),
            placeholders: PlaceholderRegistry::new(),
            directory: SessionDirectory::new(),
            placeholder_ttl: config.placeholder_ttl,
            commands,
            inbound,
            events: events.clone(),
        };
        let handle = CoreHandle {
            sender: command_tx,
            events,
        };
        (core, handle, inbound_tx)
    }

    /// Run until every [`CoreHandle`] is dropped.
    ///
    /// Inbound traffic is drained ahead of UI commands, so a command issued
    /// after a message was handed to the transport sender observes it.
    pub async fn run(mut self) {
        debug!("session core started");
        let mut inbound_open = true;

        loop {
            tokio::select! {
                biased;

                event = self.inbound.recv(), if inbound_open => match event {
                    Some(event) => self.handle_transport(event),
                    None => {
                        inbound_open = false;
                        debug!("transport event stream closed");
                        self.reconciler.on_disconnected(&mut self.mux, Some("transport gone"));
                        self.emit(CoreEvent::Connection(self.reconciler.state()));
                    }
                },

                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },

                Some(session_id) = self.mux.next_refit(), if self.mux.has_pending_refits() => {
                    self.mux.apply_refit(&session_id);
                }

                Some(expired) = self.placeholders.next_expired(), if !self.placeholders.is_empty() => {
                    self.on_expired(expired);
                }
            }
        }

        debug!("session core stopped");
    }

    fn emit(&self, event: CoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                if self.reconciler.on_connected(&mut self.mux).is_some() {
                    self.emit(CoreEvent::Connection(self.reconciler.state()));
                }
            }
            TransportEvent::Disconnected { reason } => {
                let was_connected = self.reconciler.is_connected();
                self.reconciler
                    .on_disconnected(&mut self.mux, reason.as_deref());
                if was_connected {
                    self.emit(CoreEvent::Connection(self.reconciler.state()));
                }
            }
            TransportEvent::Message(msg) => self.handle_server_message(msg),
        }
    }

    fn handle_server_message(&mut self, msg: ServerMessage) {
        match &msg {
            ServerMessage::SessionCreated { session } | ServerMessage::SessionUpdated { session } => {
                self.apply_directory(&msg);
                self.reconcile(session);
            }
            ServerMessage::SessionRemoved { .. } => self.apply_directory(&msg),
            ServerMessage::Unknown => debug!("ignoring unrecognized server message"),
            _ => {
                if let Delivery::Applied {
                    status,
                    changed: true,
                } = self.mux.handle_message(&msg)
                {
                    if let Some(session_id) = msg.terminal_session() {
                        self.emit(CoreEvent::ChannelStatus {
                            session_id: session_id.clone(),
                            status,
                        });
                    }
                }
            }
        }
    }

    fn apply_directory(&mut self, msg: &ServerMessage) {
        if let Some(change) = self.directory.apply(msg) {
            debug!(
                session = %change.session_id,
                from = ?change.from,
                to = ?change.to,
                "session status changed"
            );
            self.emit(CoreEvent::SessionStatus {
                session_id: change.session_id,
                status: change.to,
            });
        }
    }

    /// Confirm the placeholder an authoritative record refers to, if any.
    fn reconcile(&mut self, session: &SessionRecord) {
        if let Some(key) = session.correlation_key.as_deref() {
            self.confirm(CorrelationKey::new(key), &session.id);
        }
    }

    fn confirm(&mut self, key: CorrelationKey, session_id: &SessionId) -> bool {
        let Some(resolved) = self.placeholders.resolve(&key, session_id) else {
            return false;
        };

        let Placeholder {
            speculative,
            cleanup_token,
            ..
        } = resolved.placeholder;
        let host = self.mux.host_mut();
        host.seed(&resolved.session_id, speculative);
        if let Some(token) = cleanup_token {
            host.remove_stand_in(&token);
        }
        info!(key = %key, session = %resolved.session_id, "placeholder confirmed");
        self.emit(CoreEvent::PlaceholderResolved {
            key,
            session_id: resolved.session_id,
        });
        true
    }

    fn on_expired(&mut self, expired: Placeholder<U::Speculative>) {
        if let Some(token) = expired.cleanup_token {
            self.mux.host_mut().remove_stand_in(&token);
        }
        self.emit(CoreEvent::PlaceholderExpired { key: expired.key });
    }

    fn handle_command(&mut self, cmd: CoreCommand<U::Speculative>) {
        match cmd {
            CoreCommand::Open {
                session_id,
                respond_to,
            } => {
                let result = self.mux.get_or_create(&session_id).map(|c| c.info());
                let _ = respond_to.send(result);
            }

            CoreCommand::Show {
                session_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.mux.show(&session_id));
            }

            CoreCommand::Close {
                session_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.mux.close(&session_id));
            }

            CoreCommand::Input {
                session_id,
                data,
                respond_to,
            } => {
                let _ = respond_to.send(self.mux.input(&session_id, &data));
            }

            CoreCommand::Resize {
                session_id,
                cols,
                rows,
                respond_to,
            } => {
                let _ = respond_to.send(self.mux.resize(&session_id, cols, rows));
            }

            CoreCommand::Relayout { respond_to } => {
                self.mux.relayout();
                let _ = respond_to.send(());
            }

            CoreCommand::Record {
                key,
                speculative,
                cleanup_token,
                ttl,
                respond_to,
            } => {
                let ttl = ttl.unwrap_or(self.placeholder_ttl);
                let superseded =
                    self.placeholders
                        .record_with_stand_in(key, speculative, cleanup_token, ttl);
                if let Some(token) = superseded.and_then(|p| p.cleanup_token) {
                    self.mux.host_mut().remove_stand_in(&token);
                }
                let _ = respond_to.send(());
            }

            CoreCommand::Resolve {
                key,
                session_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.confirm(key, &session_id));
            }

            CoreCommand::Reactivate {
                session_id,
                respond_to,
            } => {
                let result = self
                    .directory
                    .reactivate_request(&session_id)
                    .map(|request| self.mux.send_request(request));
                let _ = respond_to.send(result);
            }

            CoreCommand::Dismiss {
                session_id,
                respond_to,
            } => {
                let result = self
                    .directory
                    .dismiss_request(&session_id)
                    .map(|request| self.mux.send_request(request));
                let _ = respond_to.send(result);
            }

            CoreCommand::Channels { respond_to } => {
                let _ = respond_to.send(self.mux.channel_infos());
            }

            CoreCommand::Active { respond_to } => {
                let _ = respond_to.send(self.mux.active().cloned());
            }

            CoreCommand::Sessions { respond_to } => {
                let _ = respond_to.send(self.directory.all());
            }

            CoreCommand::Placeholders { respond_to } => {
                let _ = respond_to.send(self.placeholders.keys());
            }

            CoreCommand::Connection { respond_to } => {
                let _ = respond_to.send(self.reconciler.state());
            }

            #[cfg(feature = "introspection")]
            CoreCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.mux.snapshot());
            }
        }
    }
}
