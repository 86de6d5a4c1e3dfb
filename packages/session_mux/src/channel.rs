use serde::{Deserialize, Serialize};

use crate::protocol::SessionId;
use crate::surface::{Dimensions, Notice, Surface};

/// Where a channel stands with respect to its server-side subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Unsubscribed,
    /// Subscribe sent (or queued), nothing heard back yet
    Subscribing,
    /// At least one output or buffer message arrived
    Active,
    /// Remote process alive, link severed
    Detached,
    /// Remote process gone
    Exited,
}

/// Point-in-time description of a channel, safe to hand across the actor
/// boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub session_id: SessionId,
    pub status: SubscriptionStatus,
    pub ordinal: u64,
    pub visible: bool,
    pub loading: bool,
    pub dimensions: Option<Dimensions>,
    pub exit_code: Option<i32>,
}

/// One addressable interactive surface bound to a session.
#[derive(Debug)]
pub struct Channel<S> {
    session_id: SessionId,
    status: SubscriptionStatus,
    surface: S,
    /// Creation sequence number, used for deterministic ordering
    ordinal: u64,
    loading: bool,
    visible: bool,
    dims: Option<Dimensions>,
    exit_code: Option<i32>,
}

impl<S: Surface> Channel<S> {
    pub(crate) fn new(session_id: SessionId, mut surface: S, ordinal: u64) -> Self {
        surface.set_loading(true);
        Self {
            session_id,
            status: SubscriptionStatus::Unsubscribed,
            surface,
            ordinal,
            loading: true,
            visible: false,
            dims: None,
            exit_code: None,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status
    }

    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn dimensions(&self) -> Option<Dimensions> {
        self.dims
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            session_id: self.session_id.clone(),
            status: self.status,
            ordinal: self.ordinal,
            visible: self.visible,
            loading: self.loading,
            dimensions: self.dims,
            exit_code: self.exit_code,
        }
    }

    /// A subscribe for this channel has been sent or queued.
    ///
    /// Exited channels keep their status: the process is gone and a fresh
    /// subscription cannot bring it back.
    pub(crate) fn mark_subscribing(&mut self) {
        if self.status != SubscriptionStatus::Exited {
            self.status = SubscriptionStatus::Subscribing;
        }
    }

    fn first_response(&mut self) {
        if self.loading {
            self.loading = false;
            self.surface.set_loading(false);
        }
    }

    /// Live output and replayed history render the same way: appended in
    /// arrival order.
    pub(crate) fn apply_stream(&mut self, data: &str) {
        self.first_response();
        self.activate();
        self.surface.write(data);
    }

    pub(crate) fn apply_detached(&mut self) {
        self.first_response();
        self.status = SubscriptionStatus::Detached;
        self.surface.notice(&Notice::Detached);
    }

    pub(crate) fn apply_exit(&mut self, code: Option<i32>) {
        self.first_response();
        self.status = SubscriptionStatus::Exited;
        self.exit_code = code;
        self.surface.notice(&Notice::Exited { code });
    }

    fn activate(&mut self) {
        if matches!(
            self.status,
            SubscriptionStatus::Subscribing | SubscriptionStatus::Unsubscribed
        ) {
            self.status = SubscriptionStatus::Active;
        }
    }

    pub(crate) fn set_visible(&mut self, visible: bool) {
        if self.visible != visible {
            self.visible = visible;
            self.surface.set_visible(visible);
        }
    }

    pub(crate) fn focus(&mut self) {
        self.surface.focus();
    }

    /// Re-fit the surface. Returns the new size only when it changed.
    pub(crate) fn refit(&mut self) -> Option<Dimensions> {
        let dims = self.surface.fit()?;
        if self.dims == Some(dims) {
            return None;
        }
        self.dims = Some(dims);
        Some(dims)
    }

    pub(crate) fn record_dimensions(&mut self, dims: Dimensions) {
        self.dims = Some(dims);
    }

    pub(crate) fn dispose(mut self) {
        self.surface.dispose();
    }
}
