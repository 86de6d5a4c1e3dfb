//! In-memory surface host and transport.
//!
//! Used by the tests and by embedders that want to drive the core without a
//! real renderer. State is shared behind `Arc<Mutex<_>>` so a clone kept by
//! the caller observes what the core did with the original.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{MountError, TransportError};
use crate::link::Transport;
use crate::placeholder::{Anchor, CleanupToken, StandInHost};
use crate::protocol::{ClientMessage, SessionId};
use crate::surface::{Dimensions, Notice, Surface, SurfaceHost};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Default)]
struct SurfaceState {
    transcript: String,
    loading: bool,
    visible: bool,
    notices: Vec<Notice>,
    fit: Option<Dimensions>,
    fit_count: usize,
    focus_count: usize,
    disposed: bool,
}

/// A surface that records everything done to it.
#[derive(Clone, Debug, Default)]
pub struct MemorySurface {
    state: Arc<Mutex<SurfaceState>>,
}

impl MemorySurface {
    pub fn new(fit: Option<Dimensions>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SurfaceState {
                fit,
                ..Default::default()
            })),
        }
    }

    pub fn transcript(&self) -> String {
        lock(&self.state).transcript.clone()
    }

    pub fn is_loading(&self) -> bool {
        lock(&self.state).loading
    }

    pub fn is_visible(&self) -> bool {
        lock(&self.state).visible
    }

    pub fn notices(&self) -> Vec<Notice> {
        lock(&self.state).notices.clone()
    }

    /// Size reported by the next `fit` calls.
    pub fn set_fit(&self, fit: Option<Dimensions>) {
        lock(&self.state).fit = fit;
    }

    pub fn fit_count(&self) -> usize {
        lock(&self.state).fit_count
    }

    pub fn focus_count(&self) -> usize {
        lock(&self.state).focus_count
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.state).disposed
    }
}

impl Surface for MemorySurface {
    fn write(&mut self, data: &str) {
        lock(&self.state).transcript.push_str(data);
    }

    fn set_loading(&mut self, loading: bool) {
        lock(&self.state).loading = loading;
    }

    fn notice(&mut self, notice: &Notice) {
        lock(&self.state).notices.push(notice.clone());
    }

    fn set_visible(&mut self, visible: bool) {
        lock(&self.state).visible = visible;
    }

    fn fit(&mut self) -> Option<Dimensions> {
        let mut state = lock(&self.state);
        state.fit_count += 1;
        state.fit
    }

    fn focus(&mut self) {
        lock(&self.state).focus_count += 1;
    }

    fn dispose(&mut self) {
        lock(&self.state).disposed = true;
    }
}

#[derive(Debug)]
struct HostState {
    mount_available: bool,
    default_fit: Option<Dimensions>,
    surfaces: HashMap<SessionId, MemorySurface>,
    mounts: usize,
    seeded: Vec<(SessionId, Anchor)>,
    removed: Vec<CleanupToken>,
}

/// Surface and stand-in host backed by [`MemorySurface`]s.
#[derive(Clone, Debug)]
pub struct MemoryHost {
    state: Arc<Mutex<HostState>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::with_fit(Some(Dimensions::new(80, 24)))
    }

    /// New surfaces initially report `fit` as their size.
    pub fn with_fit(fit: Option<Dimensions>) -> Self {
        Self {
            state: Arc::new(Mutex::new(HostState {
                mount_available: true,
                default_fit: fit,
                surfaces: HashMap::new(),
                mounts: 0,
                seeded: Vec::new(),
                removed: Vec::new(),
            })),
        }
    }

    /// When false, `mount` fails as if the UI had no container to offer.
    pub fn set_mount_available(&self, available: bool) {
        lock(&self.state).mount_available = available;
    }

    /// The most recent surface mounted for `session_id`, disposed or not.
    pub fn surface(&self, session_id: &str) -> Option<MemorySurface> {
        lock(&self.state).surfaces.get(session_id).cloned()
    }

    pub fn mount_count(&self) -> usize {
        lock(&self.state).mounts
    }

    pub fn seeded(&self) -> Vec<(SessionId, Anchor)> {
        lock(&self.state).seeded.clone()
    }

    pub fn removed_stand_ins(&self) -> Vec<CleanupToken> {
        lock(&self.state).removed.clone()
    }
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SurfaceHost for MemoryHost {
    type Surface = MemorySurface;

    fn mount(&mut self, session_id: &SessionId) -> Result<MemorySurface, MountError> {
        let mut state = lock(&self.state);
        if !state.mount_available {
            return Err(MountError::NoMountTarget);
        }
        let surface = MemorySurface::new(state.default_fit);
        state.surfaces.insert(session_id.clone(), surface.clone());
        state.mounts += 1;
        Ok(surface)
    }
}

impl StandInHost for MemoryHost {
    type Speculative = Anchor;

    fn seed(&mut self, session_id: &SessionId, speculative: Anchor) {
        lock(&self.state)
            .seeded
            .push((session_id.clone(), speculative));
    }

    fn remove_stand_in(&mut self, token: &CleanupToken) {
        lock(&self.state).removed.push(*token);
    }
}

#[derive(Debug)]
struct TransportState {
    connected: bool,
    sent: Vec<ClientMessage>,
}

/// Transport that records successful sends and can be switched off.
#[derive(Clone, Debug)]
pub struct RecordingTransport {
    state: Arc<Mutex<TransportState>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TransportState {
                connected: true,
                sent: Vec::new(),
            })),
        }
    }

    /// While disconnected every send fails with `NotConnected`.
    pub fn set_connected(&self, connected: bool) {
        lock(&self.state).connected = connected;
    }

    pub fn sent(&self) -> Vec<ClientMessage> {
        lock(&self.state).sent.clone()
    }

    pub fn clear(&self) {
        lock(&self.state).sent.clear();
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for RecordingTransport {
    fn send(&mut self, message: &ClientMessage) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.sent.push(message.clone());
        Ok(())
    }
}
