//! Visual Surface Seam
//!
//! The rendering layer owns how a session's terminal actually looks; the core
//! only drives it through these traits.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::MountError;
use crate::protocol::SessionId;

/// Terminal grid size in character cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub cols: u16,
    pub rows: u16,
}

impl Dimensions {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

/// Inline notice injected into a surface when the remote side changes state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    /// The remote process is still running but this link to it was severed
    Detached,
    /// The remote process terminated
    Exited { code: Option<i32> },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Detached => write!(f, "[session detached - process still running]"),
            Notice::Exited { code: Some(code) } => {
                write!(f, "[process exited with code {}]", code)
            }
            Notice::Exited { code: None } => write!(f, "[process exited]"),
        }
    }
}

/// One mounted terminal surface, exclusively owned by its channel.
pub trait Surface {
    /// Append stream data.
    fn write(&mut self, data: &str);

    /// Show or hide the "waiting for the server" affordance.
    fn set_loading(&mut self, loading: bool);

    /// Render a notice distinct from stream data.
    fn notice(&mut self, notice: &Notice);

    fn set_visible(&mut self, visible: bool);

    /// Recompute the grid size from the container. `None` means the container
    /// has not been laid out yet.
    fn fit(&mut self) -> Option<Dimensions>;

    fn focus(&mut self);

    /// Release the surface. Called exactly once, after which the surface is
    /// never touched again.
    fn dispose(&mut self);
}

/// Supplies surfaces for new channels.
pub trait SurfaceHost {
    type Surface: Surface;

    /// Allocate a surface for `session_id`. Must not block.
    fn mount(&mut self, session_id: &SessionId) -> Result<Self::Surface, MountError>;
}
