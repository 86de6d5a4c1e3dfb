//! Debug snapshots of multiplexer state, for consoles and bug reports.
//! Only compiled with the `introspection` feature.

use serde::Serialize;

use crate::channel::ChannelInfo;
use crate::link::Transport;
use crate::multiplexer::Multiplexer;
use crate::protocol::SessionId;
use crate::surface::SurfaceHost;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MuxSnapshot {
    pub channels: Vec<ChannelInfo>,
    pub active: Option<SessionId>,
    pub link_ready: bool,
    pub pending_outbound: usize,
}

impl<H: SurfaceHost, T: Transport> Multiplexer<H, T> {
    pub fn snapshot(&self) -> MuxSnapshot {
        MuxSnapshot {
            channels: self.channel_infos(),
            active: self.active().cloned(),
            link_ready: self.link().is_ready(),
            pending_outbound: self.link().pending_len(),
        }
    }
}
