//! Session Mux - interactive session multiplexing over one connection
//!
//! Many terminal-like sessions share a single persistent server connection.
//! This crate keeps one channel per session, routes the server's stream
//! messages to the right surface, resubscribes everything after a reconnect,
//! and reconciles optimistic placeholders with the authoritative events that
//! confirm them. Rendering and sockets stay outside, behind the
//! [`SurfaceHost`], [`StandInHost`] and [`Transport`] traits.
//!
//! # Example
//!
//! ```no_run
//! use session_mux::{Core, MemoryHost, MuxConfig, RecordingTransport, TransportEvent};
//!
//! #[tokio::main]
//! async fn main() {
//!     let host = MemoryHost::new();
//!     let (core, handle, transport_events) =
//!         Core::new(host.clone(), RecordingTransport::new(), MuxConfig::default());
//!     tokio::spawn(core.run());
//!
//!     handle.open("shell-1").await.unwrap();
//!     handle.show("shell-1").await.unwrap();
//!     transport_events.send(TransportEvent::Connected).await.unwrap();
//!
//!     handle.input("shell-1", "ls\n").await.unwrap();
//!     println!("{}", host.surface("shell-1").unwrap().transcript());
//! }
//! ```

mod channel;
pub mod config;
mod core_actor;
mod error;
#[cfg(feature = "introspection")]
mod introspect;
mod lifecycle;
mod link;
mod memory;
mod multiplexer;
mod placeholder;
pub mod protocol;
mod reconciler;
mod surface;

pub use channel::{Channel, ChannelInfo, SubscriptionStatus};
pub use config::{ConnectionConfig, FileConfig, MAX_TIMER_DELAY, MuxConfig, load_config};
pub use core_actor::{Core, CoreEvent, CoreHandle, TransportEvent};
pub use error::{MountError, MuxError, TransportError};
#[cfg(feature = "introspection")]
pub use introspect::MuxSnapshot;
pub use lifecycle::{ManagedSession, SessionDirectory, SessionStatus, StatusChange};
pub use link::{DEFAULT_MAX_PENDING, Link, Transport};
pub use memory::{MemoryHost, MemorySurface, RecordingTransport};
pub use multiplexer::{Delivery, Multiplexer};
pub use placeholder::{
    Anchor, CleanupToken, CorrelationKey, DEFAULT_TTL, Placeholder, PlaceholderRegistry,
    Resolved, StandInHost,
};
pub use protocol::{ClientMessage, ServerMessage, SessionId, SessionRecord};
pub use reconciler::{ConnectionReconciler, ConnectionState};
pub use surface::{Dimensions, Notice, Surface, SurfaceHost};
