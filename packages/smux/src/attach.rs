use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use session_mux::{
    ConnectionConfig, ConnectionState, Core, CoreEvent, CoreHandle, MuxConfig, SessionId,
    SubscriptionStatus,
};

use crate::terminal::{TerminalGuard, TerminalHost, status_line};
use crate::ws_transport::ws_transport;

const DETACH_BYTE: u8 = 0x1D; // Ctrl-]
const CYCLE_BYTE: u8 = 0x1E; // Ctrl-^

/// What happened when an attach session ended.
pub enum AttachOutcome {
    /// User pressed Ctrl-] to detach; sessions keep running.
    Detached,
    /// Every attached session's process exited.
    Exited,
}

/// A keystroke chunk split around the client's control bytes.
#[derive(Debug, PartialEq)]
enum Key<'a> {
    Data(&'a [u8]),
    Cycle,
    Detach,
}

fn split_keys(data: &[u8]) -> Vec<Key<'_>> {
    let mut keys = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        match rest
            .iter()
            .position(|&b| b == DETACH_BYTE || b == CYCLE_BYTE)
        {
            Some(pos) => {
                if pos > 0 {
                    keys.push(Key::Data(&rest[..pos]));
                }
                keys.push(if rest[pos] == DETACH_BYTE {
                    Key::Detach
                } else {
                    Key::Cycle
                });
                rest = &rest[pos + 1..];
            }
            None => {
                keys.push(Key::Data(rest));
                break;
            }
        }
    }
    keys
}

/// Decodes keystrokes into text without splitting multi-byte characters
/// that straddle two reads.
#[derive(Default)]
struct Utf8Carry {
    partial: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.partial.extend_from_slice(bytes);
        let complete = match std::str::from_utf8(&self.partial) {
            Ok(_) => self.partial.len(),
            // Incomplete sequence at the end: hold it for the next read
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.partial.len(),
        };
        let rest = self.partial.split_off(complete);
        let text = String::from_utf8_lossy(&self.partial).into_owned();
        self.partial = rest;
        text
    }
}

/// Read raw keystrokes on a blocking thread. The thread wakes every 100ms to
/// notice `shutdown`, and exits on EOF or when the receiver is dropped.
fn spawn_stdin_reader(shutdown: Arc<AtomicBool>) -> mpsc::Receiver<Vec<u8>> {
    use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
    use std::io::Read;
    use std::os::fd::AsFd;

    let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut buf = [0u8; 4096];
        while !shutdown.load(Ordering::Relaxed) {
            let mut fds = [PollFd::new(stdin.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(100u16)) {
                Ok(n) if n > 0 => {}
                Ok(_) | Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    warn!(error = %e, "stdin poll failed");
                    break;
                }
            }
            let n = match stdin.lock().read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if tx.blocking_send(buf[..n].to_vec()).is_err() {
                break;
            }
        }
        debug!("stdin reader stopped");
    });
    rx
}

/// Foreground the channel after the current one, wrapping around.
async fn cycle(handle: &CoreHandle<()>) -> Result<()> {
    let channels = handle.channels().await?;
    if channels.is_empty() {
        return Ok(());
    }
    let active = handle.active().await?;
    let current = channels
        .iter()
        .position(|c| Some(&c.session_id) == active.as_ref());
    let next = current.map_or(0, |i| (i + 1) % channels.len());
    handle.show(channels[next].session_id.clone()).await?;
    Ok(())
}

async fn all_exited(handle: &CoreHandle<()>) -> Result<bool> {
    let channels = handle.channels().await?;
    Ok(!channels.is_empty()
        && channels
            .iter()
            .all(|c| c.status == SubscriptionStatus::Exited))
}

/// Attach to `sessions` over one connection, forwarding terminal I/O for
/// whichever one is in the foreground.
pub async fn attach(
    url: String,
    mux_config: MuxConfig,
    conn_config: ConnectionConfig,
    sessions: Vec<SessionId>,
) -> Result<AttachOutcome> {
    let (transport, connector) = ws_transport();
    let (core, handle, inbound) = Core::new(TerminalHost, transport, mux_config);
    tokio::spawn(core.run());
    let connection = connector.spawn(url.clone(), conn_config, inbound);

    let guard = TerminalGuard::new();
    guard.enter_raw_mode();

    for session_id in &sessions {
        handle
            .open(session_id.clone())
            .await
            .with_context(|| format!("failed to open {}", session_id))?;
    }
    if let Some(first) = sessions.first() {
        handle.show(first.clone()).await?;
    }
    info!(url = %url, sessions = sessions.len(), "attached");

    let outcome = attach_loop(&handle).await;

    connection.abort();
    drop(guard);
    match &outcome {
        Ok(AttachOutcome::Detached) => eprintln!("\r\n[smux: detached]"),
        Ok(AttachOutcome::Exited) => eprintln!("\r\n[smux: exited]"),
        Err(e) => eprintln!("\r\n[smux: {}]", e),
    }
    outcome
}

async fn attach_loop(handle: &CoreHandle<()>) -> Result<AttachOutcome> {
    let mut events = handle.subscribe();

    #[cfg(unix)]
    let mut sigwinch =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())?;

    let stdin_shutdown = Arc::new(AtomicBool::new(false));
    let mut stdin_rx = spawn_stdin_reader(stdin_shutdown.clone());

    let mut keystrokes = Utf8Carry::default();
    let outcome = loop {
        tokio::select! {
            Some(data) = stdin_rx.recv() => {
                let mut detached = false;
                for key in split_keys(&data) {
                    match key {
                        Key::Data(bytes) => {
                            let text = keystrokes.decode(bytes);
                            if text.is_empty() {
                                continue;
                            }
                            if let Some(active) = handle.active().await? {
                                handle.input(active, text).await?;
                            }
                        }
                        Key::Cycle => cycle(handle).await?,
                        Key::Detach => {
                            detached = true;
                            break;
                        }
                    }
                }
                if detached {
                    break AttachOutcome::Detached;
                }
            }

            event = events.recv() => match event {
                Ok(CoreEvent::Connection(ConnectionState::Connected { .. })) => {
                    debug!("connection up");
                }
                Ok(CoreEvent::Connection(ConnectionState::Disconnected { .. })) => {
                    status_line("connection lost, reconnecting");
                }
                Ok(CoreEvent::ChannelStatus { status: SubscriptionStatus::Exited, .. }) => {
                    if all_exited(handle).await? {
                        break AttachOutcome::Exited;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    anyhow::bail!("session core stopped");
                }
            },

            _ = sigwinch.recv() => {
                handle.relayout().await?;
            }
        }
    };

    stdin_shutdown.store(true, Ordering::Relaxed);
    Ok(outcome)
}
