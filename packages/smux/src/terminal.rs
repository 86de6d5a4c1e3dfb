use anyhow::Result;
use nix::libc;
use std::collections::VecDeque;
use std::io::Write;
use tracing::debug;

use session_mux::{
    CleanupToken, Dimensions, MountError, Notice, SessionId, StandInHost, Surface, SurfaceHost,
};

/// Per-channel scrollback kept for repainting when a channel is shown again.
const MAX_TRANSCRIPT_BYTES: usize = 256 * 1024;

const CLEAR_SCREEN: &[u8] = b"\x1b[2J\x1b[H";
const ENTER_ALT_SCREEN: &[u8] = b"\x1b[?1049h";
const LEAVE_ALT_SCREEN: &[u8] = b"\x1b[?1049l";

/// RAII guard for the attach session: raw mode on the alternate screen,
/// original settings and screen restored on drop.
#[cfg(unix)]
pub struct TerminalGuard {
    original: Option<nix::sys::termios::Termios>,
}

#[cfg(unix)]
impl TerminalGuard {
    pub fn new() -> Self {
        use nix::sys::termios;
        let stdin = std::io::stdin();
        let original = termios::tcgetattr(&stdin).ok();
        Self { original }
    }

    pub fn enter_raw_mode(&self) {
        if let Some(ref original) = self.original {
            use nix::sys::termios;
            let stdin = std::io::stdin();
            let mut raw = original.clone();
            termios::cfmakeraw(&mut raw);
            let _ = termios::tcsetattr(&stdin, termios::SetArg::TCSANOW, &raw);
        }
        paint(ENTER_ALT_SCREEN);
    }
}

#[cfg(unix)]
impl Drop for TerminalGuard {
    fn drop(&mut self) {
        paint(LEAVE_ALT_SCREEN);
        if let Some(ref original) = self.original {
            use nix::sys::termios;
            let stdin = std::io::stdin();
            let _ = termios::tcsetattr(&stdin, termios::SetArg::TCSANOW, original);
        }
    }
}

/// Get the current terminal size (rows, cols).
#[cfg(unix)]
pub fn get_terminal_size() -> Result<(u16, u16)> {
    let mut ws = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let ret = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut ws) };
    if ret == -1 {
        anyhow::bail!("ioctl TIOCGWINSZ failed");
    }
    Ok((ws.ws_row, ws.ws_col))
}

fn paint(bytes: &[u8]) {
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_all(bytes);
    let _ = stdout.flush();
}

/// Print a client status line without disturbing the transcript.
pub fn status_line(text: &str) {
    paint(format!("\r\n[smux: {}]\r\n", text).as_bytes());
}

/// Byte-bounded scrollback, oldest chunks evicted first.
#[derive(Debug, Default)]
struct Transcript {
    chunks: VecDeque<String>,
    bytes: usize,
}

impl Transcript {
    fn push(&mut self, data: &str) {
        self.bytes += data.len();
        self.chunks.push_back(data.to_string());
        while self.bytes > MAX_TRANSCRIPT_BYTES && self.chunks.len() > 1 {
            if let Some(evicted) = self.chunks.pop_front() {
                self.bytes -= evicted.len();
            }
        }
    }

    fn clear(&mut self) {
        self.chunks.clear();
        self.bytes = 0;
    }

    fn replay(&self) -> String {
        self.chunks.iter().map(String::as_str).collect()
    }
}

#[derive(Debug, Default)]
struct PaneState {
    transcript: Transcript,
    visible: bool,
    loading: bool,
}

/// One session's pane on the controlling terminal. Only the visible pane
/// writes to stdout; hidden panes accumulate scrollback.
pub struct TerminalSurface {
    session_id: SessionId,
    state: PaneState,
}

impl TerminalSurface {
    fn emit(&mut self, text: &str) {
        self.state.transcript.push(text);
        if self.state.visible {
            paint(text.as_bytes());
        }
    }
}

impl Surface for TerminalSurface {
    fn write(&mut self, data: &str) {
        self.emit(data);
    }

    fn set_loading(&mut self, loading: bool) {
        let state = &mut self.state;
        state.loading = loading;
        if loading && state.visible {
            paint(format!("[smux: waiting for {}]\r\n", self.session_id).as_bytes());
        }
    }

    fn notice(&mut self, notice: &Notice) {
        self.emit(&format!("\r\n{}\r\n", notice));
    }

    fn set_visible(&mut self, visible: bool) {
        let state = &mut self.state;
        state.visible = visible;
        if visible {
            let mut frame = CLEAR_SCREEN.to_vec();
            frame.extend_from_slice(state.transcript.replay().as_bytes());
            if state.loading {
                frame.extend_from_slice(
                    format!("[smux: waiting for {}]\r\n", self.session_id).as_bytes(),
                );
            }
            paint(&frame);
        }
    }

    fn fit(&mut self) -> Option<Dimensions> {
        get_terminal_size()
            .ok()
            .filter(|(rows, cols)| *rows > 0 && *cols > 0)
            .map(|(rows, cols)| Dimensions::new(cols, rows))
    }

    fn focus(&mut self) {
        // Window title follows the foregrounded session
        paint(format!("\x1b]2;smux: {}\x07", self.session_id).as_bytes());
    }

    fn dispose(&mut self) {
        let state = &mut self.state;
        if state.visible {
            paint(CLEAR_SCREEN);
        }
        state.visible = false;
        state.transcript.clear();
    }
}

/// Mounts panes on the controlling terminal. Every session can be mounted;
/// there is a single screen and panes take turns on it.
#[derive(Default)]
pub struct TerminalHost;

impl SurfaceHost for TerminalHost {
    type Surface = TerminalSurface;

    fn mount(&mut self, session_id: &SessionId) -> Result<TerminalSurface, MountError> {
        Ok(TerminalSurface {
            session_id: session_id.clone(),
            state: PaneState::default(),
        })
    }
}

/// The terminal client never creates sessions optimistically, so there is
/// nothing speculative to draw; outcomes are only logged.
impl StandInHost for TerminalHost {
    type Speculative = ();

    fn seed(&mut self, session_id: &SessionId, _speculative: ()) {
        debug!(session = %session_id, "confirmed session has no pane to seed");
    }

    fn remove_stand_in(&mut self, token: &CleanupToken) {
        debug!(token = %token, "no stand-in drawn");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_evicts_oldest_chunks() {
        let mut t = Transcript::default();
        let chunk = "x".repeat(MAX_TRANSCRIPT_BYTES / 2);
        t.push("first");
        t.push(&chunk);
        t.push(&chunk);
        assert!(t.bytes <= MAX_TRANSCRIPT_BYTES);
        assert!(!t.replay().starts_with("first"));
    }

    #[test]
    fn oversized_chunk_is_kept_alone() {
        let mut t = Transcript::default();
        t.push("a");
        t.push(&"y".repeat(MAX_TRANSCRIPT_BYTES + 1));
        assert_eq!(t.chunks.len(), 1);
    }

    #[test]
    fn hidden_pane_accumulates_scrollback() {
        let mut host = TerminalHost;
        let mut surface = host.mount(&"a".into()).unwrap();
        surface.write("one ");
        surface.notice(&Notice::Exited { code: Some(3) });
        let replay = surface.state.transcript.replay();
        assert_eq!(replay, "one \r\n[process exited with code 3]\r\n");

        surface.dispose();
        assert!(surface.state.transcript.replay().is_empty());
    }
}
