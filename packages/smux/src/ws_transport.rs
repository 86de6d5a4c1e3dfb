//! WebSocket transport with automatic reconnect.
//!
//! The [`WsTransport`] half lives inside the core and only enqueues frames;
//! the connection task owns the socket, reconnects with exponential backoff,
//! and reports lifecycle and inbound messages as [`TransportEvent`]s.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tracing::{debug, info, warn};

use session_mux::{
    ClientMessage, ConnectionConfig, ServerMessage, Transport, TransportError, TransportEvent,
};

/// Outbound half handed to the core.
pub struct WsTransport {
    outbound: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
}

/// Socket-owning half, consumed by [`WsConnector::spawn`].
pub struct WsConnector {
    outbound_rx: mpsc::UnboundedReceiver<String>,
    connected: Arc<AtomicBool>,
}

pub fn ws_transport() -> (WsTransport, WsConnector) {
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let connected = Arc::new(AtomicBool::new(false));
    (
        WsTransport {
            outbound,
            connected: connected.clone(),
        },
        WsConnector {
            outbound_rx,
            connected,
        },
    )
}

impl Transport for WsTransport {
    fn send(&mut self, message: &ClientMessage) -> Result<(), TransportError> {
        // Refusing while down makes the link queue the message for later
        if !self.connected.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        let frame = message.to_frame()?;
        self.outbound
            .send(frame)
            .map_err(|_| TransportError::Closed)
    }
}

/// Decode one text frame. Frames this client cannot parse are dropped.
pub fn parse_frame(text: &str) -> Option<ServerMessage> {
    match ServerMessage::from_frame(text) {
        Ok(ServerMessage::Unknown) => {
            debug!("ignoring unrecognized frame type");
            None
        }
        Ok(msg) => Some(msg),
        Err(e) => {
            warn!(error = %e, "dropping malformed frame");
            None
        }
    }
}

impl WsConnector {
    /// Run the connection loop until the core stops listening.
    pub fn spawn(
        self,
        url: String,
        config: ConnectionConfig,
        events: mpsc::Sender<TransportEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(url, config, events))
    }

    async fn run(
        mut self,
        url: String,
        config: ConnectionConfig,
        events: mpsc::Sender<TransportEvent>,
    ) {
        let mut attempt: u32 = 0;
        // Frames accepted while the socket was dying; written first on the
        // next connection so nothing the link handed over is lost.
        let mut carry: Vec<String> = Vec::new();

        loop {
            match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((ws_stream, _)) => {
                    info!(url = %url, "connected");
                    attempt = 0;
                    let (mut ws_write, mut ws_read) = ws_stream.split();

                    let mut flushed = true;
                    let mut held = std::mem::take(&mut carry).into_iter();
                    while let Some(frame) = held.next() {
                        if ws_write
                            .send(tungstenite::Message::Text(frame.clone().into()))
                            .await
                            .is_err()
                        {
                            carry.push(frame);
                            carry.extend(held);
                            flushed = false;
                            break;
                        }
                    }

                    let reason = if flushed {
                        self.connected.store(true, Ordering::Release);
                        if events.send(TransportEvent::Connected).await.is_err() {
                            return;
                        }
                        self.pump(&mut ws_write, &mut ws_read, &events, &mut carry)
                            .await
                    } else {
                        Some("write failed".to_string())
                    };

                    self.connected.store(false, Ordering::Release);
                    while let Ok(frame) = self.outbound_rx.try_recv() {
                        carry.push(frame);
                    }
                    if !carry.is_empty() {
                        debug!(frames = carry.len(), "holding frames for next connection");
                    }
                    if events
                        .send(TransportEvent::Disconnected { reason })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    warn!(url = %url, attempt, error = %e, "connect failed");
                }
            }

            if events.is_closed() {
                return;
            }
            attempt = attempt.saturating_add(1);
            let delay = config.backoff(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::time::sleep(delay).await;
        }
    }

    /// Shuttle frames until the socket closes. Returns the close reason.
    async fn pump<W, R>(
        &mut self,
        ws_write: &mut W,
        ws_read: &mut R,
        events: &mpsc::Sender<TransportEvent>,
        carry: &mut Vec<String>,
    ) -> Option<String>
    where
        W: futures::Sink<tungstenite::Message, Error = tungstenite::Error> + Unpin,
        R: futures::Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
    {
        loop {
            tokio::select! {
                frame = self.outbound_rx.recv() => {
                    let Some(frame) = frame else {
                        return Some("client shut down".to_string());
                    };
                    if let Err(e) = ws_write
                        .send(tungstenite::Message::Text(frame.clone().into()))
                        .await
                    {
                        carry.push(frame);
                        return Some(e.to_string());
                    }
                }

                msg = ws_read.next() => match msg {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        if let Some(msg) = parse_frame(&text) {
                            if events.send(TransportEvent::Message(msg)).await.is_err() {
                                return Some("core stopped".to_string());
                            }
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        return Some(
                            frame
                                .map(|f| f.reason.as_str().to_string())
                                .filter(|r| !r.is_empty())
                                .unwrap_or_else(|| "closed by server".to_string()),
                        );
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Some(e.to_string()),
                    None => return Some("stream ended".to_string()),
                }
            }
        }
    }
}
