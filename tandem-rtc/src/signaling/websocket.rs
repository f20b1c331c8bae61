//! WebSocket transport for the signaling channel

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tandem_core::config::SignalingConfig;
use tandem_core::models::{PeerId, RoomId};
use tandem_core::protocol::{InboundEnvelope, Outbound, OutboundEnvelope};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use super::{SignalingChannel, SignalingEvent};
use crate::error::{ConnectError, Error, Result};

/// Signaling over a single WebSocket connection.
///
/// One instance serves one connection lifetime: after `disconnect` a new
/// instance is needed to reconnect.
pub struct WebSocketSignaling {
    connect_timeout: Duration,
    ping_interval: Option<Duration>,
    connected: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalingEvent>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketSignaling {
    #[must_use]
    pub fn new(config: &SignalingConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            connect_timeout: config.connect_timeout(),
            ping_interval: config.ping_interval(),
            connected: AtomicBool::new(false),
            outbound: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn spawn_writer(
        &self,
        mut ws_write: impl futures::Sink<Message, Error = WsError> + Unpin + Send + 'static,
        mut outbound_rx: mpsc::UnboundedReceiver<Message>,
    ) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        let _ = ws_write.send(Message::Close(None)).await;
                        break;
                    }
                    message = outbound_rx.recv() => {
                        let Some(message) = message else { break };
                        if let Err(error) = ws_write.send(message).await {
                            warn!(error = %error, "Failed to write signaling frame");
                            break;
                        }
                    }
                }
            }
            debug!("Signaling writer stopped");
        })
    }

    fn spawn_reader(
        &self,
        mut ws_read: impl futures::Stream<Item = std::result::Result<Message, WsError>>
            + Unpin
            + Send
            + 'static,
    ) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let reason = loop {
                let frame = tokio::select! {
                    () = cancel.cancelled() => break "closed locally".to_string(),
                    frame = ws_read.next() => frame,
                };

                match frame {
                    Some(Ok(Message::Text(text))) => deliver(&events_tx, &text),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => deliver(&events_tx, &text),
                        Err(_) => warn!("Dropping non UTF-8 binary signaling frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map_or_else(
                            || "server closed the connection".to_string(),
                            |f| f.reason.to_string(),
                        );
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        match &error {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!(error = %error, "Signaling websocket closed");
                            }
                            _ => warn!(error = %error, "Signaling websocket error"),
                        }
                        break error.to_string();
                    }
                    None => break "stream ended".to_string(),
                }
            };
            let _ = events_tx.send(SignalingEvent::Disconnected { reason });
            debug!("Signaling reader stopped");
        })
    }

    fn spawn_pinger(&self, interval: Duration, outbound: mpsc::UnboundedSender<Message>) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if outbound.send(Message::Ping(Vec::new())).is_err() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

fn deliver(events_tx: &mpsc::UnboundedSender<SignalingEvent>, text: &str) {
    match InboundEnvelope::decode(text) {
        Ok(envelope) => {
            trace!(kind = envelope.payload.kind(), sender = %envelope.sender, "Signaling message received");
            let _ = events_tx.send(SignalingEvent::Message(envelope));
        }
        Err(error) => warn!(error = %error, "Dropping malformed signaling message"),
    }
}

fn parse_url(url: &str) -> std::result::Result<Url, ConnectError> {
    let parsed = Url::parse(url).map_err(|e| ConnectError::InvalidUrl(format!("{url}: {e}")))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(parsed),
        other => Err(ConnectError::InvalidUrl(format!(
            "{url}: unsupported scheme '{other}'"
        ))),
    }
}

#[async_trait]
impl SignalingChannel for WebSocketSignaling {
    async fn connect(
        &self,
        url: &str,
        room_id: &RoomId,
        local_id: &PeerId,
    ) -> std::result::Result<(), ConnectError> {
        if self.cancel.is_cancelled() {
            return Err(ConnectError::Shutdown);
        }
        if self.connected.load(Ordering::SeqCst) {
            return Err(ConnectError::AlreadyConnected);
        }

        let url = parse_url(url)?;
        let (stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| ConnectError::Timeout(self.connect_timeout))?
            .map_err(|e| ConnectError::Unreachable(e.to_string()))?;

        let (ws_write, ws_read) = stream.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let mut tasks = vec![
            self.spawn_writer(ws_write, outbound_rx),
            self.spawn_reader(ws_read),
        ];
        if let Some(interval) = self.ping_interval {
            tasks.push(self.spawn_pinger(interval, outbound_tx.clone()));
        }
        self.tasks.lock().extend(tasks);
        *self.outbound.lock() = Some(outbound_tx);
        self.connected.store(true, Ordering::SeqCst);

        info!(url = %url, room_id = %room_id, peer_id = %local_id, "Signaling connected");

        self.send(OutboundEnvelope::new(
            room_id.clone(),
            local_id.clone(),
            Outbound::Join,
        ))
        .map_err(|e| ConnectError::Unreachable(e.to_string()))
    }

    fn send(&self, envelope: OutboundEnvelope) -> Result<()> {
        let text = envelope.encode()?;
        let guard = self.outbound.lock();
        let Some(outbound) = guard.as_ref() else {
            return Err(Error::Signaling("not connected".to_string()));
        };
        outbound
            .send(Message::Text(text))
            .map_err(|_| Error::Signaling("connection closed".to_string()))?;
        trace!(kind = envelope.payload.kind(), "Signaling message queued");
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SignalingEvent>> {
        self.events_rx.lock().take()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.connected.store(false, Ordering::SeqCst);
        self.outbound.lock().take();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(error) = task.await {
                debug!(error = %error, "Signaling task ended abnormally");
            }
        }
        info!("Signaling disconnected");
    }
}
