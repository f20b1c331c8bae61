//! Signaling adapter
//!
//! A [`SignalingChannel`] carries JSON envelopes between this client and the
//! relay server. Sends are fire-and-forget; inbound envelopes arrive decoded
//! and validated on an event channel taken once by the session loop.
//! Malformed frames never reach that channel.

mod websocket;

pub use websocket::WebSocketSignaling;

use async_trait::async_trait;
use tandem_core::models::{PeerId, RoomId};
use tandem_core::protocol::{InboundEnvelope, OutboundEnvelope};
use tokio::sync::mpsc;

use crate::error::{ConnectError, Result};

/// Something that happened on the signaling channel
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Message(InboundEnvelope),
    /// The transport closed; no further messages will arrive
    Disconnected { reason: String },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Open the channel and announce ourselves with a `join` envelope
    async fn connect(
        &self,
        url: &str,
        room_id: &RoomId,
        local_id: &PeerId,
    ) -> std::result::Result<(), ConnectError>;

    /// Queue an envelope for delivery. No acknowledgment is awaited.
    fn send(&self, envelope: OutboundEnvelope) -> Result<()>;

    /// Take the event receiver (can only be called once)
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SignalingEvent>>;

    fn is_connected(&self) -> bool;

    /// Close the channel. Safe to call more than once.
    async fn disconnect(&self);
}
