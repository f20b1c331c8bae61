//! Chat over the data channel, with signaling as fallback
//!
//! The path is chosen per message at send time: the data channel when it is
//! open, the signaling relay otherwise. Both carry the same [`ChatMessage`]
//! shape. The local log only grows; our own messages are appended when sent,
//! remote ones when received.

use std::sync::Arc;

use parking_lot::RwLock;
use tandem_core::models::{ChatMessage, PeerId, RoomId};
use tandem_core::protocol::{Outbound, OutboundEnvelope};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::MediaEngine;
use crate::error::{Error, Result};
use crate::events::SessionEvent;
use crate::signaling::SignalingChannel;

/// Which transport carried a sent message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatPath {
    DataChannel,
    Signaling,
}

pub struct ChatChannel {
    room_id: RoomId,
    local_id: PeerId,
    display_name: String,
    max_message_length: usize,
    engine: Arc<dyn MediaEngine>,
    signaling: Arc<dyn SignalingChannel>,
    log: RwLock<Vec<ChatMessage>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ChatChannel {
    pub fn new(
        room_id: RoomId,
        local_id: PeerId,
        display_name: String,
        max_message_length: usize,
        engine: Arc<dyn MediaEngine>,
        signaling: Arc<dyn SignalingChannel>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            room_id,
            local_id,
            display_name,
            max_message_length,
            engine,
            signaling,
            log: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Send `body` to the remote peer and log it locally
    pub async fn send(&self, body: &str) -> Result<ChatPath> {
        let body = body.trim();
        if body.is_empty() {
            return Err(Error::InvalidInput("chat message is empty".to_string()));
        }
        if body.chars().count() > self.max_message_length {
            return Err(Error::InvalidInput(format!(
                "chat message exceeds {} characters",
                self.max_message_length
            )));
        }

        let message = ChatMessage::new(self.display_name.clone(), self.local_id.clone(), body);
        let path = if self.engine.is_data_channel_open() {
            self.engine.send_data(&message.to_json()?).await?;
            ChatPath::DataChannel
        } else {
            self.signaling.send(OutboundEnvelope::new(
                self.room_id.clone(),
                self.local_id.clone(),
                Outbound::ChatMessage {
                    message: message.clone(),
                },
            ))?;
            ChatPath::Signaling
        };

        debug!(path = ?path, chars = body.chars().count(), "Chat message sent");
        self.log.write().push(message);
        Ok(path)
    }

    /// Record a message delivered by the signaling relay
    pub fn receive(&self, message: ChatMessage) {
        self.log.write().push(message.clone());
        let _ = self.events.send(SessionEvent::ChatReceived(message));
    }

    /// Record a message delivered as data-channel text; malformed text is dropped
    pub fn receive_data(&self, text: &str) {
        match ChatMessage::from_json(text) {
            Ok(message) if !message.sender_id.is_empty() => self.receive(message),
            Ok(_) => warn!("Dropping data channel chat message without senderId"),
            Err(error) => warn!(error = %error, "Dropping malformed data channel chat message"),
        }
    }

    /// Every message sent or received so far, in order
    #[must_use]
    pub fn history(&self) -> Vec<ChatMessage> {
        self.log.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::MockSignalingChannel;
    use crate::test_helpers::FakeEngine;

    fn channel(
        engine: Arc<FakeEngine>,
        signaling: MockSignalingChannel,
    ) -> (ChatChannel, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let chat = ChatChannel::new(
            RoomId::from("lobby"),
            PeerId::from("alice"),
            "Alice".to_string(),
            16,
            engine,
            Arc::new(signaling),
            tx,
        );
        (chat, rx)
    }

    #[tokio::test]
    async fn test_open_data_channel_is_preferred() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_data_channel_open(true);
        let mut signaling = MockSignalingChannel::new();
        signaling.expect_send().times(0);
        let (chat, _rx) = channel(Arc::clone(&engine), signaling);

        assert_eq!(chat.send("  hello ").await.unwrap(), ChatPath::DataChannel);

        let sent = engine.sent_data();
        assert_eq!(sent.len(), 1);
        assert_eq!(ChatMessage::from_json(&sent[0]).unwrap().body, "hello");
        assert_eq!(chat.history()[0].body, "hello");
    }

    #[tokio::test]
    async fn test_falls_back_to_signaling() {
        let engine = Arc::new(FakeEngine::new());
        let mut signaling = MockSignalingChannel::new();
        signaling
            .expect_send()
            .withf(|envelope| {
                matches!(&envelope.payload, Outbound::ChatMessage { message } if message.body == "hi")
            })
            .times(1)
            .returning(|_| Ok(()));
        let (chat, _rx) = channel(Arc::clone(&engine), signaling);

        assert_eq!(chat.send("hi").await.unwrap(), ChatPath::Signaling);
        assert!(engine.sent_data().is_empty());
        assert_eq!(chat.history().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_empty_and_oversized() {
        let mut signaling = MockSignalingChannel::new();
        signaling.expect_send().times(0);
        let (chat, _rx) = channel(Arc::new(FakeEngine::new()), signaling);

        assert!(matches!(chat.send("   ").await, Err(Error::InvalidInput(_))));
        assert!(matches!(
            chat.send("this is far too long").await,
            Err(Error::InvalidInput(_))
        ));
        assert!(chat.history().is_empty());
    }

    #[test]
    fn test_receive_appends_and_publishes() {
        let (chat, mut rx) = channel(Arc::new(FakeEngine::new()), MockSignalingChannel::new());
        let bob = ChatMessage::new("Bob", PeerId::from("bob"), "yo");

        chat.receive_data(&bob.to_json().unwrap());
        chat.receive_data("{not json");

        assert_eq!(chat.history(), vec![bob.clone()]);
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::ChatReceived(bob));
        assert!(rx.try_recv().is_err());
    }
}
