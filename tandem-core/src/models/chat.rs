use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::id::PeerId;

/// A chat line exchanged between the two parties of a session.
///
/// The same shape travels over the data channel and over the signaling
/// fallback, so a receiver cannot tell which path delivered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Display name of the author
    pub sender: String,
    /// Connection id of the author
    pub sender_id: PeerId,
    pub body: String,
    pub sent_at_epoch_millis: i64,
}

impl ChatMessage {
    pub fn new(sender: impl Into<String>, sender_id: PeerId, body: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            sender_id,
            body: body.into(),
            sent_at_epoch_millis: Utc::now().timestamp_millis(),
        }
    }

    /// Decode a message received as data-channel text
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_message_wire_shape() {
        let msg = ChatMessage {
            sender: "Alice".to_string(),
            sender_id: PeerId::from("alice"),
            body: "hi".to_string(),
            sent_at_epoch_millis: 1_700_000_000_000,
        };

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["sender"], "Alice");
        assert_eq!(value["senderId"], "alice");
        assert_eq!(value["body"], "hi");
        assert_eq!(value["sentAtEpochMillis"], 1_700_000_000_000_i64);
    }

    #[test]
    fn test_chat_message_rejects_missing_body() {
        let text = r#"{"sender":"Alice","senderId":"alice","sentAtEpochMillis":1}"#;
        assert!(ChatMessage::from_json(text).is_err());
    }
}
