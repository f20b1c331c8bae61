//! Signaling wire protocol
//!
//! Every frame on the signaling channel is one JSON object carrying a
//! case-sensitive `type`, the `roomId` it belongs to and the `sender`
//! connection id, plus a type-specific payload. Inbound and outbound
//! vocabularies differ (the server rewrites call-control messages), so they
//! are modelled as two payload enums sharing one envelope shape.

use serde::{Deserialize, Serialize};

use crate::error::MalformedEnvelope;
use crate::models::{ChatMessage, PeerId, RoomId, UserId};

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Pranswer => "pranswer",
            Self::Rollback => "rollback",
        }
    }
}

impl std::fmt::Display for SdpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session description (SDP) as it travels inside `offer`/`answer` envelopes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Identity of the negotiation round this description belongs to.
    ///
    /// Taken from the SDP origin line (`o=<user> <sess-id> <sess-version> ...`):
    /// a re-offer from the same endpoint bumps the version, a duplicate repeats
    /// it. Descriptions without an origin line fall back to the whole body.
    #[must_use]
    pub fn round_id(&self) -> String {
        self.sdp
            .lines()
            .find_map(|line| line.strip_prefix("o="))
            .and_then(|origin| {
                let mut fields = origin.split_whitespace();
                let _user = fields.next()?;
                let session_id = fields.next()?;
                let version = fields.next()?;
                Some(format!("{session_id}/{version}"))
            })
            .unwrap_or_else(|| self.sdp.clone())
    }
}

/// ICE candidate, opaque to the signaling layer.
///
/// Passed through to the media engine as received; only the presence of the
/// `candidate` string is checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceCandidate(pub serde_json::Value);

impl IceCandidate {
    /// The candidate line, if present
    #[must_use]
    pub fn candidate(&self) -> Option<&str> {
        self.0.get("candidate").and_then(serde_json::Value::as_str)
    }
}

/// Body of an inbound `chat-message`.
///
/// Peers send the full [`ChatMessage`]; a bare string body is also accepted
/// and attributed to the envelope sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatPayload {
    Text(String),
    Message(ChatMessage),
}

impl ChatPayload {
    /// Resolve into a message, using `sender` when the body carries no author
    #[must_use]
    pub fn into_message(self, sender: &PeerId) -> ChatMessage {
        match self {
            Self::Text(body) => ChatMessage::new(sender.as_str(), sender.clone(), body),
            Self::Message(message) => message,
        }
    }
}

impl From<ChatMessage> for ChatPayload {
    fn from(message: ChatMessage) -> Self {
        Self::Message(message)
    }
}

/// Envelope shared by both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<P> {
    pub room_id: RoomId,
    pub sender: PeerId,
    #[serde(flatten)]
    pub payload: P,
}

pub type InboundEnvelope = Envelope<Inbound>;
pub type OutboundEnvelope = Envelope<Outbound>;

/// Messages this client consumes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Inbound {
    #[serde(rename = "offer")]
    Offer { sdp: SessionDescription },

    #[serde(rename = "answer")]
    Answer { sdp: SessionDescription },

    #[serde(rename = "ice-candidate")]
    IceCandidate { candidate: IceCandidate },

    /// Full current membership of the room
    #[serde(rename = "room:update")]
    RoomUpdate { clients: Vec<PeerId> },

    /// Membership snapshot sent in reply to our own join
    #[serde(rename = "joined")]
    Joined { clients: Vec<PeerId> },

    #[serde(rename = "chat-message")]
    ChatMessage { message: ChatPayload },

    #[serde(rename = "incoming-call", rename_all = "camelCase")]
    IncomingCall {
        caller: UserId,
        caller_socket_id: PeerId,
    },

    #[serde(rename = "call-accepted")]
    CallAccepted { accepter: PeerId },

    #[serde(rename = "call-rejected")]
    CallRejected { rejecter: PeerId },

    #[serde(rename = "call-ended")]
    CallEnded { ender: PeerId },

    #[serde(rename = "user-disconnected", rename_all = "camelCase")]
    UserDisconnected { disconnected_socket: PeerId },
}

impl Inbound {
    /// Wire name of this message
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::RoomUpdate { .. } => "room:update",
            Self::Joined { .. } => "joined",
            Self::ChatMessage { .. } => "chat-message",
            Self::IncomingCall { .. } => "incoming-call",
            Self::CallAccepted { .. } => "call-accepted",
            Self::CallRejected { .. } => "call-rejected",
            Self::CallEnded { .. } => "call-ended",
            Self::UserDisconnected { .. } => "user-disconnected",
        }
    }
}

/// Messages this client emits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Outbound {
    #[serde(rename = "join")]
    Join,

    #[serde(rename = "offer")]
    Offer { sdp: SessionDescription },

    #[serde(rename = "answer")]
    Answer { sdp: SessionDescription },

    #[serde(rename = "ice-candidate")]
    IceCandidate { candidate: IceCandidate },

    #[serde(rename = "chat-message")]
    ChatMessage { message: ChatMessage },

    #[serde(rename = "call-user", rename_all = "camelCase")]
    CallUser { target_socket_id: PeerId },

    #[serde(rename = "call-accepted", rename_all = "camelCase")]
    CallAccepted { target_socket_id: PeerId },

    #[serde(rename = "call-rejected", rename_all = "camelCase")]
    CallRejected { target_socket_id: PeerId },

    #[serde(rename = "end-call", rename_all = "camelCase")]
    EndCall { target_socket_id: PeerId },
}

impl Outbound {
    /// Wire name of this message
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::ChatMessage { .. } => "chat-message",
            Self::CallUser { .. } => "call-user",
            Self::CallAccepted { .. } => "call-accepted",
            Self::CallRejected { .. } => "call-rejected",
            Self::EndCall { .. } => "end-call",
        }
    }
}

impl<P> Envelope<P> {
    pub fn new(room_id: RoomId, sender: PeerId, payload: P) -> Self {
        Self {
            room_id,
            sender,
            payload,
        }
    }
}

impl InboundEnvelope {
    /// Parse and validate one text frame
    pub fn decode(text: &str) -> Result<Self, MalformedEnvelope> {
        let envelope: Self = serde_json::from_str(text)?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Check the fields serde cannot express as required
    pub fn validate(&self) -> Result<(), MalformedEnvelope> {
        if self.room_id.is_empty() {
            return Err(MalformedEnvelope::new("empty roomId"));
        }
        if self.sender.is_empty() {
            return Err(MalformedEnvelope::new("empty sender"));
        }

        match &self.payload {
            Inbound::Offer { sdp } => validate_description(sdp, SdpType::Offer),
            Inbound::Answer { sdp } => validate_description(sdp, SdpType::Answer),
            Inbound::IceCandidate { candidate } => {
                if candidate.candidate().is_some() {
                    Ok(())
                } else {
                    Err(MalformedEnvelope::new("ice-candidate without candidate string"))
                }
            }
            Inbound::RoomUpdate { clients } | Inbound::Joined { clients } => {
                if clients.iter().any(PeerId::is_empty) {
                    Err(MalformedEnvelope::new("empty participant id in clients"))
                } else {
                    Ok(())
                }
            }
            Inbound::ChatMessage {
                message: ChatPayload::Message(message),
            } => {
                if message.sender_id.is_empty() {
                    Err(MalformedEnvelope::new("chat-message without senderId"))
                } else {
                    Ok(())
                }
            }
            Inbound::ChatMessage {
                message: ChatPayload::Text(body),
            } => {
                if body.trim().is_empty() {
                    Err(MalformedEnvelope::new("empty chat-message body"))
                } else {
                    Ok(())
                }
            }
            Inbound::IncomingCall {
                caller_socket_id, ..
            } => non_empty(caller_socket_id, "callerSocketId"),
            Inbound::CallAccepted { accepter } => non_empty(accepter, "accepter"),
            Inbound::CallRejected { rejecter } => non_empty(rejecter, "rejecter"),
            Inbound::CallEnded { ender } => non_empty(ender, "ender"),
            Inbound::UserDisconnected {
                disconnected_socket,
            } => non_empty(disconnected_socket, "disconnectedSocket"),
        }
    }
}

impl OutboundEnvelope {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn validate_description(
    desc: &SessionDescription,
    expected: SdpType,
) -> Result<(), MalformedEnvelope> {
    if desc.sdp_type != expected {
        return Err(MalformedEnvelope::new(format!(
            "{expected} envelope carries sdp of type {}",
            desc.sdp_type
        )));
    }
    if desc.sdp.trim().is_empty() {
        return Err(MalformedEnvelope::new("empty sdp body"));
    }
    Ok(())
}

fn non_empty(id: &PeerId, field: &str) -> Result<(), MalformedEnvelope> {
    if id.is_empty() {
        Err(MalformedEnvelope::new(format!("empty {field}")))
    } else {
        Ok(())
    }
}
