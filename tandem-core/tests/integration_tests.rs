//! Integration tests for the tandem-core wire protocol and configuration
//!
//! Run with: cargo test -p tandem-core --test integration_tests

use std::io::Write;

use tandem_core::{
    models::{ChatMessage, PeerId, RoomId},
    protocol::{ChatPayload, Inbound, InboundEnvelope, Outbound, OutboundEnvelope, SessionDescription},
    Config,
};

#[test]
fn test_outbound_offer_is_readable_as_inbound() {
    let offer = SessionDescription::offer("v=0\r\no=- 42 3 IN IP4 127.0.0.1\r\ns=-\r\n");
    let outbound = OutboundEnvelope::new(
        RoomId::from("lobby"),
        PeerId::from("alice"),
        Outbound::Offer { sdp: offer.clone() },
    );

    let text = outbound.encode().expect("encode");
    let value: serde_json::Value = serde_json::from_str(&text).expect("json");
    assert_eq!(value["type"], "offer");
    assert_eq!(value["roomId"], "lobby");
    assert_eq!(value["sender"], "alice");
    assert_eq!(value["sdp"]["type"], "offer");

    let inbound = InboundEnvelope::decode(&text).expect("decode");
    assert_eq!(inbound.payload, Inbound::Offer { sdp: offer.clone() });
    assert_eq!(offer.round_id(), "42/3");
}

#[test]
fn test_server_call_messages_decode() {
    let incoming = InboundEnvelope::decode(
        r#"{"type":"incoming-call","roomId":"lobby","sender":"server","caller":"Bob","callerSocketId":"sock-2"}"#,
    )
    .expect("incoming-call");
    assert!(matches!(
        incoming.payload,
        Inbound::IncomingCall { ref caller_socket_id, .. } if caller_socket_id.as_str() == "sock-2"
    ));

    let left = InboundEnvelope::decode(
        r#"{"type":"user-disconnected","roomId":"lobby","sender":"server","disconnectedSocket":"sock-2"}"#,
    )
    .expect("user-disconnected");
    assert_eq!(
        left.payload,
        Inbound::UserDisconnected {
            disconnected_socket: PeerId::from("sock-2"),
        }
    );
}

#[test]
fn test_malformed_frames_are_rejected() {
    let frames = [
        "not json",
        r#"{"type":"offer","roomId":"lobby","sender":"bob"}"#,
        r#"{"type":"answer","roomId":"","sender":"bob","sdp":{"type":"answer","sdp":"v=0"}}"#,
        r#"{"type":"offer","roomId":"lobby","sender":"bob","sdp":{"type":"answer","sdp":"v=0"}}"#,
        r#"{"type":"ice-candidate","roomId":"lobby","sender":"bob","candidate":{"sdpMid":"0"}}"#,
        r#"{"type":"teleport","roomId":"lobby","sender":"bob"}"#,
    ];
    for frame in frames {
        assert!(InboundEnvelope::decode(frame).is_err(), "accepted: {frame}");
    }
}

#[test]
fn test_chat_message_shape_is_shared() {
    let message = ChatMessage::new("Alice", PeerId::from("alice"), "hi");
    let outbound = OutboundEnvelope::new(
        RoomId::from("lobby"),
        PeerId::from("alice"),
        Outbound::ChatMessage {
            message: message.clone(),
        },
    );

    let inbound = InboundEnvelope::decode(&outbound.encode().expect("encode")).expect("decode");
    assert_eq!(
        inbound.payload,
        Inbound::ChatMessage {
            message: ChatPayload::Message(message.clone()),
        }
    );

    let over_data_channel = message.to_json().expect("json");
    assert_eq!(ChatMessage::from_json(&over_data_channel).expect("parse"), message);
}

#[test]
fn test_config_file_round_trip() {
    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .expect("tempfile");
    writeln!(
        file,
        "signaling:\n  url: wss://signal.example.com/ws\n  room_id: standup\n  display_name: Alice\nchat:\n  max_message_length: 500\n"
    )
    .expect("write");

    let config = Config::from_file(file.path().to_str().expect("utf-8 path")).expect("load");
    assert_eq!(config.signaling.url, "wss://signal.example.com/ws");
    assert_eq!(config.signaling.room_id, "standup");
    assert_eq!(config.chat.max_message_length, 500);
    assert!(config.validate().is_ok());
}
