//! Media engine adapter
//!
//! [`MediaEngine`] is the seam between negotiation and the underlying WebRTC
//! stack: offer/answer creation, description application, candidate
//! ingestion, local track attachment and the chat data channel. Engine
//! callbacks are delivered as [`EngineEvent`]s on a channel taken once by the
//! session loop.
//!
//! [`RtcEngine`] implements it over `webrtc-rs`.

mod rtc;

pub use rtc::RtcEngine;

use async_trait::async_trait;
use tandem_core::protocol::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::track::{AttachOutcome, LocalMedia, LocalTrack, TrackKind};
use crate::types::{ConnectionState, SignalingState, TrackId};

/// Callback raised by the media engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Local state changed in a way that needs a new offer
    NegotiationNeeded,
    /// A local ICE candidate was gathered
    IceCandidate(IceCandidate),
    /// A remote track arrived
    Track { kind: TrackKind, track_id: TrackId },
    ConnectionStateChanged(ConnectionState),
    DataChannelOpen,
    DataChannelClosed,
    /// Text received on the chat data channel
    DataChannelMessage(String),
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Take the event receiver (can only be called once)
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>>;

    fn signaling_state(&self) -> SignalingState;

    async fn has_remote_description(&self) -> bool;

    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    /// Apply a remote description.
    ///
    /// An offer applied while a local offer is outstanding rolls the local
    /// offer back first.
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    /// Ask for a `NegotiationNeeded` event without changing local state
    fn request_negotiation(&self);

    /// Open the default camera and microphone
    async fn acquire_local_media(&self) -> Result<LocalMedia, EngineError>;

    /// Open a capture device of `kind` by name
    async fn open_capture_device(
        &self,
        kind: TrackKind,
        device: &str,
    ) -> Result<LocalTrack, EngineError>;

    /// Whether `open_capture_device` can be used for switching
    fn supports_device_switch(&self) -> bool;

    /// Put `track` on the connection, replacing the track of the slot of
    /// matching kind
    async fn attach_local_track(&self, track: &LocalTrack) -> Result<AttachOutcome, EngineError>;

    /// Enable or disable sending of the slot of `kind`
    async fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<(), EngineError>;

    /// Local tracks currently attached to the connection
    async fn attached_tracks(&self) -> Vec<LocalTrack>;

    fn is_data_channel_open(&self) -> bool;

    async fn send_data(&self, text: &str) -> Result<(), EngineError>;

    /// Close the current connection and build a fresh one with new slots.
    ///
    /// Callbacks of the discarded connection stop being delivered.
    async fn reset(&self) -> Result<(), EngineError>;

    async fn close_data_channel(&self);

    async fn close(&self);

    /// Stop local capture
    async fn release_local_media(&self);
}
