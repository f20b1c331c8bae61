//! Tandem two-party WebRTC calls
//!
//! This crate drives one peer-to-peer media connection between two
//! participants of a room, negotiated over a WebSocket signaling relay.
//! Both sides may start an offer at any moment; collisions are resolved with
//! the perfect negotiation pattern, so neither side needs to know who "called".
//!
//! ## Architecture
//!
//! - **`Session`**: Facade tying everything together; owns the event loop
//! - **`Negotiator`**: Offer/answer state machine with glare handling and
//!   recovery from signaling state conflicts
//! - **`SignalingChannel`**: Envelope transport (`WebSocketSignaling`)
//! - **`MediaEngine`**: WebRTC stack adapter (`RtcEngine` over webrtc-rs)
//! - **`MembershipTracker`**: Room roster and call-control relay
//! - **`ChatChannel`**: Text chat over the data channel, with signaling as fallback
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tandem_rtc::{RtcEngine, Session, WebSocketSignaling};
//!
//! let engine = Arc::new(RtcEngine::new(&config.webrtc).await?);
//! let signaling = Arc::new(WebSocketSignaling::new(&config.signaling));
//! let session = Session::initialize(&config, engine, signaling).await?;
//!
//! let mut events = session.take_events().unwrap();
//! session.start().await?;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

mod chat;
mod engine;
mod error;
mod events;
mod membership;
mod negotiation;
mod session;
mod signaling;
mod track;
mod types;

pub mod test_helpers;

pub use chat::{ChatChannel, ChatPath};
pub use engine::{EngineEvent, MediaEngine, RtcEngine};
pub use error::{ConnectError, EngineError, Error, RecoveryError, Result};
pub use events::{CallEvent, SessionEvent};
pub use membership::MembershipTracker;
pub use negotiation::{
    Disposition, IgnoreReason, LifecycleState, NegotiationState, NegotiationStats, Negotiator,
    Role,
};
pub use session::Session;
pub use signaling::{SignalingChannel, SignalingEvent, WebSocketSignaling};
pub use track::{AttachOutcome, LocalMedia, LocalTrack, TrackKind, TrackSlots};
pub use types::{ConnectionState, SignalingState, TrackId};
