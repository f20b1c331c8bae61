//! Events surfaced to the user of a session

use tandem_core::models::{ChatMessage, PeerDescriptor, PeerId};

use crate::negotiation::LifecycleState;
use crate::track::{LocalMedia, TrackKind};
use crate::types::{ConnectionState, TrackId};

/// Call-control notification relayed by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    Incoming { caller: PeerDescriptor },
    Accepted { by: PeerId },
    Rejected { by: PeerId },
    Ended { by: PeerId },
    UserLeft { peer: PeerId },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    LocalMediaReady(LocalMedia),
    RemoteMediaReady { kind: TrackKind, track_id: TrackId },
    ConnectionStateChanged(ConnectionState),
    LifecycleChanged(LifecycleState),
    ChatReceived(ChatMessage),
    RosterChanged(Vec<PeerId>),
    Call(CallEvent),
    /// The signaling channel closed underneath the session
    SignalingLost { reason: String },
}
