//! Test doubles for tandem-rtc tests
//!
//! [`FakeEngine`] follows the browser offer/answer state machine closely
//! enough for negotiation to be exercised without a network stack.
//! [`RecordingSignaling`] keeps what was sent so tests can deliver it by
//! hand, and [`LoopbackHub`] relays between in-process clients the way the
//! relay server does.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tandem_core::models::{PeerId, RoomId, UserId};
use tandem_core::protocol::{
    IceCandidate, Inbound, InboundEnvelope, Outbound, OutboundEnvelope, SdpType,
    SessionDescription,
};
use tandem_core::Config;
use tokio::sync::{mpsc, oneshot};

use crate::engine::{EngineEvent, MediaEngine};
use crate::error::{ConnectError, EngineError, Error, Result};
use crate::signaling::{SignalingChannel, SignalingEvent};
use crate::track::{AttachOutcome, LocalMedia, LocalTrack, TrackKind, TrackSlots};
use crate::types::SignalingState;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Config for a session in `room` with a fixed peer id
pub fn test_config(room: &str, peer: &str) -> Config {
    let mut config = Config::default();
    config.signaling.url = "ws://loopback.test/signal".to_string();
    config.signaling.room_id = room.to_string();
    config.signaling.peer_id = Some(peer.to_string());
    config.signaling.display_name = peer.to_string();
    config
}

/// Minimal SDP carrying an origin line
pub fn test_sdp(session: u64, version: u64) -> String {
    format!("v=0\r\no=- {session} {version} IN IP4 127.0.0.1\r\ns=tandem\r\nt=0 0\r\n")
}

pub fn test_candidate(line: &str) -> IceCandidate {
    IceCandidate(serde_json::json!({
        "candidate": line,
        "sdpMid": "0",
        "sdpMLineIndex": 0,
    }))
}

#[derive(Debug)]
struct FakeState {
    signaling: SignalingState,
    remote: Option<SessionDescription>,
    session_id: u64,
    version: u64,
    slots: TrackSlots,
    negotiation_queued: bool,
    negotiation_pending: bool,
    closed: bool,
    data_channel_open: bool,
    sent_data: Vec<String>,
    candidates: Vec<IceCandidate>,
    completed_rounds: u64,
    resets: u64,
    acquisitions: u64,
    released: bool,
    fail_remote: Option<EngineError>,
    fail_candidate: bool,
    fail_reset: Option<EngineError>,
    fail_acquire: bool,
}

impl FakeState {
    fn fresh() -> Self {
        Self {
            signaling: SignalingState::Stable,
            remote: None,
            session_id: NEXT_SESSION.fetch_add(1, Ordering::SeqCst),
            version: 0,
            slots: TrackSlots::allocated(),
            negotiation_queued: false,
            negotiation_pending: false,
            closed: false,
            data_channel_open: false,
            sent_data: Vec::new(),
            candidates: Vec::new(),
            completed_rounds: 0,
            resets: 0,
            acquisitions: 0,
            released: false,
            fail_remote: None,
            fail_candidate: false,
            fail_reset: None,
            fail_acquire: false,
        }
    }

    /// Rebuild the connection part, keeping counters and injected faults
    fn rebuild(&mut self) {
        self.signaling = SignalingState::Stable;
        self.remote = None;
        self.session_id = NEXT_SESSION.fetch_add(1, Ordering::SeqCst);
        self.version = 0;
        self.slots = TrackSlots::allocated();
        self.negotiation_queued = false;
        self.negotiation_pending = false;
        self.closed = false;
        self.data_channel_open = false;
    }

    fn check_open(&self) -> std::result::Result<(), EngineError> {
        if self.closed {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }

    /// Whether a negotiation-needed event should fire now
    fn need_negotiation(&mut self) -> bool {
        if self.signaling != SignalingState::Stable {
            self.negotiation_pending = true;
            return false;
        }
        if self.negotiation_queued {
            return false;
        }
        self.negotiation_queued = true;
        true
    }

    /// Back to stable after a completed round
    fn complete_round(&mut self) -> bool {
        self.signaling = SignalingState::Stable;
        self.completed_rounds += 1;
        if std::mem::take(&mut self.negotiation_pending) {
            self.need_negotiation()
        } else {
            false
        }
    }
}

/// In-memory media engine
pub struct FakeEngine {
    state: Mutex<FakeState>,
    device_switch: bool,
    acquire_gate: Mutex<Option<oneshot::Receiver<()>>>,
    acquire_waiting: AtomicBool,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::with_device_switch(true)
    }

    /// Engine whose capture devices are fixed
    pub fn without_device_switch() -> Self {
        Self::with_device_switch(false)
    }

    fn with_device_switch(device_switch: bool) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(FakeState::fresh()),
            device_switch,
            acquire_gate: Mutex::new(None),
            acquire_waiting: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Suspend the next `acquire_local_media` until the returned sender
    /// fires or is dropped
    pub fn hold_next_acquire(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.acquire_gate.lock() = Some(rx);
        tx
    }

    /// Whether an acquisition is suspended on the gate
    pub fn is_acquire_waiting(&self) -> bool {
        self.acquire_waiting.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn set_data_channel_open(&self, open: bool) {
        self.state.lock().data_channel_open = open;
        self.emit(if open {
            EngineEvent::DataChannelOpen
        } else {
            EngineEvent::DataChannelClosed
        });
    }

    /// Make the next `set_remote_description` fail with `error`
    pub fn fail_next_remote_description(&self, error: EngineError) {
        self.state.lock().fail_remote = Some(error);
    }

    pub fn fail_next_candidate(&self) {
        self.state.lock().fail_candidate = true;
    }

    pub fn fail_next_reset(&self, error: EngineError) {
        self.state.lock().fail_reset = Some(error);
    }

    pub fn fail_acquire(&self) {
        self.state.lock().fail_acquire = true;
    }

    pub fn sent_data(&self) -> Vec<String> {
        self.state.lock().sent_data.clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().candidates.clone()
    }

    /// Offer/answer exchanges that ended back in stable
    pub fn completed_rounds(&self) -> u64 {
        self.state.lock().completed_rounds
    }

    pub fn resets(&self) -> u64 {
        self.state.lock().resets
    }

    pub fn acquisitions(&self) -> u64 {
        self.state.lock().acquisitions
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    pub fn is_track_enabled(&self, kind: TrackKind) -> bool {
        self.state.lock().slots.is_enabled(kind)
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.events_rx.lock().take()
    }

    fn signaling_state(&self) -> SignalingState {
        let state = self.state.lock();
        if state.closed {
            SignalingState::Closed
        } else {
            state.signaling
        }
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    async fn create_offer(&self) -> std::result::Result<SessionDescription, EngineError> {
        let mut state = self.state.lock();
        state.check_open()?;
        if state.signaling == SignalingState::HaveRemoteOffer {
            return Err(EngineError::StateConflict(
                "cannot create offer in have-remote-offer".to_string(),
            ));
        }
        state.negotiation_queued = false;
        state.version += 1;
        Ok(SessionDescription::offer(test_sdp(state.session_id, state.version)))
    }

    async fn create_answer(&self) -> std::result::Result<SessionDescription, EngineError> {
        let state = self.state.lock();
        state.check_open()?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(EngineError::StateConflict(format!(
                "cannot create answer in {}",
                state.signaling
            )));
        }
        Ok(SessionDescription::answer(test_sdp(state.session_id, state.version + 1)))
    }

    async fn set_local_description(
        &self,
        desc: SessionDescription,
    ) -> std::result::Result<(), EngineError> {
        let renegotiate = {
            let mut state = self.state.lock();
            state.check_open()?;
            match (desc.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::HaveLocalOffer;
                    false
                }
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => state.complete_round(),
                (SdpType::Rollback, SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::Stable;
                    false
                }
                (sdp_type, current) => {
                    return Err(EngineError::StateConflict(format!(
                        "cannot apply local {sdp_type} in {current}"
                    )));
                }
            }
        };
        if renegotiate {
            self.emit(EngineEvent::NegotiationNeeded);
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> std::result::Result<(), EngineError> {
        let renegotiate = {
            let mut state = self.state.lock();
            state.check_open()?;
            if let Some(error) = state.fail_remote.take() {
                return Err(error);
            }
            if !desc.sdp.starts_with("v=0") {
                return Err(EngineError::InvalidDescription(
                    "sdp does not start with v=0".to_string(),
                ));
            }
            match (desc.sdp_type, state.signaling) {
                (
                    SdpType::Offer,
                    SignalingState::Stable
                    | SignalingState::HaveLocalOffer
                    | SignalingState::HaveRemoteOffer,
                ) => {
                    state.signaling = SignalingState::HaveRemoteOffer;
                    state.remote = Some(desc);
                    false
                }
                (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                    state.remote = Some(desc);
                    state.complete_round()
                }
                (sdp_type, current) => {
                    return Err(EngineError::StateConflict(format!(
                        "cannot apply remote {sdp_type} in {current}"
                    )));
                }
            }
        };
        if renegotiate {
            self.emit(EngineEvent::NegotiationNeeded);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> std::result::Result<(), EngineError> {
        let mut state = self.state.lock();
        state.check_open()?;
        if std::mem::take(&mut state.fail_candidate) {
            return Err(EngineError::Internal("candidate rejected".to_string()));
        }
        if state.remote.is_none() {
            return Err(EngineError::InvalidDescription(
                "no remote description".to_string(),
            ));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    fn request_negotiation(&self) {
        self.emit(EngineEvent::NegotiationNeeded);
    }

    async fn acquire_local_media(&self) -> std::result::Result<LocalMedia, EngineError> {
        let gate = self.acquire_gate.lock().take();
        if let Some(gate) = gate {
            self.acquire_waiting.store(true, Ordering::SeqCst);
            let _ = gate.await;
            self.acquire_waiting.store(false, Ordering::SeqCst);
        }
        let mut state = self.state.lock();
        if state.fail_acquire {
            return Err(EngineError::MediaUnavailable("no capture device".to_string()));
        }
        state.acquisitions += 1;
        state.released = false;
        Ok(LocalMedia {
            audio: LocalTrack::new(TrackKind::Audio, Some("default".to_string())),
            video: LocalTrack::new(TrackKind::Video, Some("default".to_string())),
        })
    }

    async fn open_capture_device(
        &self,
        kind: TrackKind,
        device: &str,
    ) -> std::result::Result<LocalTrack, EngineError> {
        if !self.supports_device_switch() {
            return Err(EngineError::MediaUnavailable(format!("cannot open {device}")));
        }
        Ok(LocalTrack::new(kind, Some(device.to_string())))
    }

    fn supports_device_switch(&self) -> bool {
        self.device_switch
    }

    async fn attach_local_track(
        &self,
        track: &LocalTrack,
    ) -> std::result::Result<AttachOutcome, EngineError> {
        let (outcome, renegotiate) = {
            let mut state = self.state.lock();
            state.check_open()?;
            let outcome = state.slots.attach(track.clone());
            let renegotiate = matches!(
                outcome,
                AttachOutcome::Replaced { previous: None } | AttachOutcome::AdHoc
            ) && state.need_negotiation();
            (outcome, renegotiate)
        };
        if renegotiate {
            self.emit(EngineEvent::NegotiationNeeded);
        }
        Ok(outcome)
    }

    async fn set_track_enabled(
        &self,
        kind: TrackKind,
        enabled: bool,
    ) -> std::result::Result<(), EngineError> {
        let mut state = self.state.lock();
        state.check_open()?;
        state.slots.set_enabled(kind, enabled);
        Ok(())
    }

    async fn attached_tracks(&self) -> Vec<LocalTrack> {
        self.state.lock().slots.attached()
    }

    fn is_data_channel_open(&self) -> bool {
        let state = self.state.lock();
        state.data_channel_open && !state.closed
    }

    async fn send_data(&self, text: &str) -> std::result::Result<(), EngineError> {
        let mut state = self.state.lock();
        if !state.data_channel_open {
            return Err(EngineError::DataChannel("data channel is not open".to_string()));
        }
        state.sent_data.push(text.to_string());
        Ok(())
    }

    async fn reset(&self) -> std::result::Result<(), EngineError> {
        let mut state = self.state.lock();
        if let Some(error) = state.fail_reset.take() {
            return Err(error);
        }
        state.resets += 1;
        state.rebuild();
        Ok(())
    }

    async fn close_data_channel(&self) {
        let was_open = std::mem::replace(&mut self.state.lock().data_channel_open, false);
        if was_open {
            self.emit(EngineEvent::DataChannelClosed);
        }
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.signaling = SignalingState::Closed;
    }

    async fn release_local_media(&self) {
        self.state.lock().released = true;
    }
}

/// Signaling channel that records instead of sending
pub struct RecordingSignaling {
    connected: AtomicBool,
    sent: Mutex<Vec<OutboundEnvelope>>,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalingEvent>>>,
}

impl Default for RecordingSignaling {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSignaling {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            connected: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Drain everything sent so far
    pub fn take_sent(&self) -> Vec<OutboundEnvelope> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Everything sent so far, without draining
    pub fn sent(&self) -> Vec<OutboundEnvelope> {
        self.sent.lock().clone()
    }

    /// Push an inbound envelope to whoever holds the event receiver
    pub fn deliver(&self, envelope: InboundEnvelope) {
        let _ = self.events_tx.send(SignalingEvent::Message(envelope));
    }

    pub fn drop_connection(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events_tx.send(SignalingEvent::Disconnected {
            reason: reason.to_string(),
        });
    }
}

#[async_trait]
impl SignalingChannel for RecordingSignaling {
    async fn connect(
        &self,
        _url: &str,
        room_id: &RoomId,
        local_id: &PeerId,
    ) -> std::result::Result<(), ConnectError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(ConnectError::AlreadyConnected);
        }
        self.sent.lock().push(OutboundEnvelope::new(
            room_id.clone(),
            local_id.clone(),
            Outbound::Join,
        ));
        Ok(())
    }

    fn send(&self, envelope: OutboundEnvelope) -> Result<()> {
        self.sent.lock().push(envelope);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SignalingEvent>> {
        self.events_rx.lock().take()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// What the receiving client sees for a relayed envelope, if the payload
/// has an inbound form
pub fn as_inbound(envelope: &OutboundEnvelope) -> Option<InboundEnvelope> {
    let value = serde_json::to_value(envelope).ok()?;
    serde_json::from_value(value).ok()
}

/// In-process relay server
#[derive(Default)]
pub struct LoopbackHub {
    rooms: DashMap<RoomId, Vec<PeerId>>,
    clients: DashMap<PeerId, mpsc::UnboundedSender<SignalingEvent>>,
    unreachable: AtomicBool,
    log: Mutex<Vec<OutboundEnvelope>>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A client connected through this hub
    pub fn client(self: &Arc<Self>) -> LoopbackSignaling {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        LoopbackSignaling {
            hub: Arc::clone(self),
            joined: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Refuse every subsequent connect
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Every envelope the hub received, in order
    pub fn sent(&self) -> Vec<OutboundEnvelope> {
        self.log.lock().clone()
    }

    pub fn members(&self, room_id: &RoomId) -> Vec<PeerId> {
        self.rooms
            .get(room_id)
            .map(|members| members.value().clone())
            .unwrap_or_default()
    }

    /// Feed a raw text frame to `to`, as the transport would. Malformed
    /// frames are dropped; returns whether it was delivered.
    pub fn inject_text(&self, to: &PeerId, text: &str) -> bool {
        let Ok(envelope) = InboundEnvelope::decode(text) else {
            return false;
        };
        self.deliver(to, envelope);
        true
    }

    fn deliver(&self, to: &PeerId, envelope: InboundEnvelope) {
        if let Some(client) = self.clients.get(to) {
            let _ = client.send(SignalingEvent::Message(envelope));
        }
    }

    fn broadcast(&self, room_id: &RoomId, except: Option<&PeerId>, payload: &Inbound, sender: &PeerId) {
        for member in self.members(room_id) {
            if Some(&member) == except {
                continue;
            }
            self.deliver(
                &member,
                InboundEnvelope::new(room_id.clone(), sender.clone(), payload.clone()),
            );
        }
    }

    fn join(&self, room_id: &RoomId, peer: &PeerId, tx: mpsc::UnboundedSender<SignalingEvent>) {
        self.clients.insert(peer.clone(), tx);
        let clients = {
            let mut members = self.rooms.entry(room_id.clone()).or_default();
            if !members.contains(peer) {
                members.push(peer.clone());
            }
            members.value().clone()
        };
        self.broadcast(room_id, None, &Inbound::RoomUpdate { clients }, &PeerId::from("server"));
    }

    fn leave(&self, room_id: &RoomId, peer: &PeerId) {
        self.clients.remove(peer);
        let clients = {
            let mut members = self.rooms.entry(room_id.clone()).or_default();
            members.retain(|member| member != peer);
            members.value().clone()
        };
        let server = PeerId::from("server");
        self.broadcast(
            room_id,
            None,
            &Inbound::UserDisconnected {
                disconnected_socket: peer.clone(),
            },
            &server,
        );
        self.broadcast(room_id, None, &Inbound::RoomUpdate { clients }, &server);
    }

    fn route(&self, envelope: OutboundEnvelope) {
        self.log.lock().push(envelope.clone());
        let room_id = envelope.room_id.clone();
        let sender = envelope.sender.clone();

        let (target, payload) = match &envelope.payload {
            Outbound::Join => return,
            Outbound::Offer { .. }
            | Outbound::Answer { .. }
            | Outbound::IceCandidate { .. }
            | Outbound::ChatMessage { .. } => {
                let Some(inbound) = as_inbound(&envelope) else {
                    return;
                };
                self.broadcast(&room_id, Some(&sender), &inbound.payload, &sender);
                return;
            }
            Outbound::CallUser { target_socket_id } => (
                target_socket_id,
                Inbound::IncomingCall {
                    caller: UserId::from(sender.as_str()),
                    caller_socket_id: sender.clone(),
                },
            ),
            Outbound::CallAccepted { target_socket_id } => (
                target_socket_id,
                Inbound::CallAccepted {
                    accepter: sender.clone(),
                },
            ),
            Outbound::CallRejected { target_socket_id } => (
                target_socket_id,
                Inbound::CallRejected {
                    rejecter: sender.clone(),
                },
            ),
            Outbound::EndCall { target_socket_id } => (
                target_socket_id,
                Inbound::CallEnded {
                    ender: sender.clone(),
                },
            ),
        };
        self.deliver(target, InboundEnvelope::new(room_id, sender, payload));
    }
}

/// Client end of a [`LoopbackHub`]
pub struct LoopbackSignaling {
    hub: Arc<LoopbackHub>,
    joined: Mutex<Option<(RoomId, PeerId)>>,
    events_tx: mpsc::UnboundedSender<SignalingEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SignalingEvent>>>,
}

#[async_trait]
impl SignalingChannel for LoopbackSignaling {
    async fn connect(
        &self,
        url: &str,
        room_id: &RoomId,
        local_id: &PeerId,
    ) -> std::result::Result<(), ConnectError> {
        if self.hub.unreachable.load(Ordering::SeqCst) {
            return Err(ConnectError::Unreachable(url.to_string()));
        }
        {
            let mut joined = self.joined.lock();
            if joined.is_some() {
                return Err(ConnectError::AlreadyConnected);
            }
            *joined = Some((room_id.clone(), local_id.clone()));
        }
        self.hub
            .log
            .lock()
            .push(OutboundEnvelope::new(room_id.clone(), local_id.clone(), Outbound::Join));
        self.hub.join(room_id, local_id, self.events_tx.clone());
        Ok(())
    }

    fn send(&self, envelope: OutboundEnvelope) -> Result<()> {
        if self.joined.lock().is_none() {
            return Err(Error::Signaling("not connected".to_string()));
        }
        self.hub.route(envelope);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SignalingEvent>> {
        self.events_rx.lock().take()
    }

    fn is_connected(&self) -> bool {
        self.joined.lock().is_some()
    }

    async fn disconnect(&self) {
        let joined = self.joined.lock().take();
        if let Some((room_id, local_id)) = joined {
            self.hub.leave(&room_id, &local_id);
            let _ = self.events_tx.send(SignalingEvent::Disconnected {
                reason: "client disconnect".to_string(),
            });
        }
    }
}
