//! Session facade
//!
//! Wires one media engine and one signaling channel into a two-party call:
//! inbound envelopes are dispatched to negotiation, membership or chat in
//! arrival order, engine callbacks are forwarded, and user commands are
//! exposed as methods. Everything the user needs to observe arrives as
//! [`SessionEvent`]s.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tandem_core::models::{ChatMessage, PeerId, RoomId};
use tandem_core::protocol::{Inbound, InboundEnvelope};
use tandem_core::Config;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::chat::{ChatChannel, ChatPath};
use crate::engine::{EngineEvent, MediaEngine};
use crate::error::{Error, Result};
use crate::events::SessionEvent;
use crate::membership::MembershipTracker;
use crate::negotiation::{LifecycleState, NegotiationState, NegotiationStats, Negotiator};
use crate::signaling::{SignalingChannel, SignalingEvent};
use crate::track::{LocalMedia, LocalTrack, TrackKind};

pub struct Session {
    room_id: RoomId,
    local_id: PeerId,
    engine: Arc<dyn MediaEngine>,
    signaling: Arc<dyn SignalingChannel>,
    negotiator: Arc<Negotiator>,
    membership: MembershipTracker,
    chat: ChatChannel,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    cancel: CancellationToken,
    run_loop: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Session {
    /// Connect to signaling, join the room and start processing events.
    ///
    /// Fails with [`Error::Connect`] when the signaling channel cannot be
    /// opened; nothing is left running in that case.
    pub async fn initialize(
        config: &Config,
        engine: Arc<dyn MediaEngine>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> Result<Arc<Self>> {
        let room_id = RoomId::from(config.signaling.room_id.trim());
        if room_id.is_empty() {
            return Err(Error::InvalidInput("room id must not be empty".to_string()));
        }
        let local_id = config
            .signaling
            .peer_id
            .as_deref()
            .map_or_else(PeerId::new, PeerId::from);

        let engine_events = engine
            .take_events()
            .ok_or_else(|| Error::InvalidInput("media engine is already in use".to_string()))?;
        let signaling_events = signaling
            .take_events()
            .ok_or_else(|| Error::InvalidInput("signaling channel is already in use".to_string()))?;

        signaling
            .connect(&config.signaling.url, &room_id, &local_id)
            .await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let negotiator = Arc::new(Negotiator::new(
            room_id.clone(),
            local_id.clone(),
            Arc::clone(&engine),
            Arc::clone(&signaling),
            events_tx.clone(),
            cancel.clone(),
        ));
        let membership = MembershipTracker::new(
            room_id.clone(),
            local_id.clone(),
            Arc::clone(&signaling),
            events_tx.clone(),
        );
        let chat = ChatChannel::new(
            room_id.clone(),
            local_id.clone(),
            config.signaling.display_name.clone(),
            config.chat.max_message_length,
            Arc::clone(&engine),
            Arc::clone(&signaling),
            events_tx.clone(),
        );

        let session = Arc::new(Self {
            room_id,
            local_id,
            engine,
            signaling,
            negotiator,
            membership,
            chat,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            cancel,
            run_loop: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let handle = tokio::spawn(Arc::clone(&session).run(signaling_events, engine_events));
        *session.run_loop.lock() = Some(handle);

        info!(room_id = %session.room_id, peer_id = %session.local_id, "Session initialized");
        Ok(session)
    }

    async fn run(
        self: Arc<Self>,
        mut signaling_events: mpsc::UnboundedReceiver<SignalingEvent>,
        mut engine_events: mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        let mut signaling_open = true;
        let mut engine_open = true;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                event = signaling_events.recv(), if signaling_open => match event {
                    Some(SignalingEvent::Message(envelope)) => tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => break,
                        () = self.dispatch(envelope) => {}
                    },
                    Some(SignalingEvent::Disconnected { reason }) => {
                        if !self.cancel.is_cancelled() {
                            warn!(reason = %reason, "Signaling channel lost");
                            let _ = self.events_tx.send(SessionEvent::SignalingLost { reason });
                        }
                        signaling_open = false;
                    }
                    None => signaling_open = false,
                },
                event = engine_events.recv(), if engine_open => match event {
                    Some(event) => self.on_engine_event(event),
                    None => engine_open = false,
                },
                else => break,
            }
        }
        debug!("Session loop stopped");
    }

    async fn dispatch(&self, envelope: InboundEnvelope) {
        if envelope.room_id != self.room_id {
            debug!(room_id = %envelope.room_id, kind = envelope.payload.kind(), "Dropping message for another room");
            return;
        }
        if envelope.sender == self.local_id {
            trace!(kind = envelope.payload.kind(), "Dropping our own echo");
            return;
        }

        let sender = envelope.sender;
        match envelope.payload {
            Inbound::Offer { sdp } => {
                let disposition = self.negotiator.handle_offer(&sender, sdp).await;
                debug!(sender = %sender, disposition = ?disposition, "Offer handled");
            }
            Inbound::Answer { sdp } => {
                let disposition = self.negotiator.handle_answer(sdp).await;
                debug!(sender = %sender, disposition = ?disposition, "Answer handled");
            }
            Inbound::IceCandidate { candidate } => {
                self.negotiator.handle_candidate(candidate).await;
            }
            Inbound::RoomUpdate { clients } | Inbound::Joined { clients } => {
                let joined = self.membership.apply_roster(clients);
                if !joined.is_empty() {
                    self.negotiator.resend_pending_offer();
                }
            }
            Inbound::ChatMessage { message } => self.chat.receive(message.into_message(&sender)),
            other => {
                self.membership.handle_call_message(&other);
            }
        }
    }

    fn on_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::NegotiationNeeded => {
                let negotiator = Arc::clone(&self.negotiator);
                let cancel = self.cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        () = cancel.cancelled() => {}
                        disposition = negotiator.negotiate() => {
                            debug!(disposition = ?disposition, "Negotiation attempt finished");
                        }
                    }
                });
            }
            EngineEvent::IceCandidate(candidate) => {
                self.negotiator.forward_local_candidate(candidate);
            }
            EngineEvent::Track { kind, track_id } => {
                info!(kind = %kind, track_id = %track_id, "Remote media ready");
                let _ = self
                    .events_tx
                    .send(SessionEvent::RemoteMediaReady { kind, track_id });
            }
            EngineEvent::ConnectionStateChanged(state) => {
                info!(state = %state, "Media connection state changed");
                let _ = self
                    .events_tx
                    .send(SessionEvent::ConnectionStateChanged(state));
            }
            EngineEvent::DataChannelOpen => info!("Chat data channel open"),
            EngineEvent::DataChannelClosed => debug!("Chat data channel closed"),
            EngineEvent::DataChannelMessage(text) => self.chat.receive_data(&text),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.lock().take()
    }

    #[must_use]
    pub const fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Acquire and attach local camera and microphone
    pub async fn start(&self) -> Result<LocalMedia> {
        self.ensure_open()?;
        Ok(self.negotiator.ensure_local_media().await?)
    }

    /// Ask for a new negotiation round
    pub fn negotiate(&self) -> Result<()> {
        self.ensure_open()?;
        self.engine.request_negotiation();
        Ok(())
    }

    /// Flip the microphone, returning whether it is now enabled
    pub async fn toggle_audio(&self) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.negotiator.toggle_track(TrackKind::Audio).await?)
    }

    /// Flip the camera, returning whether it is now enabled
    pub async fn toggle_video(&self) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.negotiator.toggle_track(TrackKind::Video).await?)
    }

    pub async fn switch_capture_device(&self, kind: TrackKind, device: &str) -> Result<LocalTrack> {
        self.ensure_open()?;
        self.negotiator.switch_capture_device(kind, device).await
    }

    pub async fn send_chat(&self, body: &str) -> Result<ChatPath> {
        self.ensure_open()?;
        self.chat.send(body).await
    }

    pub fn call_user(&self, target: &PeerId) -> Result<()> {
        self.ensure_open()?;
        self.membership.call_user(target)
    }

    pub fn accept_call(&self, caller: &PeerId) -> Result<()> {
        self.ensure_open()?;
        self.membership.accept_call(caller)
    }

    pub fn reject_call(&self, caller: &PeerId) -> Result<()> {
        self.ensure_open()?;
        self.membership.reject_call(caller)
    }

    pub fn end_call(&self, peer: &PeerId) -> Result<()> {
        self.ensure_open()?;
        self.membership.end_call(peer)
    }

    /// Rebuild the media connection by hand, e.g. after a failed recovery
    pub async fn restart_media(&self) -> Result<()> {
        self.ensure_open()?;
        Ok(self.negotiator.recover().await?)
    }

    #[must_use]
    pub fn lifecycle_state(&self) -> LifecycleState {
        self.negotiator.lifecycle()
    }

    #[must_use]
    pub fn negotiation_state(&self) -> NegotiationState {
        self.negotiator.state()
    }

    #[must_use]
    pub fn stats(&self) -> NegotiationStats {
        self.negotiator.stats()
    }

    #[must_use]
    pub fn roster(&self) -> Vec<PeerId> {
        self.membership.roster()
    }

    #[must_use]
    pub fn chat_history(&self) -> Vec<ChatMessage> {
        self.chat.history()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Release everything: data channel, media connection, local capture,
    /// then signaling. Safe to call more than once.
    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        self.engine.close_data_channel().await;
        self.engine.close().await;
        self.engine.release_local_media().await;
        self.signaling.disconnect().await;

        let handle = self.run_loop.lock().take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                debug!(error = %error, "Session loop ended abnormally");
            }
        }
        info!(room_id = %self.room_id, "Session disconnected");
    }
}
