//! Perfect negotiation
//!
//! Either peer may start an offer at any time. When both do at once (glare)
//! the pair resolves it without coordination: the impolite side ignores the
//! remote offer and keeps its own, the polite side rolls its own offer back
//! and answers. Roles come from comparing connection ids, see [`Role`].
//!
//! The [`Negotiator`] owns the negotiation state, the duplicate-offer guard
//! and the local capture, and rebuilds the media connection when the engine
//! reports a signaling state conflict.
//!
//! Inbound handlers must be called one at a time, in arrival order.
//! [`Negotiator::negotiate`] may run concurrently with them.

mod role;
mod state;

pub use role::Role;
pub use state::{LifecycleState, NegotiationState};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tandem_core::models::{PeerId, RoomId};
use tandem_core::protocol::{IceCandidate, Outbound, OutboundEnvelope, SessionDescription};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::MediaEngine;
use crate::error::{EngineError, Error, RecoveryError, Result};
use crate::events::SessionEvent;
use crate::signaling::SignalingChannel;
use crate::track::{LocalMedia, LocalTrack, TrackKind};
use crate::types::SignalingState;

/// What became of one inbound message or offer attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    Ignored(IgnoreReason),
    /// The step failed and the round was abandoned; the connection is intact
    Failed,
    /// A state conflict forced a connection rebuild, which succeeded
    Recovered,
    RecoveryFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Impolite side receiving an offer that collides with its own
    Collision,
    /// Same negotiation round as the offer already applied
    DuplicateOffer,
    /// Answer without an outstanding local offer
    DuplicateAnswer,
    /// Belongs to the remote branch we decided to ignore
    DiscardedBranch,
    Recovering,
    /// An offer is already being made, or an answer is being produced
    OfferInFlight,
    /// A remote offer was accepted while ours was being built
    Superseded,
}

/// Counters of negotiation activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NegotiationStats {
    pub offers_sent: u64,
    pub answers_sent: u64,
    pub offers_ignored: u64,
    pub duplicates_dropped: u64,
    pub candidates_failed: u64,
    pub recoveries: u64,
}

#[derive(Debug)]
struct MediaState {
    local: Option<LocalMedia>,
    audio_enabled: bool,
    video_enabled: bool,
}

impl Default for MediaState {
    fn default() -> Self {
        Self {
            local: None,
            audio_enabled: true,
            video_enabled: true,
        }
    }
}

impl MediaState {
    const fn is_enabled(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.audio_enabled,
            TrackKind::Video => self.video_enabled,
        }
    }

    fn set_enabled(&mut self, kind: TrackKind, enabled: bool) {
        match kind {
            TrackKind::Audio => self.audio_enabled = enabled,
            TrackKind::Video => self.video_enabled = enabled,
        }
    }
}

/// Clears the making-offer flag when an offer attempt ends, however it ends
struct OfferScope<'a> {
    negotiator: &'a Negotiator,
}

impl Drop for OfferScope<'_> {
    fn drop(&mut self) {
        self.negotiator.finish_offer();
    }
}

/// Raised while a remote offer is being answered
struct AnswerScope<'a> {
    flag: &'a AtomicBool,
}

impl<'a> AnswerScope<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self { flag }
    }
}

impl Drop for AnswerScope<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub struct Negotiator {
    room_id: RoomId,
    local_id: PeerId,
    engine: Arc<dyn MediaEngine>,
    signaling: Arc<dyn SignalingChannel>,
    events: mpsc::UnboundedSender<SessionEvent>,
    /// Cancelled when the owning session is torn down
    closed: CancellationToken,
    /// Resolved once, the engine's answer does not change at runtime
    device_switch: bool,
    state: Mutex<NegotiationState>,
    /// Bumped whenever an in-flight local offer must be abandoned
    offer_epoch: AtomicU64,
    answering: AtomicBool,
    has_negotiated: AtomicBool,
    /// Round id of the last remote offer applied
    applied_offer: Mutex<Option<String>>,
    /// Our last offer sent, kept for peers that join while it is outstanding
    sent_offer: Mutex<Option<SessionDescription>>,
    media: tokio::sync::Mutex<MediaState>,
    recovery: tokio::sync::Mutex<()>,
    stats: Mutex<NegotiationStats>,
}

impl Negotiator {
    pub fn new(
        room_id: RoomId,
        local_id: PeerId,
        engine: Arc<dyn MediaEngine>,
        signaling: Arc<dyn SignalingChannel>,
        events: mpsc::UnboundedSender<SessionEvent>,
        closed: CancellationToken,
    ) -> Self {
        let device_switch = engine.supports_device_switch();
        Self {
            room_id,
            local_id,
            engine,
            signaling,
            events,
            closed,
            device_switch,
            state: Mutex::new(NegotiationState::Idle),
            offer_epoch: AtomicU64::new(0),
            answering: AtomicBool::new(false),
            has_negotiated: AtomicBool::new(false),
            applied_offer: Mutex::new(None),
            sent_offer: Mutex::new(None),
            media: tokio::sync::Mutex::new(MediaState::default()),
            recovery: tokio::sync::Mutex::new(()),
            stats: Mutex::new(NegotiationStats::default()),
        }
    }

    #[must_use]
    pub fn state(&self) -> NegotiationState {
        *self.state.lock()
    }

    #[must_use]
    pub fn lifecycle(&self) -> LifecycleState {
        self.state().lifecycle()
    }

    #[must_use]
    pub fn stats(&self) -> NegotiationStats {
        *self.stats.lock()
    }

    #[must_use]
    pub const fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Apply `f` to the state under the lock, publishing lifecycle changes
    fn transition<R>(&self, f: impl FnOnce(&mut NegotiationState) -> R) -> R {
        let (result, before, after) = {
            let mut state = self.state.lock();
            let before = *state;
            let result = f(&mut *state);
            (result, before, *state)
        };
        if before.lifecycle() != after.lifecycle() {
            debug!(from = %before.lifecycle(), to = %after.lifecycle(), "Lifecycle changed");
            let _ = self.events.send(SessionEvent::LifecycleChanged(after.lifecycle()));
        }
        result
    }

    fn send(&self, payload: Outbound) {
        let kind = payload.kind();
        let envelope = OutboundEnvelope::new(self.room_id.clone(), self.local_id.clone(), payload);
        if let Err(error) = self.signaling.send(envelope) {
            warn!(kind, error = %error, "Failed to send signaling message");
        }
    }

    /// Relay a locally gathered ICE candidate to the remote peer
    pub fn forward_local_candidate(&self, candidate: IceCandidate) {
        self.send(Outbound::IceCandidate { candidate });
    }

    /// Current local capture, if started
    pub async fn local_media(&self) -> Option<LocalMedia> {
        self.media.lock().await.local.clone()
    }

    /// Acquire local capture and attach it, once.
    ///
    /// Later calls return the capture already attached.
    pub async fn ensure_local_media(&self) -> std::result::Result<LocalMedia, EngineError> {
        let mut media = self.media.lock().await;
        if let Some(local) = &media.local {
            return Ok(local.clone());
        }

        let local = self.engine.acquire_local_media().await?;
        if self.closed.is_cancelled() {
            // Capture finished after teardown; give it straight back
            self.engine.release_local_media().await;
            return Err(EngineError::Closed);
        }
        for track in local.tracks() {
            self.engine.attach_local_track(track).await?;
        }
        media.local = Some(local.clone());

        info!(audio = %local.audio.id, video = %local.video.id, "Local media attached");
        let _ = self.events.send(SessionEvent::LocalMediaReady(local.clone()));
        Ok(local)
    }

    /// Flip sending of the local track of `kind`, returning the new state
    pub async fn toggle_track(&self, kind: TrackKind) -> std::result::Result<bool, EngineError> {
        let mut media = self.media.lock().await;
        if media.local.is_none() {
            return Err(EngineError::MediaUnavailable("local media not started".to_string()));
        }

        let enabled = !media.is_enabled(kind);
        self.engine.set_track_enabled(kind, enabled).await?;
        media.set_enabled(kind, enabled);

        info!(kind = %kind, enabled, "Local track toggled");
        Ok(enabled)
    }

    /// Replace the local track of `kind` with one from `device`
    pub async fn switch_capture_device(&self, kind: TrackKind, device: &str) -> Result<LocalTrack> {
        if !self.device_switch {
            return Err(Error::Unsupported("capture device switching"));
        }
        self.ensure_local_media().await?;

        let mut media = self.media.lock().await;
        let track = self.engine.open_capture_device(kind, device).await?;
        self.engine.attach_local_track(&track).await?;
        if !media.is_enabled(kind) {
            self.engine.set_track_enabled(kind, false).await?;
        }
        if let Some(local) = media.local.as_mut() {
            let previous = local.replace(track.clone());
            info!(
                kind = %kind,
                device,
                previous = %previous.id,
                current = %track.id,
                "Capture device switched"
            );
        }
        Ok(track)
    }

    /// Make and send an offer, in reaction to the engine asking for one
    pub async fn negotiate(&self) -> Disposition {
        let engine_state = self.engine.signaling_state();
        let answering = self.answering.load(Ordering::SeqCst);
        let started = self.transition(|state| {
            if state.is_recovering() {
                return Err(IgnoreReason::Recovering);
            }
            if state.is_making_offer() || answering || engine_state != SignalingState::Stable {
                return Err(IgnoreReason::OfferInFlight);
            }
            *state = state.with_making_offer(true);
            Ok(self.offer_epoch.load(Ordering::SeqCst))
        });
        let epoch = match started {
            Ok(epoch) => epoch,
            Err(reason) => {
                debug!(reason = ?reason, signaling_state = %engine_state, "Skipping offer");
                return Disposition::Ignored(reason);
            }
        };
        let _scope = OfferScope { negotiator: self };

        let offer = match self.engine.create_offer().await {
            Ok(offer) => offer,
            Err(error) => return self.on_step_error("create offer", error).await,
        };
        if self.superseded(epoch) {
            debug!("Local offer superseded before it was applied");
            return Disposition::Ignored(IgnoreReason::Superseded);
        }

        if let Err(error) = self.engine.set_local_description(offer.clone()).await {
            return self.on_step_error("apply local offer", error).await;
        }
        if self.superseded(epoch) {
            debug!("Local offer superseded before it was sent");
            return Disposition::Ignored(IgnoreReason::Superseded);
        }

        *self.sent_offer.lock() = Some(offer.clone());
        self.send(Outbound::Offer { sdp: offer });
        self.stats.lock().offers_sent += 1;
        info!(room_id = %self.room_id, "Sent offer");
        Disposition::Applied
    }

    /// Send our outstanding offer again, for a peer that joined after it went
    /// out. Returns whether anything was sent.
    pub fn resend_pending_offer(&self) -> bool {
        if self.state().is_making_offer()
            || self.engine.signaling_state() != SignalingState::HaveLocalOffer
        {
            return false;
        }
        let Some(offer) = self.sent_offer.lock().clone() else {
            return false;
        };
        info!(round = %offer.round_id(), "Re-sending outstanding offer to new participant");
        self.send(Outbound::Offer { sdp: offer });
        true
    }

    fn superseded(&self, epoch: u64) -> bool {
        self.offer_epoch.load(Ordering::SeqCst) != epoch
    }

    /// Called when an offer attempt ends
    fn finish_offer(&self) {
        let settled = self.engine.signaling_state() == SignalingState::Stable
            && !self.answering.load(Ordering::SeqCst);
        let negotiated = self.has_negotiated.load(Ordering::SeqCst);
        self.transition(|state| {
            *state = state.with_making_offer(false);
            if settled && *state == (NegotiationState::Negotiating { making_offer: false }) {
                *state = if negotiated {
                    NegotiationState::Stable
                } else {
                    NegotiationState::Idle
                };
            }
        });
    }

    /// Return to a resting state after a failed step
    fn settle(&self) {
        let stable = self.engine.signaling_state() == SignalingState::Stable;
        let negotiated = self.has_negotiated.load(Ordering::SeqCst);
        self.transition(|state| {
            let current = *state;
            if current.is_recovering() || current.is_ignoring_offer() || current.is_making_offer() {
                return;
            }
            *state = if !stable {
                NegotiationState::Negotiating {
                    making_offer: false,
                }
            } else if negotiated {
                NegotiationState::Stable
            } else {
                NegotiationState::Idle
            };
        });
    }

    async fn on_step_error(&self, step: &'static str, error: EngineError) -> Disposition {
        if self.closed.is_cancelled() {
            debug!(step, error = %error, "Negotiation step failed after teardown");
            return Disposition::Failed;
        }
        if error.is_state_conflict() {
            if self.state().is_recovering() {
                debug!(step, error = %error, "State conflict while already recovering");
                return Disposition::Ignored(IgnoreReason::Recovering);
            }
            warn!(step, error = %error, "Signaling state conflict, recreating media connection");
            return match self.recover().await {
                Ok(()) => Disposition::Recovered,
                Err(_) => Disposition::RecoveryFailed,
            };
        }

        warn!(step, error = %error, "Negotiation step failed, abandoning round");
        self.settle();
        Disposition::Failed
    }

    /// Handle a remote offer from `sender`
    pub async fn handle_offer(&self, sender: &PeerId, offer: SessionDescription) -> Disposition {
        if self.state().is_recovering() {
            debug!(sender = %sender, "Dropping offer while recovering");
            return Disposition::Ignored(IgnoreReason::Recovering);
        }

        let round = offer.round_id();
        let same_round = self.applied_offer.lock().as_deref() == Some(round.as_str());
        if same_round && self.engine.has_remote_description().await {
            self.stats.lock().duplicates_dropped += 1;
            info!(sender = %sender, round = %round, "Dropping duplicate offer");
            return Disposition::Ignored(IgnoreReason::DuplicateOffer);
        }

        let role = Role::for_pair(&self.local_id, sender);
        let engine_state = self.engine.signaling_state();
        let decision = self.transition(|state| {
            let making = state.is_making_offer();
            let collision = making || engine_state != SignalingState::Stable;
            if collision && !role.is_polite() {
                *state = NegotiationState::IgnoringOffer {
                    making_offer: making,
                };
                return None;
            }
            *state = if state.is_ignoring_offer() {
                NegotiationState::IgnoringOffer {
                    making_offer: false,
                }
            } else {
                NegotiationState::Negotiating {
                    making_offer: false,
                }
            };
            Some(collision)
        });

        let Some(collision) = decision else {
            self.stats.lock().offers_ignored += 1;
            info!(sender = %sender, role = %role, signaling_state = %engine_state, "Ignoring colliding offer");
            return Disposition::Ignored(IgnoreReason::Collision);
        };

        self.offer_epoch.fetch_add(1, Ordering::SeqCst);
        let _answering = AnswerScope::raise(&self.answering);
        if collision {
            info!(sender = %sender, role = %role, "Accepting colliding offer over our own");
        }

        if let Err(error) = self.ensure_local_media().await {
            warn!(error = %error, "Answering without local media");
        }

        if let Err(error) = self.engine.set_remote_description(offer).await {
            return self.on_step_error("apply remote offer", error).await;
        }
        *self.applied_offer.lock() = Some(round);
        self.transition(|state| {
            if !state.is_recovering() {
                *state = NegotiationState::Negotiating {
                    making_offer: state.is_making_offer(),
                };
            }
        });

        let answer = match self.engine.create_answer().await {
            Ok(answer) => answer,
            Err(error) => return self.on_step_error("create answer", error).await,
        };
        if let Err(error) = self.engine.set_local_description(answer.clone()).await {
            return self.on_step_error("apply local answer", error).await;
        }

        self.send(Outbound::Answer { sdp: answer });
        self.stats.lock().answers_sent += 1;
        self.has_negotiated.store(true, Ordering::SeqCst);
        self.transition(|state| {
            if !state.is_recovering() && !state.is_making_offer() {
                *state = NegotiationState::Stable;
            }
        });
        info!(sender = %sender, "Answered offer");
        Disposition::Applied
    }

    /// Handle a remote answer to our offer
    pub async fn handle_answer(&self, answer: SessionDescription) -> Disposition {
        let state = self.state();
        if state.is_recovering() {
            debug!("Dropping answer while recovering");
            return Disposition::Ignored(IgnoreReason::Recovering);
        }

        let engine_state = self.engine.signaling_state();
        if engine_state != SignalingState::HaveLocalOffer {
            let reason = if state.is_ignoring_offer() {
                IgnoreReason::DiscardedBranch
            } else {
                IgnoreReason::DuplicateAnswer
            };
            self.stats.lock().duplicates_dropped += 1;
            debug!(reason = ?reason, signaling_state = %engine_state, "Dropping answer without outstanding offer");
            return Disposition::Ignored(reason);
        }

        if let Err(error) = self.engine.set_remote_description(answer).await {
            return self.on_step_error("apply remote answer", error).await;
        }

        self.has_negotiated.store(true, Ordering::SeqCst);
        self.transition(|state| {
            if !state.is_recovering() && !state.is_making_offer() {
                *state = NegotiationState::Stable;
            }
        });
        info!("Answer applied");
        Disposition::Applied
    }

    /// Handle a remote ICE candidate.
    ///
    /// Failures are logged and never affect negotiation state.
    pub async fn handle_candidate(&self, candidate: IceCandidate) -> Disposition {
        let state = self.state();
        if state.is_recovering() {
            return Disposition::Ignored(IgnoreReason::Recovering);
        }
        if state.is_ignoring_offer() {
            debug!("Dropping candidate of ignored offer");
            return Disposition::Ignored(IgnoreReason::DiscardedBranch);
        }

        match self.engine.add_ice_candidate(candidate).await {
            Ok(()) => Disposition::Applied,
            Err(error) => {
                self.stats.lock().candidates_failed += 1;
                warn!(error = %error, "Failed to add remote ICE candidate");
                Disposition::Failed
            }
        }
    }

    /// Tear down the media connection, build a new one and re-attach the
    /// local capture.
    ///
    /// Leaves the session `Idle` on success; on failure it stays `Recovering`.
    pub async fn recover(&self) -> std::result::Result<(), RecoveryError> {
        if self.closed.is_cancelled() {
            return Err(RecoveryError::Closed);
        }
        let _serial = self.recovery.lock().await;
        if self.closed.is_cancelled() {
            return Err(RecoveryError::Closed);
        }
        self.transition(|state| *state = NegotiationState::Recovering);
        self.stats.lock().recoveries += 1;

        if let Err(error) = self.engine.reset().await {
            error!(error = %error, "Failed to recreate media connection");
            return Err(RecoveryError::Reset(error));
        }

        {
            let media = self.media.lock().await;
            if let Some(local) = &media.local {
                for track in local.tracks() {
                    if let Err(error) = self.engine.attach_local_track(track).await {
                        error!(kind = %track.kind, error = %error, "Failed to re-attach local track");
                        return Err(RecoveryError::Reattach(error));
                    }
                }
                for kind in TrackKind::ALL {
                    if media.is_enabled(kind) {
                        continue;
                    }
                    if let Err(error) = self.engine.set_track_enabled(kind, false).await {
                        error!(kind = %kind, error = %error, "Failed to restore disabled track");
                        return Err(RecoveryError::Reattach(error));
                    }
                }
            }
        }

        *self.applied_offer.lock() = None;
        *self.sent_offer.lock() = None;
        self.offer_epoch.fetch_add(1, Ordering::SeqCst);
        self.has_negotiated.store(false, Ordering::SeqCst);
        self.transition(|state| *state = NegotiationState::Idle);
        info!("Media connection recovered");
        Ok(())
    }
}
