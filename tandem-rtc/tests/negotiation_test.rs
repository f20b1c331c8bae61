//! Negotiation between two in-memory peers, with messages delivered by hand
//!
//! Run with: cargo test -p tandem-rtc --test negotiation_test

use std::sync::Arc;

use tandem_core::models::{PeerId, RoomId};
use tandem_core::protocol::{Outbound, SessionDescription};
use tandem_rtc::test_helpers::{test_candidate, FakeEngine, RecordingSignaling};
use tandem_rtc::{
    Disposition, EngineError, Error, IgnoreReason, LifecycleState, MediaEngine, NegotiationState,
    Negotiator, RecoveryError, Role, SessionEvent, SignalingState, TrackKind,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Peer {
    id: PeerId,
    engine: Arc<FakeEngine>,
    signaling: Arc<RecordingSignaling>,
    negotiator: Negotiator,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    closed: CancellationToken,
}

impl Peer {
    fn new(id: &str) -> Self {
        Self::with_engine(id, FakeEngine::new())
    }

    fn with_engine(id: &str, engine: FakeEngine) -> Self {
        let engine = Arc::new(engine);
        let closed = CancellationToken::new();
        let signaling = Arc::new(RecordingSignaling::new());
        let (tx, events) = mpsc::unbounded_channel();
        let negotiator = Negotiator::new(
            RoomId::from("lobby"),
            PeerId::from(id),
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            Arc::clone(&signaling) as Arc<dyn tandem_rtc::SignalingChannel>,
            tx,
            closed.clone(),
        );
        Self {
            id: PeerId::from(id),
            engine,
            signaling,
            negotiator,
            events,
            closed,
        }
    }

    /// Peer with local media attached and nothing in its outbox
    async fn started(id: &str) -> Self {
        Self::start(Self::new(id)).await
    }

    async fn start(peer: Self) -> Self {
        peer.negotiator
            .ensure_local_media()
            .await
            .expect("local media");
        peer.signaling.take_sent();
        peer
    }

    fn take_offer(&self) -> SessionDescription {
        self.signaling
            .take_sent()
            .into_iter()
            .find_map(|envelope| match envelope.payload {
                Outbound::Offer { sdp } => Some(sdp),
                _ => None,
            })
            .expect("an offer was sent")
    }

    fn take_answer(&self) -> SessionDescription {
        self.signaling
            .take_sent()
            .into_iter()
            .find_map(|envelope| match envelope.payload {
                Outbound::Answer { sdp } => Some(sdp),
                _ => None,
            })
            .expect("an answer was sent")
    }

    fn lifecycle_changes(&mut self) -> Vec<LifecycleState> {
        let mut changes = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let SessionEvent::LifecycleChanged(state) = event {
                changes.push(state);
            }
        }
        changes
    }
}

/// One complete round: `offerer` offers, `answerer` answers
async fn exchange(offerer: &Peer, answerer: &Peer) {
    assert_eq!(offerer.negotiator.negotiate().await, Disposition::Applied);
    let offer = offerer.take_offer();
    assert_eq!(
        answerer.negotiator.handle_offer(&offerer.id, offer).await,
        Disposition::Applied
    );
    let answer = answerer.take_answer();
    assert_eq!(
        offerer.negotiator.handle_answer(answer).await,
        Disposition::Applied
    );
}

#[tokio::test]
async fn test_glare_resolves_to_single_round() {
    let mut alice = Peer::started("alice").await;
    let bob = Peer::started("bob").await;
    assert_eq!(Role::for_pair(&alice.id, &bob.id), Role::Impolite);
    assert_eq!(Role::for_pair(&bob.id, &alice.id), Role::Polite);

    // Both offer before hearing from the other
    assert_eq!(alice.negotiator.negotiate().await, Disposition::Applied);
    assert_eq!(bob.negotiator.negotiate().await, Disposition::Applied);
    let alice_offer = alice.take_offer();
    let bob_offer = bob.take_offer();

    // Impolite side keeps its own offer
    assert_eq!(
        alice.negotiator.handle_offer(&bob.id, bob_offer).await,
        Disposition::Ignored(IgnoreReason::Collision)
    );
    assert!(alice.negotiator.state().is_ignoring_offer());
    assert_eq!(
        alice
            .negotiator
            .handle_candidate(test_candidate("candidate:1 1 udp 1 10.0.0.2 5000 typ host"))
            .await,
        Disposition::Ignored(IgnoreReason::DiscardedBranch)
    );

    // Polite side rolls back and answers
    assert_eq!(
        bob.negotiator.handle_offer(&alice.id, alice_offer).await,
        Disposition::Applied
    );
    let answer = bob.take_answer();
    assert_eq!(alice.negotiator.handle_answer(answer).await, Disposition::Applied);

    for peer in [&alice, &bob] {
        assert_eq!(peer.negotiator.state(), NegotiationState::Stable);
        assert_eq!(peer.engine.signaling_state(), SignalingState::Stable);
        assert_eq!(peer.engine.completed_rounds(), 1);
    }
    assert_eq!(alice.negotiator.stats().offers_ignored, 1);
    assert_eq!(bob.negotiator.stats().answers_sent, 1);
    assert!(alice.engine.candidates().is_empty());
    assert_eq!(
        alice.lifecycle_changes(),
        vec![LifecycleState::Negotiating, LifecycleState::Stable]
    );
}

#[tokio::test]
async fn test_duplicate_offer_and_answer_are_dropped() {
    let alice = Peer::started("alice").await;
    let bob = Peer::started("bob").await;

    assert_eq!(alice.negotiator.negotiate().await, Disposition::Applied);
    let offer = alice.take_offer();
    assert_eq!(
        bob.negotiator.handle_offer(&alice.id, offer.clone()).await,
        Disposition::Applied
    );
    let answer = bob.take_answer();

    assert_eq!(
        bob.negotiator.handle_offer(&alice.id, offer).await,
        Disposition::Ignored(IgnoreReason::DuplicateOffer)
    );
    assert!(bob.signaling.take_sent().is_empty());

    assert_eq!(
        alice.negotiator.handle_answer(answer.clone()).await,
        Disposition::Applied
    );
    assert_eq!(
        alice.negotiator.handle_answer(answer).await,
        Disposition::Ignored(IgnoreReason::DuplicateAnswer)
    );

    assert_eq!(bob.engine.completed_rounds(), 1);
    assert_eq!(alice.engine.completed_rounds(), 1);
    assert_eq!(bob.negotiator.stats().duplicates_dropped, 1);
    assert_eq!(alice.negotiator.stats().duplicates_dropped, 1);
    assert_eq!(alice.negotiator.state(), NegotiationState::Stable);
}

#[tokio::test]
async fn test_renegotiation_is_not_a_duplicate() {
    let alice = Peer::started("alice").await;
    let bob = Peer::started("bob").await;

    exchange(&alice, &bob).await;
    exchange(&alice, &bob).await;
    exchange(&bob, &alice).await;

    assert_eq!(alice.engine.completed_rounds(), 3);
    assert_eq!(bob.engine.completed_rounds(), 3);
    assert_eq!(bob.negotiator.stats().duplicates_dropped, 0);
}

#[tokio::test]
async fn test_second_offer_waits_for_answer() {
    let alice = Peer::started("alice").await;

    assert_eq!(alice.negotiator.negotiate().await, Disposition::Applied);
    assert_eq!(
        alice.negotiator.negotiate().await,
        Disposition::Ignored(IgnoreReason::OfferInFlight)
    );
    assert_eq!(alice.negotiator.stats().offers_sent, 1);
}

#[tokio::test]
async fn test_pending_offer_is_resent_until_answered() {
    let alice = Peer::started("alice").await;
    let bob = Peer::started("bob").await;

    assert!(!alice.negotiator.resend_pending_offer());
    assert_eq!(alice.negotiator.negotiate().await, Disposition::Applied);
    let first = alice.take_offer();

    assert!(alice.negotiator.resend_pending_offer());
    let again = alice.take_offer();
    assert_eq!(again, first);

    assert_eq!(
        bob.negotiator.handle_offer(&alice.id, again).await,
        Disposition::Applied
    );
    let answer = bob.take_answer();
    assert_eq!(alice.negotiator.handle_answer(answer).await, Disposition::Applied);
    assert!(!alice.negotiator.resend_pending_offer());
}

#[tokio::test]
async fn test_rejected_offer_abandons_round() {
    let mut bob = Peer::started("bob").await;

    let disposition = bob
        .negotiator
        .handle_offer(&PeerId::from("alice"), SessionDescription::offer("not sdp at all"))
        .await;

    assert_eq!(disposition, Disposition::Failed);
    assert_eq!(bob.negotiator.lifecycle(), LifecycleState::Idle);
    assert_eq!(bob.engine.resets(), 0);
    assert!(bob.signaling.take_sent().is_empty());
    assert_eq!(
        bob.lifecycle_changes(),
        vec![LifecycleState::Negotiating, LifecycleState::Idle]
    );
}

#[tokio::test]
async fn test_state_conflict_recovers_connection() {
    let alice = Peer::started("alice").await;
    let bob = Peer::started("bob").await;
    let before = bob.negotiator.local_media().await.expect("local media");
    assert!(!bob
        .negotiator
        .toggle_track(TrackKind::Audio)
        .await
        .expect("toggle"));

    assert_eq!(alice.negotiator.negotiate().await, Disposition::Applied);
    let offer = alice.take_offer();
    bob.engine
        .fail_next_remote_description(EngineError::StateConflict("wrong state: stable".to_string()));

    assert_eq!(
        bob.negotiator.handle_offer(&alice.id, offer.clone()).await,
        Disposition::Recovered
    );
    assert_eq!(bob.engine.resets(), 1);
    assert_eq!(bob.negotiator.state(), NegotiationState::Idle);
    assert_eq!(bob.negotiator.stats().recoveries, 1);

    // Same capture, one track per kind, disabled state kept
    let attached = bob.engine.attached_tracks().await;
    assert_eq!(attached.len(), 2);
    assert_eq!(attached.iter().filter(|t| t.kind == TrackKind::Audio).count(), 1);
    assert_eq!(attached.iter().filter(|t| t.kind == TrackKind::Video).count(), 1);
    assert!(attached.contains(&before.audio));
    assert!(attached.contains(&before.video));
    assert!(!bob.engine.is_track_enabled(TrackKind::Audio));
    assert!(bob.engine.is_track_enabled(TrackKind::Video));
    assert_eq!(bob.engine.acquisitions(), 1);

    // The fresh connection negotiates normally
    assert_eq!(
        bob.negotiator.handle_offer(&alice.id, offer).await,
        Disposition::Applied
    );
}

#[tokio::test]
async fn test_failed_recovery_stays_recovering() {
    let bob = Peer::started("bob").await;
    bob.engine.fail_next_remote_description(EngineError::Closed);
    bob.engine
        .fail_next_reset(EngineError::Internal("no ice agent".to_string()));

    let offer = SessionDescription::offer(tandem_rtc::test_helpers::test_sdp(7, 1));
    assert_eq!(
        bob.negotiator.handle_offer(&PeerId::from("alice"), offer.clone()).await,
        Disposition::RecoveryFailed
    );
    assert!(bob.negotiator.state().is_recovering());

    assert_eq!(
        bob.negotiator.handle_offer(&PeerId::from("alice"), offer).await,
        Disposition::Ignored(IgnoreReason::Recovering)
    );
    assert_eq!(
        bob.negotiator
            .handle_candidate(test_candidate("candidate:1 1 udp 1 10.0.0.2 5000 typ host"))
            .await,
        Disposition::Ignored(IgnoreReason::Recovering)
    );
    assert_eq!(
        bob.negotiator.negotiate().await,
        Disposition::Ignored(IgnoreReason::Recovering)
    );

    bob.negotiator.recover().await.expect("manual recovery");
    assert_eq!(bob.negotiator.lifecycle(), LifecycleState::Idle);
    assert_eq!(bob.engine.attached_tracks().await.len(), 2);
}

#[tokio::test]
async fn test_candidate_failure_is_counted_only() {
    let alice = Peer::started("alice").await;
    let bob = Peer::started("bob").await;
    let candidate = test_candidate("candidate:1 1 udp 1 10.0.0.2 5000 typ host");

    // No remote description yet
    assert_eq!(
        bob.negotiator.handle_candidate(candidate.clone()).await,
        Disposition::Failed
    );
    assert_eq!(bob.negotiator.state(), NegotiationState::Idle);

    exchange(&alice, &bob).await;
    bob.engine.fail_next_candidate();
    assert_eq!(
        bob.negotiator.handle_candidate(candidate.clone()).await,
        Disposition::Failed
    );
    assert_eq!(
        bob.negotiator.handle_candidate(candidate).await,
        Disposition::Applied
    );

    assert_eq!(bob.negotiator.stats().candidates_failed, 2);
    assert_eq!(bob.negotiator.state(), NegotiationState::Stable);
    assert_eq!(bob.engine.candidates().len(), 1);
}

#[tokio::test]
async fn test_capture_device_switch() {
    let alice = Peer::started("alice").await;

    let track = alice
        .negotiator
        .switch_capture_device(TrackKind::Video, "usb-camera")
        .await
        .expect("switch");
    assert_eq!(track.device.as_deref(), Some("usb-camera"));
    assert!(alice.engine.attached_tracks().await.contains(&track));
    assert_eq!(alice.engine.attached_tracks().await.len(), 2);
    assert_eq!(
        alice.negotiator.local_media().await.expect("local media").video,
        track
    );
}

#[tokio::test]
async fn test_capture_device_switch_unsupported() {
    let alice = Peer::start(Peer::with_engine("alice", FakeEngine::without_device_switch())).await;

    assert!(matches!(
        alice
            .negotiator
            .switch_capture_device(TrackKind::Video, "usb-camera")
            .await,
        Err(Error::Unsupported(_))
    ));
    let local = alice.negotiator.local_media().await.expect("local media");
    assert_eq!(local.video.device.as_deref(), Some("default"));
}

#[tokio::test]
async fn test_closed_negotiator_does_not_rebuild_connection() {
    let alice = Peer::started("alice").await;
    let bob = Peer::started("bob").await;
    assert_eq!(alice.negotiator.negotiate().await, Disposition::Applied);
    let offer = alice.take_offer();

    bob.closed.cancel();
    bob.engine.close().await;
    bob.engine.release_local_media().await;

    // The closed engine rejects the offer, which must not count as a conflict
    assert_eq!(
        bob.negotiator.handle_offer(&alice.id, offer).await,
        Disposition::Failed
    );
    assert!(matches!(
        bob.negotiator.recover().await,
        Err(RecoveryError::Closed)
    ));
    assert_eq!(bob.engine.resets(), 0);
    assert!(bob.engine.is_closed());
    assert!(bob.engine.is_released());
    assert_eq!(bob.negotiator.stats().recoveries, 0);
    assert_ne!(bob.negotiator.lifecycle(), LifecycleState::Recovering);
}

#[tokio::test]
async fn test_toggle_requires_local_media() {
    let alice = Peer::new("alice");
    assert!(matches!(
        alice.negotiator.toggle_track(TrackKind::Video).await,
        Err(EngineError::MediaUnavailable(_))
    ));

    alice.negotiator.ensure_local_media().await.expect("local media");
    assert!(!alice
        .negotiator
        .toggle_track(TrackKind::Video)
        .await
        .expect("toggle"));
    assert!(alice
        .negotiator
        .toggle_track(TrackKind::Video)
        .await
        .expect("toggle"));
    assert!(alice.engine.is_track_enabled(TrackKind::Video));
}
