//! `webrtc-rs` backed media engine

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tandem_core::config::WebRTCConfig;
use tandem_core::protocol::{IceCandidate, SdpType, SessionDescription};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as CodecRegistry, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{EngineEvent, MediaEngine};
use crate::error::EngineError;
use crate::track::{AttachOutcome, LocalMedia, LocalTrack, TrackKind, TrackSlots};
use crate::types::{ConnectionState, SignalingState, TrackId};

const STREAM_ID: &str = "tandem";

/// Forwards callbacks of one connection generation.
///
/// Once the engine moves to a newer generation, events from older
/// connections are dropped.
#[derive(Clone)]
struct EventSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
    current: Arc<AtomicU64>,
    generation: u64,
}

impl EventSink {
    fn emit(&self, event: EngineEvent) {
        if self.current.load(Ordering::SeqCst) != self.generation {
            trace!(generation = self.generation, "Dropping event from discarded connection");
            return;
        }
        let _ = self.tx.send(event);
    }
}

/// One peer connection with its pre-allocated slots
struct Connection {
    pc: Arc<RTCPeerConnection>,
    transceivers: HashMap<TrackKind, Arc<RTCRtpTransceiver>>,
    slots: Mutex<TrackSlots>,
    /// Our own chat channel plus the one announced by the remote side
    channels: Arc<RwLock<Vec<Arc<RTCDataChannel>>>>,
}

impl Connection {
    fn open_channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.channels
            .read()
            .iter()
            .find(|dc| dc.ready_state() == RTCDataChannelState::Open)
            .cloned()
    }
}

/// Media engine over a `webrtc-rs` peer connection
pub struct RtcEngine {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    chat_label: String,
    video_devices: Vec<String>,
    connection: RwLock<Option<Arc<Connection>>>,
    generation: Arc<AtomicU64>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
    /// Sample tracks backing the local capture, by track id
    captured: RwLock<HashMap<TrackId, Arc<TrackLocalStaticSample>>>,
}

impl RtcEngine {
    /// Build the engine and its first peer connection
    pub async fn new(config: &WebRTCConfig) -> Result<Self, EngineError> {
        let mut codecs = CodecRegistry::default();
        codecs.register_default_codecs().map_err(internal)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut codecs).map_err(internal)?;

        let api = APIBuilder::new()
            .with_media_engine(codecs)
            .with_interceptor_registry(registry)
            .build();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let engine = Self {
            api,
            ice_servers: ice_servers(config),
            chat_label: config.data_channel_label.clone(),
            video_devices: config.video_devices.clone(),
            connection: RwLock::new(None),
            generation: Arc::new(AtomicU64::new(0)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            captured: RwLock::new(HashMap::new()),
        };

        let connection = engine.open_connection(0).await?;
        *engine.connection.write() = Some(connection);

        info!(
            ice_servers = engine.ice_servers.len(),
            chat_label = %engine.chat_label,
            "Media engine ready"
        );
        Ok(engine)
    }

    /// Sample sink of a captured local track, for feeding encoded frames
    #[must_use]
    pub fn capture_sink(&self, id: &TrackId) -> Option<Arc<TrackLocalStaticSample>> {
        self.captured.read().get(id).cloned()
    }

    /// Feed one encoded frame into a captured local track
    pub async fn write_sample(
        &self,
        id: &TrackId,
        data: Bytes,
        duration: Duration,
    ) -> Result<(), EngineError> {
        let sink = self
            .capture_sink(id)
            .ok_or_else(|| EngineError::MediaUnavailable(format!("no capture track {id}")))?;
        sink.write_sample(&Sample {
            data,
            duration,
            ..Default::default()
        })
        .await
        .map_err(internal)
    }

    fn connection(&self) -> Result<Arc<Connection>, EngineError> {
        self.connection.read().clone().ok_or(EngineError::Closed)
    }

    fn sink(&self, generation: u64) -> EventSink {
        EventSink {
            tx: self.events_tx.clone(),
            current: Arc::clone(&self.generation),
            generation,
        }
    }

    async fn open_connection(&self, generation: u64) -> Result<Arc<Connection>, EngineError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(internal)?,
        );

        let mut transceivers = HashMap::new();
        for kind in TrackKind::ALL {
            let transceiver = pc
                .add_transceiver_from_kind(RTPCodecType::from(kind), None)
                .await
                .map_err(internal)?;
            transceivers.insert(kind, transceiver);
        }

        let chat = pc
            .create_data_channel(
                &self.chat_label,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| EngineError::DataChannel(e.to_string()))?;

        let connection = Arc::new(Connection {
            pc,
            transceivers,
            slots: Mutex::new(TrackSlots::allocated()),
            channels: Arc::new(RwLock::new(vec![Arc::clone(&chat)])),
        });

        let sink = self.sink(generation);
        bind_data_channel(&chat, sink.clone());
        self.bind_callbacks(&connection, sink);

        debug!(generation, "Opened peer connection");
        Ok(connection)
    }

    fn bind_callbacks(&self, connection: &Connection, sink: EventSink) {
        let pc = &connection.pc;

        let negotiation_sink = sink.clone();
        pc.on_negotiation_needed(Box::new(move || {
            negotiation_sink.emit(EngineEvent::NegotiationNeeded);
            Box::pin(async {})
        }));

        let candidate_sink = sink.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate
                    .to_json()
                    .map_err(|e| e.to_string())
                    .and_then(|init| serde_json::to_value(init).map_err(|e| e.to_string()))
                {
                    Ok(value) => candidate_sink.emit(EngineEvent::IceCandidate(IceCandidate(value))),
                    Err(error) => warn!(error = %error, "Failed to serialize local ICE candidate"),
                }
            }
            Box::pin(async {})
        }));

        let track_sink = sink.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let kind = TrackKind::from(track.kind());
            info!(
                kind = %kind,
                codec = %track.codec().capability.mime_type,
                "Remote track arrived"
            );
            track_sink.emit(EngineEvent::Track {
                kind,
                track_id: TrackId::new(track.id()),
            });
            Box::pin(async {})
        }));

        let state_sink = sink.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            state_sink.emit(EngineEvent::ConnectionStateChanged(connection_state(state)));
            Box::pin(async {})
        }));

        let channels = Arc::clone(&connection.channels);
        let label = self.chat_label.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            if dc.label() == label {
                bind_data_channel(&dc, sink.clone());
                channels.write().push(dc);
            } else {
                debug!(label = %dc.label(), "Ignoring unexpected data channel");
            }
            Box::pin(async {})
        }));
    }

    fn sample_track(&self, kind: TrackKind, device: Option<String>) -> LocalTrack {
        let track = LocalTrack::new(kind, device);
        let mime_type = match kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let sample = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id.to_string(),
            STREAM_ID.to_owned(),
        ));
        self.captured.write().insert(track.id.clone(), sample);
        track
    }

    fn sample_for(&self, track: &LocalTrack) -> Result<Arc<dyn TrackLocal + Send + Sync>, EngineError> {
        let sample: Arc<dyn TrackLocal + Send + Sync> =
            self.captured.read().get(&track.id).cloned().ok_or_else(|| {
                EngineError::MediaUnavailable(format!("track {} is not captured", track.id))
            })?;
        Ok(sample)
    }

    async fn rollback(&self, pc: &RTCPeerConnection) -> Result<(), EngineError> {
        let pending = pc
            .pending_local_description()
            .await
            .map(|desc| desc.sdp)
            .unwrap_or_default();
        let rollback = to_rtc(&SessionDescription {
            sdp_type: SdpType::Rollback,
            sdp: pending,
        })?;
        pc.set_local_description(rollback)
            .await
            .map_err(|e| EngineError::StateConflict(format!("rollback failed: {e}")))?;
        debug!("Rolled back local offer");
        Ok(())
    }

    async fn shutdown_connection(&self, connection: &Connection) {
        let channels: Vec<_> = connection.channels.read().clone();
        for dc in channels {
            if let Err(error) = dc.close().await {
                debug!(error = %error, "Failed to close data channel");
            }
        }
        if let Err(error) = connection.pc.close().await {
            warn!(error = %error, "Failed to close peer connection");
        }
    }
}

#[async_trait]
impl MediaEngine for RtcEngine {
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.events_rx.lock().take()
    }

    fn signaling_state(&self) -> SignalingState {
        self.connection
            .read()
            .as_ref()
            .map_or(SignalingState::Closed, |c| signaling_state(c.pc.signaling_state()))
    }

    async fn has_remote_description(&self) -> bool {
        match self.connection() {
            Ok(connection) => connection.pc.remote_description().await.is_some(),
            Err(_) => false,
        }
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let connection = self.connection()?;
        let offer = connection.pc.create_offer(None).await.map_err(state_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let connection = self.connection()?;
        let answer = connection.pc.create_answer(None).await.map_err(state_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let connection = self.connection()?;
        let desc = to_rtc(&desc)?;
        connection
            .pc
            .set_local_description(desc)
            .await
            .map_err(description_error)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let connection = self.connection()?;
        if desc.sdp_type == SdpType::Offer
            && connection.pc.signaling_state() == RTCSignalingState::HaveLocalOffer
        {
            self.rollback(&connection.pc).await?;
        }
        let desc = to_rtc(&desc)?;
        connection
            .pc
            .set_remote_description(desc)
            .await
            .map_err(description_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        let connection = self.connection()?;
        let init: RTCIceCandidateInit = serde_json::from_value(candidate.0)
            .map_err(|e| EngineError::InvalidDescription(format!("bad candidate: {e}")))?;
        connection
            .pc
            .add_ice_candidate(init)
            .await
            .map_err(state_error)
    }

    fn request_negotiation(&self) {
        self.sink(self.generation.load(Ordering::SeqCst))
            .emit(EngineEvent::NegotiationNeeded);
    }

    async fn acquire_local_media(&self) -> Result<LocalMedia, EngineError> {
        let audio = self.sample_track(TrackKind::Audio, None);
        let video = self.sample_track(TrackKind::Video, self.video_devices.first().cloned());
        info!(audio = %audio.id, video = %video.id, "Local capture started");
        Ok(LocalMedia { audio, video })
    }

    async fn open_capture_device(
        &self,
        kind: TrackKind,
        device: &str,
    ) -> Result<LocalTrack, EngineError> {
        if kind == TrackKind::Video && !self.video_devices.iter().any(|d| d == device) {
            return Err(EngineError::MediaUnavailable(format!(
                "unknown video device '{device}'"
            )));
        }
        Ok(self.sample_track(kind, Some(device.to_owned())))
    }

    fn supports_device_switch(&self) -> bool {
        self.video_devices.len() > 1
    }

    async fn attach_local_track(&self, track: &LocalTrack) -> Result<AttachOutcome, EngineError> {
        let connection = self.connection()?;
        let sample = self.sample_for(track)?;

        if let Some(transceiver) = connection.transceivers.get(&track.kind) {
            let enabled = connection.slots.lock().is_enabled(track.kind);
            if enabled {
                transceiver
                    .sender()
                    .await
                    .replace_track(Some(sample))
                    .await
                    .map_err(internal)?;
            }
        } else {
            connection.pc.add_track(sample).await.map_err(internal)?;
        }

        let outcome = connection.slots.lock().attach(track.clone());
        Ok(outcome)
    }

    async fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<(), EngineError> {
        let connection = self.connection()?;
        let outgoing = connection.slots.lock().set_enabled(kind, enabled);
        let Some(transceiver) = connection.transceivers.get(&kind) else {
            return Err(EngineError::MediaUnavailable(format!("no {kind} slot")));
        };
        let track = match outgoing {
            Some(track) => Some(self.sample_for(&track)?),
            None => None,
        };
        transceiver
            .sender()
            .await
            .replace_track(track)
            .await
            .map_err(internal)
    }

    async fn attached_tracks(&self) -> Vec<LocalTrack> {
        self.connection()
            .map(|c| c.slots.lock().attached())
            .unwrap_or_default()
    }

    fn is_data_channel_open(&self) -> bool {
        self.connection()
            .map(|c| c.open_channel().is_some())
            .unwrap_or(false)
    }

    async fn send_data(&self, text: &str) -> Result<(), EngineError> {
        let connection = self.connection()?;
        let dc = connection
            .open_channel()
            .ok_or_else(|| EngineError::DataChannel("no open data channel".to_string()))?;
        dc.send_text(text.to_owned())
            .await
            .map_err(|e| EngineError::DataChannel(e.to_string()))?;
        Ok(())
    }

    async fn reset(&self) -> Result<(), EngineError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let previous = self.connection.write().take();
        if let Some(previous) = previous {
            self.shutdown_connection(&previous).await;
        }

        let connection = self.open_connection(generation).await?;
        *self.connection.write() = Some(connection);
        info!(generation, "Media connection recreated");
        Ok(())
    }

    async fn close_data_channel(&self) {
        let Ok(connection) = self.connection() else {
            return;
        };
        let channels: Vec<_> = connection.channels.read().clone();
        for dc in channels {
            if let Err(error) = dc.close().await {
                debug!(error = %error, "Failed to close data channel");
            }
        }
    }

    async fn close(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        let previous = self.connection.write().take();
        if let Some(previous) = previous {
            self.shutdown_connection(&previous).await;
            info!("Media connection closed");
        }
    }

    async fn release_local_media(&self) {
        let released = {
            let mut captured = self.captured.write();
            let count = captured.len();
            captured.clear();
            count
        };
        if released > 0 {
            info!(tracks = released, "Local capture stopped");
        }
    }
}

fn bind_data_channel(dc: &Arc<RTCDataChannel>, sink: EventSink) {
    let open_sink = sink.clone();
    dc.on_open(Box::new(move || {
        open_sink.emit(EngineEvent::DataChannelOpen);
        Box::pin(async {})
    }));

    let close_sink = sink.clone();
    dc.on_close(Box::new(move || {
        close_sink.emit(EngineEvent::DataChannelClosed);
        Box::pin(async {})
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        if msg.is_string {
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => sink.emit(EngineEvent::DataChannelMessage(text)),
                Err(error) => warn!(error = %error, "Dropping non UTF-8 data channel text"),
            }
        } else {
            debug!(bytes = msg.data.len(), "Ignoring binary data channel message");
        }
        Box::pin(async {})
    }));
}

fn ice_servers(config: &WebRTCConfig) -> Vec<RTCIceServer> {
    let mut servers = Vec::new();
    if !config.stun_servers.is_empty() {
        servers.push(RTCIceServer {
            urls: config.stun_servers.clone(),
            ..Default::default()
        });
    }
    if let Some(turn) = &config.turn {
        servers.push(RTCIceServer {
            urls: vec![turn.server_url.clone()],
            username: turn.username.clone(),
            credential: turn.password.clone(),
            ..Default::default()
        });
    }
    servers
}

fn to_rtc(desc: &SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    let value = serde_json::json!({
        "type": desc.sdp_type.as_str(),
        "sdp": desc.sdp,
    });
    let rtc: RTCSessionDescription = serde_json::from_value(value)
        .map_err(|e| EngineError::InvalidDescription(e.to_string()))?;
    if rtc.sdp_type == RTCSdpType::Unspecified {
        return Err(EngineError::InvalidDescription(format!(
            "unsupported sdp type {}",
            desc.sdp_type
        )));
    }
    Ok(rtc)
}

const fn signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

const fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn internal(err: webrtc::Error) -> EngineError {
    EngineError::Internal(err.to_string())
}

/// Classify an error from an operation gated on signaling state
fn state_error(err: webrtc::Error) -> EngineError {
    if matches!(err, webrtc::Error::ErrConnectionClosed) {
        return EngineError::Closed;
    }
    let message = err.to_string();
    if is_state_message(&message) {
        EngineError::StateConflict(message)
    } else {
        EngineError::Internal(message)
    }
}

/// Like [`state_error`], but anything else means the description was rejected
fn description_error(err: webrtc::Error) -> EngineError {
    match state_error(err) {
        EngineError::Internal(message) => EngineError::InvalidDescription(message),
        other => other,
    }
}

fn is_state_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("signaling state") || message.contains("rollback")
}
