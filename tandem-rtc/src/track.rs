//! Local media tracks and transceiver slot bookkeeping
//!
//! A media connection owns one audio and one video slot, allocated when the
//! connection is created. Local tracks are attached by replacing the track in
//! the slot of matching kind, so re-attaching after a reset never grows the
//! sender list. Disabling a track detaches it from its slot while keeping it
//! remembered for a later enable.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::TrackId;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub const ALL: [Self; 2] = [Self::Audio, Self::Video];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<webrtc::rtp_transceiver::rtp_codec::RTPCodecType> for TrackKind {
    fn from(codec_type: webrtc::rtp_transceiver::rtp_codec::RTPCodecType) -> Self {
        match codec_type {
            webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

impl From<TrackKind> for webrtc::rtp_transceiver::rtp_codec::RTPCodecType {
    fn from(kind: TrackKind) -> Self {
        match kind {
            TrackKind::Audio => Self::Audio,
            TrackKind::Video => Self::Video,
        }
    }
}

/// A captured local track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTrack {
    pub id: TrackId,
    pub kind: TrackKind,
    /// Capture device the track was opened on, if the engine names devices
    pub device: Option<String>,
}

impl LocalTrack {
    #[must_use]
    pub fn new(kind: TrackKind, device: Option<String>) -> Self {
        Self {
            id: TrackId::generate(),
            kind,
            device,
        }
    }
}

/// The local camera/microphone capture, one track per kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMedia {
    pub audio: LocalTrack,
    pub video: LocalTrack,
}

impl LocalMedia {
    #[must_use]
    pub const fn track(&self, kind: TrackKind) -> &LocalTrack {
        match kind {
            TrackKind::Audio => &self.audio,
            TrackKind::Video => &self.video,
        }
    }

    #[must_use]
    pub fn tracks(&self) -> [&LocalTrack; 2] {
        [&self.audio, &self.video]
    }

    /// Swap in a track of the same kind, returning the one it replaces
    pub fn replace(&mut self, track: LocalTrack) -> LocalTrack {
        let slot = match track.kind {
            TrackKind::Audio => &mut self.audio,
            TrackKind::Video => &mut self.video,
        };
        std::mem::replace(slot, track)
    }
}

/// How a local track ended up on the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachOutcome {
    /// Replaced whatever the pre-allocated slot carried
    Replaced { previous: Option<TrackId> },
    /// No slot of that kind existed; a new sender was added
    AdHoc,
}

#[derive(Debug, Clone)]
struct SlotState {
    track: Option<LocalTrack>,
    enabled: bool,
}

/// Which local track each transceiver slot carries
#[derive(Debug, Clone, Default)]
pub struct TrackSlots {
    slots: HashMap<TrackKind, SlotState>,
}

impl TrackSlots {
    /// One empty, enabled slot per media kind
    #[must_use]
    pub fn allocated() -> Self {
        let slots = TrackKind::ALL
            .into_iter()
            .map(|kind| {
                (
                    kind,
                    SlotState {
                        track: None,
                        enabled: true,
                    },
                )
            })
            .collect();
        Self { slots }
    }

    #[must_use]
    pub fn has_slot(&self, kind: TrackKind) -> bool {
        self.slots.contains_key(&kind)
    }

    /// Record `track` as the slot's content.
    ///
    /// Replaces the previous track of the same kind; the returned outcome says
    /// whether a slot existed or one had to be added.
    pub fn attach(&mut self, track: LocalTrack) -> AttachOutcome {
        let kind = track.kind;
        if let Some(slot) = self.slots.get_mut(&kind) {
            let previous = slot.track.replace(track).map(|t| t.id);
            debug!(kind = %kind, previous = ?previous, "Replaced track in slot");
            AttachOutcome::Replaced { previous }
        } else {
            self.slots.insert(
                kind,
                SlotState {
                    track: Some(track),
                    enabled: true,
                },
            );
            debug!(kind = %kind, "Added ad hoc slot");
            AttachOutcome::AdHoc
        }
    }

    /// Flip the enabled flag, returning the track that should now be sent
    /// (`None` while disabled or when nothing is attached)
    pub fn set_enabled(&mut self, kind: TrackKind, enabled: bool) -> Option<LocalTrack> {
        let slot = self.slots.get_mut(&kind)?;
        slot.enabled = enabled;
        if enabled {
            slot.track.clone()
        } else {
            None
        }
    }

    #[must_use]
    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        self.slots.get(&kind).is_some_and(|slot| slot.enabled)
    }

    /// Tracks currently attached, in kind order
    #[must_use]
    pub fn attached(&self) -> Vec<LocalTrack> {
        TrackKind::ALL
            .iter()
            .filter_map(|kind| self.slots.get(kind))
            .filter_map(|slot| slot.track.clone())
            .collect()
    }

    /// Number of slots, counting ad hoc ones
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_replaces_in_slot() {
        let mut slots = TrackSlots::allocated();
        let first = LocalTrack::new(TrackKind::Audio, None);
        let second = LocalTrack::new(TrackKind::Audio, None);

        assert_eq!(slots.attach(first.clone()), AttachOutcome::Replaced { previous: None });
        assert_eq!(
            slots.attach(second.clone()),
            AttachOutcome::Replaced {
                previous: Some(first.id)
            }
        );
        assert_eq!(slots.attached(), vec![second]);
        assert_eq!(slots.len(), 2);
    }

    #[test]
    fn test_attach_without_slot_is_ad_hoc() {
        let mut slots = TrackSlots::default();
        let video = LocalTrack::new(TrackKind::Video, Some("cam0".into()));

        assert_eq!(slots.attach(video.clone()), AttachOutcome::AdHoc);
        assert!(slots.has_slot(TrackKind::Video));
        assert!(!slots.has_slot(TrackKind::Audio));
        assert_eq!(slots.attached(), vec![video]);
    }

    #[test]
    fn test_disable_keeps_track_for_enable() {
        let mut slots = TrackSlots::allocated();
        let video = LocalTrack::new(TrackKind::Video, None);
        slots.attach(video.clone());

        assert_eq!(slots.set_enabled(TrackKind::Video, false), None);
        assert!(!slots.is_enabled(TrackKind::Video));
        assert_eq!(slots.set_enabled(TrackKind::Video, true), Some(video));
        assert!(slots.is_enabled(TrackKind::Video));
    }

    #[test]
    fn test_local_media_replace() {
        let mut media = LocalMedia {
            audio: LocalTrack::new(TrackKind::Audio, None),
            video: LocalTrack::new(TrackKind::Video, Some("cam0".into())),
        };
        let rear = LocalTrack::new(TrackKind::Video, Some("cam1".into()));

        let old = media.replace(rear.clone());
        assert_eq!(old.device.as_deref(), Some("cam0"));
        assert_eq!(media.track(TrackKind::Video), &rear);
    }
}
