//! Media tracks, streams and inbound track classification
//!
//! Inbound tracks are routed by [`TrackClassifier`] into one of three
//! [`TrackBuckets`] per peer; the buckets are exposed to applications as a
//! camera+microphone [`MediaStream`] and a screen [`MediaStream`].

mod buckets;
mod capture;
mod classifier;

pub use buckets::{TrackBucket, TrackBuckets};
pub use capture::{LocalMedia, LocalTrack, MediaSource, NoCapture, StaticSampleCapture};
pub use classifier::{Classification, ClassificationSource, TrackClassifier};

use std::fmt;
use std::sync::Arc;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Capture surface reported for a video track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisplaySurface {
    Monitor,
    Window,
    Browser,
    Application,
}

impl DisplaySurface {
    /// Parse a capture surface name (`monitor`, `window`, `browser`, `application`)
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "monitor" => Some(Self::Monitor),
            "window" => Some(Self::Window),
            "browser" => Some(Self::Browser),
            "application" => Some(Self::Application),
            _ => None,
        }
    }
}

/// Which externally exposed stream a set of tracks belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Camera video plus microphone audio
    Camera,
    /// Screen-share video
    Screen,
}

/// An inbound media track
#[derive(Clone)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
    /// Human-readable label (msid stream and track ids for RTP tracks)
    pub label: String,
    pub display_surface: Option<DisplaySurface>,
    remote: Option<Arc<TrackRemote>>,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            display_surface: None,
            remote: None,
        }
    }

    pub fn with_display_surface(mut self, surface: DisplaySurface) -> Self {
        self.display_surface = Some(surface);
        self
    }

    /// Wrap a track delivered by the WebRTC stack
    ///
    /// Returns `None` for tracks of unspecified kind.
    pub fn from_remote(track: Arc<TrackRemote>) -> Option<Self> {
        let kind = match track.kind() {
            RTPCodecType::Audio => MediaKind::Audio,
            RTPCodecType::Video => MediaKind::Video,
            _ => return None,
        };
        let id = track.id();
        let label = format!("{} {}", track.stream_id(), id);

        Some(Self {
            id,
            kind,
            label,
            display_surface: None,
            remote: Some(track),
        })
    }

    /// Underlying RTP track, for reading packets
    pub fn remote(&self) -> Option<&Arc<TrackRemote>> {
        self.remote.as_ref()
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("display_surface", &self.display_surface)
            .field("rtp", &self.remote.is_some())
            .finish()
    }
}

/// A peer's tracks grouped for consumption
#[derive(Debug, Clone)]
pub struct MediaStream {
    /// `<peer id>/camera` or `<peer id>/screen`
    pub id: String,
    pub peer_id: String,
    pub kind: StreamKind,
    pub tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(peer_id: &str, kind: StreamKind, tracks: Vec<MediaTrack>) -> Self {
        let suffix = match kind {
            StreamKind::Camera => "camera",
            StreamKind::Screen => "screen",
        };
        Self {
            id: format!("{}/{}", peer_id, suffix),
            peer_id: peer_id.to_string(),
            kind,
            tracks,
        }
    }

    pub fn track_ids(&self) -> Vec<&str> {
        self.tracks.iter().map(|t| t.id.as_str()).collect()
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind == MediaKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind == MediaKind::Video)
    }
}
