//! Local media acquisition

use super::{DisplaySurface, MediaKind};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// A local track published to peers
///
/// Applications feed encoded frames into [`LocalTrack::sample_track`].
#[derive(Clone)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
    pub display_surface: Option<DisplaySurface>,
    track: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    /// Opus microphone track
    pub fn audio(id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        let id = id.into();
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            id.clone(),
            stream_id.into(),
        ));

        Self {
            id,
            kind: MediaKind::Audio,
            display_surface: None,
            track,
        }
    }

    /// VP8 camera track
    pub fn video(id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        let id = id.into();
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000, // Standard 90kHz clock for video
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            id.clone(),
            stream_id.into(),
        ));

        Self {
            id,
            kind: MediaKind::Video,
            display_surface: None,
            track,
        }
    }

    /// VP8 screen-capture track
    pub fn screen(
        id: impl Into<String>,
        stream_id: impl Into<String>,
        surface: DisplaySurface,
    ) -> Self {
        let mut track = Self::video(id, stream_id);
        track.display_surface = Some(surface);
        track
    }

    pub fn sample_track(&self) -> &Arc<TrackLocalStaticSample> {
        &self.track
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("display_surface", &self.display_surface)
            .finish()
    }
}

/// Captured camera and microphone tracks
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    pub tracks: Vec<LocalTrack>,
}

impl LocalMedia {
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

/// Source of local camera and microphone tracks
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire capture tracks
    ///
    /// An error means capture was denied or is unavailable; the session then
    /// continues without media.
    async fn acquire(&self) -> Result<LocalMedia>;
}

/// Publishes sample-fed Opus and VP8 tracks
#[derive(Debug, Clone)]
pub struct StaticSampleCapture {
    pub stream_id: String,
    pub audio: bool,
    pub video: bool,
}

impl StaticSampleCapture {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            audio: true,
            video: true,
        }
    }
}

#[async_trait]
impl MediaSource for StaticSampleCapture {
    async fn acquire(&self) -> Result<LocalMedia> {
        let mut tracks = Vec::new();
        if self.audio {
            tracks.push(LocalTrack::audio(
                format!("{}-mic", self.stream_id),
                &self.stream_id,
            ));
        }
        if self.video {
            tracks.push(LocalTrack::video(
                format!("{}-camera", self.stream_id),
                &self.stream_id,
            ));
        }

        if tracks.is_empty() {
            return Err(Error::MediaUnavailable(
                "capture configured with neither audio nor video".to_string(),
            ));
        }

        info!(stream_id = %self.stream_id, tracks = tracks.len(), "Local capture ready");
        Ok(LocalMedia { tracks })
    }
}

/// A source that always fails, as when camera/microphone access is denied
#[derive(Debug, Clone, Default)]
pub struct NoCapture;

#[async_trait]
impl MediaSource for NoCapture {
    async fn acquire(&self) -> Result<LocalMedia> {
        Err(Error::MediaUnavailable(
            "camera and microphone unavailable".to_string(),
        ))
    }
}
