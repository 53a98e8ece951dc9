//! Per-peer track buckets

use super::{MediaStream, MediaTrack, StreamKind};

/// Bucket an inbound track is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackBucket {
    /// Microphone audio
    Audio,
    /// Camera video
    Camera,
    /// Screen-share video
    Screen,
}

/// The three track lists of one peer link
///
/// A track id is held by at most one bucket.
#[derive(Debug, Default, Clone)]
pub struct TrackBuckets {
    audio: Vec<MediaTrack>,
    camera: Vec<MediaTrack>,
    screen: Vec<MediaTrack>,
}

impl TrackBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a track; returns false if its id is already held
    pub fn insert(&mut self, bucket: TrackBucket, track: MediaTrack) -> bool {
        if self.locate(&track.id).is_some() {
            return false;
        }
        self.list_mut(bucket).push(track);
        true
    }

    /// Move a camera track to the screen bucket
    pub fn promote_to_screen(&mut self, track_id: &str) -> bool {
        match self.camera.iter().position(|t| t.id == track_id) {
            Some(index) => {
                let track = self.camera.remove(index);
                self.screen.push(track);
                true
            }
            None => false,
        }
    }

    /// Empty the screen bucket; returns whether anything was removed
    pub fn clear_screen(&mut self) -> bool {
        let had_tracks = !self.screen.is_empty();
        self.screen.clear();
        had_tracks
    }

    pub fn clear(&mut self) {
        self.audio.clear();
        self.camera.clear();
        self.screen.clear();
    }

    /// Bucket holding `track_id`, if any
    pub fn locate(&self, track_id: &str) -> Option<TrackBucket> {
        [
            (TrackBucket::Audio, &self.audio),
            (TrackBucket::Camera, &self.camera),
            (TrackBucket::Screen, &self.screen),
        ]
        .into_iter()
        .find(|(_, list)| list.iter().any(|t| t.id == track_id))
        .map(|(bucket, _)| bucket)
    }

    pub fn tracks(&self, bucket: TrackBucket) -> &[MediaTrack] {
        match bucket {
            TrackBucket::Audio => &self.audio,
            TrackBucket::Camera => &self.camera,
            TrackBucket::Screen => &self.screen,
        }
    }

    pub fn len(&self) -> usize {
        self.audio.len() + self.camera.len() + self.screen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tracks of the given stream: audio plus camera, or screen
    pub fn stream_tracks(&self, kind: StreamKind) -> Vec<MediaTrack> {
        match kind {
            StreamKind::Camera => self.audio.iter().chain(&self.camera).cloned().collect(),
            StreamKind::Screen => self.screen.clone(),
        }
    }

    /// Build the stream for `kind`, or `None` when it has no tracks
    pub fn build_stream(&self, peer_id: &str, kind: StreamKind) -> Option<MediaStream> {
        let tracks = self.stream_tracks(kind);
        if tracks.is_empty() {
            None
        } else {
            Some(MediaStream::new(peer_id, kind, tracks))
        }
    }

    fn list_mut(&mut self, bucket: TrackBucket) -> &mut Vec<MediaTrack> {
        match bucket {
            TrackBucket::Audio => &mut self.audio,
            TrackBucket::Camera => &mut self.camera,
            TrackBucket::Screen => &mut self.screen,
        }
    }
}
