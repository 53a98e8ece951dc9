//! Inbound track classification
//!
//! Video tracks are screen video when any of these holds, checked in order:
//! the sender announced the id in `screen_track_metadata`, the capture
//! surface is a display source, or the label names a screen, monitor or
//! window. Everything else is camera video. Audio is always microphone.

use super::{MediaKind, MediaTrack, TrackBucket};
use std::collections::{HashMap, HashSet};
use tracing::debug;

const SCREEN_LABEL_KEYWORDS: [&str; 3] = ["screen", "monitor", "window"];

/// Which rule decided a classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationSource {
    AudioKind,
    Metadata,
    CaptureSurface,
    Label,
    Default,
}

impl ClassificationSource {
    /// Heuristic confidence in `[0, 1]`
    pub fn confidence(&self) -> f32 {
        match self {
            Self::AudioKind | Self::Metadata => 1.0,
            Self::CaptureSurface => 0.9,
            Self::Label => 0.6,
            Self::Default => 0.5,
        }
    }
}

/// Result of classifying one track delivery
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub bucket: TrackBucket,
    pub source: ClassificationSource,
    /// The track id was already classified for this peer
    pub is_duplicate: bool,
}

impl Classification {
    pub fn confidence(&self) -> f32 {
        self.source.confidence()
    }
}

#[derive(Debug, Default)]
struct PeerTracks {
    announced_screen: HashSet<String>,
    processed: HashMap<String, (TrackBucket, ClassificationSource)>,
}

/// Per-peer track classifier
#[derive(Debug, Default)]
pub struct TrackClassifier {
    peers: HashMap<String, PeerTracks>,
}

impl TrackClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify a track delivered for `peer_id`
    ///
    /// A repeated delivery of an already classified id reports the original
    /// bucket with `is_duplicate` set.
    pub fn classify(&mut self, peer_id: &str, track: &MediaTrack) -> Classification {
        let peer = self.peers.entry(peer_id.to_string()).or_default();

        if let Some((bucket, source)) = peer.processed.get(&track.id) {
            return Classification {
                bucket: *bucket,
                source: *source,
                is_duplicate: true,
            };
        }

        let (bucket, source) = match track.kind {
            MediaKind::Audio => (TrackBucket::Audio, ClassificationSource::AudioKind),
            MediaKind::Video => {
                if peer.announced_screen.contains(&track.id) {
                    (TrackBucket::Screen, ClassificationSource::Metadata)
                } else if track.display_surface.is_some() {
                    (TrackBucket::Screen, ClassificationSource::CaptureSurface)
                } else if label_names_screen(&track.label) {
                    (TrackBucket::Screen, ClassificationSource::Label)
                } else {
                    (TrackBucket::Camera, ClassificationSource::Default)
                }
            }
        };

        debug!(
            peer_id,
            track_id = %track.id,
            ?bucket,
            ?source,
            "Classified inbound track"
        );

        peer.processed.insert(track.id.clone(), (bucket, source));
        Classification {
            bucket,
            source,
            is_duplicate: false,
        }
    }

    /// Record screen track ids announced by `peer_id`
    ///
    /// Returns the ids that were already classified as camera video and must
    /// now move to the screen bucket. Each id is returned at most once.
    pub fn announce(&mut self, peer_id: &str, track_ids: &[String]) -> Vec<String> {
        let peer = self.peers.entry(peer_id.to_string()).or_default();
        let mut reclassified = Vec::new();

        for id in track_ids {
            peer.announced_screen.insert(id.clone());
            if let Some(entry) = peer.processed.get_mut(id) {
                if entry.0 == TrackBucket::Camera {
                    *entry = (TrackBucket::Screen, ClassificationSource::Metadata);
                    reclassified.push(id.clone());
                }
            }
        }

        if !reclassified.is_empty() {
            debug!(peer_id, ?reclassified, "Reclassifying camera tracks as screen");
        }
        reclassified
    }

    /// Drop every screen-bucket entry for `peer_id`
    ///
    /// Used when the peer stops sharing; its announced ids no longer apply.
    pub fn clear_screen(&mut self, peer_id: &str) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.announced_screen.clear();
            peer.processed
                .retain(|_, (bucket, _)| *bucket != TrackBucket::Screen);
        }
    }

    /// Forget all state for a peer whose link was torn down
    pub fn forget_peer(&mut self, peer_id: &str) {
        self.peers.remove(peer_id);
    }

    pub fn is_processed(&self, peer_id: &str, track_id: &str) -> bool {
        self.peers
            .get(peer_id)
            .is_some_and(|p| p.processed.contains_key(track_id))
    }
}

fn label_names_screen(label: &str) -> bool {
    let label = label.to_ascii_lowercase();
    SCREEN_LABEL_KEYWORDS.iter().any(|k| label.contains(k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::DisplaySurface;

    fn video(id: &str, label: &str) -> MediaTrack {
        MediaTrack::new(id, MediaKind::Video, label)
    }

    #[test]
    fn test_audio_is_always_microphone() {
        let mut classifier = TrackClassifier::new();
        let track = MediaTrack::new("a1", MediaKind::Audio, "Screen audio");
        let result = classifier.classify("peer-b", &track);
        assert_eq!(result.bucket, TrackBucket::Audio);
        assert_eq!(result.source, ClassificationSource::AudioKind);
    }

    #[test]
    fn test_tier_order() {
        let mut classifier = TrackClassifier::new();
        classifier.announce("peer-b", &["v-meta".to_string()]);

        let meta = classifier.classify("peer-b", &video("v-meta", "FaceTime HD Camera"));
        assert_eq!(meta.source, ClassificationSource::Metadata);
        assert_eq!(meta.bucket, TrackBucket::Screen);

        let surface = classifier.classify(
            "peer-b",
            &video("v-surface", "camera").with_display_surface(DisplaySurface::Window),
        );
        assert_eq!(surface.source, ClassificationSource::CaptureSurface);

        let label = classifier.classify("peer-b", &video("v-label", "Entire MONITOR 1"));
        assert_eq!(label.source, ClassificationSource::Label);
        assert_eq!(label.bucket, TrackBucket::Screen);

        let camera = classifier.classify("peer-b", &video("v-cam", "USB webcam"));
        assert_eq!(camera.bucket, TrackBucket::Camera);
        assert_eq!(camera.source, ClassificationSource::Default);

        assert!(meta.confidence() > surface.confidence());
        assert!(surface.confidence() > label.confidence());
        assert!(label.confidence() > camera.confidence());
    }

    #[test]
    fn test_duplicate_delivery() {
        let mut classifier = TrackClassifier::new();
        let track = video("v1", "webcam");
        assert!(!classifier.classify("peer-b", &track).is_duplicate);

        let again = classifier.classify("peer-b", &track);
        assert!(again.is_duplicate);
        assert_eq!(again.bucket, TrackBucket::Camera);

        // Same id from another peer is independent
        assert!(!classifier.classify("peer-c", &track).is_duplicate);
    }

    #[test]
    fn test_late_metadata_reclassifies_once() {
        let mut classifier = TrackClassifier::new();
        classifier.classify("peer-b", &video("v1", "webcam"));

        let moved = classifier.announce("peer-b", &["v1".to_string(), "v2".to_string()]);
        assert_eq!(moved, vec!["v1".to_string()]);

        // A repeated announcement moves nothing
        assert!(classifier.announce("peer-b", &["v1".to_string()]).is_empty());

        let again = classifier.classify("peer-b", &video("v1", "webcam"));
        assert!(again.is_duplicate);
        assert_eq!(again.bucket, TrackBucket::Screen);
    }

    #[test]
    fn test_forget_peer_resets_state() {
        let mut classifier = TrackClassifier::new();
        classifier.classify("peer-b", &video("v1", "webcam"));
        classifier.forget_peer("peer-b");
        assert!(!classifier.is_processed("peer-b", "v1"));
    }

    #[test]
    fn test_clear_screen_keeps_camera() {
        let mut classifier = TrackClassifier::new();
        classifier.classify("peer-b", &video("cam", "webcam"));
        classifier.classify("peer-b", &video("scr", "screen:0"));
        classifier.clear_screen("peer-b");
        assert!(classifier.is_processed("peer-b", "cam"));
        assert!(!classifier.is_processed("peer-b", "scr"));
    }
}
