//! Relay and reliable-channel envelope types
//!
//! Every frame on the relay socket and on a peer's reliable channel is one
//! JSON object with a `type` discriminator.

use crate::identity::LocalIdentity;
use crate::Result;
use serde::{Deserialize, Serialize};

/// SDP type carried in a [`SessionDescription`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description as exchanged over the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate as exchanged over the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,

    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,

    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Signaling envelope
///
/// Sent over the relay, except `screen_track_metadata` which travels over the
/// reliable channel where the sender is implied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingEnvelope {
    /// Announce presence on connect and on every reconnect
    #[serde(rename = "join")]
    Join {
        #[serde(rename = "peerId")]
        peer_id: String,
        data: LocalIdentity,
    },

    /// Graceful departure (also synthesized by the relay on disconnect)
    #[serde(rename = "leave")]
    Leave {
        #[serde(rename = "peerId")]
        peer_id: String,
    },

    /// Avatar state broadcast
    #[serde(rename = "player_state")]
    PlayerState {
        #[serde(rename = "peerId")]
        peer_id: String,
        data: LocalIdentity,
    },

    #[serde(rename = "webrtc-offer")]
    Offer {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(rename = "targetPeer")]
        target_peer: String,
        offer: SessionDescription,
    },

    #[serde(rename = "webrtc-answer")]
    Answer {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(rename = "targetPeer")]
        target_peer: String,
        answer: SessionDescription,
    },

    #[serde(rename = "webrtc-ice")]
    Ice {
        #[serde(rename = "peerId")]
        peer_id: String,
        #[serde(rename = "targetPeer")]
        target_peer: String,
        candidate: IceCandidate,
    },

    /// Track ids the sender is publishing as screen video
    #[serde(rename = "screen_track_metadata")]
    ScreenTrackMetadata {
        #[serde(rename = "peerId", default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
        #[serde(rename = "trackIds")]
        track_ids: Vec<String>,
    },
}

impl SignalingEnvelope {
    /// Wire name of this envelope's `type`
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::PlayerState { .. } => "player_state",
            Self::Offer { .. } => "webrtc-offer",
            Self::Answer { .. } => "webrtc-answer",
            Self::Ice { .. } => "webrtc-ice",
            Self::ScreenTrackMetadata { .. } => "screen_track_metadata",
        }
    }

    /// Sender peer id, if the envelope names one
    pub fn sender(&self) -> Option<&str> {
        match self {
            Self::Join { peer_id, .. }
            | Self::Leave { peer_id }
            | Self::PlayerState { peer_id, .. }
            | Self::Offer { peer_id, .. }
            | Self::Answer { peer_id, .. }
            | Self::Ice { peer_id, .. } => Some(peer_id),
            Self::ScreenTrackMetadata { peer_id, .. } => peer_id.as_deref(),
        }
    }

    /// Target peer id for point-to-point kinds
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Offer { target_peer, .. }
            | Self::Answer { target_peer, .. }
            | Self::Ice { target_peer, .. } => Some(target_peer),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_offer_wire_format() {
        let envelope = SignalingEnvelope::Offer {
            peer_id: "peer-b".to_string(),
            target_peer: "peer-a".to_string(),
            offer: SessionDescription::offer("v=0"),
        };

        let value: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "webrtc-offer",
                "peerId": "peer-b",
                "targetPeer": "peer-a",
                "offer": {"type": "offer", "sdp": "v=0"}
            })
        );
    }

    #[test]
    fn test_ice_wire_format() {
        let text = r#"{
            "type": "webrtc-ice",
            "peerId": "peer-a",
            "targetPeer": "peer-b",
            "candidate": {
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 51000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            }
        }"#;

        let envelope = SignalingEnvelope::from_json(text).unwrap();
        match &envelope {
            SignalingEnvelope::Ice { candidate, .. } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
                assert_eq!(candidate.username_fragment, None);
            }
            other => panic!("unexpected envelope {:?}", other),
        }
        assert_eq!(envelope.sender(), Some("peer-a"));
        assert_eq!(envelope.target(), Some("peer-b"));
    }

    #[test]
    fn test_screen_metadata_without_sender() {
        let envelope = SignalingEnvelope::from_json(
            r#"{"type":"screen_track_metadata","trackIds":["t1","t2"]}"#,
        )
        .unwrap();

        assert_eq!(envelope.sender(), None);
        assert_eq!(envelope.kind(), "screen_track_metadata");

        let text = envelope.to_json().unwrap();
        assert!(!text.contains("peerId"));
    }

    #[test]
    fn test_join_carries_identity() {
        let text = r#"{"type":"join","peerId":"peer-c","data":{"id":"peer-c","hasMedia":true}}"#;
        let envelope = SignalingEnvelope::from_json(text).unwrap();
        match envelope {
            SignalingEnvelope::Join { peer_id, data } => {
                assert_eq!(peer_id, "peer-c");
                assert!(data.has_media);
            }
            other => panic!("unexpected envelope {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result = SignalingEnvelope::from_json(r#"{"type":"chat","peerId":"x"}"#);
        assert!(matches!(result, Err(crate::Error::SerializationError(_))));
    }
}
