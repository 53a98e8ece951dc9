//! Events published to session subscribers

use crate::identity::LocalIdentity;
use crate::media::{MediaStream, StreamKind};

/// Notification for rendering, physics and UI collaborators
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A remote peer's state was created or updated
    PlayerUpdate(LocalIdentity),

    /// A remote peer left the relay
    PlayerLeave { peer_id: String },

    /// A peer's camera+microphone stream appeared or changed
    StreamAdded { peer_id: String, stream: MediaStream },

    /// A peer's screen stream appeared or changed
    ScreenStreamAdded { peer_id: String, stream: MediaStream },

    StreamRemoved { peer_id: String, kind: StreamKind },

    /// Relay reconnection gave up after `attempts` tries
    SignalingLost { attempts: u32 },
}

impl MeshEvent {
    /// Wire-style event name
    pub fn name(&self) -> &'static str {
        match self {
            MeshEvent::PlayerUpdate(_) => "player_update",
            MeshEvent::PlayerLeave { .. } => "player_leave",
            MeshEvent::StreamAdded { .. } => "stream_added",
            MeshEvent::ScreenStreamAdded { .. } => "screen_stream_added",
            MeshEvent::StreamRemoved { .. } => "stream_removed",
            MeshEvent::SignalingLost { .. } => "signaling_lost",
        }
    }

    /// Remote peer the event is about, if any
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            MeshEvent::PlayerUpdate(state) => Some(&state.id),
            MeshEvent::PlayerLeave { peer_id }
            | MeshEvent::StreamAdded { peer_id, .. }
            | MeshEvent::ScreenStreamAdded { peer_id, .. }
            | MeshEvent::StreamRemoved { peer_id, .. } => Some(peer_id),
            MeshEvent::SignalingLost { .. } => None,
        }
    }
}
