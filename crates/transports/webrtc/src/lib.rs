//! Proximity-gated WebRTC peer mesh
//!
//! This crate connects a participant in a shared 3D world to the other
//! participants near it: it keeps one signaling relay connection, negotiates
//! direct WebRTC links with peers inside a connect radius, classifies their
//! inbound tracks into camera and screen streams, and keeps avatar state in
//! sync over the relay and per-peer data channels.
//!
//! # Features
//!
//! - **Proximity mesh**: links open and close as avatars move, capped at
//!   `max_peers`, with a deterministic glare rule so each pair negotiates once
//! - **Renegotiation**: screen sharing adds tracks to live links without
//!   tearing them down
//! - **Track classification**: explicit metadata, capture surface and label
//!   heuristics route video into camera or screen streams
//! - **Presence**: dead-band change detection on position, velocity and
//!   rotation
//! - **Relay reconnection**: exponential backoff with a capped delay and a
//!   bounded number of attempts
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Application (rendering / physics / UI)              │
//! │  ↑ MeshEvent            ↓ update_local_player, ...   │
//! │  PeerMeshSession                                     │
//! │  └─ dispatch task (single owner of mesh state)       │
//! │     ├─ SignalingLink (JSON over WebSocket, backoff)  │
//! │     ├─ PresenceBroadcaster (dead-band, ~100 ms)      │
//! │     └─ MeshTopology (proximity sweep, ~1 s)          │
//! │        └─ PeerLink per peer                          │
//! │           ├─ PeerTransport (RTCPeerConnection)       │
//! │           ├─ ReliableChannel (RTCDataChannel)        │
//! │           └─ TrackBuckets (audio / camera / screen)  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use peermesh_webrtc::MeshConfig;
//!
//! let config = MeshConfig {
//!     signaling_url: "ws://localhost:8080".to_string(),
//!     max_peers: 8,
//!     ..Default::default()
//! };
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.proximity.connect_radius, 12.0);
//! ```

#![warn(clippy::all)]

pub mod channels;
pub mod config;
pub mod error;
pub mod identity;
pub mod media;
pub mod peer;
pub mod presence;
pub mod session;
pub mod signaling;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{
    DataChannelMode, MeshConfig, PresenceOptions, ProximityOptions, SignalingOptions,
    TurnServerConfig,
};
pub use error::{Error, Result};
pub use identity::{Billboard, LocalIdentity, LocalPlayerPatch, RemotePeerRecord, Vec3};
pub use media::{LocalTrack, MediaKind, MediaStream, MediaTrack, StreamKind};
pub use peer::{LinkState, PeerInfo};
pub use session::{MeshEvent, PeerMeshSession};
pub use signaling::{LinkStatus, SignalingEnvelope};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let ver = version();
        assert!(!ver.is_empty());
    }
}
