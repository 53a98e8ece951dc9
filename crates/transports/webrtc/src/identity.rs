//! Avatar identity and remote peer records

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// A point or direction in world space
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Distance on the ground plane (X/Z), ignoring height
    pub fn planar_distance(&self, other: &Vec3) -> f64 {
        let dx = self.x - other.x;
        let dz = self.z - other.z;
        (dx * dx + dz * dz).sqrt()
    }

    /// Largest absolute per-component difference
    pub fn max_abs_delta(&self, other: &Vec3) -> f64 {
        (self.x - other.x)
            .abs()
            .max((self.y - other.y).abs())
            .max((self.z - other.z).abs())
    }
}

/// Placement of a shared-screen billboard in the world
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Billboard {
    pub position: Vec3,
    pub height: f64,
    pub width: f64,
    pub aspect_ratio: f64,
}

/// Avatar state of one participant
///
/// The local session owns exactly one of these; remote copies are carried in
/// [`RemotePeerRecord`]s. Serializes with camelCase keys to match the relay
/// wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalIdentity {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub position: Vec3,
    #[serde(default)]
    pub velocity: Vec3,
    #[serde(default)]
    pub rotation: Vec3,
    #[serde(default)]
    pub has_media: bool,
    #[serde(default)]
    pub screen_sharing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billboard: Option<Billboard>,
}

const PALETTE: [&str; 8] = [
    "#e6194b", "#3cb44b", "#ffe119", "#4363d8", "#f58231", "#911eb4", "#46f0f0", "#f032e6",
];

impl LocalIdentity {
    /// Create an identity at the origin with no media
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let color = color_for(&id).to_string();
        Self {
            name: id.clone(),
            id,
            color,
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            rotation: Vec3::ZERO,
            has_media: false,
            screen_sharing: false,
            billboard: None,
        }
    }

    /// Build the local identity from configuration, generating what is missing
    pub fn from_config(config: &crate::MeshConfig) -> Self {
        let id = config.peer_id.clone().unwrap_or_else(generate_peer_id);
        let mut identity = Self::new(id);
        if let Some(name) = &config.display_name {
            identity.name = name.clone();
        }
        if let Some(color) = &config.color {
            identity.color = color.clone();
        }
        identity
    }

    /// Apply a partial update
    pub fn apply(&mut self, patch: LocalPlayerPatch) {
        if let Some(position) = patch.position {
            self.position = position;
        }
        if let Some(velocity) = patch.velocity {
            self.velocity = velocity;
        }
        if let Some(rotation) = patch.rotation {
            self.rotation = rotation;
        }
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(color) = patch.color {
            self.color = color;
        }
    }
}

/// Generate a fresh client-side peer id
pub fn generate_peer_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("peer-{}", &uuid[..12])
}

fn color_for(id: &str) -> &'static str {
    let sum = id.bytes().fold(0usize, |acc, b| acc.wrapping_add(b as usize));
    PALETTE[sum % PALETTE.len()]
}

/// Partial update to the local avatar
///
/// Media and screen-share flags are owned by the session and cannot be
/// patched directly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalPlayerPatch {
    pub position: Option<Vec3>,
    pub velocity: Option<Vec3>,
    pub rotation: Option<Vec3>,
    pub name: Option<String>,
    pub color: Option<String>,
}

impl LocalPlayerPatch {
    pub fn position(position: Vec3) -> Self {
        Self {
            position: Some(position),
            ..Default::default()
        }
    }

    pub fn with_velocity(mut self, velocity: Vec3) -> Self {
        self.velocity = Some(velocity);
        self
    }

    pub fn with_rotation(mut self, rotation: Vec3) -> Self {
        self.rotation = Some(rotation);
        self
    }
}

/// Last-known state of a remote peer
#[derive(Debug, Clone)]
pub struct RemotePeerRecord {
    pub state: LocalIdentity,
    pub last_updated: Instant,
    /// Created from an offer before any state arrived
    pub placeholder: bool,
}

impl RemotePeerRecord {
    pub fn new(state: LocalIdentity) -> Self {
        Self {
            state,
            last_updated: Instant::now(),
            placeholder: false,
        }
    }

    pub fn placeholder(peer_id: &str) -> Self {
        Self {
            state: LocalIdentity::new(peer_id),
            last_updated: Instant::now(),
            placeholder: true,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.state.id
    }

    /// Replace the state, returning the previous one
    pub fn update(&mut self, state: LocalIdentity) -> LocalIdentity {
        self.last_updated = Instant::now();
        self.placeholder = false;
        std::mem::replace(&mut self.state, state)
    }
}
