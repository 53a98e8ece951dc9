//! Configuration types for the peer mesh

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for a [`crate::PeerMeshSession`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// WebSocket signaling relay URL (ws:// or wss://)
    pub signaling_url: String,

    /// STUN server URLs
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Local peer ID (auto-generated if None)
    pub peer_id: Option<String>,

    /// Display name advertised to other peers
    pub display_name: Option<String>,

    /// Display color advertised to other peers (e.g. "#3fa7d6")
    pub color: Option<String>,

    /// Hard cap on simultaneously open peer links (default: 16)
    pub max_peers: u32,

    /// Reliable channel delivery mode (default: Reliable)
    pub data_channel_mode: DataChannelMode,

    /// Relay connection and reconnection settings
    pub signaling: SignalingOptions,

    /// Proximity policy settings
    pub proximity: ProximityOptions,

    /// Presence broadcast settings
    pub presence: PresenceOptions,
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn:// or turns://)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Relay connection options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingOptions {
    /// Window for the relay socket to open (default: 10000ms)
    pub connect_timeout_ms: u64,

    /// First reconnect delay in milliseconds (default: 1000)
    pub reconnect_base_delay_ms: u64,

    /// Upper bound on a reconnect delay in milliseconds (default: 30000)
    pub reconnect_max_delay_ms: u64,

    /// Reconnect attempts before the link gives up (default: 10)
    pub max_reconnect_attempts: u32,
}

/// Proximity policy options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProximityOptions {
    /// Planar distance under which a direct link is maintained (default: 12.0)
    pub connect_radius: f64,

    /// Sweep period in milliseconds (default: 1000)
    pub sweep_interval_ms: u64,

    /// Window for an offer/answer exchange before the sweep drops the link
    /// (default: 15000ms)
    pub negotiation_timeout_ms: u64,
}

/// Presence broadcast options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceOptions {
    /// Change-detection period in milliseconds (default: 100)
    pub broadcast_interval_ms: u64,

    /// Dead-band for position components (default: 0.01)
    pub position_epsilon: f64,

    /// Dead-band for velocity components (default: 0.05)
    pub velocity_epsilon: f64,

    /// Dead-band for rotation components (default: 0.01)
    pub rotation_epsilon: f64,
}

/// Data channel mode
///
/// Determines the reliability of message delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataChannelMode {
    /// Reliable, ordered delivery (default)
    Reliable,
    /// Unreliable, unordered delivery (low latency)
    ///
    /// Presence tolerates loss because the relay path still carries every
    /// state change.
    Unreliable,
}

impl DataChannelMode {
    /// Get the ordered setting for webrtc-rs
    pub fn ordered(&self) -> bool {
        match self {
            DataChannelMode::Reliable => true,
            DataChannelMode::Unreliable => false,
        }
    }

    /// Get the max retransmits setting for webrtc-rs
    pub fn max_retransmits(&self) -> Option<u16> {
        match self {
            DataChannelMode::Reliable => None,      // Unlimited retransmits
            DataChannelMode::Unreliable => Some(0), // No retransmits
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:8080".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            peer_id: None,
            display_name: None,
            color: None,
            max_peers: 16,
            data_channel_mode: DataChannelMode::Reliable,
            signaling: SignalingOptions::default(),
            proximity: ProximityOptions::default(),
            presence: PresenceOptions::default(),
        }
    }
}

impl Default for SignalingOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 10,
        }
    }
}

impl Default for ProximityOptions {
    fn default() -> Self {
        Self {
            connect_radius: 12.0,
            sweep_interval_ms: 1000,
            negotiation_timeout_ms: 15_000,
        }
    }
}

impl Default for PresenceOptions {
    fn default() -> Self {
        Self {
            broadcast_interval_ms: 100,
            position_epsilon: 0.01,
            velocity_epsilon: 0.05,
            rotation_epsilon: 0.01,
        }
    }
}

impl SignalingOptions {
    /// Connect window as a Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl ProximityOptions {
    /// Sweep period as a Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }
}

impl PresenceOptions {
    /// Broadcast period as a Duration
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.broadcast_interval_ms)
    }
}

impl MeshConfig {
    /// Parse a configuration from TOML text
    ///
    /// Missing keys fall back to their defaults. The result is validated.
    pub fn from_toml_str(text: &str) -> crate::Result<Self> {
        let config: MeshConfig = toml::from_str(text)
            .map_err(|e| crate::Error::InvalidConfig(format!("Failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `signaling_url` is not a valid WebSocket URL
    /// - `max_peers` is not in range 1-64
    /// - `connect_radius` is not a positive finite number
    /// - any interval or timeout is zero
    /// - the reconnect cap is below the base delay
    /// - an epsilon is negative
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        // Validate signaling URL
        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must start with ws:// or wss://, got {}",
                self.signaling_url
            )));
        }

        // Validate max peers
        if self.max_peers == 0 || self.max_peers > 64 {
            return Err(Error::InvalidConfig(format!(
                "max_peers must be in range 1-64, got {}",
                self.max_peers
            )));
        }

        if let Some(peer_id) = &self.peer_id {
            if peer_id.trim().is_empty() {
                return Err(Error::InvalidConfig("peer_id must not be blank".to_string()));
            }
        }

        if !self.proximity.connect_radius.is_finite() || self.proximity.connect_radius <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "connect_radius must be positive, got {}",
                self.proximity.connect_radius
            )));
        }

        if self.proximity.sweep_interval_ms == 0 || self.presence.broadcast_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "sweep and broadcast intervals must be non-zero".to_string(),
            ));
        }

        if self.signaling.connect_timeout_ms == 0 || self.proximity.negotiation_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "connect_timeout_ms and negotiation_timeout_ms must be non-zero".to_string(),
            ));
        }

        if self.signaling.reconnect_base_delay_ms == 0
            || self.signaling.reconnect_max_delay_ms < self.signaling.reconnect_base_delay_ms
        {
            return Err(Error::InvalidConfig(format!(
                "reconnect delays must satisfy 0 < base ({}) <= cap ({})",
                self.signaling.reconnect_base_delay_ms, self.signaling.reconnect_max_delay_ms
            )));
        }

        let presence = &self.presence;
        for (name, value) in [
            ("position_epsilon", presence.position_epsilon),
            ("velocity_epsilon", presence.velocity_epsilon),
            ("rotation_epsilon", presence.rotation_epsilon),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::InvalidConfig(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MeshConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_peers, 16);
        assert_eq!(config.presence.broadcast_interval(), Duration::from_millis(100));
        assert_eq!(config.proximity.sweep_interval(), Duration::from_secs(1));
        assert_eq!(config.proximity.negotiation_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_zero_negotiation_timeout() {
        let mut config = MeshConfig::default();
        config.proximity.negotiation_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(crate::Error::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_signaling_url() {
        let config = MeshConfig {
            signaling_url: "http://localhost:8080".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_max_peers() {
        let mut config = MeshConfig {
            max_peers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.max_peers = 65;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_radius() {
        let mut config = MeshConfig::default();
        config.proximity.connect_radius = 0.0;
        assert!(config.validate().is_err());

        config.proximity.connect_radius = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconnect_cap_below_base() {
        let mut config = MeshConfig::default();
        config.signaling.reconnect_base_delay_ms = 5000;
        config.signaling.reconnect_max_delay_ms = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_epsilon() {
        let mut config = MeshConfig::default();
        config.presence.velocity_epsilon = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = MeshConfig::from_toml_str(
            r#"
            signaling_url = "wss://relay.example.com/ws"
            peer_id = "peer-a"
            data_channel_mode = "unreliable"

            [proximity]
            connect_radius = 25.0

            [signaling]
            max_reconnect_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.signaling_url, "wss://relay.example.com/ws");
        assert_eq!(config.peer_id.as_deref(), Some("peer-a"));
        assert_eq!(config.data_channel_mode, DataChannelMode::Unreliable);
        assert_eq!(config.proximity.connect_radius, 25.0);
        assert_eq!(config.proximity.sweep_interval_ms, 1000);
        assert_eq!(config.signaling.max_reconnect_attempts, 3);
        assert_eq!(config.signaling.reconnect_base_delay_ms, 1000);
    }

    #[test]
    fn test_from_toml_rejects_invalid() {
        let result = MeshConfig::from_toml_str(r#"signaling_url = "tcp://nope""#);
        assert!(matches!(result, Err(crate::Error::InvalidConfig(_))));
    }

    #[test]
    fn test_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_peers = 4").unwrap();
        let config = MeshConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_peers, 4);
    }

    #[test]
    fn test_data_channel_mode_reliable() {
        let mode = DataChannelMode::Reliable;
        assert!(mode.ordered());
        assert_eq!(mode.max_retransmits(), None);
    }

    #[test]
    fn test_data_channel_mode_unreliable() {
        let mode = DataChannelMode::Unreliable;
        assert!(!mode.ordered());
        assert_eq!(mode.max_retransmits(), Some(0));
    }
}
