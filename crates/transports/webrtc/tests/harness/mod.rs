//! Test harness for peer mesh integration tests
//!
//! Provides an embedded signaling relay and helpers for building sessions
//! backed by the in-memory transport.

#![allow(dead_code)]

mod relay;

pub use relay::TestRelay;

use peermesh_webrtc::media::StaticSampleCapture;
use peermesh_webrtc::testing::MockTransportFactory;
use peermesh_webrtc::{MeshConfig, PeerMeshSession};
use std::sync::Arc;
use std::time::Duration;

/// Harness errors
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Relay error: {0}")]
    RelayError(String),

    #[error("Session error: {0}")]
    SessionError(#[from] peermesh_webrtc::Error),

    #[error("Timeout: {0}")]
    Timeout(String),
}

pub type HarnessResult<T> = Result<T, HarnessError>;

/// Initialize test logging (safe to call from every test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,peermesh_webrtc=debug")
        .with_test_writer()
        .try_init();
}

/// Configuration with intervals short enough for tests
pub fn test_config(relay_url: &str, peer_id: &str) -> MeshConfig {
    let mut config = MeshConfig {
        signaling_url: relay_url.to_string(),
        stun_servers: Vec::new(),
        peer_id: Some(peer_id.to_string()),
        ..Default::default()
    };
    config.proximity.sweep_interval_ms = 50;
    config.presence.broadcast_interval_ms = 20;
    config.signaling.connect_timeout_ms = 2000;
    config.signaling.reconnect_base_delay_ms = 50;
    config.signaling.reconnect_max_delay_ms = 200;
    config.signaling.max_reconnect_attempts = 3;
    config
}

/// A session wired to a mock transport factory
pub struct TestPeer {
    pub session: PeerMeshSession,
    pub factory: Arc<MockTransportFactory>,
}

impl TestPeer {
    /// Build and initialize a session with camera and microphone
    pub async fn join(config: MeshConfig) -> HarnessResult<Self> {
        let factory = Arc::new(MockTransportFactory::new());
        let stream_id = format!("{}-stream", config.peer_id.clone().unwrap_or_default());
        let session = PeerMeshSession::with_transport_factory(
            config,
            factory.clone(),
            Arc::new(StaticSampleCapture::new(stream_id)),
        )?;
        session.init().await?;
        Ok(Self { session, factory })
    }

    pub fn id(&self) -> String {
        self.session.local_identity().id
    }
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn wait_until<F>(what: &str, timeout: Duration, mut check: F) -> HarnessResult<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            return Err(HarnessError::Timeout(what.to_string()));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}
