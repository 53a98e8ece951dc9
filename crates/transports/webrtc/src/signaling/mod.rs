//! Signaling relay client and envelope protocol
//!
//! - [`SignalingLink`] owns the relay WebSocket, sends `join` on every open
//!   and reconnects with [`ReconnectPolicy`] backoff
//! - [`SignalingEnvelope`] is the tagged JSON envelope shared by the relay and
//!   the peer reliable channel

mod link;
mod protocol;
mod reconnect;

pub use link::{LinkStatus, MessageHandler, SignalingLink, StatusHandler};
pub use protocol::{IceCandidate, SdpType, SessionDescription, SignalingEnvelope};
pub use reconnect::{Backoff, ReconnectPolicy};

/// Outbound path for envelopes addressed to the relay
///
/// Sends are best-effort; implementations log failures.
pub trait EnvelopeSink: Send + Sync {
    fn send_envelope(&self, envelope: SignalingEnvelope);
}
