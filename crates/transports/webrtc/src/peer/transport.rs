//! Transport seam between peer links and the WebRTC stack
//!
//! A [`PeerTransport`] is one peer connection. Its callbacks never touch mesh
//! state; they push [`LinkEvent`]s into the session's dispatch loop through a
//! [`LinkEventSink`].

use crate::channels::ReliableChannel;
use crate::media::{LocalTrack, MediaTrack};
use crate::signaling::{IceCandidate, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Connection state reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    /// Transient; may recover without renegotiation
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// States after which the connection is unusable
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportState::Failed | TransportState::Closed)
    }
}

/// Event raised by a transport callback
pub enum TransportEvent {
    /// Local ICE candidate to forward to the remote peer
    IceCandidate(IceCandidate),
    /// Inbound media track
    Track(MediaTrack),
    /// Reliable channel opened (locally created or remotely announced)
    ChannelOpened(Arc<dyn ReliableChannel>),
    /// Text frame received on the reliable channel
    ChannelMessage(String),
    ChannelClosed,
    StateChanged(TransportState),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            Self::Track(t) => f.debug_tuple("Track").field(t).finish(),
            Self::ChannelOpened(c) => f.debug_tuple("ChannelOpened").field(&c.label()).finish(),
            Self::ChannelMessage(m) => f.debug_tuple("ChannelMessage").field(m).finish(),
            Self::ChannelClosed => f.write_str("ChannelClosed"),
            Self::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
        }
    }
}

/// Transport event tagged with the link it came from
///
/// `connection_id` distinguishes successive links to the same peer so that
/// events from a torn-down link can be discarded.
#[derive(Debug)]
pub struct LinkEvent {
    pub peer_id: String,
    pub connection_id: u64,
    pub event: TransportEvent,
}

/// Sender half handed to a transport for its callbacks
#[derive(Clone)]
pub struct LinkEventSink {
    peer_id: String,
    connection_id: u64,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkEventSink {
    pub fn new(
        peer_id: impl Into<String>,
        connection_id: u64,
        tx: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            connection_id,
            tx,
        }
    }

    /// Push an event to the dispatch loop; returns false once it is gone
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(LinkEvent {
                peer_id: self.peer_id.clone(),
                connection_id: self.connection_id,
                event,
            })
            .is_ok()
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }
}

/// One peer connection
///
/// `create_offer` and `create_answer` also apply the result as the local
/// description.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Discard a pending local offer
    async fn rollback(&self) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    async fn remove_track(&self, track_id: &str) -> Result<()>;

    /// Create the reliable channel; its opening is reported as
    /// [`TransportEvent::ChannelOpened`]
    async fn create_channel(&self, label: &str) -> Result<Arc<dyn ReliableChannel>>;

    async fn close(&self) -> Result<()>;
}

/// Builds transports for new peer links
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, events: LinkEventSink) -> Result<Arc<dyn PeerTransport>>;
}
