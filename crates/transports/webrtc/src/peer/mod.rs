//! Peer links and mesh topology
//!
//! Handles per-peer negotiation, ICE buffering, proximity gating and the
//! WebRTC transport behind each link.

pub mod ice_buffer;
pub mod link;
pub mod proximity;
pub mod rtc;
pub mod topology;
pub mod transport;

pub use ice_buffer::{DrainReport, IceCandidateBuffer};
pub use link::{LinkState, PeerLink};
pub use proximity::{is_designated_offerer, ProximityPlan, ProximityPolicy};
pub use rtc::{RtcTransport, RtcTransportFactory};
pub use topology::{MeshTopology, PeerInfo};
pub use transport::{
    LinkEvent, LinkEventSink, PeerTransport, TransportEvent, TransportFactory, TransportState,
};
