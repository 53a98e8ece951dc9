//! Session facade and its dispatch loop
//!
//! [`PeerMeshSession`] is what applications hold. Everything it does is
//! serialized through one dispatch task that owns the mesh topology.

mod dispatcher;
pub mod events;
#[allow(clippy::module_inception)]
pub mod session;

pub use events::MeshEvent;
pub use session::PeerMeshSession;
