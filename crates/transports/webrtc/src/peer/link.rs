//! One negotiated connection to a remote peer

use super::transport::PeerTransport;
use crate::channels::{ReliableChannel, CHANNEL_LABEL};
use crate::media::{LocalTrack, MediaStream, MediaTrack, StreamKind, TrackBucket, TrackBuckets};
use crate::session::MeshEvent;
use crate::signaling::SessionDescription;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Negotiation state of a [`PeerLink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Local side sent the initial offer
    NegotiatingOffer,
    /// Remote side sent the initial offer
    NegotiatingAnswer,
    Connected,
    /// Local side sent an offer on an established link
    Renegotiating,
    Closed,
}

/// Connection, reliable channel and inbound track buckets for one peer
pub struct PeerLink {
    peer_id: String,
    connection_id: u64,
    state: LinkState,
    transport: Arc<dyn PeerTransport>,
    channel: Option<Arc<dyn ReliableChannel>>,
    buckets: TrackBuckets,
    camera_stream: Option<MediaStream>,
    screen_stream: Option<MediaStream>,
    remote_description_set: bool,
    /// Local renegotiation deferred until the link is connected again
    pending_renegotiation: bool,
    /// Remote offer dropped by the glare rule; its candidates are stale
    /// until the remote answers ours
    superseded_remote_offer: bool,
    state_since: Instant,
    connected_at: Option<Instant>,
}

impl PeerLink {
    pub fn new(
        peer_id: impl Into<String>,
        connection_id: u64,
        transport: Arc<dyn PeerTransport>,
        state: LinkState,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            connection_id,
            state,
            transport,
            channel: None,
            buckets: TrackBuckets::new(),
            camera_stream: None,
            screen_stream: None,
            remote_description_set: false,
            pending_renegotiation: false,
            superseded_remote_offer: false,
            state_since: Instant::now(),
            connected_at: None,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn channel(&self) -> Option<&Arc<dyn ReliableChannel>> {
        self.channel.as_ref()
    }

    pub fn buckets(&self) -> &TrackBuckets {
        &self.buckets
    }

    pub fn camera_stream(&self) -> Option<&MediaStream> {
        self.camera_stream.as_ref()
    }

    pub fn screen_stream(&self) -> Option<&MediaStream> {
        self.screen_stream.as_ref()
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_renegotiation(&self) -> bool {
        self.pending_renegotiation
    }

    pub fn set_pending_renegotiation(&mut self, pending: bool) {
        self.pending_renegotiation = pending;
    }

    pub fn superseded_remote_offer(&self) -> bool {
        self.superseded_remote_offer
    }

    pub fn set_superseded_remote_offer(&mut self, superseded: bool) {
        self.superseded_remote_offer = superseded;
    }

    /// Time spent in the current offer/answer exchange, if one is open
    pub fn negotiating_for(&self) -> Option<Duration> {
        match self.state {
            LinkState::NegotiatingOffer | LinkState::NegotiatingAnswer | LinkState::Renegotiating => {
                Some(self.state_since.elapsed())
            }
            LinkState::Connected | LinkState::Closed => None,
        }
    }

    /// Time since negotiation completed
    pub fn connected_for(&self) -> Option<Duration> {
        self.connected_at.map(|at| at.elapsed())
    }

    pub fn set_state(&mut self, next: LinkState) {
        if self.state != next {
            debug!(
                peer_id = %self.peer_id,
                "Link state transition: {:?} -> {:?}", self.state, next
            );
            self.state = next;
            self.state_since = Instant::now();
        }
        if next == LinkState::Connected && self.connected_at.is_none() {
            self.connected_at = Some(Instant::now());
        }
    }

    /// Attach local tracks to the transport
    pub async fn attach_tracks(&self, tracks: &[LocalTrack]) -> Result<()> {
        for track in tracks {
            self.transport.add_track(track).await?;
        }
        Ok(())
    }

    /// Detach local tracks; failures are logged per track
    pub async fn detach_tracks(&self, tracks: &[LocalTrack]) {
        for track in tracks {
            if let Err(e) = self.transport.remove_track(&track.id).await {
                warn!(peer_id = %self.peer_id, track_id = %track.id, "Failed to remove track: {}", e);
            }
        }
    }

    /// Create the reliable channel (offerer side)
    pub async fn open_channel(&mut self) -> Result<()> {
        let channel = self.transport.create_channel(CHANNEL_LABEL).await?;
        self.channel = Some(channel);
        Ok(())
    }

    pub fn set_channel(&mut self, channel: Option<Arc<dyn ReliableChannel>>) {
        self.channel = channel;
    }

    pub async fn create_offer(&self) -> Result<SessionDescription> {
        self.transport.create_offer().await
    }

    pub async fn create_answer(&self) -> Result<SessionDescription> {
        self.transport.create_answer().await
    }

    /// Apply a remote offer or answer
    pub async fn apply_remote_description(&mut self, description: SessionDescription) -> Result<()> {
        self.transport.set_remote_description(description).await?;
        self.remote_description_set = true;
        Ok(())
    }

    /// Apply an answer to the local offer
    ///
    /// Only valid while an offer is outstanding; otherwise returns
    /// [`Error::NegotiationState`] and leaves the link untouched.
    pub async fn apply_answer(&mut self, answer: SessionDescription) -> Result<()> {
        if !matches!(
            self.state,
            LinkState::NegotiatingOffer | LinkState::Renegotiating
        ) {
            return Err(Error::NegotiationState(format!(
                "answer from {} while {:?}",
                self.peer_id, self.state
            )));
        }

        self.apply_remote_description(answer).await?;
        self.set_state(LinkState::Connected);
        Ok(())
    }

    /// Discard the outstanding local offer
    pub async fn rollback(&mut self) -> Result<()> {
        self.transport.rollback().await?;
        self.set_state(LinkState::Connected);
        Ok(())
    }

    /// Add a classified inbound track
    pub fn add_track(&mut self, bucket: TrackBucket, track: MediaTrack) -> Vec<MeshEvent> {
        if !self.buckets.insert(bucket, track) {
            return Vec::new();
        }
        self.rebuild_streams()
    }

    /// Move camera tracks named by late screen metadata to the screen bucket
    pub fn promote_to_screen(&mut self, track_ids: &[String]) -> Vec<MeshEvent> {
        let mut moved = false;
        for id in track_ids {
            moved |= self.buckets.promote_to_screen(id);
        }
        if moved {
            self.rebuild_streams()
        } else {
            Vec::new()
        }
    }

    /// Drop screen tracks after the peer stopped sharing
    pub fn clear_screen(&mut self) -> Vec<MeshEvent> {
        if self.buckets.clear_screen() {
            self.rebuild_streams()
        } else {
            Vec::new()
        }
    }

    /// Rebuild the exposed streams, reporting only those whose tracks changed
    fn rebuild_streams(&mut self) -> Vec<MeshEvent> {
        let mut events = Vec::new();

        for kind in [StreamKind::Camera, StreamKind::Screen] {
            let next = self.buckets.build_stream(&self.peer_id, kind);
            let current = match kind {
                StreamKind::Camera => &mut self.camera_stream,
                StreamKind::Screen => &mut self.screen_stream,
            };

            let before = current.as_ref().map(MediaStream::track_ids);
            let after = next.as_ref().map(MediaStream::track_ids);
            if before == after {
                continue;
            }

            match &next {
                Some(stream) => events.push(match kind {
                    StreamKind::Camera => MeshEvent::StreamAdded {
                        peer_id: self.peer_id.clone(),
                        stream: stream.clone(),
                    },
                    StreamKind::Screen => MeshEvent::ScreenStreamAdded {
                        peer_id: self.peer_id.clone(),
                        stream: stream.clone(),
                    },
                }),
                None => events.push(MeshEvent::StreamRemoved {
                    peer_id: self.peer_id.clone(),
                    kind,
                }),
            }
            *current = next;
        }

        events
    }

    /// Close the transport and channel and clear all buckets
    pub async fn close(&mut self) -> Vec<MeshEvent> {
        self.set_state(LinkState::Closed);

        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                debug!(peer_id = %self.peer_id, "Channel close failed: {}", e);
            }
        }
        if let Err(e) = self.transport.close().await {
            warn!(peer_id = %self.peer_id, "Transport close failed: {}", e);
        }

        self.buckets.clear();

        let mut events = Vec::new();
        if self.camera_stream.take().is_some() {
            events.push(MeshEvent::StreamRemoved {
                peer_id: self.peer_id.clone(),
                kind: StreamKind::Camera,
            });
        }
        if self.screen_stream.take().is_some() {
            events.push(MeshEvent::StreamRemoved {
                peer_id: self.peer_id.clone(),
                kind: StreamKind::Screen,
            });
        }
        events
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("peer_id", &self.peer_id)
            .field("connection_id", &self.connection_id)
            .field("state", &self.state)
            .field("channel_open", &self.channel.as_ref().map(|c| c.is_open()))
            .field("tracks", &self.buckets.len())
            .finish()
    }
}
