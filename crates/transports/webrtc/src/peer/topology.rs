//! Proximity-gated mesh of peer links

use super::ice_buffer::IceCandidateBuffer;
use super::link::{LinkState, PeerLink};
use super::proximity::{is_designated_offerer, ProximityPolicy};
use super::transport::{LinkEvent, LinkEventSink, TransportEvent, TransportFactory, TransportState};
use crate::channels::ReliableChannel;
use crate::identity::{LocalIdentity, RemotePeerRecord};
use crate::media::{LocalTrack, MediaStream, TrackClassifier};
use crate::session::MeshEvent;
use crate::signaling::{EnvelopeSink, IceCandidate, SessionDescription, SignalingEnvelope};
use crate::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

/// Snapshot of one known peer
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Last-known avatar state
    pub state: LocalIdentity,

    /// Link state, if a link exists
    pub link: Option<LinkState>,

    /// Time since negotiation completed
    pub connected_for: Option<Duration>,
}

/// Owns remote peer records and the links between them and the local peer
///
/// Every method runs on the session's dispatch task, so no locking is
/// needed. Links are always a subset of records.
pub struct MeshTopology {
    records: HashMap<String, RemotePeerRecord>,
    links: HashMap<String, PeerLink>,
    ice: IceCandidateBuffer,
    classifier: TrackClassifier,
    factory: Arc<dyn TransportFactory>,
    link_events: mpsc::UnboundedSender<LinkEvent>,
    policy: ProximityPolicy,
    local_media: Vec<LocalTrack>,
    screen_tracks: Vec<LocalTrack>,
    next_connection_id: u64,
}

impl MeshTopology {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        link_events: mpsc::UnboundedSender<LinkEvent>,
        policy: ProximityPolicy,
    ) -> Self {
        Self {
            records: HashMap::new(),
            links: HashMap::new(),
            ice: IceCandidateBuffer::new(),
            classifier: TrackClassifier::new(),
            factory,
            link_events,
            policy,
            local_media: Vec::new(),
            screen_tracks: Vec::new(),
            next_connection_id: 0,
        }
    }

    /// Camera and microphone tracks attached to every new link
    pub fn set_local_media(&mut self, tracks: Vec<LocalTrack>) {
        self.local_media = tracks;
    }

    pub fn screen_tracks(&self) -> &[LocalTrack] {
        &self.screen_tracks
    }

    pub fn record(&self, peer_id: &str) -> Option<&RemotePeerRecord> {
        self.records.get(peer_id)
    }

    pub fn link(&self, peer_id: &str) -> Option<&PeerLink> {
        self.links.get(peer_id)
    }

    pub fn link_state(&self, peer_id: &str) -> Option<LinkState> {
        self.links.get(peer_id).map(PeerLink::state)
    }

    /// Ids of peers with a link, sorted
    pub fn linked_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.links.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn pending_candidates(&self, peer_id: &str) -> usize {
        self.ice.pending(peer_id)
    }

    /// All known peers with their link summary, sorted by id
    pub fn peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .records
            .iter()
            .map(|(peer_id, record)| {
                let link = self.links.get(peer_id);
                PeerInfo {
                    state: record.state.clone(),
                    link: link.map(PeerLink::state),
                    connected_for: link.and_then(PeerLink::connected_for),
                }
            })
            .collect();
        peers.sort_by(|a, b| a.state.id.cmp(&b.state.id));
        peers
    }

    pub fn remote_stream(&self, peer_id: &str) -> Option<MediaStream> {
        self.links.get(peer_id)?.camera_stream().cloned()
    }

    pub fn remote_screen_stream(&self, peer_id: &str) -> Option<MediaStream> {
        self.links.get(peer_id)?.screen_stream().cloned()
    }

    /// Create or update the record for `peer_id`
    ///
    /// A `screenSharing` flip from true to false drops the peer's screen
    /// tracks.
    pub fn upsert_record(&mut self, peer_id: &str, mut state: LocalIdentity) -> Vec<MeshEvent> {
        state.id = peer_id.to_string();

        let stopped_sharing = match self.records.get_mut(peer_id) {
            Some(record) => {
                let previous = record.update(state.clone());
                previous.screen_sharing && !state.screen_sharing
            }
            None => {
                debug!(peer_id, "New remote peer");
                self.records
                    .insert(peer_id.to_string(), RemotePeerRecord::new(state.clone()));
                false
            }
        };

        let mut events = vec![MeshEvent::PlayerUpdate(state)];
        if stopped_sharing {
            debug!(peer_id, "Remote peer stopped screen sharing");
            self.classifier.clear_screen(peer_id);
            if let Some(link) = self.links.get_mut(peer_id) {
                events.extend(link.clear_screen());
            }
        }
        events
    }

    /// Forget a peer that left the relay
    pub async fn remove_peer(&mut self, peer_id: &str) -> Vec<MeshEvent> {
        let mut events = self.teardown(peer_id).await;
        self.ice.discard(peer_id);

        if self.records.remove(peer_id).is_some() {
            info!(peer_id, "Remote peer left");
            events.push(MeshEvent::PlayerLeave {
                peer_id: peer_id.to_string(),
            });
        }
        events
    }

    /// Close the link to `peer_id`, keeping its record
    pub async fn teardown(&mut self, peer_id: &str) -> Vec<MeshEvent> {
        let Some(mut link) = self.links.remove(peer_id) else {
            return Vec::new();
        };

        info!(peer_id, connection_id = link.connection_id(), "Tearing down peer link");
        let events = link.close().await;
        self.ice.discard(peer_id);
        self.classifier.forget_peer(peer_id);
        events
    }

    /// Close every link
    pub async fn close_all(&mut self) -> Vec<MeshEvent> {
        let mut events = Vec::new();
        for peer_id in self.linked_peers() {
            events.extend(self.teardown(&peer_id).await);
        }
        events
    }

    /// Apply the proximity policy once
    ///
    /// Links whose negotiation outlived the policy's timeout are torn down
    /// first, so the plan can offer to those peers again. Candidate queues of
    /// peers without a link are dropped.
    pub async fn sweep(&mut self, local: &LocalIdentity, sink: &dyn EnvelopeSink) -> Vec<MeshEvent> {
        let mut events = Vec::new();

        let timeout = self.policy.negotiation_timeout;
        let stalled: Vec<String> = self
            .links
            .iter()
            .filter(|(_, link)| link.negotiating_for().is_some_and(|elapsed| elapsed >= timeout))
            .map(|(peer_id, _)| peer_id.clone())
            .collect();
        for peer_id in stalled {
            warn!(peer_id = %peer_id, ?timeout, "Negotiation timed out");
            events.extend(self.teardown(&peer_id).await);
        }

        let linked: HashSet<String> = self.links.keys().cloned().collect();
        let dropped = self.ice.retain_peers(|peer_id| linked.contains(peer_id));
        if dropped > 0 {
            debug!(dropped, "Dropped ICE candidates queued for unlinked peers");
        }

        let plan = self.policy.plan(local, &self.records, &linked);
        for peer_id in plan.disconnect {
            info!(peer_id = %peer_id, "Peer out of range");
            events.extend(self.teardown(&peer_id).await);
        }

        for peer_id in plan.connect {
            if let Err(e) = self.connect(&peer_id, local, sink).await {
                warn!(peer_id = %peer_id, "Failed to connect: {}", e);
            }
        }
        events
    }

    /// Open a link as offerer and send the offer
    #[instrument(skip(self, peer_id, local, sink), fields(peer_id = %peer_id))]
    pub async fn connect(
        &mut self,
        peer_id: &str,
        local: &LocalIdentity,
        sink: &dyn EnvelopeSink,
    ) -> Result<()> {
        if self.links.contains_key(peer_id) {
            return Ok(());
        }

        let mut link = self.new_link(peer_id, LinkState::NegotiatingOffer).await?;

        let offer = match self.prepare_offer(&mut link).await {
            Ok(offer) => offer,
            Err(e) => {
                link.close().await;
                return Err(e);
            }
        };

        info!("Sending offer");
        sink.send_envelope(SignalingEnvelope::Offer {
            peer_id: local.id.clone(),
            target_peer: peer_id.to_string(),
            offer,
        });
        self.links.insert(peer_id.to_string(), link);
        Ok(())
    }

    async fn prepare_offer(&self, link: &mut PeerLink) -> Result<SessionDescription> {
        link.attach_tracks(&self.local_media).await?;
        link.attach_tracks(&self.screen_tracks).await?;
        link.open_channel().await?;
        link.create_offer().await
    }

    async fn new_link(&mut self, peer_id: &str, state: LinkState) -> Result<PeerLink> {
        self.next_connection_id += 1;
        let connection_id = self.next_connection_id;
        let events = LinkEventSink::new(peer_id, connection_id, self.link_events.clone());
        let transport = self.factory.create(events).await?;
        Ok(PeerLink::new(peer_id, connection_id, transport, state))
    }

    /// Handle an offer from `from`
    ///
    /// Without a link this accepts a new connection. On a connected link it is
    /// a renegotiation. Offers that collide with a local offer are resolved by
    /// the glare rule.
    pub async fn handle_offer(
        &mut self,
        from: &str,
        offer: SessionDescription,
        local: &LocalIdentity,
        sink: &dyn EnvelopeSink,
    ) -> Vec<MeshEvent> {
        if !self.records.contains_key(from) {
            self.records
                .insert(from.to_string(), RemotePeerRecord::placeholder(from));
        }

        match self.link_state(from) {
            None => self.accept_inbound(from, offer, local, sink).await,

            Some(LinkState::Connected) => {
                self.answer_renegotiation(from, offer, local, sink).await;
                Vec::new()
            }

            Some(LinkState::NegotiatingOffer) => {
                if is_designated_offerer(&local.id, from) {
                    debug!(peer_id = from, "Glare: keeping local offer, dropping remote offer");
                    self.ice.discard(from);
                    if let Some(link) = self.links.get_mut(from) {
                        link.set_superseded_remote_offer(true);
                    }
                    return Vec::new();
                }
                info!(peer_id = from, "Glare: yielding to remote offer");
                let mut events = self.teardown(from).await;
                events.extend(self.accept_inbound(from, offer, local, sink).await);
                events
            }

            Some(LinkState::Renegotiating) => {
                if is_designated_offerer(&local.id, from) {
                    debug!(peer_id = from, "Renegotiation collision: keeping local offer");
                    return Vec::new();
                }
                self.yield_renegotiation(from, offer, local, sink).await;
                Vec::new()
            }

            Some(state) => {
                debug!(peer_id = from, ?state, "Dropping offer");
                Vec::new()
            }
        }
    }

    #[instrument(skip(self, from, offer, local, sink), fields(peer_id = %from))]
    async fn accept_inbound(
        &mut self,
        from: &str,
        offer: SessionDescription,
        local: &LocalIdentity,
        sink: &dyn EnvelopeSink,
    ) -> Vec<MeshEvent> {
        if self.links.len() >= self.policy.max_peers {
            warn!(max_peers = self.policy.max_peers, "Refusing offer, peer limit reached");
            self.ice.discard(from);
            return Vec::new();
        }

        let mut link = match self.new_link(from, LinkState::NegotiatingAnswer).await {
            Ok(link) => link,
            Err(e) => {
                warn!("Failed to create link for inbound offer: {}", e);
                return Vec::new();
            }
        };

        let attached = match link.attach_tracks(&self.local_media).await {
            Ok(()) => link.attach_tracks(&self.screen_tracks).await,
            Err(e) => Err(e),
        };
        let answer = match attached {
            Ok(()) => answer_offer(&mut self.ice, &mut link, offer).await,
            Err(e) => Err(e),
        };

        match answer {
            Ok(answer) => {
                info!("Sending answer");
                sink.send_envelope(SignalingEnvelope::Answer {
                    peer_id: local.id.clone(),
                    target_peer: from.to_string(),
                    answer,
                });
                link.set_state(LinkState::Connected);
                self.links.insert(from.to_string(), link);
            }
            Err(e) => {
                warn!("Failed to answer offer: {}", e);
                link.close().await;
            }
        }
        Vec::new()
    }

    async fn answer_renegotiation(
        &mut self,
        from: &str,
        offer: SessionDescription,
        local: &LocalIdentity,
        sink: &dyn EnvelopeSink,
    ) {
        let Some(link) = self.links.get_mut(from) else {
            return;
        };

        match answer_offer(&mut self.ice, link, offer).await {
            Ok(answer) => {
                debug!(peer_id = from, "Answering renegotiation");
                sink.send_envelope(SignalingEnvelope::Answer {
                    peer_id: local.id.clone(),
                    target_peer: from.to_string(),
                    answer,
                });
            }
            Err(e) => warn!(peer_id = from, "Renegotiation failed: {}", e),
        }
    }

    /// Roll back our renegotiation offer, answer theirs, then offer again
    async fn yield_renegotiation(
        &mut self,
        from: &str,
        offer: SessionDescription,
        local: &LocalIdentity,
        sink: &dyn EnvelopeSink,
    ) {
        let Some(link) = self.links.get_mut(from) else {
            return;
        };

        info!(peer_id = from, "Renegotiation collision: rolling back local offer");
        if let Err(e) = link.rollback().await {
            warn!(peer_id = from, "Rollback failed: {}", e);
            return;
        }
        link.set_pending_renegotiation(true);

        self.answer_renegotiation(from, offer, local, sink).await;
        self.resume_pending_renegotiation(from, local, sink).await;
    }

    /// Handle an answer to a local offer
    pub async fn handle_answer(
        &mut self,
        from: &str,
        answer: SessionDescription,
        local: &LocalIdentity,
        sink: &dyn EnvelopeSink,
    ) {
        let Some(link) = self.links.get_mut(from) else {
            debug!(peer_id = from, "Dropping answer without a link");
            return;
        };

        match link.apply_answer(answer).await {
            Ok(()) => {
                link.set_superseded_remote_offer(false);
                self.ice.drain_if_ready(from, link).await;
                info!(peer_id = from, "Link connected");
            }
            Err(e) if e.is_negotiation_error() => {
                debug!(peer_id = from, "Dropping answer: {}", e);
                return;
            }
            Err(e) => {
                warn!(peer_id = from, "Failed to apply answer: {}", e);
                return;
            }
        }

        self.resume_pending_renegotiation(from, local, sink).await;
    }

    async fn resume_pending_renegotiation(
        &mut self,
        peer_id: &str,
        local: &LocalIdentity,
        sink: &dyn EnvelopeSink,
    ) {
        let pending = match self.links.get_mut(peer_id) {
            Some(link) if link.pending_renegotiation() && link.state() == LinkState::Connected => {
                link.set_pending_renegotiation(false);
                true
            }
            _ => false,
        };
        if pending {
            self.renegotiate(peer_id, local, sink).await;
        }
    }

    /// Queue a remote candidate and apply it if the link is ready
    ///
    /// Candidates that follow an offer dropped by the glare rule belong to
    /// the remote's abandoned connection and are discarded.
    pub async fn handle_ice(&mut self, from: &str, candidate: IceCandidate) {
        match self.links.get(from) {
            Some(link) if link.superseded_remote_offer() => {
                trace!(peer_id = from, "Dropping ICE candidate from superseded offer");
            }
            Some(link) => {
                self.ice.add(from, candidate);
                self.ice.drain_if_ready(from, link).await;
            }
            None => {
                trace!(peer_id = from, "Buffering ICE candidate before link exists");
                self.ice.add(from, candidate);
            }
        }
    }

    /// Send a fresh offer on an established link
    ///
    /// Deferred until the link is connected if negotiation is in flight.
    pub async fn renegotiate(&mut self, peer_id: &str, local: &LocalIdentity, sink: &dyn EnvelopeSink) {
        let Some(link) = self.links.get_mut(peer_id) else {
            return;
        };

        if link.state() != LinkState::Connected {
            debug!(peer_id, state = ?link.state(), "Deferring renegotiation");
            link.set_pending_renegotiation(true);
            return;
        }

        link.set_state(LinkState::Renegotiating);
        match link.create_offer().await {
            Ok(offer) => {
                info!(peer_id, "Sending renegotiation offer");
                sink.send_envelope(SignalingEnvelope::Offer {
                    peer_id: local.id.clone(),
                    target_peer: peer_id.to_string(),
                    offer,
                });
            }
            Err(e) => {
                warn!(peer_id, "Failed to create renegotiation offer: {}", e);
                link.set_state(LinkState::Connected);
            }
        }
    }

    /// Handle a callback event from a link's transport
    pub async fn handle_link_event(
        &mut self,
        event: LinkEvent,
        local: &LocalIdentity,
        sink: &dyn EnvelopeSink,
    ) -> Vec<MeshEvent> {
        let LinkEvent {
            peer_id,
            connection_id,
            event,
        } = event;

        let Some(link) = self
            .links
            .get_mut(&peer_id)
            .filter(|link| link.connection_id() == connection_id)
        else {
            trace!(peer_id = %peer_id, connection_id, "Dropping stale link event");
            return Vec::new();
        };

        match event {
            TransportEvent::IceCandidate(candidate) => {
                sink.send_envelope(SignalingEnvelope::Ice {
                    peer_id: local.id.clone(),
                    target_peer: peer_id,
                    candidate,
                });
                Vec::new()
            }

            TransportEvent::Track(track) => {
                let classification = self.classifier.classify(&peer_id, &track);
                if classification.is_duplicate {
                    debug!(peer_id = %peer_id, track_id = %track.id, "Ignoring duplicate track");
                    return Vec::new();
                }
                link.add_track(classification.bucket, track)
            }

            TransportEvent::ChannelOpened(channel) => {
                debug!(peer_id = %peer_id, "Reliable channel open");
                link.set_channel(Some(Arc::clone(&channel)));
                if !self.screen_tracks.is_empty() {
                    announce_screen_tracks(channel.as_ref(), &local.id, &self.screen_tracks).await;
                }
                Vec::new()
            }

            TransportEvent::ChannelMessage(text) => self.handle_channel_message(&peer_id, &text),

            TransportEvent::ChannelClosed => {
                link.set_channel(None);
                if matches!(link.state(), LinkState::Connected | LinkState::Renegotiating) {
                    info!(peer_id = %peer_id, "Reliable channel closed on live link");
                    return self.teardown(&peer_id).await;
                }
                debug!(peer_id = %peer_id, "Reliable channel closed");
                Vec::new()
            }

            TransportEvent::StateChanged(state) if state.is_terminal() => {
                warn!(peer_id = %peer_id, ?state, "Transport failed");
                self.teardown(&peer_id).await
            }

            TransportEvent::StateChanged(TransportState::Disconnected) => {
                warn!(peer_id = %peer_id, "Transport disconnected, waiting for recovery");
                Vec::new()
            }

            TransportEvent::StateChanged(state) => {
                debug!(peer_id = %peer_id, ?state, "Transport state");
                Vec::new()
            }
        }
    }

    /// Handle a frame received on a peer's reliable channel
    pub fn handle_channel_message(&mut self, peer_id: &str, text: &str) -> Vec<MeshEvent> {
        match SignalingEnvelope::from_json(text) {
            Ok(SignalingEnvelope::PlayerState { data, .. }) => self.upsert_record(peer_id, data),
            Ok(SignalingEnvelope::ScreenTrackMetadata { track_ids, .. }) => {
                self.apply_screen_metadata(peer_id, &track_ids)
            }
            Ok(other) => {
                debug!(peer_id, kind = other.kind(), "Ignoring envelope on reliable channel");
                Vec::new()
            }
            Err(e) => {
                warn!(peer_id, "Dropping malformed channel frame: {}", e);
                Vec::new()
            }
        }
    }

    /// Record announced screen track ids, moving already bucketed ones
    pub fn apply_screen_metadata(&mut self, peer_id: &str, track_ids: &[String]) -> Vec<MeshEvent> {
        let moved = self.classifier.announce(peer_id, track_ids);
        if moved.is_empty() {
            return Vec::new();
        }
        self.links
            .get_mut(peer_id)
            .map(|link| link.promote_to_screen(&moved))
            .unwrap_or_default()
    }

    /// Publish screen tracks on every link and renegotiate
    pub async fn start_screen_sharing(
        &mut self,
        tracks: Vec<LocalTrack>,
        local: &LocalIdentity,
        sink: &dyn EnvelopeSink,
    ) {
        self.screen_tracks = tracks;

        for peer_id in self.linked_peers() {
            let Some(link) = self.links.get(&peer_id) else {
                continue;
            };

            if let Err(e) = link.attach_tracks(&self.screen_tracks).await {
                warn!(peer_id = %peer_id, "Failed to attach screen tracks: {}", e);
                continue;
            }
            if let Some(channel) = link.channel().filter(|c| c.is_open()) {
                announce_screen_tracks(channel.as_ref(), &local.id, &self.screen_tracks).await;
            }
            self.renegotiate(&peer_id, local, sink).await;
        }
    }

    /// Withdraw screen tracks from every link and renegotiate
    pub async fn stop_screen_sharing(&mut self, local: &LocalIdentity, sink: &dyn EnvelopeSink) {
        let tracks = std::mem::take(&mut self.screen_tracks);
        if tracks.is_empty() {
            return;
        }

        for peer_id in self.linked_peers() {
            if let Some(link) = self.links.get(&peer_id) {
                link.detach_tracks(&tracks).await;
            }
            self.renegotiate(&peer_id, local, sink).await;
        }
    }

    /// Send a frame on every open reliable channel; returns how many succeeded
    pub async fn broadcast_to_channels(&self, text: &str) -> usize {
        let sends = self
            .links
            .values()
            .filter_map(|link| link.channel().map(|c| (link.peer_id(), c)))
            .filter(|(_, channel)| channel.is_open())
            .map(|(peer_id, channel)| async move { (peer_id, channel.send_text(text).await) });

        let mut delivered = 0;
        for (peer_id, result) in futures::future::join_all(sends).await {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => debug!(peer_id, "Channel send failed: {}", e),
            }
        }
        delivered
    }
}

/// Apply a remote offer, drain early candidates and produce the answer
async fn answer_offer(
    ice: &mut IceCandidateBuffer,
    link: &mut PeerLink,
    offer: SessionDescription,
) -> Result<SessionDescription> {
    link.apply_remote_description(offer).await?;
    let peer_id = link.peer_id().to_string();
    ice.drain_if_ready(&peer_id, link).await;
    link.create_answer().await
}

async fn announce_screen_tracks(channel: &dyn ReliableChannel, local_id: &str, tracks: &[LocalTrack]) {
    let envelope = SignalingEnvelope::ScreenTrackMetadata {
        peer_id: Some(local_id.to_string()),
        track_ids: tracks.iter().map(|t| t.id.clone()).collect(),
    };

    let result = match envelope.to_json() {
        Ok(text) => channel.send_text(&text).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        warn!("Failed to announce screen tracks: {}", e);
    }
}
