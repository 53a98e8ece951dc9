//! In-memory transport and relay doubles
//!
//! Compiled for unit tests and behind the `test-util` feature so integration
//! tests can drive negotiation without a network.

use crate::channels::ReliableChannel;
use crate::media::{LocalTrack, MediaTrack};
use crate::peer::{LinkEventSink, PeerTransport, TransportEvent, TransportFactory, TransportState};
use crate::signaling::{EnvelopeSink, IceCandidate, SdpType, SessionDescription, SignalingEnvelope};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Relay double that records every envelope
#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<SignalingEnvelope>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SignalingEnvelope> {
        self.sent.lock().clone()
    }

    /// Drain what was recorded so far
    pub fn take(&self) -> Vec<SignalingEnvelope> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(SignalingEnvelope::kind).collect()
    }

    /// Envelopes addressed to `peer_id`
    pub fn sent_to(&self, peer_id: &str) -> Vec<SignalingEnvelope> {
        self.sent
            .lock()
            .iter()
            .filter(|e| e.target() == Some(peer_id))
            .cloned()
            .collect()
    }
}

impl EnvelopeSink for RecordingSink {
    fn send_envelope(&self, envelope: SignalingEnvelope) {
        self.sent.lock().push(envelope);
    }
}

/// One call made on a [`MockTransport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    CreateOffer,
    CreateAnswer,
    SetRemote(SdpType),
    Rollback,
    AddIce(String),
    AddTrack(String),
    RemoveTrack(String),
    CreateChannel(String),
    Close,
}

/// Transport double
///
/// SDP bodies are synthetic. Candidates whose text contains `malformed` are
/// rejected. Created channels open immediately.
pub struct MockTransport {
    events: LinkEventSink,
    calls: Mutex<Vec<TransportCall>>,
    tracks: Mutex<Vec<String>>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    sdp_version: AtomicU64,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn new(events: LinkEventSink) -> Self {
        Self {
            events,
            calls: Mutex::new(Vec::new()),
            tracks: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            sdp_version: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn peer_id(&self) -> &str {
        self.events.peer_id()
    }

    pub fn connection_id(&self) -> u64 {
        self.events.connection_id()
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &TransportCall) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    /// Candidates accepted by `add_ice_candidate`, in order
    pub fn applied_candidates(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                TransportCall::AddIce(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    /// Ids of local tracks currently attached
    pub fn local_tracks(&self) -> Vec<String> {
        self.tracks.lock().clone()
    }

    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.channels.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Raise a transport event as the WebRTC stack would
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events.emit(event)
    }

    pub fn emit_ice_candidate(&self, candidate: &str) -> bool {
        self.emit(TransportEvent::IceCandidate(IceCandidate::new(candidate)))
    }

    pub fn emit_track(&self, track: MediaTrack) -> bool {
        self.emit(TransportEvent::Track(track))
    }

    pub fn emit_state(&self, state: TransportState) -> bool {
        self.emit(TransportEvent::StateChanged(state))
    }

    /// Deliver a text frame as if received on the reliable channel
    pub fn emit_channel_message(&self, text: impl Into<String>) -> bool {
        self.emit(TransportEvent::ChannelMessage(text.into()))
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().push(call);
    }

    fn next_sdp(&self, kind: &str) -> String {
        let version = self.sdp_version.fetch_add(1, Ordering::SeqCst) + 1;
        format!(
            "v=0\r\no=mock {} {} IN IP4 127.0.0.1\r\ns={}\r\n",
            self.connection_id(),
            version,
            kind
        )
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::WebRtcError("transport closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        self.record(TransportCall::CreateOffer);
        Ok(SessionDescription::offer(self.next_sdp("offer")))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        self.record(TransportCall::CreateAnswer);
        Ok(SessionDescription::answer(self.next_sdp("answer")))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        self.record(TransportCall::SetRemote(description.kind));
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.ensure_open()?;
        self.record(TransportCall::Rollback);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if candidate.candidate.contains("malformed") {
            return Err(Error::IceCandidateError(format!(
                "rejected candidate '{}'",
                candidate.candidate
            )));
        }
        self.record(TransportCall::AddIce(candidate.candidate));
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        self.ensure_open()?;
        let mut tracks = self.tracks.lock();
        if tracks.contains(&track.id) {
            return Err(Error::MediaTrackError(format!(
                "track {} already attached",
                track.id
            )));
        }
        tracks.push(track.id.clone());
        drop(tracks);
        self.record(TransportCall::AddTrack(track.id.clone()));
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<()> {
        let mut tracks = self.tracks.lock();
        let before = tracks.len();
        tracks.retain(|id| id != track_id);
        if tracks.len() == before {
            return Err(Error::MediaTrackError(format!("track {} not attached", track_id)));
        }
        drop(tracks);
        self.record(TransportCall::RemoveTrack(track_id.to_string()));
        Ok(())
    }

    async fn create_channel(&self, label: &str) -> Result<Arc<dyn ReliableChannel>> {
        self.ensure_open()?;
        self.record(TransportCall::CreateChannel(label.to_string()));

        let channel = Arc::new(MockChannel::new(label));
        self.channels.lock().push(Arc::clone(&channel));
        self.events
            .emit(TransportEvent::ChannelOpened(channel.clone() as Arc<dyn ReliableChannel>));
        Ok(channel)
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.record(TransportCall::Close);
        }
        Ok(())
    }
}

/// Reliable channel double that records sent frames
#[derive(Debug)]
pub struct MockChannel {
    label: String,
    open: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl MockChannel {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Parsed envelopes sent on this channel
    pub fn sent_envelopes(&self) -> Vec<SignalingEnvelope> {
        self.sent
            .lock()
            .iter()
            .filter_map(|text| SignalingEnvelope::from_json(text).ok())
            .collect()
    }
}

#[async_trait]
impl ReliableChannel for MockChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        if !self.is_open() {
            return Err(Error::DataChannelError(format!(
                "channel '{}' is not open",
                self.label
            )));
        }
        self.sent.lock().push(text.to_string());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory double keeping every transport it built, per peer
#[derive(Default)]
pub struct MockTransportFactory {
    created: Mutex<HashMap<String, Vec<Arc<MockTransport>>>>,
    fail: AtomicBool,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `create` calls fail
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Most recent transport built for `peer_id`
    pub fn latest(&self, peer_id: &str) -> Option<Arc<MockTransport>> {
        self.created.lock().get(peer_id)?.last().cloned()
    }

    pub fn transports_for(&self, peer_id: &str) -> Vec<Arc<MockTransport>> {
        self.created.lock().get(peer_id).cloned().unwrap_or_default()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().values().map(Vec::len).sum()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(&self, events: LinkEventSink) -> Result<Arc<dyn PeerTransport>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::WebRtcError("mock factory set to fail".to_string()));
        }

        let peer_id = events.peer_id().to_string();
        let transport = Arc::new(MockTransport::new(events));
        self.created
            .lock()
            .entry(peer_id)
            .or_default()
            .push(Arc::clone(&transport));
        Ok(transport)
    }
}
