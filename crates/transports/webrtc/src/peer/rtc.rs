//! `webrtc`-backed peer transport

use super::transport::{
    LinkEventSink, PeerTransport, TransportEvent, TransportFactory, TransportState,
};
use crate::channels::{ReliableChannel, RtcReliableChannel};
use crate::config::{DataChannelMode, MeshConfig};
use crate::media::{LocalTrack, MediaTrack};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Builds [`RtcTransport`]s with STUN/TURN servers from configuration
#[derive(Debug, Clone)]
pub struct RtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
    channel_mode: DataChannelMode,
}

impl RtcTransportFactory {
    pub fn new(config: &MeshConfig) -> Self {
        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
            }))
            .collect();

        Self {
            ice_servers,
            channel_mode: config.data_channel_mode,
        }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    #[instrument(skip(self, events), fields(peer_id = %events.peer_id(), connection_id = events.connection_id()))]
    async fn create(&self, events: LinkEventSink) -> Result<Arc<dyn PeerTransport>> {
        info!("Creating peer connection");

        // Opus for audio, VP8/VP9/H.264 for video
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry = register_default_interceptors(Default::default(), &mut media_engine)
            .map_err(|e| Error::WebRtcError(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?);

        let transport = RtcTransport {
            peer_connection,
            senders: Mutex::new(HashMap::new()),
            channel_mode: self.channel_mode,
            inbound_channels: Arc::new(Mutex::new(Vec::new())),
            events,
        };
        transport.install_handlers();

        Ok(Arc::new(transport))
    }
}

/// One `RTCPeerConnection`
pub struct RtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    /// RTP senders by local track id, retained for removal
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
    channel_mode: DataChannelMode,
    /// Channels announced by the remote side, owned here until the link
    /// takes them on open
    inbound_channels: Arc<Mutex<Vec<Arc<RtcReliableChannel>>>>,
    events: LinkEventSink,
}

impl RtcTransport {
    fn install_handlers(&self) {
        let sink = self.events.clone();
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let sink = sink.clone();
                Box::pin(async move {
                    // None marks the end of gathering
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            sink.emit(TransportEvent::IceCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            }));
                        }
                        Err(e) => warn!(peer_id = %sink.peer_id(), "Failed to encode ICE candidate: {}", e),
                    }
                })
            }));

        let sink = self.events.clone();
        self.peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let sink = sink.clone();
                Box::pin(async move {
                    match MediaTrack::from_remote(track) {
                        Some(track) => {
                            sink.emit(TransportEvent::Track(track));
                        }
                        None => debug!(peer_id = %sink.peer_id(), "Ignoring track of unspecified kind"),
                    }
                })
            },
        ));

        let sink = self.events.clone();
        let mode = self.channel_mode;
        let inbound = Arc::clone(&self.inbound_channels);
        self.peer_connection
            .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let sink = sink.clone();
                let inbound = Arc::clone(&inbound);
                Box::pin(async move {
                    debug!(peer_id = %sink.peer_id(), "Remote data channel '{}'", channel.label());
                    inbound.lock().push(RtcReliableChannel::attach(channel, mode, sink));
                })
            }));

        let sink = self.events.clone();
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let sink = sink.clone();
                Box::pin(async move {
                    let state = match s {
                        RTCPeerConnectionState::New => TransportState::New,
                        RTCPeerConnectionState::Connecting => TransportState::Connecting,
                        RTCPeerConnectionState::Connected => TransportState::Connected,
                        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
                        RTCPeerConnectionState::Failed => TransportState::Failed,
                        RTCPeerConnectionState::Closed => TransportState::Closed,
                        _ => return,
                    };
                    sink.emit(TransportEvent::StateChanged(state));
                })
            }));
    }

    async fn local_description(&self, kind: &str) -> Result<String> {
        self.peer_connection
            .local_description()
            .await
            .map(|desc| desc.sdp)
            .ok_or_else(|| {
                Error::SdpError(format!("No local description after setting {}", kind))
            })
    }
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        Ok(SessionDescription::offer(self.local_description("offer").await?))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))?;

        Ok(SessionDescription::answer(self.local_description("answer").await?))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let parsed = match description.kind {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| Error::SdpError(format!("Failed to parse remote description: {}", e)))?;

        self.peer_connection
            .set_remote_description(parsed)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn rollback(&self) -> Result<()> {
        let rollback: RTCSessionDescription =
            serde_json::from_value(serde_json::json!({ "type": "rollback", "sdp": "" }))?;

        self.peer_connection
            .set_local_description(rollback)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to roll back local offer: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let sender = self
            .peer_connection
            .add_track(Arc::clone(track.sample_track()) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to add track {}: {}", track.id, e)))?;

        // Drain RTCP so the interceptors keep running
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        self.senders.lock().insert(track.id.clone(), sender);
        debug!(peer_id = %self.events.peer_id(), track_id = %track.id, "Local track added");
        Ok(())
    }

    async fn remove_track(&self, track_id: &str) -> Result<()> {
        let sender = self
            .senders
            .lock()
            .remove(track_id)
            .ok_or_else(|| Error::MediaTrackError(format!("Track {} is not attached", track_id)))?;

        self.peer_connection
            .remove_track(&sender)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to remove track {}: {}", track_id, e)))
    }

    async fn create_channel(&self, label: &str) -> Result<Arc<dyn ReliableChannel>> {
        let channel = RtcReliableChannel::create(
            &self.peer_connection,
            label,
            self.channel_mode,
            self.events.clone(),
        )
        .await?;
        Ok(channel as Arc<dyn ReliableChannel>)
    }

    async fn close(&self) -> Result<()> {
        info!(peer_id = %self.events.peer_id(), "Closing peer connection");
        self.senders.lock().clear();
        self.inbound_channels.lock().clear();
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to close connection: {}", e)))
    }
}
