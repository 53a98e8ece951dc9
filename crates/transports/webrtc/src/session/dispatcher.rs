//! The session's single dispatch loop
//!
//! Relay envelopes, link events, facade commands and both timers are
//! processed one at a time on one task, which owns all mesh state.

use super::events::MeshEvent;
use crate::identity::{Billboard, LocalIdentity};
use crate::media::{LocalTrack, MediaStream};
use crate::peer::{LinkEvent, MeshTopology, PeerInfo};
use crate::presence::PresenceBroadcaster;
use crate::signaling::{EnvelopeSink, LinkStatus, SignalingEnvelope};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

/// Request from the facade to the dispatch loop
pub(crate) enum Command {
    BroadcastState {
        reply: oneshot::Sender<usize>,
    },
    GetPeers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    GetRemoteStream {
        peer_id: String,
        screen: bool,
        reply: oneshot::Sender<Option<MediaStream>>,
    },
    StartScreenSharing {
        tracks: Vec<LocalTrack>,
        billboard: Option<Billboard>,
        reply: oneshot::Sender<()>,
    },
    StopScreenSharing {
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Receivers drained by the loop
pub(crate) struct DispatchInputs {
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub envelopes: mpsc::UnboundedReceiver<SignalingEnvelope>,
    pub link_events: mpsc::UnboundedReceiver<LinkEvent>,
    pub statuses: mpsc::UnboundedReceiver<LinkStatus>,
}

pub(crate) struct Dispatcher {
    identity: Arc<RwLock<LocalIdentity>>,
    topology: MeshTopology,
    presence: PresenceBroadcaster,
    relay: Arc<dyn EnvelopeSink>,
    events: broadcast::Sender<MeshEvent>,
    presence_interval: Duration,
    sweep_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        identity: Arc<RwLock<LocalIdentity>>,
        topology: MeshTopology,
        presence: PresenceBroadcaster,
        relay: Arc<dyn EnvelopeSink>,
        events: broadcast::Sender<MeshEvent>,
        presence_interval: Duration,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            identity,
            topology,
            presence,
            relay,
            events,
            presence_interval,
            sweep_interval,
        }
    }

    pub async fn run(mut self, mut inputs: DispatchInputs) {
        let mut presence_tick = tokio::time::interval(self.presence_interval);
        presence_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep_tick = tokio::time::interval(self.sweep_interval);
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Session dispatch loop running");

        loop {
            tokio::select! {
                command = inputs.commands.recv() => {
                    match command {
                        Some(Command::Stop { reply }) => {
                            self.shutdown().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            debug!("Session handle dropped");
                            self.shutdown().await;
                            break;
                        }
                    }
                }
                Some(envelope) = inputs.envelopes.recv() => self.handle_envelope(envelope).await,
                Some(event) = inputs.link_events.recv() => self.handle_link_event(event).await,
                Some(status) = inputs.statuses.recv() => self.handle_status(status).await,
                _ = presence_tick.tick() => self.broadcast_if_changed().await,
                _ = sweep_tick.tick() => self.sweep().await,
            }
        }

        info!("Session dispatch loop stopped");
    }

    fn local(&self) -> LocalIdentity {
        self.identity.read().clone()
    }

    fn emit(&self, events: Vec<MeshEvent>) {
        for event in events {
            trace!(event = event.name(), peer_id = ?event.peer_id(), "Publishing event");
            // No subscribers is not an error
            let _ = self.events.send(event);
        }
    }

    pub async fn handle_command(&mut self, command: Command) {
        match command {
            Command::BroadcastState { reply } => {
                let local = self.local();
                self.presence.mark_sent(&local);
                let delivered = self.publish(local).await;
                let _ = reply.send(delivered);
            }

            Command::GetPeers { reply } => {
                let _ = reply.send(self.topology.peers());
            }

            Command::GetRemoteStream {
                peer_id,
                screen,
                reply,
            } => {
                let stream = if screen {
                    self.topology.remote_screen_stream(&peer_id)
                } else {
                    self.topology.remote_stream(&peer_id)
                };
                let _ = reply.send(stream);
            }

            Command::StartScreenSharing {
                tracks,
                billboard,
                reply,
            } => {
                self.start_screen_sharing(tracks, billboard).await;
                let _ = reply.send(());
            }

            Command::StopScreenSharing { reply } => {
                self.stop_screen_sharing().await;
                let _ = reply.send(());
            }

            Command::Stop { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    pub async fn handle_envelope(&mut self, envelope: SignalingEnvelope) {
        let local = self.local();
        let relay = Arc::clone(&self.relay);

        let events = match envelope {
            SignalingEnvelope::Join { peer_id, data } => {
                info!(peer_id = %peer_id, "Peer joined the relay");
                let events = self.topology.upsert_record(&peer_id, data);
                // Newcomers learn our state even if we are standing still
                relay.send_envelope(SignalingEnvelope::PlayerState {
                    peer_id: local.id.clone(),
                    data: local,
                });
                events
            }

            SignalingEnvelope::Leave { peer_id } => self.topology.remove_peer(&peer_id).await,

            SignalingEnvelope::PlayerState { peer_id, data } => {
                self.topology.upsert_record(&peer_id, data)
            }

            SignalingEnvelope::Offer { peer_id, offer, .. } => {
                self.topology
                    .handle_offer(&peer_id, offer, &local, relay.as_ref())
                    .await
            }

            SignalingEnvelope::Answer {
                peer_id, answer, ..
            } => {
                self.topology
                    .handle_answer(&peer_id, answer, &local, relay.as_ref())
                    .await;
                Vec::new()
            }

            SignalingEnvelope::Ice {
                peer_id, candidate, ..
            } => {
                self.topology.handle_ice(&peer_id, candidate).await;
                Vec::new()
            }

            SignalingEnvelope::ScreenTrackMetadata { peer_id, track_ids } => match peer_id {
                Some(peer_id) => self.topology.apply_screen_metadata(&peer_id, &track_ids),
                None => {
                    debug!("Dropping relayed screen metadata without sender");
                    Vec::new()
                }
            },
        };

        self.emit(events);
    }

    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        let local = self.local();
        let relay = Arc::clone(&self.relay);
        let events = self
            .topology
            .handle_link_event(event, &local, relay.as_ref())
            .await;
        self.emit(events);
    }

    async fn handle_status(&mut self, status: LinkStatus) {
        match status {
            LinkStatus::Reconnected => {
                info!("Relay restored, republishing local state");
                let local = self.local();
                self.relay.send_envelope(SignalingEnvelope::PlayerState {
                    peer_id: local.id.clone(),
                    data: local,
                });
            }
            LinkStatus::Failed { attempts } => {
                error!(attempts, "Signaling relay lost");
                self.emit(vec![MeshEvent::SignalingLost { attempts }]);
            }
            other => debug!(status = ?other, "Relay status"),
        }
    }

    /// Publish the local state if it moved beyond the dead-band
    pub async fn broadcast_if_changed(&mut self) {
        let local = self.local();
        if let Some(state) = self.presence.poll(&local) {
            self.publish(state).await;
        }
    }

    /// Send `player_state` over the relay and every open reliable channel
    async fn publish(&self, state: LocalIdentity) -> usize {
        let envelope = SignalingEnvelope::PlayerState {
            peer_id: state.id.clone(),
            data: state,
        };

        let text = match envelope.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode player state: {}", e);
                return 0;
            }
        };

        self.relay.send_envelope(envelope);
        self.topology.broadcast_to_channels(&text).await
    }

    pub async fn sweep(&mut self) {
        let local = self.local();
        let relay = Arc::clone(&self.relay);
        let events = self.topology.sweep(&local, relay.as_ref()).await;
        self.emit(events);
    }

    async fn start_screen_sharing(&mut self, tracks: Vec<LocalTrack>, billboard: Option<Billboard>) {
        let relay = Arc::clone(&self.relay);
        if !self.topology.screen_tracks().is_empty() {
            let local = self.local();
            self.topology.stop_screen_sharing(&local, relay.as_ref()).await;
        }

        {
            let mut identity = self.identity.write();
            identity.screen_sharing = true;
            identity.billboard = billboard;
        }

        let local = self.local();
        info!(tracks = tracks.len(), "Starting screen share");
        self.topology
            .start_screen_sharing(tracks, &local, relay.as_ref())
            .await;
        self.broadcast_if_changed().await;
    }

    async fn stop_screen_sharing(&mut self) {
        {
            let mut identity = self.identity.write();
            identity.screen_sharing = false;
            identity.billboard = None;
        }

        let local = self.local();
        let relay = Arc::clone(&self.relay);
        info!("Stopping screen share");
        self.topology.stop_screen_sharing(&local, relay.as_ref()).await;
        self.broadcast_if_changed().await;
    }

    async fn shutdown(&mut self) {
        let events = self.topology.close_all().await;
        self.emit(events);
    }

    #[cfg(test)]
    pub fn topology(&self) -> &MeshTopology {
        &self.topology
    }
}
