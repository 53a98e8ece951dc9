//! Peer mesh session facade

use super::dispatcher::{Command, DispatchInputs, Dispatcher};
use super::events::MeshEvent;
use crate::config::MeshConfig;
use crate::identity::{Billboard, LocalIdentity, LocalPlayerPatch};
use crate::media::{LocalTrack, MediaSource, MediaStream, StaticSampleCapture};
use crate::peer::{MeshTopology, PeerInfo, ProximityPolicy, RtcTransportFactory, TransportFactory};
use crate::presence::PresenceBroadcaster;
use crate::signaling::{EnvelopeSink, SignalingLink};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Capacity of the subscriber event channel
const EVENT_CAPACITY: usize = 256;

/// Public entry point of the mesh
///
/// Owns the local identity, the relay link and the dispatch task that drives
/// every peer link. Subscribers receive [`MeshEvent`]s.
///
/// ```no_run
/// use peermesh_webrtc::{MeshConfig, PeerMeshSession, LocalPlayerPatch, Vec3};
///
/// # tokio_test::block_on(async {
/// let session = PeerMeshSession::new(MeshConfig::default())?;
/// let mut events = session.subscribe();
/// session.init().await?;
///
/// session.update_local_player(LocalPlayerPatch::position(Vec3::new(1.0, 0.0, 2.0)));
/// while let Ok(event) = events.recv().await {
///     println!("{}", event.name());
/// }
/// # Ok::<(), peermesh_webrtc::Error>(())
/// # });
/// ```
pub struct PeerMeshSession {
    config: MeshConfig,
    identity: Arc<RwLock<LocalIdentity>>,
    factory: Arc<dyn TransportFactory>,
    media_source: Arc<dyn MediaSource>,
    events: broadcast::Sender<MeshEvent>,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    link: Mutex<Option<Arc<SignalingLink>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl PeerMeshSession {
    /// Session with WebRTC transports and sample-fed capture tracks
    pub fn new(config: MeshConfig) -> Result<Self> {
        let factory = Arc::new(RtcTransportFactory::new(&config));
        let identity = LocalIdentity::from_config(&config);
        let media = Arc::new(StaticSampleCapture::new(identity.id.clone()));
        Self::build(config, identity, factory, media)
    }

    /// Session with a custom transport factory and media source
    pub fn with_transport_factory(
        config: MeshConfig,
        factory: Arc<dyn TransportFactory>,
        media_source: Arc<dyn MediaSource>,
    ) -> Result<Self> {
        let identity = LocalIdentity::from_config(&config);
        Self::build(config, identity, factory, media_source)
    }

    fn build(
        config: MeshConfig,
        identity: LocalIdentity,
        factory: Arc<dyn TransportFactory>,
        media_source: Arc<dyn MediaSource>,
    ) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            config,
            identity: Arc::new(RwLock::new(identity)),
            factory,
            media_source,
            events,
            commands: Mutex::new(None),
            link: Mutex::new(None),
            dispatcher: Mutex::new(None),
        })
    }

    /// Acquire local media, start the dispatch loop and connect to the relay
    ///
    /// A relay failure is returned, but the session keeps running offline
    /// with only the local avatar; calls on it stay valid.
    pub async fn init(&self) -> Result<LocalIdentity> {
        if self.commands.lock().is_some() {
            return Err(Error::InternalError("session already initialized".to_string()));
        }

        let local_media = match self.media_source.acquire().await {
            Ok(media) => media.tracks,
            Err(e) => {
                warn!("Continuing without local media: {}", e);
                Vec::new()
            }
        };
        self.identity.write().has_media = !local_media.is_empty();

        let (command_tx, commands) = mpsc::unbounded_channel();
        let (envelope_tx, envelopes) = mpsc::unbounded_channel();
        let (link_event_tx, link_events) = mpsc::unbounded_channel();
        let (status_tx, statuses) = mpsc::unbounded_channel();

        let link = SignalingLink::new(
            self.config.signaling_url.clone(),
            &self.config.signaling,
            Arc::clone(&self.identity),
        );
        link.on_message(move |envelope| {
            let _ = envelope_tx.send(envelope);
        });
        link.on_status(move |status| {
            let _ = status_tx.send(status);
        });

        let mut topology = MeshTopology::new(
            Arc::clone(&self.factory),
            link_event_tx,
            ProximityPolicy::new(
                self.config.proximity.connect_radius,
                self.config.max_peers as usize,
            )
            .with_negotiation_timeout(self.config.proximity.negotiation_timeout()),
        );
        topology.set_local_media(local_media);

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.identity),
            topology,
            PresenceBroadcaster::new(self.config.presence.clone()),
            Arc::clone(&link) as Arc<dyn EnvelopeSink>,
            self.events.clone(),
            self.config.presence.broadcast_interval(),
            self.config.proximity.sweep_interval(),
        );
        let handle = tokio::spawn(dispatcher.run(DispatchInputs {
            commands,
            envelopes,
            link_events,
            statuses,
        }));

        *self.commands.lock() = Some(command_tx);
        *self.link.lock() = Some(Arc::clone(&link));
        *self.dispatcher.lock() = Some(handle);

        let identity = self.local_identity();
        info!(
            peer_id = %identity.id,
            has_media = identity.has_media,
            "Peer mesh session started"
        );

        match link.connect().await {
            Ok(identity) => Ok(identity),
            Err(e) => {
                warn!("Relay unreachable, running offline: {}", e);
                Err(e)
            }
        }
    }

    /// Subscribe to mesh events
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Run `handler` for every mesh event on a background task
    pub fn on_message<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(MeshEvent) + Send + Sync + 'static,
    {
        let mut events = self.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => handler(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event handler lagging, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Apply a partial update to the local avatar
    ///
    /// Picked up by the next presence tick.
    pub fn update_local_player(&self, patch: LocalPlayerPatch) {
        self.identity.write().apply(patch);
    }

    pub fn local_identity(&self) -> LocalIdentity {
        self.identity.read().clone()
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.link
            .lock()
            .as_ref()
            .is_some_and(|link| link.is_connected())
    }

    /// Publish the local state now, regardless of the dead-band
    ///
    /// Returns the number of reliable channels that accepted the frame.
    pub async fn broadcast_player_state(&self) -> Result<usize> {
        self.request(|reply| Command::BroadcastState { reply }).await
    }

    /// Known remote peers with their link summary
    pub async fn get_peers(&self) -> Result<Vec<PeerInfo>> {
        self.request(|reply| Command::GetPeers { reply }).await
    }

    /// Camera and microphone stream of `peer_id`
    pub async fn get_remote_stream(&self, peer_id: &str) -> Result<Option<MediaStream>> {
        let peer_id = peer_id.to_string();
        self.request(|reply| Command::GetRemoteStream {
            peer_id,
            screen: false,
            reply,
        })
        .await
    }

    /// Screen stream of `peer_id`
    pub async fn get_remote_screen_stream(&self, peer_id: &str) -> Result<Option<MediaStream>> {
        let peer_id = peer_id.to_string();
        self.request(|reply| Command::GetRemoteStream {
            peer_id,
            screen: true,
            reply,
        })
        .await
    }

    /// Publish screen tracks to every linked peer
    ///
    /// Replaces any screen share already active.
    pub async fn start_screen_sharing(
        &self,
        tracks: Vec<LocalTrack>,
        billboard: Option<Billboard>,
    ) -> Result<()> {
        if tracks.is_empty() {
            return Err(Error::MediaTrackError(
                "screen share needs at least one track".to_string(),
            ));
        }
        self.request(|reply| Command::StartScreenSharing {
            tracks,
            billboard,
            reply,
        })
        .await
    }

    pub async fn stop_screen_sharing(&self) -> Result<()> {
        self.request(|reply| Command::StopScreenSharing { reply }).await
    }

    /// Close every link, leave the relay and stop the dispatch loop
    ///
    /// Calling it again is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let Some(commands) = self.commands.lock().take() else {
            return Ok(());
        };

        info!("Stopping peer mesh session");
        let (reply, done) = oneshot::channel();
        if commands.send(Command::Stop { reply }).is_ok() {
            let _ = done.await;
        }

        if let Some(link) = self.link.lock().take() {
            link.stop();
        }

        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Dispatch task ended abnormally: {}", e);
            }
        }
        Ok(())
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let commands = self
            .commands
            .lock()
            .clone()
            .ok_or(Error::SessionClosed)?;

        let (reply, response) = oneshot::channel();
        commands
            .send(build(reply))
            .map_err(|_| Error::SessionClosed)?;
        response
            .await
            .map_err(|_| Error::SessionClosed)
    }
}

impl Drop for PeerMeshSession {
    fn drop(&mut self) {
        if let Some(link) = self.link.lock().take() {
            link.stop();
        }
        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
    }
}
