//! Headless peer mesh client
//!
//! Joins a signaling relay as one avatar, keeps links to nearby peers and
//! logs every mesh event.
//!
//! # Usage
//!
//! ```bash
//! # Join a local relay with defaults
//! cargo run --bin mesh_client -- --signaling-url ws://localhost:8080
//!
//! # Load settings from a file, override the display name
//! cargo run --bin mesh_client -- --config mesh.toml --name observer
//!
//! # Walk in a 5-unit circle so nearby peers connect and disconnect
//! cargo run --bin mesh_client -- --orbit-radius 5 --log-json
//! ```

use clap::Parser;
use peermesh_webrtc::media::NoCapture;
use peermesh_webrtc::peer::RtcTransportFactory;
use peermesh_webrtc::{LocalPlayerPatch, MeshConfig, MeshEvent, PeerMeshSession, Vec3};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Peer mesh client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file; flags below override it
    #[arg(short, long, env = "MESH_CONFIG")]
    config: Option<PathBuf>,

    /// WebSocket signaling relay URL
    #[arg(long, env = "MESH_SIGNALING_URL")]
    signaling_url: Option<String>,

    /// STUN servers (comma-separated)
    #[arg(long, value_delimiter = ',', env = "MESH_STUN_SERVERS")]
    stun_servers: Option<Vec<String>>,

    /// Fixed peer id (generated when omitted)
    #[arg(long, env = "MESH_PEER_ID")]
    peer_id: Option<String>,

    /// Display name
    #[arg(long, env = "MESH_NAME")]
    name: Option<String>,

    /// Maximum concurrent peer links
    #[arg(long, env = "MESH_MAX_PEERS")]
    max_peers: Option<u32>,

    /// Distance within which peers are linked
    #[arg(long, env = "MESH_CONNECT_RADIUS")]
    connect_radius: Option<f64>,

    /// Join without camera and microphone
    #[arg(long, default_value_t = false)]
    no_media: bool,

    /// Walk in a circle of this radius around the origin
    #[arg(long, default_value_t = 0.0)]
    orbit_radius: f64,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false, env = "MESH_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn load_config(&self) -> peermesh_webrtc::Result<MeshConfig> {
        let mut config = match &self.config {
            Some(path) => MeshConfig::from_file(path)?,
            None => MeshConfig::default(),
        };

        if let Some(url) = &self.signaling_url {
            config.signaling_url = url.clone();
        }
        if let Some(servers) = &self.stun_servers {
            config.stun_servers = servers.clone();
        }
        if let Some(peer_id) = &self.peer_id {
            config.peer_id = Some(peer_id.clone());
        }
        if let Some(name) = &self.name {
            config.display_name = Some(name.clone());
        }
        if let Some(max_peers) = self.max_peers {
            config.max_peers = max_peers;
        }
        if let Some(radius) = self.connect_radius {
            config.proximity.connect_radius = radius;
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        if shutdown_flag_handler.swap(true, Ordering::SeqCst) {
            eprintln!("Shutdown already in progress, forcing exit");
            std::process::exit(1);
        }
        eprintln!("\nCtrl+C received, leaving the mesh...");
    })?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("mesh-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(
    args: Args,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(args.log_json);

    let config = args.load_config()?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        signaling_url = %config.signaling_url,
        max_peers = config.max_peers,
        connect_radius = config.proximity.connect_radius,
        stun_servers = config.stun_servers.len(),
        turn_servers = config.turn_servers.len(),
        "Mesh client starting"
    );

    let session = if args.no_media {
        PeerMeshSession::with_transport_factory(
            config.clone(),
            Arc::new(RtcTransportFactory::new(&config)),
            Arc::new(NoCapture),
        )?
    } else {
        PeerMeshSession::new(config)?
    };

    let printer = session.on_message(log_event);

    match session.init().await {
        Ok(identity) => info!(peer_id = %identity.id, "Joined the mesh"),
        Err(e) => warn!("Running offline: {}", e),
    }

    let started = Instant::now();
    while !shutdown_flag.load(Ordering::SeqCst) {
        if args.orbit_radius > 0.0 {
            let angle = started.elapsed().as_secs_f64() * 0.2;
            let position = Vec3::new(
                args.orbit_radius * angle.cos(),
                0.0,
                args.orbit_radius * angle.sin(),
            );
            session.update_local_player(LocalPlayerPatch::position(position));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!("Shutting down");
    session.stop().await?;
    printer.abort();
    Ok(())
}

fn log_event(event: MeshEvent) {
    match &event {
        MeshEvent::PlayerUpdate(state) => info!(
            peer_id = %state.id,
            x = state.position.x,
            z = state.position.z,
            has_media = state.has_media,
            screen_sharing = state.screen_sharing,
            "player_update"
        ),
        MeshEvent::StreamAdded { peer_id, stream }
        | MeshEvent::ScreenStreamAdded { peer_id, stream } => info!(
            peer_id = %peer_id,
            stream = %stream.id,
            tracks = stream.tracks.len(),
            "{}",
            event.name()
        ),
        MeshEvent::SignalingLost { attempts } => warn!(attempts, "signaling_lost"),
        other => info!(peer_id = ?other.peer_id(), "{}", other.name()),
    }
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
