//! Session integration tests over the embedded relay
//!
//! Sessions use the in-memory transport, so offers, answers and candidates
//! travel through a real WebSocket relay while media and channels stay local.
//!
//! ```bash
//! cargo test -p peermesh-webrtc --test session_e2e -- --nocapture
//! ```

mod harness;

use harness::{init_logging, test_config, wait_until, TestPeer, TestRelay};
use peermesh_webrtc::media::DisplaySurface;
use peermesh_webrtc::testing::TransportCall;
use peermesh_webrtc::{
    LinkState, LocalPlayerPatch, LocalTrack, MediaKind, MediaTrack, MeshEvent, PeerInfo,
    PeerMeshSession, Vec3,
};
use std::time::Duration;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(5);

async fn link_state(peer: &TestPeer, remote: &str) -> Option<LinkState> {
    peer.session
        .get_peers()
        .await
        .ok()?
        .into_iter()
        .find(|info| info.state.id == remote)?
        .link
}

/// Poll `peer`'s view of `remote` until `check` holds
async fn wait_peer<F>(peer: &TestPeer, remote: &str, what: &str, check: F)
where
    F: Fn(Option<&PeerInfo>) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let peers = peer.session.get_peers().await.unwrap();
        if check(peers.iter().find(|info| info.state.id == remote)) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_link(peer: &TestPeer, remote: &str, expected: Option<LinkState>) {
    let what = format!("{} link to {} = {:?}", peer.id(), remote, expected);
    wait_peer(peer, remote, &what, |info| info.and_then(|i| i.link) == expected).await;
}

async fn connected_pair(relay: &TestRelay) -> (TestPeer, TestPeer) {
    let a = TestPeer::join(test_config(&relay.url(), "peer-a")).await.unwrap();
    let b = TestPeer::join(test_config(&relay.url(), "peer-b")).await.unwrap();
    wait_link(&a, "peer-b", Some(LinkState::Connected)).await;
    wait_link(&b, "peer-a", Some(LinkState::Connected)).await;
    (a, b)
}

async fn next_matching<F>(events: &mut broadcast::Receiver<MeshEvent>, mut matches: F) -> MeshEvent
where
    F: FnMut(&MeshEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for mesh event")
}

#[tokio::test]
async fn test_two_peers_link_with_a_single_offer() {
    init_logging();
    let relay = TestRelay::start().await.unwrap();
    let (a, b) = connected_pair(&relay).await;

    // The greater id offers, exactly once
    assert_eq!(relay.received_from("webrtc-offer", "peer-b").len(), 1);
    assert!(relay.received_from("webrtc-offer", "peer-a").is_empty());
    assert_eq!(relay.received_from("webrtc-answer", "peer-a").len(), 1);

    assert_eq!(a.factory.transports_for("peer-b").len(), 1);
    assert_eq!(b.factory.transports_for("peer-a").len(), 1);

    // Camera and microphone attached on both ends
    assert_eq!(b.factory.latest("peer-a").unwrap().local_tracks().len(), 2);
    assert_eq!(a.factory.latest("peer-b").unwrap().local_tracks().len(), 2);

    // Only the offerer opens the reliable channel
    let offerer = b.factory.latest("peer-a").unwrap();
    assert_eq!(offerer.count(&TransportCall::CreateChannel("mesh".to_string())), 1);

    a.session.stop().await.unwrap();
    b.session.stop().await.unwrap();
}

#[tokio::test]
async fn test_ice_candidates_cross_the_relay() {
    init_logging();
    let relay = TestRelay::start().await.unwrap();
    let (a, b) = connected_pair(&relay).await;

    let candidate = "candidate:1 1 udp 2130706431 192.0.2.10 50000 typ host";
    b.factory
        .latest("peer-a")
        .unwrap()
        .emit_ice_candidate(candidate);

    let remote = a.factory.latest("peer-b").unwrap();
    wait_until("candidate applied at peer-a", WAIT, || {
        remote.applied_candidates().iter().any(|c| c == candidate)
    })
    .await
    .unwrap();

    let relayed = relay.received_from("webrtc-ice", "peer-b");
    assert_eq!(relayed.len(), 1);
    assert_eq!(relayed[0]["targetPeer"], "peer-a");

    a.session.stop().await.unwrap();
    b.session.stop().await.unwrap();
}

#[tokio::test]
async fn test_presence_reaches_remote_peer() {
    init_logging();
    let relay = TestRelay::start().await.unwrap();
    let (a, b) = connected_pair(&relay).await;
    let mut events = b.session.subscribe();

    a.session
        .update_local_player(LocalPlayerPatch::position(Vec3::new(3.0, 0.0, 4.0)));

    let event = next_matching(&mut events, |event| {
        matches!(event, MeshEvent::PlayerUpdate(state) if state.id == "peer-a" && state.position.x == 3.0)
    })
    .await;
    let MeshEvent::PlayerUpdate(state) = event else {
        unreachable!()
    };
    assert_eq!(state.position.z, 4.0);

    // Still in range, so the link is untouched
    assert_eq!(link_state(&b, "peer-a").await, Some(LinkState::Connected));

    a.session.stop().await.unwrap();
    b.session.stop().await.unwrap();
}

#[tokio::test]
async fn test_moving_apart_closes_and_moving_back_reopens() {
    init_logging();
    let relay = TestRelay::start().await.unwrap();
    let (a, b) = connected_pair(&relay).await;
    let first = a.factory.latest("peer-b").unwrap();

    b.session
        .update_local_player(LocalPlayerPatch::position(Vec3::new(100.0, 0.0, 0.0)));

    wait_link(&b, "peer-a", None).await;
    wait_link(&a, "peer-b", None).await;
    assert!(first.is_closed());

    // Records survive the teardown
    let peers = a.session.get_peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].state.position.x, 100.0);

    b.session
        .update_local_player(LocalPlayerPatch::position(Vec3::new(1.0, 0.0, 0.0)));

    wait_link(&b, "peer-a", Some(LinkState::Connected)).await;
    wait_link(&a, "peer-b", Some(LinkState::Connected)).await;
    assert_eq!(a.factory.transports_for("peer-b").len(), 2);
    assert_eq!(relay.received_from("webrtc-offer", "peer-b").len(), 2);

    a.session.stop().await.unwrap();
    b.session.stop().await.unwrap();
}

#[tokio::test]
async fn test_screen_share_renegotiates_without_new_link() {
    init_logging();
    let relay = TestRelay::start().await.unwrap();
    let (a, b) = connected_pair(&relay).await;
    let mut events = a.session.subscribe();

    let screen = LocalTrack::screen("peer-b-screen", "peer-b-display", DisplaySurface::Monitor);
    b.session
        .start_screen_sharing(vec![screen], None)
        .await
        .unwrap();

    wait_until("renegotiation offer", WAIT, || {
        relay.received_from("webrtc-offer", "peer-b").len() == 2
    })
    .await
    .unwrap();
    wait_until("renegotiation answer", WAIT, || {
        relay.received_from("webrtc-answer", "peer-a").len() == 2
    })
    .await
    .unwrap();
    wait_link(&b, "peer-a", Some(LinkState::Connected)).await;

    assert_eq!(a.factory.transports_for("peer-b").len(), 1);
    assert_eq!(link_state(&a, "peer-b").await, Some(LinkState::Connected));

    // Carry the metadata frame from b's channel to a, then deliver the track
    let outbound = b.factory.latest("peer-a").unwrap();
    let metadata = outbound.channels()[0]
        .sent()
        .into_iter()
        .find(|text| text.contains("screen_track_metadata"))
        .expect("screen metadata sent on the channel");

    let inbound = a.factory.latest("peer-b").unwrap();
    inbound.emit_channel_message(metadata);
    inbound.emit_track(MediaTrack::new(
        "peer-b-screen",
        MediaKind::Video,
        "peer-b-display peer-b-screen",
    ));

    let event = next_matching(&mut events, |event| {
        matches!(event, MeshEvent::ScreenStreamAdded { .. })
    })
    .await;
    assert_eq!(event.peer_id(), Some("peer-b"));

    let stream = a
        .session
        .get_remote_screen_stream("peer-b")
        .await
        .unwrap()
        .expect("screen stream");
    assert_eq!(stream.track_ids(), vec!["peer-b-screen"]);

    // The remote record follows the sharer's presence
    wait_peer(&a, "peer-b", "screen sharing flag", |info| {
        info.is_some_and(|i| i.state.screen_sharing)
    })
    .await;

    a.session.stop().await.unwrap();
    b.session.stop().await.unwrap();
}

#[tokio::test]
async fn test_leave_removes_remote_peer() {
    init_logging();
    let relay = TestRelay::start().await.unwrap();
    let (a, b) = connected_pair(&relay).await;
    let mut events = a.session.subscribe();
    let transport = a.factory.latest("peer-b").unwrap();

    b.session.stop().await.unwrap();

    next_matching(&mut events, |event| {
        matches!(event, MeshEvent::PlayerLeave { peer_id } if peer_id == "peer-b")
    })
    .await;

    assert!(a.session.get_peers().await.unwrap().is_empty());
    assert!(transport.is_closed());

    a.session.stop().await.unwrap();
}

#[tokio::test]
async fn test_full_mesh_has_one_link_per_pair() {
    init_logging();
    let relay = TestRelay::start().await.unwrap();

    let ids = ["peer-1", "peer-2", "peer-3", "peer-4"];
    let mut peers = Vec::new();
    for id in ids {
        peers.push(TestPeer::join(test_config(&relay.url(), id)).await.unwrap());
    }

    for peer in &peers {
        for remote in ids.iter().filter(|id| **id != peer.id()) {
            wait_link(peer, remote, Some(LinkState::Connected)).await;
        }
    }

    let offers = relay.received_of("webrtc-offer");
    assert_eq!(offers.len(), 6);
    for offer in &offers {
        let from = offer["peerId"].as_str().unwrap();
        let to = offer["targetPeer"].as_str().unwrap();
        assert!(from > to, "{} offered to {}", from, to);
    }

    for peer in &peers {
        assert_eq!(peer.factory.created_count(), 3);
        peer.session.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_session_runs_offline_when_relay_unreachable() {
    init_logging();

    // Bind and drop to get a port nobody listens on
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let config = test_config(&format!("ws://127.0.0.1:{}", port), "peer-offline");
    let session = PeerMeshSession::with_transport_factory(
        config,
        std::sync::Arc::new(peermesh_webrtc::testing::MockTransportFactory::new()),
        std::sync::Arc::new(peermesh_webrtc::media::NoCapture),
    )
    .unwrap();

    assert!(session.init().await.is_err());
    assert!(!session.is_connected());

    session.update_local_player(LocalPlayerPatch::position(Vec3::new(1.0, 2.0, 3.0)));
    assert_eq!(session.local_identity().position, Vec3::new(1.0, 2.0, 3.0));
    assert!(!session.local_identity().has_media);
    assert!(session.get_peers().await.unwrap().is_empty());
    assert_eq!(session.broadcast_player_state().await.unwrap(), 0);

    session.stop().await.unwrap();
    session.stop().await.unwrap();
}
